//! Authentication error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Refresh token was rejected")]
    RefreshRejected,

    #[error("Not authorized")]
    Unauthorized,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Session changed while the request was in flight")]
    SessionChanged,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Storage error: {0}")]
    Storage(#[from] testhub_storage::StorageError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuthError {
    /// Errors after which the session cannot continue and is logged out.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, AuthError::RefreshRejected | AuthError::Unauthorized)
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for AuthError {
    fn from(err: url::ParseError) -> Self {
        AuthError::InvalidUrl(err.to_string())
    }
}
