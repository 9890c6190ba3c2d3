//! Session data structures
//!
//! ```text
//! LoggedOut
//!   ↓ login / restore
//! Valid
//!   ↓ time passes (inside refresh window)
//! ExpiringSoon ──refresh──→ Valid
//!   ↓ time passes
//! Expired ──refresh rejected──→ LoggedOut
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_joined: Option<DateTime<Utc>>,
    /// Fields the server sends that this client does not model
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserProfile {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: None,
            first_name: None,
            last_name: None,
            is_staff: false,
            date_joined: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn display_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) if !first.is_empty() && !last.is_empty() => {
                format!("{} {}", first, last)
            }
            (Some(first), _) if !first.is_empty() => first.to_string(),
            _ => self.username.clone(),
        }
    }
}

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("username", &self.username)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Body of a successful `auth/login/` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    pub user: UserProfile,
}

/// Body of a successful `auth/token/refresh/` call. `refresh` is only
/// present when the server rotates refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    LoggedOut,
    Valid,
    ExpiringSoon,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::LoggedOut => "logged_out",
            SessionStatus::Valid => "valid",
            SessionStatus::ExpiringSoon => "expiring_soon",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn is_logged_in(&self) -> bool {
        !matches!(self, SessionStatus::LoggedOut)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything the client knows about the current session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Milliseconds since the epoch; 0 when unknown or logged out
    pub expires_at: i64,
    pub current_user: Option<UserProfile>,
}

impl SessionSnapshot {
    pub fn has_credentials(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some() && self.current_user.is_some()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at != 0 && now_ms > self.expires_at
    }

    /// True when less than `window_ms` remains, including already expired.
    pub fn is_expiring_soon(&self, now_ms: i64, window_ms: i64) -> bool {
        self.expires_at != 0 && self.expires_at - now_ms < window_ms
    }

    pub fn status(&self, now_ms: i64, window_ms: i64) -> SessionStatus {
        if !self.has_credentials() {
            SessionStatus::LoggedOut
        } else if self.is_expired(now_ms) {
            SessionStatus::Expired
        } else if self.is_expiring_soon(now_ms, window_ms) {
            SessionStatus::ExpiringSoon
        } else {
            SessionStatus::Valid
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
