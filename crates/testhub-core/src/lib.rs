//! TestHub Core
//!
//! Application layer of the TestHub client: wires local storage, the
//! authenticated session, route guarding and UI preferences together.

mod app;
mod config;
mod error;
mod guard;
mod preferences;

pub use app::App;
pub use config::{Config, API_URL_ENV};
pub use error::CoreError;
pub use guard::{GuardDecision, RouteGuard, RouteMeta, HOME_PATH, LOGIN_PATH};
pub use preferences::{Language, LanguagePreference, LANGUAGE_KEY};

// Re-export the layers below
pub use testhub_auth::{
    AuthConfig, AuthError, AuthorizedClient, Credentials, Navigator, NoopNavigator,
    Registration, SessionManager, SessionSnapshot, SessionStatus, UserProfile,
};
pub use testhub_storage::{Database, StorageError};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging. Returns false if a global subscriber was already set.
pub fn init_logging() -> bool {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_only_installs_once() {
        init_logging();
        assert!(!init_logging());
        tracing::info!("Logging initialized");
    }
}
