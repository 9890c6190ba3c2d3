//! Application context
//!
//! Owns the storage, the session and the per-user preferences. Views read
//! state from here and never hold tokens of their own.

use std::sync::Arc;

use testhub_auth::{AuthApi, AuthorizedClient, HttpAuthApi, Navigator, SessionManager};
use testhub_storage::Database;

use crate::config::Config;
use crate::guard::RouteGuard;
use crate::preferences::LanguagePreference;
use crate::Result;

pub struct App {
    config: Config,
    db: Database,
    session: SessionManager,
    client: AuthorizedClient,
    language: LanguagePreference,
    guard: RouteGuard,
}

impl App {
    /// Open the local database and connect to the configured API.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&config.database_path)?;

        let api = HttpAuthApi::new(&config.api_base_url, config.auth.request_timeout)?;
        Self::with_api(config, db, Arc::new(api))
    }

    /// Build the context around an already opened database and API.
    pub fn with_api(config: Config, db: Database, api: Arc<dyn AuthApi>) -> Result<Self> {
        let session = SessionManager::new(db.clone(), api, config.auth.clone())?;
        let client = AuthorizedClient::new(
            &config.api_base_url,
            session.clone(),
            config.auth.request_timeout,
        )?;
        let language = LanguagePreference::new(db.clone())?;
        let guard = RouteGuard::new(session.clone());

        tracing::info!(
            database = %config.database_path.display(),
            api_base_url = %config.api_base_url,
            language = %language.language(),
            "Application context created"
        );

        Ok(Self {
            config,
            db,
            session,
            client,
            language,
            guard,
        })
    }

    /// Restore the persisted session. A failed restore leaves the app
    /// logged out but running.
    pub async fn initialize(&self) {
        match self.session.initialize_session().await {
            Ok(()) => tracing::info!(
                status = %self.session.status(),
                "Application initialized"
            ),
            Err(e) => tracing::warn!(error = %e, "Session restore failed, continuing logged out"),
        }
    }

    pub fn set_navigator(&self, navigator: Arc<dyn Navigator>) {
        self.session.set_navigator(navigator);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn client(&self) -> &AuthorizedClient {
        &self.client
    }

    pub fn language(&self) -> &LanguagePreference {
        &self.language
    }

    pub fn guard(&self) -> &RouteGuard {
        &self.guard
    }
}
