//! Session Manager
//!
//! Owns the authenticated session: login, logout, token refresh, profile
//! loading and the background auto-refresh poller. Memory is the source of
//! truth and local storage is written through on every mutation, under the
//! same lock, so the two never disagree between operations.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use testhub_storage::Database;

use crate::api::AuthApi;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::navigator::{Navigator, NoopNavigator};
use crate::refresh::AutoRefresh;
use crate::session::{
    now_millis, Credentials, LoginResponse, RefreshResponse, Registration, SessionSnapshot,
    SessionStatus, UserProfile,
};
use crate::store::SessionStore;
use crate::token;
use crate::Result;

struct SessionState {
    session: SessionSnapshot,
    /// Bumped whenever a session ends or is replaced; responses started under
    /// an older value are dropped
    generation: u64,
}

pub(crate) struct SessionInner {
    config: AuthConfig,
    api: Arc<dyn AuthApi>,
    store: SessionStore,
    navigator: RwLock<Arc<dyn Navigator>>,
    state: RwLock<SessionState>,
    logging_out: AtomicBool,
    logout_done: Notify,
    refresh_lock: tokio::sync::Mutex<()>,
    auto_refresh: Mutex<Option<AutoRefresh>>,
}

pub struct SessionManager {
    inner: Arc<SessionInner>,
}

/// Releases the logout flag even if the logout future is dropped midway.
struct LogoutGuard<'a>(&'a SessionInner);

impl Drop for LogoutGuard<'_> {
    fn drop(&mut self) {
        self.0.logging_out.store(false, Ordering::Release);
        self.0.logout_done.notify_waiters();
    }
}

impl SessionManager {
    /// Create a manager, restoring any tokens left in storage. The persisted
    /// user profile is restored by [`SessionManager::initialize_session`].
    pub fn new(db: Database, api: Arc<dyn AuthApi>, config: AuthConfig) -> Result<Self> {
        let store = SessionStore::new(db);
        let session = store.load_tokens()?;

        tracing::info!(
            has_access_token = session.access_token.is_some(),
            has_refresh_token = session.refresh_token.is_some(),
            expires_at = session.expires_at,
            "Restored persisted session tokens"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                api,
                store,
                navigator: RwLock::new(Arc::new(NoopNavigator)),
                state: RwLock::new(SessionState {
                    session,
                    generation: 0,
                }),
                logging_out: AtomicBool::new(false),
                logout_done: Notify::new(),
                refresh_lock: tokio::sync::Mutex::new(()),
                auto_refresh: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn set_navigator(&self, navigator: Arc<dyn Navigator>) {
        *self.inner.navigator.write() = navigator;
    }

    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    // === Accessors ===

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.read().session.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.state.read().session.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.state.read().session.refresh_token.clone()
    }

    pub fn expires_at(&self) -> i64 {
        self.inner.state.read().session.expires_at
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner.state.read().session.current_user.clone()
    }

    pub fn has_credentials(&self) -> bool {
        self.inner.state.read().session.has_credentials()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.read().session.is_authenticated()
    }

    pub fn is_token_expired(&self) -> bool {
        self.inner.state.read().session.is_expired(now_millis())
    }

    pub fn is_token_expiring_soon(&self) -> bool {
        self.inner
            .state
            .read()
            .session
            .is_expiring_soon(now_millis(), self.inner.config.refresh_window_millis())
    }

    pub fn status(&self) -> SessionStatus {
        self.inner
            .state
            .read()
            .session
            .status(now_millis(), self.inner.config.refresh_window_millis())
    }

    pub fn is_logging_out(&self) -> bool {
        self.inner.logging_out.load(Ordering::Acquire)
    }

    // === Lifecycle ===

    pub async fn login(&self, credentials: &Credentials) -> Result<LoginResponse> {
        let generation = self.generation();

        let response = self.inner.api.login(credentials).await.map_err(|e| {
            tracing::warn!(username = %credentials.username, error = %e, "Login failed");
            e
        })?;

        let expires_at = self.expiry_for(&response.access);
        self.start_session(
            generation,
            SessionSnapshot {
                access_token: Some(response.access.clone()),
                refresh_token: Some(response.refresh.clone()),
                expires_at,
                current_user: Some(response.user.clone()),
            },
        )?;

        self.start_auto_refresh();

        tracing::info!(
            username = %response.user.username,
            expires_at,
            "Logged in"
        );

        Ok(response)
    }

    /// Create an account. The session is not touched; the user logs in
    /// afterwards.
    pub async fn register(&self, registration: &Registration) -> Result<UserProfile> {
        let user = self.inner.api.register(registration).await?;
        tracing::info!(username = %user.username, "Registered new account");
        Ok(user)
    }

    /// Idempotent. Concurrent callers wait for the logout already in flight
    /// and return once it has finished.
    pub async fn logout(&self) {
        self.end_session(None).await;
    }

    /// Log out only if the session seen at `generation` is still the current
    /// one. Returns false when it has already ended.
    async fn logout_if_current(&self, generation: u64) -> bool {
        self.end_session(Some(generation)).await
    }

    async fn end_session(&self, expected_generation: Option<u64>) -> bool {
        let done = self.inner.logout_done.notified();
        tokio::pin!(done);
        done.as_mut().enable();

        if self.inner.logging_out.swap(true, Ordering::AcqRel) {
            tracing::debug!("Logout already in progress");
            done.await;
            return true;
        }
        let _guard = LogoutGuard(&self.inner);

        if let Some(expected) = expected_generation {
            if self.generation() != expected {
                tracing::debug!("Session already replaced, skipping logout");
                return false;
            }
        }

        // Stop the poller first so no tick races the clear below
        self.stop_auto_refresh();

        let (access_token, notify_token) = {
            let state = self.inner.state.read();
            let session = &state.session;
            let now = now_millis();
            let refresh_expired = session
                .refresh_token
                .as_deref()
                .and_then(token::expiry_millis)
                .is_some_and(|exp| now > exp);

            // An expired access token would only earn a 401 from the server
            let notify = (!session.is_expired(now) && !refresh_expired)
                .then(|| session.refresh_token.clone())
                .flatten();
            (session.access_token.clone(), notify)
        };

        if let Some(refresh_token) = notify_token {
            if let Err(e) = self
                .inner
                .api
                .logout(access_token.as_deref(), &refresh_token)
                .await
            {
                tracing::warn!(error = %e, "Server-side logout failed, clearing local session anyway");
            }
        }

        self.clear_session();
        tracing::info!("Logged out");

        self.navigator().redirect_to_login();
        true
    }

    /// Exchange the refresh token for a new access token. A rejected refresh
    /// token logs the session out before the error is returned.
    pub async fn refresh_access_token(&self) -> Result<String> {
        let _refreshing = self.inner.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Refresh after `rejected_token` earned a 401, unless another caller has
    /// already replaced it while this one waited.
    pub async fn refresh_after_unauthorized(&self, rejected_token: &str) -> Result<String> {
        let _refreshing = self.inner.refresh_lock.lock().await;
        if let Some(current) = self.access_token() {
            if current != rejected_token {
                return Ok(current);
            }
        }
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<String> {
        let (generation, refresh_token, has_access_token) = {
            let state = self.inner.state.read();
            (
                state.generation,
                state.session.refresh_token.clone(),
                state.session.has_credentials(),
            )
        };

        let Some(refresh_token) = refresh_token else {
            if !has_access_token {
                return Err(AuthError::NotLoggedIn);
            }
            tracing::warn!("No refresh token available, logging out");
            self.logout_if_current(generation).await;
            return Err(AuthError::RefreshRejected);
        };

        match self.inner.api.refresh(&refresh_token).await {
            Ok(RefreshResponse { access, refresh }) => {
                let expires_at = self.expiry_for(&access);
                let rotated = refresh.is_some();
                self.commit(generation, |session| {
                    session.access_token = Some(access.clone());
                    session.expires_at = expires_at;
                    if let Some(refresh) = refresh {
                        session.refresh_token = Some(refresh);
                    }
                })?;

                tracing::info!(rotated, expires_at, "Access token refreshed");
                Ok(access)
            }
            Err(e) if e.is_auth_failure() => {
                tracing::error!(error = %e, "Token refresh rejected, logging out");
                if self.logout_if_current(generation).await {
                    Err(e)
                } else {
                    Err(AuthError::SessionChanged)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed");
                Err(e)
            }
        }
    }

    /// Load the profile from `auth/profile/`. An authorization failure, or
    /// calling this without a session, logs out.
    pub async fn fetch_profile(&self) -> Result<UserProfile> {
        let (generation, access_token) = self.generation_and_token();
        let Some(access_token) = access_token else {
            self.logout_if_current(generation).await;
            return Err(AuthError::Unauthorized);
        };

        match self.inner.api.profile(&access_token).await {
            Ok(user) => {
                self.commit(generation, |session| {
                    session.current_user = Some(user.clone());
                })?;
                tracing::debug!(username = %user.username, "Loaded user profile");
                Ok(user)
            }
            Err(e) if e.is_auth_failure() => {
                tracing::warn!(error = %e, "Profile request unauthorized, logging out");
                if self.logout_if_current(generation).await {
                    Err(e)
                } else {
                    Err(AuthError::SessionChanged)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Load the user from `auth/me/`. Any failure logs out, unless the
    /// session the request was made for has already ended.
    pub async fn fetch_current_user(&self) -> Result<UserProfile> {
        let (generation, access_token) = self.generation_and_token();
        match self.load_current_user(generation, access_token).await {
            Err(AuthError::SessionChanged) => Err(AuthError::SessionChanged),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load current user, logging out");
                if self.logout_if_current(generation).await {
                    Err(e)
                } else {
                    Err(AuthError::SessionChanged)
                }
            }
            ok => ok,
        }
    }

    async fn load_current_user(
        &self,
        generation: u64,
        access_token: Option<String>,
    ) -> Result<UserProfile> {
        let access_token = access_token.ok_or(AuthError::NotLoggedIn)?;

        let user = self.inner.api.current_user(&access_token).await?;
        self.commit(generation, |session| {
            session.current_user = Some(user.clone());
        })?;
        Ok(user)
    }

    /// Run once at startup, before the first protected navigation.
    pub async fn initialize_session(&self) -> Result<()> {
        let generation = {
            let mut state = self.inner.state.write();
            if state.session.current_user.is_none() {
                state.session.current_user = self.inner.store.load_user()?;
            }
            state.generation
        };

        let snapshot = self.snapshot();
        let expired = snapshot.is_expired(now_millis());
        tracing::info!(
            has_access_token = snapshot.access_token.is_some(),
            has_refresh_token = snapshot.refresh_token.is_some(),
            has_user = snapshot.current_user.is_some(),
            expired,
            "Initializing session"
        );

        if snapshot.access_token.is_none() {
            tracing::debug!("No access token, nothing to initialize");
            return Ok(());
        }

        if expired && snapshot.refresh_token.is_some() {
            if let Err(e) = self.refresh_access_token().await {
                tracing::error!(error = %e, "Could not refresh expired session");
                // Rejections already logged out; transport failures end here too
                self.abandon_restore(generation).await;
                return Err(e);
            }
        }

        if self.current_user().is_none() {
            if let Err(e) = self.fetch_profile().await {
                tracing::error!(error = %e, "Could not load user profile");
                self.abandon_restore(generation).await;
                return Err(e);
            }
        }

        self.start_auto_refresh();
        Ok(())
    }

    /// End a failed restore, leaving any session that replaced it alone.
    async fn abandon_restore(&self, generation: u64) {
        if self.has_credentials() {
            self.logout_if_current(generation).await;
        }
    }

    // === Auto-refresh ===

    /// Replace any running poller with a fresh one.
    pub fn start_auto_refresh(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("No async runtime available, auto-refresh not started");
            return;
        }

        let task = AutoRefresh::spawn(Arc::downgrade(&self.inner), self.inner.config.poll_interval);
        if let Some(previous) = self.inner.auto_refresh.lock().replace(task) {
            previous.stop();
        }

        tracing::debug!(
            interval_secs = self.inner.config.poll_interval.as_secs(),
            "Auto-refresh started"
        );
    }

    pub fn stop_auto_refresh(&self) {
        if let Some(task) = self.inner.auto_refresh.lock().take() {
            task.stop();
            tracing::debug!("Auto-refresh stopped");
        }
    }

    pub fn is_auto_refresh_running(&self) -> bool {
        self.inner
            .auto_refresh
            .lock()
            .as_ref()
            .is_some_and(|task| task.is_running())
    }

    pub(crate) async fn auto_refresh_tick(&self) {
        let due = {
            let state = self.inner.state.read();
            let session = &state.session;
            session.is_authenticated()
                && session.refresh_token.is_some()
                && session.is_expiring_soon(now_millis(), self.inner.config.refresh_window_millis())
        };
        if !due {
            return;
        }

        tracing::info!("Access token expiring soon, refreshing");
        match self.refresh_access_token().await {
            Ok(_) => tracing::debug!("Auto-refresh succeeded"),
            // Rejections have already logged out
            Err(e) => tracing::warn!(error = %e, "Auto-refresh failed"),
        }
    }

    // === Internals ===

    fn navigator(&self) -> Arc<dyn Navigator> {
        self.inner.navigator.read().clone()
    }

    fn generation(&self) -> u64 {
        self.inner.state.read().generation
    }

    fn generation_and_token(&self) -> (u64, Option<String>) {
        let state = self.inner.state.read();
        (state.generation, state.session.access_token.clone())
    }

    fn expiry_for(&self, access_token: &str) -> i64 {
        let config = &self.inner.config;
        let from_claim = config
            .trust_token_expiry
            .then(|| token::expiry_millis(access_token))
            .flatten();
        from_claim.unwrap_or_else(|| now_millis() + config.token_ttl_millis())
    }

    /// Apply `update` and write the result through to storage, unless the
    /// session changed after `generation` was read. Memory only moves once
    /// storage has accepted the write.
    fn commit(&self, generation: u64, update: impl FnOnce(&mut SessionSnapshot)) -> Result<()> {
        let mut state = self.inner.state.write();
        if state.generation != generation {
            tracing::debug!("Discarding response for a session that has since ended");
            return Err(AuthError::SessionChanged);
        }

        let mut next = state.session.clone();
        update(&mut next);
        self.inner.store.save(&next)?;
        state.session = next;
        Ok(())
    }

    /// Install a freshly logged-in session, ending whatever came before it.
    fn start_session(&self, generation: u64, session: SessionSnapshot) -> Result<()> {
        let mut state = self.inner.state.write();
        if state.generation != generation {
            tracing::debug!("Discarding login for a session that has since ended");
            return Err(AuthError::SessionChanged);
        }

        self.inner.store.save(&session)?;
        state.session = session;
        state.generation += 1;
        Ok(())
    }

    fn clear_session(&self) {
        let mut state = self.inner.state.write();
        state.session = SessionSnapshot::default();
        state.generation += 1;

        if let Err(e) = self.inner.store.clear() {
            tracing::error!(error = %e, "Failed to clear persisted session");
        }
    }
}

impl Clone for SessionManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ACCESS_TOKEN_KEY, EXPIRES_AT_KEY, REFRESH_TOKEN_KEY, USER_KEY};
    use crate::testing::{encode_jwt, FakeAuthApi, RecordingNavigator};
    use serde_json::json;
    use std::time::Duration;

    const POLL: Duration = Duration::from_secs(120);

    fn setup() -> (SessionManager, Arc<FakeAuthApi>, Arc<RecordingNavigator>, Database) {
        let db = Database::open_in_memory().unwrap();
        setup_with_db(db)
    }

    fn setup_with_db(
        db: Database,
    ) -> (SessionManager, Arc<FakeAuthApi>, Arc<RecordingNavigator>, Database) {
        let api = Arc::new(FakeAuthApi::new());
        let navigator = Arc::new(RecordingNavigator::default());
        let manager = SessionManager::new(db.clone(), api.clone(), AuthConfig::default()).unwrap();
        manager.set_navigator(navigator.clone());
        (manager, api, navigator, db)
    }

    fn credentials() -> Credentials {
        Credentials::new("alice", FakeAuthApi::PASSWORD)
    }

    /// Let spawned tasks run after the paused clock moves.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn persisted_session_keys(db: &Database) -> Vec<String> {
        db.keys()
            .unwrap()
            .into_iter()
            .filter(|k| {
                [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRES_AT_KEY, USER_KEY]
                    .contains(&k.as_str())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_login_populates_and_persists() {
        let (manager, api, _, db) = setup();
        assert_eq!(manager.status(), SessionStatus::LoggedOut);

        let response = manager.login(&credentials()).await.unwrap();

        assert!(manager.is_authenticated());
        assert_eq!(manager.access_token(), Some(response.access.clone()));
        assert_eq!(manager.refresh_token(), Some(response.refresh.clone()));
        assert_eq!(manager.current_user().unwrap().username, "alice");
        assert_eq!(manager.status(), SessionStatus::Valid);
        assert!(manager.is_auto_refresh_running());
        assert_eq!(api.login_calls(), 1);

        assert_eq!(
            db.get_item(ACCESS_TOKEN_KEY).unwrap(),
            Some(response.access)
        );
        assert_eq!(
            db.get_item(EXPIRES_AT_KEY).unwrap(),
            Some(manager.expires_at().to_string())
        );
        assert!(db.get_item(USER_KEY).unwrap().unwrap().contains("alice"));
    }

    #[tokio::test]
    async fn test_login_failure_leaves_session_logged_out() {
        let (manager, _, navigator, db) = setup();

        let result = manager.login(&Credentials::new("alice", "wrong")).await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));

        assert_eq!(manager.status(), SessionStatus::LoggedOut);
        assert!(!manager.is_auto_refresh_running());
        assert!(persisted_session_keys(&db).is_empty());
        assert_eq!(navigator.redirects(), 0);
    }

    #[tokio::test]
    async fn test_expiry_falls_back_to_fixed_ttl() {
        let (manager, api, _, _) = setup();
        api.set_opaque_tokens(true);

        let before = now_millis();
        manager.login(&credentials()).await.unwrap();
        let ttl = AuthConfig::default().token_ttl_millis();

        assert!(manager.expires_at() >= before + ttl);
        assert!(manager.expires_at() <= now_millis() + ttl);
    }

    #[tokio::test]
    async fn test_expiry_comes_from_token_claim() {
        let (manager, api, _, _) = setup();
        api.set_access_ttl(Duration::from_secs(3600));

        let response = manager.login(&credentials()).await.unwrap();
        assert_eq!(
            Some(manager.expires_at()),
            token::expiry_millis(&response.access)
        );
        assert!(manager.expires_at() > now_millis() + 50 * 60 * 1000);
    }

    #[tokio::test]
    async fn test_login_then_logout_clears_everything() {
        let (manager, api, navigator, db) = setup();
        db.set_item("app-lang", "en").unwrap();

        manager.login(&credentials()).await.unwrap();
        manager.logout().await;

        assert_eq!(manager.snapshot(), SessionSnapshot::default());
        assert_eq!(manager.status(), SessionStatus::LoggedOut);
        assert!(!manager.is_auto_refresh_running());
        assert!(persisted_session_keys(&db).is_empty());
        assert_eq!(db.get_item("app-lang").unwrap().as_deref(), Some("en"));
        assert_eq!(api.logout_calls(), 1);
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_logout_runs_once() {
        let (manager, api, navigator, db) = setup();
        manager.login(&credentials()).await.unwrap();

        let first = manager.clone();
        let second = manager.clone();
        tokio::join!(first.logout(), second.logout());

        assert_eq!(api.logout_calls(), 1);
        assert_eq!(navigator.redirects(), 1);
        assert!(!manager.is_logging_out());
        assert!(!manager.has_credentials());
        assert!(persisted_session_keys(&db).is_empty());
    }

    #[tokio::test]
    async fn test_logout_survives_server_failure() {
        let (manager, api, navigator, db) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_fail_logout(true);

        manager.logout().await;

        assert_eq!(api.logout_calls(), 1);
        assert!(!manager.has_credentials());
        assert!(persisted_session_keys(&db).is_empty());
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test]
    async fn test_logout_skips_server_when_access_token_expired() {
        let db = Database::open_in_memory().unwrap();
        let expired = (now_millis() - 1000).to_string();
        db.set_items(&[
            (ACCESS_TOKEN_KEY, "stale"),
            (REFRESH_TOKEN_KEY, "refresh-0"),
            (EXPIRES_AT_KEY, expired.as_str()),
        ])
        .unwrap();
        let (manager, api, _, db) = setup_with_db(db);

        manager.logout().await;

        assert_eq!(api.logout_calls(), 0);
        assert!(persisted_session_keys(&db).is_empty());
    }

    #[tokio::test]
    async fn test_refresh_rotates_tokens() {
        let (manager, api, _, db) = setup();
        api.set_rotate_refresh(true);
        let login = manager.login(&credentials()).await.unwrap();

        let access = manager.refresh_access_token().await.unwrap();

        assert_ne!(access, login.access);
        assert_eq!(manager.access_token(), Some(access.clone()));
        let rotated = manager.refresh_token().unwrap();
        assert_ne!(rotated, login.refresh);
        assert_eq!(db.get_item(REFRESH_TOKEN_KEY).unwrap(), Some(rotated));
        assert_eq!(db.get_item(ACCESS_TOKEN_KEY).unwrap(), Some(access));

        // The old refresh token is gone for good
        assert!(matches!(
            api.refresh(&login.refresh).await,
            Err(AuthError::RefreshRejected)
        ));
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_keeps_refresh_token() {
        let (manager, _, _, _) = setup();
        let login = manager.login(&credentials()).await.unwrap();

        manager.refresh_access_token().await.unwrap();
        assert_eq!(manager.refresh_token(), Some(login.refresh));
    }

    #[tokio::test]
    async fn test_rejected_refresh_logs_out_once() {
        let (manager, api, navigator, db) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_reject_refresh(true);

        let result = manager.refresh_access_token().await;

        assert!(matches!(result, Err(AuthError::RefreshRejected)));
        assert_eq!(manager.status(), SessionStatus::LoggedOut);
        assert!(persisted_session_keys(&db).is_empty());
        assert_eq!(navigator.redirects(), 1);
        assert_eq!(api.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_session() {
        let (manager, api, navigator, _) = setup();
        let login = manager.login(&credentials()).await.unwrap();
        api.set_transport_failure(true);

        let result = manager.refresh_access_token().await;

        assert!(matches!(result, Err(AuthError::Transport(_))));
        assert_eq!(manager.access_token(), Some(login.access));
        assert!(manager.is_authenticated());
        assert_eq!(navigator.redirects(), 0);
    }

    #[tokio::test]
    async fn test_refresh_when_logged_out() {
        let (manager, api, navigator, _) = setup();

        let result = manager.refresh_access_token().await;

        assert!(matches!(result, Err(AuthError::NotLoggedIn)));
        assert_eq!(api.refresh_calls(), 0);
        assert_eq!(navigator.redirects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_refresh_response_is_discarded_after_logout() {
        let (manager, api, _, db) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_refresh_delay(Duration::from_secs(5));

        let refreshing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh_access_token().await }
        });
        settle().await;
        assert_eq!(api.refresh_calls(), 1);

        manager.logout().await;
        let result = refreshing.await.unwrap();

        assert!(matches!(result, Err(AuthError::SessionChanged)));
        assert_eq!(manager.snapshot(), SessionSnapshot::default());
        assert!(persisted_session_keys(&db).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_refresh_rejection_keeps_next_session() {
        let (manager, api, navigator, _) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_refresh_delay(Duration::from_secs(5));

        let refreshing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh_access_token().await }
        });
        settle().await;

        // Logout blacklists the refresh token the request is carrying
        manager.logout().await;
        let next = manager.login(&credentials()).await.unwrap();
        let result = refreshing.await.unwrap();

        assert!(matches!(result, Err(AuthError::SessionChanged)));
        assert!(manager.is_authenticated());
        assert_eq!(manager.access_token(), Some(next.access));
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_profile_rejection_keeps_next_session() {
        let (manager, api, navigator, _) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_profile_delay(Duration::from_secs(5));

        let fetching = tokio::spawn({
            let manager = manager.clone();
            async move { manager.fetch_profile().await }
        });
        settle().await;
        api.set_reject_profile(true);

        manager.logout().await;
        manager.login(&credentials()).await.unwrap();
        let result = fetching.await.unwrap();

        assert!(matches!(result, Err(AuthError::SessionChanged)));
        assert!(manager.is_authenticated());
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_current_user_keeps_next_session() {
        let (manager, api, navigator, db) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_profile_delay(Duration::from_secs(5));

        let fetching = tokio::spawn({
            let manager = manager.clone();
            async move { manager.fetch_current_user().await }
        });
        settle().await;

        manager.logout().await;
        manager.login(&credentials()).await.unwrap();
        let result = fetching.await.unwrap();

        assert!(matches!(result, Err(AuthError::SessionChanged)));
        assert!(manager.is_authenticated());
        assert_eq!(persisted_session_keys(&db).len(), 4);
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_current_user_failure_keeps_next_session() {
        let (manager, api, navigator, _) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_profile_delay(Duration::from_secs(5));

        let fetching = tokio::spawn({
            let manager = manager.clone();
            async move { manager.fetch_current_user().await }
        });
        settle().await;
        api.set_reject_profile(true);

        manager.logout().await;
        manager.login(&credentials()).await.unwrap();
        let result = fetching.await.unwrap();

        assert!(matches!(result, Err(AuthError::SessionChanged)));
        assert!(manager.is_authenticated());
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test]
    async fn test_login_replaces_previous_session_generation() {
        let (manager, _, _, _) = setup();
        manager.login(&credentials()).await.unwrap();
        let before = manager.generation();

        manager.login(&credentials()).await.unwrap();

        assert_ne!(manager.generation(), before);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let (manager, api, _, db) = setup();
        let login = manager.login(&credentials()).await.unwrap();
        manager.stop_auto_refresh();
        db.with_connection(|conn| Ok(conn.execute_batch("DROP TABLE local_storage")?))
            .unwrap();

        let refreshed = manager.refresh_access_token().await;
        assert!(matches!(refreshed, Err(AuthError::Storage(_))));
        assert_eq!(manager.access_token(), Some(login.access));

        api.set_user_email("alice@new.example.com");
        assert!(matches!(
            manager.fetch_profile().await,
            Err(AuthError::Storage(_))
        ));
        assert_eq!(
            manager.current_user().unwrap().email.as_deref(),
            Some("alice@example.com")
        );
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_after_unauthorized_reuses_newer_token() {
        let (manager, api, _, _) = setup();
        let login = manager.login(&credentials()).await.unwrap();
        let fresh = manager.refresh_access_token().await.unwrap();

        // A request that failed with the login token finds the fresh one
        let token = manager
            .refresh_after_unauthorized(&login.access)
            .await
            .unwrap();
        assert_eq!(token, fresh);
        assert_eq!(api.refresh_calls(), 1);

        let newer = manager.refresh_after_unauthorized(&fresh).await.unwrap();
        assert_ne!(newer, fresh);
        assert_eq!(api.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_fetch_profile_updates_user() {
        let (manager, api, _, db) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_user_email("alice@new.example.com");

        let user = manager.fetch_profile().await.unwrap();

        assert_eq!(user.email.as_deref(), Some("alice@new.example.com"));
        assert_eq!(manager.current_user(), Some(user));
        assert!(db
            .get_item(USER_KEY)
            .unwrap()
            .unwrap()
            .contains("alice@new.example.com"));
    }

    #[tokio::test]
    async fn test_unauthorized_profile_logs_out() {
        let (manager, api, navigator, _) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_reject_profile(true);

        let result = manager.fetch_profile().await;

        assert!(matches!(result, Err(AuthError::Unauthorized)));
        assert!(!manager.has_credentials());
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test]
    async fn test_profile_transport_failure_keeps_session() {
        let (manager, api, _, _) = setup();
        manager.login(&credentials()).await.unwrap();
        api.set_transport_failure(true);

        assert!(matches!(
            manager.fetch_profile().await,
            Err(AuthError::Transport(_))
        ));
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_fetch_profile_without_session_logs_out() {
        let (manager, api, navigator, _) = setup();

        assert!(matches!(
            manager.fetch_profile().await,
            Err(AuthError::Unauthorized)
        ));
        assert_eq!(api.profile_calls(), 0);
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test]
    async fn test_fetch_current_user_failure_logs_out() {
        let (manager, api, navigator, _) = setup();
        manager.login(&credentials()).await.unwrap();

        let user = manager.fetch_current_user().await.unwrap();
        assert_eq!(user.username, "alice");

        api.set_transport_failure(true);
        assert!(manager.fetch_current_user().await.is_err());
        assert_eq!(api.current_user_calls(), 2);
        assert!(!manager.has_credentials());
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test]
    async fn test_register_does_not_log_in() {
        let (manager, api, _, db) = setup();
        let registration = Registration {
            username: "carol".to_string(),
            email: "carol@example.com".to_string(),
            password: "pw".to_string(),
            password_confirm: "pw".to_string(),
        };

        let user = manager.register(&registration).await.unwrap();

        assert_eq!(user.username, "carol");
        assert_eq!(api.register_calls(), 1);
        assert!(!manager.has_credentials());
        assert!(persisted_session_keys(&db).is_empty());
    }

    // === Startup ===

    fn persist_expired_session(db: &Database, with_user: bool) {
        let user = json!({"id": 1, "username": "alice"}).to_string();
        let expired = now_millis() - 60_000;
        let access = encode_jwt(&json!({"exp": expired / 1000}));
        let mut items = vec![
            (ACCESS_TOKEN_KEY, access.as_str()),
            (REFRESH_TOKEN_KEY, FakeAuthApi::INITIAL_REFRESH_TOKEN),
        ];
        let expired = expired.to_string();
        items.push((EXPIRES_AT_KEY, expired.as_str()));
        if with_user {
            items.push((USER_KEY, user.as_str()));
        }
        db.set_items(&items).unwrap();
    }

    #[tokio::test]
    async fn test_initialize_with_expired_token_and_cached_user() {
        let db = Database::open_in_memory().unwrap();
        persist_expired_session(&db, true);
        let (manager, api, _, _) = setup_with_db(db);
        assert_eq!(manager.status(), SessionStatus::Expired);
        assert!(!manager.is_authenticated());

        manager.initialize_session().await.unwrap();

        assert!(manager.is_authenticated());
        assert_eq!(manager.status(), SessionStatus::Valid);
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(api.profile_calls(), 0);
        assert!(manager.is_auto_refresh_running());
    }

    #[tokio::test]
    async fn test_initialize_with_expired_token_without_user() {
        let db = Database::open_in_memory().unwrap();
        persist_expired_session(&db, false);
        let (manager, api, _, _) = setup_with_db(db);

        manager.initialize_session().await.unwrap();

        assert!(manager.is_authenticated());
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(api.profile_calls(), 1);
    }

    #[tokio::test]
    async fn test_initialize_aborts_when_refresh_fails() {
        let db = Database::open_in_memory().unwrap();
        persist_expired_session(&db, true);
        let (manager, api, navigator, db) = setup_with_db(db);
        api.set_transport_failure(true);

        assert!(manager.initialize_session().await.is_err());

        assert_eq!(manager.status(), SessionStatus::LoggedOut);
        assert_eq!(api.profile_calls(), 0);
        assert!(!manager.is_auto_refresh_running());
        assert!(persisted_session_keys(&db).is_empty());
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test]
    async fn test_initialize_logs_out_when_profile_fails() {
        let db = Database::open_in_memory().unwrap();
        db.set_items(&[
            (ACCESS_TOKEN_KEY, "opaque"),
            (REFRESH_TOKEN_KEY, FakeAuthApi::INITIAL_REFRESH_TOKEN),
        ])
        .unwrap();
        let (manager, api, _, _) = setup_with_db(db);
        api.set_transport_failure(true);

        assert!(manager.initialize_session().await.is_err());
        assert!(!manager.has_credentials());
    }

    #[tokio::test]
    async fn test_initialize_without_tokens_is_noop() {
        let (manager, api, navigator, _) = setup();

        manager.initialize_session().await.unwrap();

        assert_eq!(manager.status(), SessionStatus::LoggedOut);
        assert_eq!(api.refresh_calls() + api.profile_calls(), 0);
        assert!(!manager.is_auto_refresh_running());
        assert_eq!(navigator.redirects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_restore_keeps_session_logged_in_meanwhile() {
        let db = Database::open_in_memory().unwrap();
        persist_expired_session(&db, true);
        let (manager, api, navigator, _) = setup_with_db(db);
        api.set_refresh_delay(Duration::from_secs(5));

        let restoring = tokio::spawn({
            let manager = manager.clone();
            async move { manager.initialize_session().await }
        });
        settle().await;
        assert_eq!(api.refresh_calls(), 1);

        manager.logout().await;
        let next = manager.login(&credentials()).await.unwrap();
        let result = restoring.await.unwrap();

        assert!(matches!(result, Err(AuthError::SessionChanged)));
        assert!(manager.is_authenticated());
        assert_eq!(manager.access_token(), Some(next.access));
        assert_eq!(navigator.redirects(), 1);
    }

    #[tokio::test]
    async fn test_session_round_trips_through_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");

        let before = {
            let (manager, _, _, _) = setup_with_db(Database::open(&path).unwrap());
            manager.login(&credentials()).await.unwrap();
            manager.stop_auto_refresh();
            manager.snapshot()
        };

        let (restored, api, _, _) = setup_with_db(Database::open(&path).unwrap());
        restored.initialize_session().await.unwrap();

        assert_eq!(restored.snapshot(), before);
        assert_eq!(api.refresh_calls() + api.profile_calls(), 0);
    }

    // === Auto-refresh ===

    #[tokio::test(start_paused = true)]
    async fn test_tick_refreshes_token_inside_window() {
        let (manager, api, _, _) = setup();
        api.set_access_ttl(Duration::from_secs(3 * 60));
        manager.login(&credentials()).await.unwrap();
        let first_expiry = manager.expires_at();
        assert_eq!(manager.status(), SessionStatus::ExpiringSoon);

        api.set_access_ttl(Duration::from_secs(30 * 60));
        tokio::time::advance(POLL + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(api.refresh_calls(), 1);
        assert!(manager.expires_at() > first_expiry);
        assert_eq!(manager.status(), SessionStatus::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_ignores_token_outside_window() {
        let (manager, api, _, _) = setup();
        api.set_access_ttl(Duration::from_secs(10 * 60));
        manager.login(&credentials()).await.unwrap();

        tokio::time::advance(POLL + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarting_auto_refresh_keeps_one_timer() {
        let (manager, api, _, _) = setup();
        api.set_access_ttl(Duration::from_secs(3 * 60));
        manager.login(&credentials()).await.unwrap();

        manager.start_auto_refresh();
        manager.start_auto_refresh();
        settle().await;

        tokio::time::advance(POLL + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(api.refresh_calls(), 1);
        assert!(manager.is_auto_refresh_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_does_not_refresh() {
        let (manager, api, _, _) = setup();
        api.set_access_ttl(Duration::from_secs(3 * 60));
        manager.login(&credentials()).await.unwrap();

        manager.stop_auto_refresh();
        assert!(!manager.is_auto_refresh_running());

        tokio::time::advance(POLL * 3).await;
        settle().await;

        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_with_rejected_refresh_logs_out() {
        let (manager, api, navigator, db) = setup();
        api.set_access_ttl(Duration::from_secs(3 * 60));
        manager.login(&credentials()).await.unwrap();
        api.set_reject_refresh(true);

        tokio::time::advance(POLL + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(manager.status(), SessionStatus::LoggedOut);
        assert!(!manager.is_auto_refresh_running());
        assert!(persisted_session_keys(&db).is_empty());
        assert_eq!(navigator.redirects(), 1);

        tokio::time::advance(POLL * 2).await;
        settle().await;
        assert_eq!(api.refresh_calls(), 1);
    }
}
