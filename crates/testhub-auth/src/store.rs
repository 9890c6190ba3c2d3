//! Persisted mirror of the session in local storage.

use testhub_storage::Database;

use crate::session::{SessionSnapshot, UserProfile};
use crate::Result;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const EXPIRES_AT_KEY: &str = "token_expires_at";
pub const USER_KEY: &str = "user";

/// Every key owned by the session. Other keys (e.g. the UI language) are
/// left alone on logout.
pub const SESSION_KEYS: [&str; 4] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRES_AT_KEY, USER_KEY];

#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Tokens and expiry. The user profile is loaded separately by
    /// [`SessionStore::load_user`].
    pub fn load_tokens(&self) -> Result<SessionSnapshot> {
        let access_token = self.non_empty(ACCESS_TOKEN_KEY)?;
        let refresh_token = self.non_empty(REFRESH_TOKEN_KEY)?;
        let expires_at = match self.non_empty(EXPIRES_AT_KEY)? {
            Some(raw) => raw.parse::<i64>().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring malformed token expiry");
                0
            }),
            None => 0,
        };

        Ok(SessionSnapshot {
            access_token,
            refresh_token,
            expires_at,
            current_user: None,
        })
    }

    pub fn load_user(&self) -> Result<Option<UserProfile>> {
        let Some(raw) = self.non_empty(USER_KEY)? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(user) => Ok(Some(user)),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed persisted user profile");
                Ok(None)
            }
        }
    }

    /// Write every present field of `session`. Absent fields are not removed;
    /// use [`SessionStore::clear`] for that.
    pub fn save(&self, session: &SessionSnapshot) -> Result<()> {
        let expires_at = session.expires_at.to_string();
        let user_json = session
            .current_user
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut items: Vec<(&str, &str)> = Vec::with_capacity(SESSION_KEYS.len());
        if let Some(token) = session.access_token.as_deref() {
            items.push((ACCESS_TOKEN_KEY, token));
            items.push((EXPIRES_AT_KEY, &expires_at));
        }
        if let Some(token) = session.refresh_token.as_deref() {
            items.push((REFRESH_TOKEN_KEY, token));
        }
        if let Some(json) = user_json.as_deref() {
            items.push((USER_KEY, json));
        }

        self.db.set_items(&items)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.db.remove_items(&SESSION_KEYS)?;
        Ok(())
    }

    fn non_empty(&self, key: &str) -> Result<Option<String>> {
        Ok(self.db.get_item(key)?.filter(|value| !value.is_empty()))
    }
}
