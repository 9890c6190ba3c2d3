//! Navigation guard for protected and guest-only routes.

use serde::{Deserialize, Serialize};
use testhub_auth::SessionManager;

pub const LOGIN_PATH: &str = "/login";
pub const HOME_PATH: &str = "/home";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMeta {
    #[serde(default)]
    pub requires_auth: bool,
    /// Login and registration pages; signed-in users are sent home
    #[serde(default)]
    pub requires_guest: bool,
}

impl RouteMeta {
    pub const PUBLIC: RouteMeta = RouteMeta {
        requires_auth: false,
        requires_guest: false,
    };

    pub const PROTECTED: RouteMeta = RouteMeta {
        requires_auth: true,
        requires_guest: false,
    };

    pub const GUEST: RouteMeta = RouteMeta {
        requires_auth: false,
        requires_guest: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardDecision {
    Proceed,
    RedirectToLogin,
    RedirectToHome,
}

impl GuardDecision {
    pub fn redirect_path(&self) -> Option<&'static str> {
        match self {
            GuardDecision::Proceed => None,
            GuardDecision::RedirectToLogin => Some(LOGIN_PATH),
            GuardDecision::RedirectToHome => Some(HOME_PATH),
        }
    }
}

#[derive(Clone)]
pub struct RouteGuard {
    session: SessionManager,
    restoring: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl RouteGuard {
    pub fn new(session: SessionManager) -> Self {
        Self {
            session,
            restoring: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Decide whether navigation to a route with `meta` may go ahead. A
    /// persisted session without a loaded user is restored first.
    pub async fn check(&self, meta: &RouteMeta) -> GuardDecision {
        if self.needs_restore() {
            let _restoring = self.restoring.lock().await;
            // Another navigation may have restored it while this one waited
            if self.needs_restore() {
                if let Err(e) = self.session.initialize_session().await {
                    tracing::warn!(error = %e, "Session restore failed during navigation");
                }
            }
        }

        let authenticated = self.session.is_authenticated();
        let decision = if meta.requires_auth && !authenticated {
            GuardDecision::RedirectToLogin
        } else if meta.requires_guest && authenticated {
            GuardDecision::RedirectToHome
        } else {
            GuardDecision::Proceed
        };

        tracing::debug!(
            requires_auth = meta.requires_auth,
            requires_guest = meta.requires_guest,
            authenticated,
            decision = ?decision,
            "Route guard decision"
        );
        decision
    }

    fn needs_restore(&self) -> bool {
        self.session.has_credentials() && self.session.current_user().is_none()
    }
}
