//! Hook for sending the user back to the login surface.

pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self);
}

/// For hosts that poll `is_authenticated` instead of reacting to logout.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn redirect_to_login(&self) {}
}
