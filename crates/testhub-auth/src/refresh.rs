//! Background task that keeps the access token fresh.

use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::manager::{SessionInner, SessionManager};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RefreshControl {
    Run,
    Stop,
}

/// Handle to a running poller. Dropping it without [`AutoRefresh::stop`]
/// also ends the task, on its next wake-up.
pub(crate) struct AutoRefresh {
    control: watch::Sender<RefreshControl>,
    handle: JoinHandle<()>,
}

impl AutoRefresh {
    pub(crate) fn spawn(session: Weak<SessionInner>, interval: Duration) -> Self {
        let (control, rx) = watch::channel(RefreshControl::Run);
        let handle = tokio::spawn(run(session, interval, rx));
        Self { control, handle }
    }

    /// A refresh already in progress runs to completion; no further tick acts.
    pub(crate) fn stop(self) {
        let _ = self.control.send(RefreshControl::Stop);
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished() && *self.control.borrow() == RefreshControl::Run
    }
}

async fn run(
    session: Weak<SessionInner>,
    interval: Duration,
    mut control: watch::Receiver<RefreshControl>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = control.changed() => {
                if changed.is_err() || *control.borrow() == RefreshControl::Stop {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = session.upgrade() else {
                    break;
                };
                SessionManager::from_inner(inner).auto_refresh_tick().await;
            }
        }
    }

    tracing::debug!("Auto-refresh task stopped");
}
