//! Connectivity monitor.
//!
//! Combines the host's link signal (reported by the embedding shell) with
//! an active probe against the backend's health endpoint. The link being
//! up does not mean the backend is reachable, hence the `Degraded` state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::policy::SyncPolicy;
use crate::remote::RemoteBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// Link up and the backend answered the last probe.
    Online,
    /// Link reported up but the backend is not answering.
    Degraded,
    /// Link reported down.
    Offline,
}

pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteBackend>,
    navigator_online: AtomicBool,
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    pub fn new(remote: Arc<dyn RemoteBackend>) -> Self {
        let (tx, _) = watch::channel(ConnectivityState::Offline);
        Self {
            remote,
            navigator_online: AtomicBool::new(false),
            tx,
        }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Receiver for state transitions; the sync engine drains on every
    /// change to `Online`.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Feed the host's link-state signal. A link-up report triggers an
    /// optimistic `Degraded` until the next probe confirms reachability.
    pub fn set_navigator_online(&self, online: bool) {
        let was = self.navigator_online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        if online {
            self.transition(ConnectivityState::Degraded);
        } else {
            self.transition(ConnectivityState::Offline);
        }
    }

    /// Run one health probe and fold the result into the state.
    pub async fn probe(&self) -> ConnectivityState {
        if !self.navigator_online.load(Ordering::SeqCst) {
            self.transition(ConnectivityState::Offline);
            return ConnectivityState::Offline;
        }
        let next = match self.remote.health_check().await {
            Ok(()) => ConnectivityState::Online,
            Err(err) => {
                debug!(%err, "health probe failed");
                ConnectivityState::Degraded
            }
        };
        self.transition(next);
        next
    }

    fn transition(&self, next: ConnectivityState) {
        let changed = self.tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "connectivity changed");
        }
    }

    /// Probe on an interval until the monitor is dropped.
    pub fn spawn(self: Arc<Self>, policy: &SyncPolicy) {
        let monitor = Arc::downgrade(&self);
        let interval = policy.probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.probe().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::MockBackend;
    use crate::remote::RemoteError;

    #[tokio::test]
    async fn test_offline_until_navigator_reports_up() {
        let remote = Arc::new(MockBackend::new());
        let monitor = ConnectivityMonitor::new(remote);

        assert_eq!(monitor.current(), ConnectivityState::Offline);
        // Probes while the link is down never hit the network.
        assert_eq!(monitor.probe().await, ConnectivityState::Offline);
    }

    #[tokio::test]
    async fn test_probe_confirms_online() {
        let remote = Arc::new(MockBackend::new());
        let monitor = ConnectivityMonitor::new(remote.clone());

        monitor.set_navigator_online(true);
        assert_eq!(monitor.current(), ConnectivityState::Degraded);

        assert_eq!(monitor.probe().await, ConnectivityState::Online);
        assert_eq!(monitor.current(), ConnectivityState::Online);
    }

    #[tokio::test]
    async fn test_failed_probe_degrades() {
        let remote = Arc::new(MockBackend::new());
        let monitor = ConnectivityMonitor::new(remote.clone());
        monitor.set_navigator_online(true);
        monitor.probe().await;
        assert_eq!(monitor.current(), ConnectivityState::Online);

        *remote.healthy.lock().unwrap() = false;
        assert_eq!(monitor.probe().await, ConnectivityState::Degraded);

        *remote.healthy.lock().unwrap() = true;
        assert_eq!(monitor.probe().await, ConnectivityState::Online);
    }

    #[tokio::test]
    async fn test_auth_failure_still_means_reachable_but_degraded() {
        let remote = Arc::new(MockBackend::new());
        remote.script_error("health_check", RemoteError::Auth("revoked".to_string()));
        let monitor = ConnectivityMonitor::new(remote);
        monitor.set_navigator_online(true);

        assert_eq!(monitor.probe().await, ConnectivityState::Degraded);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let remote = Arc::new(MockBackend::new());
        let monitor = ConnectivityMonitor::new(remote);
        let mut rx = monitor.subscribe();

        monitor.set_navigator_online(true);
        rx.changed().await.expect("change");
        assert_eq!(*rx.borrow(), ConnectivityState::Degraded);
    }
}
