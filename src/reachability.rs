//! Network reachability signal.
//!
//! A boolean online/offline flag with change notifications, backed by a
//! tokio watch channel. The host feeds it from whatever connectivity events
//! the platform provides; `probe` offers a fallback health-check against the
//! remote store itself.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::remote::RemoteStore;

#[derive(Debug)]
pub struct Reachability {
    tx: watch::Sender<bool>,
}

impl Reachability {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a connectivity change. Transitions are logged; repeated
    /// notifications of the same state are ignored.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Network restored; resuming queued sync");
            } else {
                info!("Network offline; deferring remote sync and keeping queue pending");
            }
        }
    }

    /// Subscribe to connectivity changes (used by the sync loop to react to
    /// a reachability-regained edge).
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Health-check the remote store and record the result.
    pub async fn probe(&self, remote: &Arc<dyn RemoteStore>) -> bool {
        let online = remote.health_check().await.is_ok();
        self.set_online(online);
        online
    }
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_online_notifies_subscribers_on_change_only() {
        let reach = Reachability::new(false);
        let mut rx = reach.subscribe();
        assert!(!reach.is_online());

        // Same-state notification does not wake subscribers.
        reach.set_online(false);
        assert!(!rx.has_changed().unwrap());

        reach.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(reach.is_online());
    }

    #[tokio::test]
    async fn test_probe_records_remote_health() {
        let mock = Arc::new(crate::remote::mock::MockRemote::new());
        let remote: Arc<dyn RemoteStore> = mock.clone();

        let reach = Reachability::new(false);
        assert!(reach.probe(&remote).await);
        assert!(reach.is_online());

        mock.set_fail_all(true);
        assert!(!reach.probe(&remote).await);
        assert!(!reach.is_online());
    }
}
