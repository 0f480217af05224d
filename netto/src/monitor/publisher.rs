// Snapshot distribution to subscribers

use crate::process::{MonitorSnapshot, SharedSnapshot};
use std::sync::Arc;
use tokio::sync::watch;

/// Hands immutable snapshots to any number of subscribers.
///
/// Backed by a latest-value channel: a slow subscriber skips intermediate
/// snapshots instead of queueing them.
#[derive(Debug)]
pub struct BandwidthPublisher {
    tx: watch::Sender<SharedSnapshot>,
}

impl BandwidthPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(MonitorSnapshot::empty()));
        Self { tx }
    }

    pub fn publish(&self, snapshot: MonitorSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub fn subscribe(&self) -> SnapshotSubscription {
        SnapshotSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn latest(&self) -> SharedSnapshot {
        self.tx.borrow().clone()
    }
}

impl Default for BandwidthPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of snapshots published after subscribing
pub struct SnapshotSubscription {
    rx: watch::Receiver<SharedSnapshot>,
}

impl SnapshotSubscription {
    /// Wait for the next snapshot; `None` once the publisher is gone
    pub async fn next(&mut self) -> Option<SharedSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Most recent snapshot without waiting
    pub fn latest(&self) -> SharedSnapshot {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessBandwidth;
    use chrono::Utc;

    fn snapshot_with(name: &str) -> MonitorSnapshot {
        MonitorSnapshot {
            captured_at: Utc::now(),
            processes: vec![ProcessBandwidth {
                name: name.to_string(),
                pid: 1,
                download_speed: 1.0,
                upload_speed: 0.0,
                history: vec![(1, 0)],
                last_seen: Utc::now(),
            }],
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_snapshots() {
        let publisher = BandwidthPublisher::new();
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        publisher.publish(snapshot_with("curl"));

        assert!(first.next().await.unwrap().get("curl").is_some());
        assert!(second.next().await.unwrap().get("curl").is_some());
    }

    #[tokio::test]
    async fn test_held_snapshot_is_never_mutated() {
        let publisher = BandwidthPublisher::new();
        let mut sub = publisher.subscribe();

        publisher.publish(snapshot_with("a"));
        let held = sub.next().await.unwrap();
        publisher.publish(snapshot_with("b"));

        assert!(held.get("a").is_some());
        assert!(held.get("b").is_none());
        assert!(sub.latest().get("b").is_some());
    }

    #[tokio::test]
    async fn test_next_ends_when_publisher_dropped() {
        let publisher = BandwidthPublisher::new();
        let mut sub = publisher.subscribe();
        drop(publisher);
        assert!(sub.next().await.is_none());
    }
}
