//! Snapshot broadcaster for the forward registry. Every mutation publishes the full current
//! list as JSON; a subscriber that falls behind skips intermediate snapshots but always sees
//! the most recent one (watch-channel contract).

use bytes::Bytes;
use tokio::sync::watch;

pub struct Broadcaster {
    tx: watch::Sender<Bytes>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Bytes::from_static(b"[]"));
        Self { tx }
    }

    /// Replace the current snapshot; all subscribers are woken. `send_replace` so publishing
    /// works even while nobody is subscribed.
    pub fn publish(&self, snapshot_json: Bytes) {
        self.tx.send_replace(snapshot_json);
    }

    /// New subscribers immediately observe the latest snapshot, then each change.
    pub fn subscribe(&self) -> watch::Receiver<Bytes> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Bytes {
        self.tx.borrow().clone()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_subscriber_sees_only_latest() {
        let b = Broadcaster::new();
        let mut rx = b.subscribe();
        b.publish(Bytes::from_static(b"[1]"));
        b.publish(Bytes::from_static(b"[2]"));
        b.publish(Bytes::from_static(b"[3]"));
        rx.changed().await.unwrap();
        assert_eq!(&*rx.borrow_and_update(), &Bytes::from_static(b"[3]"));
        // No stale intermediate snapshots remain.
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn new_subscriber_gets_current_snapshot() {
        let b = Broadcaster::new();
        b.publish(Bytes::from_static(b"[42]"));
        let rx = b.subscribe();
        assert_eq!(&*rx.borrow(), &Bytes::from_static(b"[42]"));
    }
}
