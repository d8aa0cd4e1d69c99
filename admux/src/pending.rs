//! One-shot rendezvous table for in-flight outbound opens.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::socket::Socket;

/// A locally-initiated `OPEN` awaiting the peer's verdict.
pub(crate) struct PendingOpen {
    /// Service string the open was issued for (without any wire NUL).
    pub(crate) service: String,
    /// Completion handle back to the `open` caller.
    pub(crate) tx: oneshot::Sender<Result<Socket>>,
}

/// Table binding each outbound `OPEN` to its eventual reply.
///
/// Each entry is completed at most once: the first `remove` wins and any
/// later completion attempt for the same id finds nothing.
pub(crate) struct PendingOpens {
    entries: HashMap<u32, PendingOpen>,
}

impl PendingOpens {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, local_id: u32, entry: PendingOpen) {
        let previous = self.entries.insert(local_id, entry);
        debug_assert!(previous.is_none(), "pending open id collision");
    }

    /// Take the entry for `local_id`, if one is still outstanding.
    pub(crate) fn remove(&mut self, local_id: u32) -> Option<PendingOpen> {
        self.entries.remove(&local_id)
    }

    pub(crate) fn contains(&self, local_id: u32) -> bool {
        self.entries.contains_key(&local_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Fail every outstanding open. Used at dispose time.
    pub(crate) fn fail_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            let _ = entry.tx.send(Err(Error::ConnectionClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(service: &str) -> (PendingOpen, oneshot::Receiver<Result<Socket>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingOpen {
                service: service.to_string(),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn test_completion_is_one_shot() {
        let mut pending = PendingOpens::new();
        let (open, _rx) = entry("shell:");
        pending.insert(1, open);

        assert!(pending.contains(1));
        assert!(pending.remove(1).is_some());
        // A duplicate reply for the same id finds nothing.
        assert!(pending.remove(1).is_none());
        assert!(!pending.contains(1));
    }

    #[tokio::test]
    async fn test_fail_all_unblocks_every_waiter() {
        let mut pending = PendingOpens::new();
        let (open_a, rx_a) = entry("shell:");
        let (open_b, rx_b) = entry("sync:");
        pending.insert(1, open_a);
        pending.insert(2, open_b);

        pending.fail_all();
        assert_eq!(pending.len(), 0);

        for rx in [rx_a, rx_b] {
            match rx.await {
                Ok(Err(Error::ConnectionClosed)) => {}
                other => panic!("expected ConnectionClosed, got {:?}", other.map(|r| r.err())),
            }
        }
    }
}
