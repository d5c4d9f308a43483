use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

/// Tracks live relays per kernel so they can be torn down administratively.
///
/// A poisoned lock is recovered; every operation is a single map update.
#[derive(Debug, Default)]
pub struct RelayRegistry {
    kernels: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn kernels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<()>>> {
        self.kernels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Teardown signal for a relay attaching to `kernel_id`.
    pub fn subscribe(&self, kernel_id: &str) -> broadcast::Receiver<()> {
        self.kernels()
            .entry(kernel_id.to_string())
            .or_insert_with(|| broadcast::channel(1).0)
            .subscribe()
    }

    /// Signals every relay attached to `kernel_id` to close both of its
    /// connections. Returns how many relay pumps were signalled.
    pub fn teardown(&self, kernel_id: &str) -> usize {
        let sender = self.kernels().remove(kernel_id);
        let signalled = sender.map_or(0, |tx| tx.send(()).unwrap_or(0));
        if signalled > 0 {
            tracing::info!(kernel_id, "tearing down kernel relays");
        }
        signalled
    }

    pub fn teardown_all(&self) -> usize {
        let senders: Vec<_> = self.kernels().drain().collect();
        senders
            .into_iter()
            .map(|(_, tx)| tx.send(()).unwrap_or(0))
            .sum()
    }

    /// Forgets `kernel_id` once no relay is attached to it anymore.
    pub fn release(&self, kernel_id: &str) {
        let mut kernels = self.kernels();
        if kernels
            .get(kernel_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            kernels.remove(kernel_id);
        }
    }

    pub fn is_attached(&self, kernel_id: &str) -> bool {
        self.kernels()
            .get(kernel_id)
            .is_some_and(|tx| tx.receiver_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn teardown_reaches_every_subscriber() {
        let registry = RelayRegistry::new();
        let mut a = registry.subscribe("k1");
        let mut b = registry.subscribe("k1");
        let mut other = registry.subscribe("k2");

        assert_eq!(registry.teardown("k1"), 2);
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
        assert!(other.try_recv().is_err());
        assert!(!registry.is_attached("k1"));
        assert!(registry.is_attached("k2"));
        assert_eq!(registry.teardown("k1"), 0);
    }

    #[test]
    fn release_keeps_entries_with_live_relays() {
        let registry = RelayRegistry::new();
        let first = registry.subscribe("k1");
        let second = registry.subscribe("k1");
        drop(first);
        registry.release("k1");
        assert!(registry.is_attached("k1"));
        drop(second);
        registry.release("k1");
        assert!(!registry.is_attached("k1"));
        assert_eq!(registry.teardown_all(), 0);
    }
}
