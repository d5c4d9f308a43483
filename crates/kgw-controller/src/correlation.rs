use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

/// Cell an in-flight request belongs to, and the relay that recorded it.
///
/// Only the recording relay persists output for the request. Other relays
/// attached to the same kernel see the same broadcast output and skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub cell_id: Uuid,
    pub relay_id: Uuid,
}

/// Maps the `msg_id` of an in-flight `execute_request` to the cell that
/// issued it. Shared by every relay in the process.
///
/// The lock is held only for a single map operation, never across an await.
/// Each operation leaves the map consistent, so a poisoned lock is recovered.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, Correlation>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Correlation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Associates `msg_id` with `cell_id` on behalf of `relay_id`, replacing
    /// and returning any previous association.
    pub fn record(&self, msg_id: &str, relay_id: Uuid, cell_id: Uuid) -> Option<Correlation> {
        self.entries()
            .insert(msg_id.to_string(), Correlation { cell_id, relay_id })
    }

    pub fn lookup(&self, parent_msg_id: &str) -> Option<Correlation> {
        self.entries().get(parent_msg_id).copied()
    }

    /// Drops the entry for `msg_id` if `relay_id` recorded it.
    pub fn forget(&self, msg_id: &str, relay_id: Uuid) -> Option<Correlation> {
        let mut entries = self.entries();
        match entries.get(msg_id) {
            Some(entry) if entry.relay_id == relay_id => entries.remove(msg_id),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn record_lookup_forget() {
        let table = CorrelationTable::new();
        let relay = Uuid::new_v4();
        let cell = Uuid::new_v4();
        let entry = Correlation {
            cell_id: cell,
            relay_id: relay,
        };
        assert_eq!(table.record("m1", relay, cell), None);
        assert_eq!(table.lookup("m1"), Some(entry));
        assert_eq!(table.lookup("m2"), None);
        assert_eq!(table.forget("m1", relay), Some(entry));
        assert_eq!(table.lookup("m1"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn record_replaces_previous_entry() {
        let table = CorrelationTable::new();
        let relay = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        table.record("m1", relay, first);
        assert_eq!(
            table.record("m1", relay, second).map(|e| e.cell_id),
            Some(first)
        );
        assert_eq!(table.lookup("m1").map(|e| e.cell_id), Some(second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn only_the_recording_relay_can_forget() {
        let table = CorrelationTable::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        table.record("m1", owner, Uuid::new_v4());
        assert_eq!(table.forget("m1", other), None);
        assert_eq!(table.len(), 1);
        assert!(table.forget("m1", owner).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let table = Arc::new(CorrelationTable::new());
        let relay = Uuid::new_v4();
        table.record("m1", relay, Uuid::new_v4());
        let poisoner = table.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.lock().unwrap();
            panic!("poison the table");
        })
        .join();
        assert!(table.entries.is_poisoned());
        assert!(table.lookup("m1").is_some());
        assert!(table.forget("m1", relay).is_some());
    }

    #[test]
    fn concurrent_writers_keep_every_entry() {
        let table = Arc::new(CorrelationTable::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let relay = Uuid::new_v4();
                    for i in 0..100 {
                        table.record(&format!("t{t}-m{i}"), relay, Uuid::new_v4());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 800);
    }
}
