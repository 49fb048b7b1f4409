//! Entry/exit correlation
//!
//! An entry hook and its matching exit hook are separate activations with
//! no shared stack. The entry side stashes what the exit side needs in a
//! [`CorrelationTable`] under the initiating task's key; the exit side takes
//! it back out.
//!
//! Entries whose exit is never observed (task killed mid-call, probe
//! attached between entry and exit) stay in the table until the next
//! `begin` on the same key overwrites them. Nothing sweeps stale entries.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::TableFull;
use crate::memory::Handle;

/// How a task maps to a correlation key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrelationKey {
    /// Full pid_tgid: one pending operation per thread
    #[default]
    Thread,
    /// Process id only: threads of a process share one slot
    Process,
}

impl CorrelationKey {
    pub fn key_for(self, pid_tgid: u64) -> u64 {
        match self {
            CorrelationKey::Thread => pid_tgid,
            CorrelationKey::Process => pid_tgid >> 32,
        }
    }
}

/// Context captured at entry for the common case: the object being
/// operated on and when the operation began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOp {
    pub target: Handle,
    pub started_ns: u64,
}

/// Keyed store of in-flight operations with a fixed maximum size.
pub struct CorrelationTable<V = PendingOp> {
    name: &'static str,
    capacity: usize,
    entries: Mutex<HashMap<u64, V>>,
}

impl<V: Copy> CorrelationTable<V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            entries: Mutex::new(HashMap::with_capacity(capacity.min(1024))),
        }
    }

    /// Record `value` as the pending operation for `key`.
    ///
    /// Overwrites any leftover entry for the key and returns it. Fails only
    /// when the key is new and the table is already at capacity.
    pub fn begin(&self, key: u64, value: V) -> Result<Option<V>, TableFull> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            return Err(TableFull {
                table: self.name,
                capacity: self.capacity,
            });
        }
        Ok(entries.insert(key, value))
    }

    /// Take the pending operation for `key`, leaving no entry behind.
    pub fn end(&self, key: u64) -> Option<V> {
        self.entries.lock().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<V> std::fmt::Debug for CorrelationTable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn op(target: u64) -> PendingOp {
        PendingOp {
            target: Handle(target),
            started_ns: 0,
        }
    }

    #[test]
    fn test_end_without_begin_is_missing() {
        let table: CorrelationTable = CorrelationTable::new("connect_args", 4);
        assert_eq!(table.end(7), None);
    }

    #[test]
    fn test_begin_reclaims_stale_entry() {
        let table: CorrelationTable = CorrelationTable::new("connect_args", 4);
        assert_eq!(table.begin(7, op(1)).unwrap(), None);
        assert_eq!(table.begin(7, op(2)).unwrap(), Some(op(1)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_rejects_new_keys_only() {
        let table: CorrelationTable = CorrelationTable::new("connect_args", 2);
        table.begin(1, op(1)).unwrap();
        table.begin(2, op(2)).unwrap();

        let err = table.begin(3, op(3)).unwrap_err();
        assert_eq!(err.capacity, 2);
        assert_eq!(err.table, "connect_args");

        // Existing keys can still be overwritten
        assert_eq!(table.begin(2, op(20)).unwrap(), Some(op(2)));
        assert_eq!(table.end(2), Some(op(20)));
        assert!(table.begin(3, op(3)).is_ok());
    }

    #[test]
    fn test_process_key_shares_slot() {
        let a = (42u64 << 32) | 1;
        let b = (42u64 << 32) | 2;
        assert_ne!(CorrelationKey::Thread.key_for(a), CorrelationKey::Thread.key_for(b));
        assert_eq!(CorrelationKey::Process.key_for(a), 42);
        assert_eq!(CorrelationKey::Process.key_for(b), 42);
    }

    #[test]
    fn test_clear() {
        let table: CorrelationTable = CorrelationTable::new("file_args", 8);
        table.begin(1, op(1)).unwrap();
        table.clear();
        assert!(table.is_empty());
    }

    proptest! {
        #[test]
        fn prop_begin_then_end_round_trips(key in any::<u64>(), target in any::<u64>(), ts in any::<u64>()) {
            let table: CorrelationTable = CorrelationTable::new("prop", 16);
            let ctx = PendingOp { target: Handle(target), started_ns: ts };
            table.begin(key, ctx).unwrap();
            prop_assert_eq!(table.end(key), Some(ctx));
            prop_assert_eq!(table.end(key), None);
        }

        #[test]
        fn prop_second_begin_wins(key in any::<u64>(), first in any::<u64>(), second in any::<u64>()) {
            let table: CorrelationTable = CorrelationTable::new("prop", 16);
            table.begin(key, op(first)).unwrap();
            table.begin(key, op(second)).unwrap();
            prop_assert_eq!(table.end(key), Some(op(second)));
            prop_assert!(table.is_empty());
        }
    }
}
