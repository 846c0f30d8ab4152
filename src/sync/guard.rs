use std::collections::HashMap;
use std::fmt;

use crate::model::{EntityId, FieldKey};

/// Dispatch stamp. Strictly increasing across the whole engine, which makes
/// it strictly increasing per key as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Pending(Seq),
    Committed(Seq),
    RolledBack(Seq),
}

impl SyncState {
    pub fn is_pending(self) -> bool {
        matches!(self, SyncState::Pending(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Committed,
    RolledBack,
}

#[derive(Debug, Default)]
pub struct StalenessGuard {
    last_issued: u64,
    slots: HashMap<FieldKey, SyncState>,
}

impl StalenessGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next sequence number for `key`, superseding whatever was
    /// pending there.
    pub fn stamp(&mut self, key: &FieldKey) -> Seq {
        self.last_issued += 1;
        let seq = Seq(self.last_issued);
        let replaced = self.slots.insert(key.clone(), SyncState::Pending(seq));
        if let Some(SyncState::Pending(previous)) = replaced {
            tracing::debug!(%key, superseded = %previous, by = %seq, "superseding in-flight write");
        }
        seq
    }

    /// True when `seq` is the newest stamp for `key` and still unresolved.
    pub fn is_current(&self, key: &FieldKey, seq: Seq) -> bool {
        matches!(self.slots.get(key), Some(SyncState::Pending(current)) if *current == seq)
    }

    /// Resolves `key` if `seq` is current. Returns false for stale outcomes,
    /// which must not touch the entity store.
    pub fn settle(&mut self, key: &FieldKey, seq: Seq, settlement: Settlement) -> bool {
        if !self.is_current(key, seq) {
            return false;
        }
        let next = match settlement {
            Settlement::Committed => SyncState::Committed(seq),
            Settlement::RolledBack => SyncState::RolledBack(seq),
        };
        self.slots.insert(key.clone(), next);
        true
    }

    pub fn state(&self, key: &FieldKey) -> SyncState {
        self.slots.get(key).copied().unwrap_or(SyncState::Idle)
    }

    pub fn is_pending(&self, key: &FieldKey) -> bool {
        self.state(key).is_pending()
    }

    /// Drops tracking for `key`; any response still in flight for it will be
    /// discarded.
    pub fn retire(&mut self, key: &FieldKey) {
        self.slots.remove(key);
    }

    pub fn retire_entities(&mut self, ids: &[EntityId]) {
        self.slots.retain(|key, _| !ids.contains(&key.entity));
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.slots.values().filter(|state| state.is_pending()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Field;

    fn key(entity: &str) -> FieldKey {
        FieldKey::new(EntityId::from(entity), Field::Title)
    }

    #[test]
    fn newer_stamp_supersedes_older_response() {
        let mut guard = StalenessGuard::new();
        let title = key("todo-1");
        let first = guard.stamp(&title);
        let second = guard.stamp(&title);
        assert!(first < second);

        assert!(guard.settle(&title, second, Settlement::Committed));
        assert!(!guard.settle(&title, first, Settlement::Committed));
        assert_eq!(guard.state(&title), SyncState::Committed(second));
    }

    #[test]
    fn stale_failure_is_ignored_too() {
        let mut guard = StalenessGuard::new();
        let title = key("todo-1");
        let first = guard.stamp(&title);
        let second = guard.stamp(&title);
        assert!(!guard.settle(&title, first, Settlement::RolledBack));
        assert_eq!(guard.state(&title), SyncState::Pending(second));
    }

    #[test]
    fn keys_are_independent() {
        let mut guard = StalenessGuard::new();
        let a = key("a");
        let b = key("b");
        let seq_a = guard.stamp(&a);
        let _seq_b = guard.stamp(&b);
        assert!(guard.settle(&a, seq_a, Settlement::RolledBack));
        assert_eq!(guard.state(&a), SyncState::RolledBack(seq_a));
        assert!(guard.is_pending(&b));
        assert_eq!(guard.pending_count(), 1);
    }

    #[test]
    fn retired_keys_discard_late_responses() {
        let mut guard = StalenessGuard::new();
        let title = key("entry");
        let seq = guard.stamp(&title);
        guard.retire_entities(&[EntityId::from("entry")]);
        assert_eq!(guard.state(&title), SyncState::Idle);
        assert!(!guard.settle(&title, seq, Settlement::Committed));
    }
}
