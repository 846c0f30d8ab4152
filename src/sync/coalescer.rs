use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::model::{EntityId, Field, FieldKey, FieldValue};

/// A field edit whose quiet period has elapsed and which is ready to be
/// committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCommit {
    pub key: FieldKey,
    pub value: FieldValue,
    /// Set when an older write for the same field was still on the wire
    /// while this burst was typed. The commit must then go out even if the
    /// value matches the canonical one.
    pub must_write: bool,
    pub edits: u32,
}

#[derive(Debug)]
struct PendingEdit {
    value: FieldValue,
    deadline: Instant,
    edits: u32,
    must_write: bool,
}

/// Per-field debounce: one pending commit per (entity, field), rescheduled
/// on every edit.
#[derive(Debug)]
pub struct EditCoalescer {
    text_quiet: Duration,
    discrete_quiet: Duration,
    pending: IndexMap<FieldKey, PendingEdit>,
}

impl EditCoalescer {
    pub fn new(text_quiet: Duration, discrete_quiet: Duration) -> Self {
        Self {
            text_quiet,
            discrete_quiet,
            pending: IndexMap::new(),
        }
    }

    pub fn quiet_period(&self, field: Field) -> Duration {
        if field.is_free_text() {
            self.text_quiet
        } else {
            self.discrete_quiet
        }
    }

    /// Records an edit at `now` and returns the new commit deadline. Any
    /// previously scheduled commit for the same key is replaced.
    pub fn record(
        &mut self,
        key: FieldKey,
        value: FieldValue,
        now: Instant,
        must_write: bool,
    ) -> Instant {
        let deadline = now + self.quiet_period(key.field);
        match self.pending.get_mut(&key) {
            Some(edit) => {
                edit.value = value;
                edit.deadline = deadline;
                edit.edits += 1;
                edit.must_write |= must_write;
            }
            None => {
                self.pending.insert(
                    key,
                    PendingEdit {
                        value,
                        deadline,
                        edits: 1,
                        must_write,
                    },
                );
            }
        }
        deadline
    }

    /// Removes and returns every edit whose quiet period has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<ScheduledCommit> {
        let due: Vec<FieldKey> = self
            .pending
            .iter()
            .filter(|(_, edit)| edit.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        due.into_iter().filter_map(|key| self.take(&key)).collect()
    }

    /// Removes and returns every scheduled edit regardless of deadline.
    pub fn take_all(&mut self) -> Vec<ScheduledCommit> {
        self.pending
            .drain(..)
            .map(|(key, edit)| into_commit(key, edit))
            .collect()
    }

    pub fn take(&mut self, key: &FieldKey) -> Option<ScheduledCommit> {
        self.pending
            .shift_remove_entry(key)
            .map(|(key, edit)| into_commit(key, edit))
    }

    pub fn cancel_entities(&mut self, ids: &[EntityId]) -> usize {
        let before = self.pending.len();
        self.pending.retain(|key, _| !ids.contains(&key.entity));
        before - self.pending.len()
    }

    pub fn is_scheduled(&self, key: &FieldKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|edit| edit.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn into_commit(key: FieldKey, edit: PendingEdit) -> ScheduledCommit {
    ScheduledCommit {
        key,
        value: edit.value,
        must_write: edit.must_write,
        edits: edit.edits,
    }
}
