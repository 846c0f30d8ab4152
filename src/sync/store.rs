use bitflags::bitflags;
use indexmap::IndexMap;

use crate::model::{EntityId, Field, FieldKey, FieldValue, Node, Patch, Trip};

bitflags! {
    /// What kind of change a listener is being told about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChangeSet: u8 {
        const FIELDS = 1;
        const ORDER = 1 << 1;
        const STRUCTURE = 1 << 2;
        const HYDRATE = 1 << 3;
    }
}

impl ChangeSet {
    fn for_patch(patch: &Patch) -> Self {
        patch
            .changes
            .iter()
            .fold(ChangeSet::empty(), |acc, (field, _)| {
                if *field == Field::Children {
                    acc | ChangeSet::ORDER
                } else {
                    acc | ChangeSet::FIELDS
                }
            })
    }
}

pub type Listener = Box<dyn FnMut(&Trip, ChangeSet)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Canonical and displayed copies of one trip.
///
/// The displayed tree is the canonical tree with every pending optimistic
/// value laid over it. Only the sync engine writes here.
pub struct EntityStore {
    canonical: Trip,
    displayed: Trip,
    pending: IndexMap<FieldKey, FieldValue>,
    listeners: IndexMap<SubscriptionId, Listener>,
    next_listener: u64,
}

impl EntityStore {
    pub fn new(trip: Trip) -> Self {
        Self {
            canonical: trip.clone(),
            displayed: trip,
            pending: IndexMap::new(),
            listeners: IndexMap::new(),
            next_listener: 0,
        }
    }

    pub fn displayed(&self) -> &Trip {
        &self.displayed
    }

    pub fn canonical(&self) -> &Trip {
        &self.canonical
    }

    pub fn canonical_value(&self, key: &FieldKey) -> Option<FieldValue> {
        self.canonical.field(&key.entity, key.field)
    }

    #[cfg(test)]
    pub fn displayed_value(&self, key: &FieldKey) -> Option<FieldValue> {
        self.displayed.field(&key.entity, key.field)
    }

    pub fn is_pending(&self, key: &FieldKey) -> bool {
        self.pending.contains_key(key)
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        self.next_listener += 1;
        let id = SubscriptionId(self.next_listener);
        self.listeners.insert(id, listener);
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.shift_remove(&id).is_some()
    }

    /// Writes `patch` into the displayed tree, and into the canonical tree as
    /// well when `committed`. Optimistic writes mark each field pending;
    /// committed writes clear the mark. Patches aimed at entities that no
    /// longer exist are dropped. Returns whether anything was written.
    pub fn apply(&mut self, patch: &Patch, committed: bool) -> bool {
        let mut touched = false;
        for (field, value) in &patch.changes {
            let key = FieldKey::new(patch.entity.clone(), *field);
            if committed {
                let in_canonical = set_field(&mut self.canonical, &key, value);
                let in_display = set_field(&mut self.displayed, &key, value);
                self.pending.shift_remove(&key);
                touched |= in_canonical || in_display;
            } else if set_field(&mut self.displayed, &key, value) {
                self.pending.insert(key, value.clone());
                touched = true;
            } else {
                tracing::debug!(%key, "dropping optimistic patch for missing entity");
            }
        }
        if touched {
            self.notify(ChangeSet::for_patch(patch));
        }
        touched
    }

    /// Rolls displayed fields back to the given values and clears their
    /// pending marks. Canonical state is untouched.
    pub fn restore(&mut self, patch: &Patch) -> bool {
        let mut touched = false;
        for (field, value) in &patch.changes {
            let key = FieldKey::new(patch.entity.clone(), *field);
            self.pending.shift_remove(&key);
            touched |= set_field(&mut self.displayed, &key, value);
        }
        if touched {
            self.notify(ChangeSet::for_patch(patch));
        }
        touched
    }

    /// Drops the pending mark on `key` and shows the canonical value again.
    pub fn settle_to_canonical(&mut self, key: &FieldKey) -> bool {
        match self.canonical_value(key) {
            Some(value) => self.restore(&Patch::single(key.entity.clone(), key.field, value)),
            None => self.pending.shift_remove(key).is_some(),
        }
    }

    /// Adds a child under `parent`. Optimistic inserts only reach the
    /// displayed tree. A committed insert lands in both trees; if the
    /// displayed tree already holds the optimistic copy, its fields are
    /// refreshed except where a local edit is pending.
    pub fn insert(&mut self, parent: &EntityId, index: usize, node: Node, committed: bool) -> bool {
        if !committed {
            let inserted = self.displayed.insert_child(parent, index, node);
            if inserted {
                self.notify(ChangeSet::STRUCTURE);
            }
            return inserted;
        }

        let id = node.id().clone();
        let fresh_fields = node.as_entity().scalar_fields();
        let in_canonical = self.canonical.insert_child(parent, index, node.clone());
        let in_display = if self.displayed.contains(&id) {
            for (field, value) in fresh_fields {
                let key = FieldKey::new(id.clone(), field);
                if !self.pending.contains_key(&key) {
                    set_field(&mut self.displayed, &key, &value);
                }
            }
            true
        } else {
            self.displayed.insert_child(parent, index, node)
        };
        if in_canonical || in_display {
            self.notify(ChangeSet::STRUCTURE);
        }
        in_canonical
    }

    /// Removes `id` and its subtree from the displayed tree, and from the
    /// canonical tree too when `committed`. Pending marks for the whole
    /// subtree are dropped.
    pub fn remove(&mut self, id: &EntityId, committed: bool) -> Option<(EntityId, usize, Node)> {
        let mut subtree = self.displayed.subtree_ids(id);
        if committed {
            subtree.extend(self.canonical.subtree_ids(id));
        }
        self.pending.retain(|key, _| !subtree.contains(&key.entity));

        let from_display = self.displayed.remove(id);
        let from_canonical = if committed {
            self.canonical.remove(id)
        } else {
            None
        };
        let removed = from_display.or(from_canonical);
        if removed.is_some() {
            self.notify(ChangeSet::STRUCTURE);
        }
        removed
    }

    /// Replaces both trees with a fresh copy from the remote. Pending values
    /// for which `keep` returns true are laid over the new displayed tree;
    /// every other pending mark is dropped.
    pub fn hydrate<F>(&mut self, trip: Trip, keep: F)
    where
        F: Fn(&FieldKey) -> bool,
    {
        self.canonical = trip.clone();
        self.displayed = trip;
        self.pending.retain(|key, _| keep(key));
        let displayed = &mut self.displayed;
        self.pending
            .retain(|key, value| set_field(displayed, key, value));
        self.notify(ChangeSet::HYDRATE);
    }

    fn notify(&mut self, changes: ChangeSet) {
        for listener in self.listeners.values_mut() {
            listener(&self.displayed, changes);
        }
    }
}

fn set_field(trip: &mut Trip, key: &FieldKey, value: &FieldValue) -> bool {
    match trip.entity_mut(&key.entity) {
        Some(mut entity) => entity.set_field(key.field, value),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::model::{ChildDraft, DraftKind, EntryType};

    fn sample_trip() -> Trip {
        let mut trip = Trip::new(EntityId::from("trip"), "Porto");
        let day = ChildDraft {
            id: EntityId::from("day"),
            title: "Day one".into(),
            kind: DraftKind::Day { date: None },
        };
        trip.push_child(&EntityId::from("trip"), day.into_node(0));
        let entry = ChildDraft {
            id: EntityId::from("note"),
            title: "Lunch".into(),
            kind: DraftKind::Entry {
                entry_type: EntryType::Note,
            },
        };
        trip.push_child(&EntityId::from("day"), entry.into_node(0));
        trip
    }

    fn title_key() -> FieldKey {
        FieldKey::new(EntityId::from("note"), Field::Title)
    }

    #[test]
    fn optimistic_apply_leaves_canonical_alone() {
        let mut store = EntityStore::new(sample_trip());
        let patch = Patch::single(
            EntityId::from("note"),
            Field::Title,
            FieldValue::text("Dinner"),
        );
        assert!(store.apply(&patch, false));
        assert!(store.is_pending(&title_key()));
        assert_eq!(
            store.displayed_value(&title_key()),
            Some(FieldValue::text("Dinner"))
        );
        assert_eq!(
            store.canonical_value(&title_key()),
            Some(FieldValue::text("Lunch"))
        );

        assert!(store.apply(&patch, true));
        assert!(!store.is_pending(&title_key()));
        assert_eq!(
            store.canonical_value(&title_key()),
            Some(FieldValue::text("Dinner"))
        );
    }

    #[test]
    fn settle_to_canonical_reverts_display() {
        let mut store = EntityStore::new(sample_trip());
        let patch = Patch::single(
            EntityId::from("note"),
            Field::Title,
            FieldValue::text("Dinner"),
        );
        store.apply(&patch, false);
        assert!(store.settle_to_canonical(&title_key()));
        assert_eq!(store.displayed(), store.canonical());
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn patches_for_missing_entities_are_dropped() {
        let mut store = EntityStore::new(sample_trip());
        let patch = Patch::single(
            EntityId::from("ghost"),
            Field::Title,
            FieldValue::text("Boo"),
        );
        assert!(!store.apply(&patch, false));
        assert!(!store.apply(&patch, true));
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn removal_drops_pending_marks_of_the_subtree() {
        let mut store = EntityStore::new(sample_trip());
        store.apply(
            &Patch::single(
                EntityId::from("note"),
                Field::Body,
                FieldValue::text("pastel de nata"),
            ),
            false,
        );
        assert_eq!(store.pending_len(), 1);
        let removed = store.remove(&EntityId::from("day"), false);
        assert!(removed.is_some());
        assert_eq!(store.pending_len(), 0);
        assert!(store.canonical().contains(&EntityId::from("note")));
        assert!(!store.displayed().contains(&EntityId::from("note")));
    }

    #[test]
    fn committed_insert_keeps_pending_local_edits() {
        let mut store = EntityStore::new(sample_trip());
        let draft = ChildDraft {
            id: EntityId::from("museum"),
            title: "Museum ".into(),
            kind: DraftKind::Entry {
                entry_type: EntryType::Place,
            },
        };
        let optimistic = draft.clone().into_node(0);
        store.insert(&EntityId::from("day"), usize::MAX, optimistic, false);
        store.apply(
            &Patch::single(
                EntityId::from("museum"),
                Field::Address,
                FieldValue::text("Rua Dom Manuel II"),
            ),
            false,
        );

        let server = draft.into_node(1);
        assert!(store.insert(&EntityId::from("day"), usize::MAX, server, true));
        let address = FieldKey::new(EntityId::from("museum"), Field::Address);
        assert_eq!(
            store.displayed_value(&address),
            Some(FieldValue::text("Rua Dom Manuel II"))
        );
        assert_eq!(store.canonical_value(&address), Some(FieldValue::text("")));
    }

    #[test]
    fn listeners_see_each_change() {
        let mut store = EntityStore::new(sample_trip());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let id = store.subscribe(Box::new(move |trip, changes| {
            sink.borrow_mut().push((trip.days.len(), changes));
        }));
        store.remove(&EntityId::from("note"), false);
        store.hydrate(sample_trip(), |_| false);
        assert!(store.unsubscribe(id));
        store.remove(&EntityId::from("day"), false);

        let seen = seen.borrow();
        assert_eq!(
            seen.as_slice(),
            &[(1, ChangeSet::STRUCTURE), (1, ChangeSet::HYDRATE)]
        );
    }

    #[test]
    fn hydrate_reprojects_kept_pending_values() {
        let mut store = EntityStore::new(sample_trip());
        store.apply(
            &Patch::single(
                EntityId::from("note"),
                Field::Title,
                FieldValue::text("Brunch"),
            ),
            false,
        );
        store.hydrate(sample_trip(), |key| key.field == Field::Title);
        assert_eq!(
            store.displayed_value(&title_key()),
            Some(FieldValue::text("Brunch"))
        );
        assert!(store.is_pending(&title_key()));
    }
}
