use std::collections::{HashMap, HashSet};

use crate::model::{ChildDraft, EntityId, Field, FieldKey, FieldValue, Patch, Trip};

use super::guard::{Seq, Settlement, StalenessGuard};
use super::notice::{NoticeBoard, Severity};
use super::reorder::MovePlan;
use super::store::EntityStore;
use super::transport::{
    Completion, Dispatch, RemoteError, RemoteReply, RemoteRequest, RequestId, Transport,
};

/// One field of an update, with the canonical value it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: Field,
    pub value: FieldValue,
    pub previous: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    UpdateFields {
        entity: EntityId,
        changes: Vec<FieldChange>,
    },
    Reorder {
        parent: EntityId,
        plan: MovePlan,
    },
    Create {
        parent: EntityId,
        draft: ChildDraft,
    },
    Delete {
        entity: EntityId,
    },
}

/// What a completion did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Committed,
    RolledBack,
    /// The outcome belonged to a superseded write and was dropped.
    Stale,
    /// A fresh copy of the trip arrived and should replace local state.
    Hydrate(Trip),
    Unknown,
}

#[derive(Debug)]
enum InFlight {
    Update {
        entity: EntityId,
        changes: Vec<FieldChange>,
        stamps: Vec<Seq>,
    },
    Reorder {
        parent: EntityId,
        previous: Vec<EntityId>,
        stamp: Seq,
    },
    Create {
        parent: EntityId,
        draft: ChildDraft,
    },
    Delete {
        entity: EntityId,
        title: String,
    },
    Fetch,
}

/// Applies mutations optimistically, sends them out and reconciles the
/// answers.
pub struct MutationExecutor {
    trip_id: EntityId,
    guard: StalenessGuard,
    transport: Box<dyn Transport>,
    next_request: u64,
    in_flight: HashMap<RequestId, InFlight>,
    deferred_deletes: HashSet<EntityId>,
    dropped: Vec<EntityId>,
    notices: NoticeBoard,
    resync_requested: bool,
}

impl MutationExecutor {
    pub fn new(trip_id: EntityId, transport: Box<dyn Transport>) -> Self {
        Self {
            trip_id,
            guard: StalenessGuard::new(),
            transport,
            next_request: 0,
            in_flight: HashMap::new(),
            deferred_deletes: HashSet::new(),
            dropped: Vec::new(),
            notices: NoticeBoard::default(),
            resync_requested: false,
        }
    }

    pub fn guard(&self) -> &StalenessGuard {
        &self.guard
    }

    pub fn notices(&self) -> &NoticeBoard {
        &self.notices
    }

    pub fn notices_mut(&mut self) -> &mut NoticeBoard {
        &mut self.notices
    }

    /// Stamps `key` ahead of its dispatch so that an older in-flight write
    /// for it can no longer land.
    pub fn supersede(&mut self, key: &FieldKey) {
        self.guard.stamp(key);
    }

    /// Applies `mutation` to the displayed tree and sends it out. Returns
    /// the request id, or `None` when nothing was dispatched.
    pub fn execute(&mut self, store: &mut EntityStore, mutation: Mutation) -> Option<RequestId> {
        match mutation {
            Mutation::UpdateFields { entity, changes } => {
                self.execute_update(store, entity, changes)
            }
            Mutation::Reorder { parent, plan } => self.execute_reorder(store, parent, plan),
            Mutation::Create { parent, draft } => self.execute_create(store, parent, draft),
            Mutation::Delete { entity } => self.execute_delete(store, entity),
        }
    }

    fn execute_update(
        &mut self,
        store: &mut EntityStore,
        entity: EntityId,
        changes: Vec<FieldChange>,
    ) -> Option<RequestId> {
        if changes.is_empty() {
            return None;
        }
        let patch = Patch {
            entity: entity.clone(),
            changes: changes
                .iter()
                .map(|change| (change.field, change.value.clone()))
                .collect(),
        };
        if !store.apply(&patch, false) {
            return None;
        }
        let stamps = patch.keys().map(|key| self.guard.stamp(&key)).collect();
        self.dispatch(
            store,
            RemoteRequest::UpdateField {
                entity: entity.clone(),
                patch: patch.changes,
            },
            InFlight::Update {
                entity,
                changes,
                stamps,
            },
        )
    }

    fn execute_reorder(
        &mut self,
        store: &mut EntityStore,
        parent: EntityId,
        plan: MovePlan,
    ) -> Option<RequestId> {
        let patch = Patch::single(
            parent.clone(),
            Field::Children,
            FieldValue::Order(plan.ordered.clone()),
        );
        if !store.apply(&patch, false) {
            return None;
        }
        let stamp = self
            .guard
            .stamp(&FieldKey::new(parent.clone(), Field::Children));
        self.dispatch(
            store,
            RemoteRequest::ReorderSiblings {
                parent: parent.clone(),
                ordered: plan.ordered,
            },
            InFlight::Reorder {
                parent,
                previous: plan.previous,
                stamp,
            },
        )
    }

    fn execute_create(
        &mut self,
        store: &mut EntityStore,
        parent: EntityId,
        draft: ChildDraft,
    ) -> Option<RequestId> {
        let order = store
            .displayed()
            .child_ids(&parent)
            .map_or(0, |siblings| siblings.len() as u32);
        if !store.insert(&parent, usize::MAX, draft.clone().into_node(order), false) {
            tracing::debug!(%parent, "parent vanished before the child could be added");
            return None;
        }
        self.dispatch(
            store,
            RemoteRequest::CreateChild {
                parent: parent.clone(),
                draft: draft.clone(),
            },
            InFlight::Create { parent, draft },
        )
    }

    fn execute_delete(&mut self, store: &mut EntityStore, entity: EntityId) -> Option<RequestId> {
        let title = store
            .displayed()
            .entity(&entity)
            .map(|found| found.title().to_string())?;
        let subtree = store.displayed().subtree_ids(&entity);
        self.guard.retire_entities(&subtree);
        store.remove(&entity, false)?;

        if self.creating(&entity) {
            tracing::debug!(%entity, "delete deferred until its create settles");
            self.deferred_deletes.insert(entity);
            return None;
        }
        self.dispatch(
            store,
            RemoteRequest::DeleteEntity {
                entity: entity.clone(),
            },
            InFlight::Delete { entity, title },
        )
    }

    /// Requests a fresh copy of the trip. Only one fetch is in flight at a
    /// time.
    pub fn fetch(&mut self, store: &mut EntityStore) -> Option<RequestId> {
        if self
            .in_flight
            .values()
            .any(|record| matches!(record, InFlight::Fetch))
        {
            return None;
        }
        self.resync_requested = false;
        let request = RemoteRequest::FetchTrip {
            trip: self.trip_id.clone(),
        };
        self.dispatch(store, request, InFlight::Fetch)
    }

    fn dispatch(
        &mut self,
        store: &mut EntityStore,
        request: RemoteRequest,
        record: InFlight,
    ) -> Option<RequestId> {
        self.next_request += 1;
        let id = RequestId(self.next_request);
        let label = request.label();
        self.in_flight.insert(id, record);
        // One lane per trip: the remote applies this trip's writes in the
        // order they were stamped.
        let dispatch = Dispatch {
            id,
            lane: self.trip_id.clone(),
            request,
        };
        match self.transport.send(dispatch) {
            Ok(()) => {
                tracing::debug!(request = %id, label, "dispatched");
                Some(id)
            }
            Err(closed) => {
                tracing::warn!(request = %id, label, "{closed}");
                let failure = Completion {
                    id,
                    outcome: Err(RemoteError::Transient(closed.to_string())),
                };
                if let Resolution::Hydrate(trip) = self.complete(store, failure) {
                    store.hydrate(trip, |_| false);
                }
                None
            }
        }
    }

    /// Reconciles one completion with local state.
    pub fn complete(&mut self, store: &mut EntityStore, completion: Completion) -> Resolution {
        let Some(record) = self.in_flight.remove(&completion.id) else {
            tracing::debug!(request = %completion.id, "completion for unknown request");
            return Resolution::Unknown;
        };
        let outcome = completion.outcome;
        match record {
            InFlight::Update {
                entity,
                changes,
                stamps,
            } => {
                let outcome = match outcome {
                    Ok(RemoteReply::Entity(record)) => Ok(record),
                    Ok(other) => Err(unexpected(&other, "update_field")),
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(record) => {
                        let mut committed = Patch {
                            entity: entity.clone(),
                            changes: Vec::new(),
                        };
                        for (change, seq) in changes.into_iter().zip(stamps) {
                            let key = FieldKey::new(entity.clone(), change.field);
                            if self.guard.settle(&key, seq, Settlement::Committed) {
                                let value = record.value(change.field).cloned();
                                committed
                                    .changes
                                    .push((change.field, value.unwrap_or(change.value)));
                            }
                        }
                        if committed.changes.is_empty() {
                            return Resolution::Stale;
                        }
                        store.apply(&committed, true);
                        Resolution::Committed
                    }
                    Err(err) => self.roll_back_update(store, entity, changes, stamps, &err),
                }
            }
            InFlight::Reorder {
                parent,
                previous,
                stamp,
            } => {
                let key = FieldKey::new(parent.clone(), Field::Children);
                let outcome = match outcome {
                    Ok(RemoteReply::Order(ordered)) => Ok(ordered),
                    Ok(other) => Err(unexpected(&other, "reorder_siblings")),
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(ordered) => {
                        if !self.guard.settle(&key, stamp, Settlement::Committed) {
                            return Resolution::Stale;
                        }
                        store.apply(
                            &Patch::single(parent, Field::Children, FieldValue::Order(ordered)),
                            true,
                        );
                        Resolution::Committed
                    }
                    Err(err) => {
                        if !self.guard.settle(&key, stamp, Settlement::RolledBack) {
                            return Resolution::Stale;
                        }
                        store.restore(&Patch::single(
                            parent.clone(),
                            Field::Children,
                            FieldValue::Order(previous),
                        ));
                        self.notices.raise(
                            Severity::Warning,
                            Some(parent),
                            format!("Couldn't save the new order ({err}). The previous order is back."),
                        );
                        self.note_failure(&err);
                        Resolution::RolledBack
                    }
                }
            }
            InFlight::Create { parent, draft } => match outcome {
                Ok(RemoteReply::Created(node)) => {
                    if self.deferred_deletes.remove(&draft.id) {
                        let entity = draft.id.clone();
                        self.dispatch(
                            store,
                            RemoteRequest::DeleteEntity {
                                entity: entity.clone(),
                            },
                            InFlight::Delete {
                                entity,
                                title: draft.title,
                            },
                        );
                        return Resolution::Committed;
                    }
                    let position = store.displayed().position_of(node.id());
                    store.insert(&parent, position.unwrap_or(usize::MAX), node, true);
                    Resolution::Committed
                }
                Ok(other) => {
                    let err = unexpected(&other, "create_child");
                    self.roll_back_create(store, draft, &err)
                }
                Err(err) => self.roll_back_create(store, draft, &err),
            },
            InFlight::Delete { entity, title } => match outcome {
                Ok(RemoteReply::Deleted) | Err(RemoteError::NotFound(_)) => {
                    store.remove(&entity, true);
                    Resolution::Committed
                }
                Ok(other) => {
                    let err = unexpected(&other, "delete_entity");
                    self.roll_back_delete(store, entity, &title, &err)
                }
                Err(err) => self.roll_back_delete(store, entity, &title, &err),
            },
            InFlight::Fetch => match outcome {
                Ok(RemoteReply::Trip(trip)) => Resolution::Hydrate(trip),
                Ok(other) => {
                    let err = unexpected(&other, "fetch_trip");
                    self.fetch_failed(&err)
                }
                Err(err) => self.fetch_failed(&err),
            },
        }
    }

    fn roll_back_update(
        &mut self,
        store: &mut EntityStore,
        entity: EntityId,
        changes: Vec<FieldChange>,
        stamps: Vec<Seq>,
        err: &RemoteError,
    ) -> Resolution {
        let mut restore = Patch {
            entity: entity.clone(),
            changes: Vec::new(),
        };
        for (change, seq) in changes.into_iter().zip(stamps) {
            let key = FieldKey::new(entity.clone(), change.field);
            if self.guard.settle(&key, seq, Settlement::RolledBack) {
                restore.changes.push((change.field, change.previous));
            }
        }
        if restore.changes.is_empty() {
            return Resolution::Stale;
        }
        let fields = restore
            .changes
            .iter()
            .map(|(field, _)| field.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        store.restore(&restore);
        let title = store
            .displayed()
            .entity(&entity)
            .map(|found| found.title().to_string())
            .unwrap_or_default();
        self.notices.raise(
            Severity::Warning,
            Some(entity),
            format!("Couldn't save {fields} of '{title}' ({err}). Reverted to the last saved value."),
        );
        self.note_failure(err);
        Resolution::RolledBack
    }

    fn roll_back_create(
        &mut self,
        store: &mut EntityStore,
        draft: ChildDraft,
        err: &RemoteError,
    ) -> Resolution {
        if self.deferred_deletes.remove(&draft.id) {
            // Already gone locally; nothing left to undo.
            return Resolution::RolledBack;
        }
        let subtree = store.displayed().subtree_ids(&draft.id);
        store.remove(&draft.id, false);
        self.guard.retire_entities(&subtree);
        self.dropped.extend(subtree);
        self.notices.raise(
            Severity::Warning,
            None,
            format!("Couldn't add '{}' ({err}).", draft.title.trim()),
        );
        self.note_failure(err);
        Resolution::RolledBack
    }

    fn roll_back_delete(
        &mut self,
        store: &mut EntityStore,
        entity: EntityId,
        title: &str,
        err: &RemoteError,
    ) -> Resolution {
        let canonical = store.canonical();
        let restored = match (
            canonical.parent_of(&entity),
            canonical.position_of(&entity),
            canonical.node(&entity),
        ) {
            (Some(parent), Some(index), Some(node)) => store.insert(&parent, index, node, false),
            _ => false,
        };
        if !restored {
            tracing::debug!(%entity, "deleted entity has no canonical copy to restore");
        }
        self.notices.raise(
            Severity::Warning,
            Some(entity),
            format!("Couldn't delete '{title}' ({err}). It has been restored."),
        );
        self.note_failure(err);
        Resolution::RolledBack
    }

    fn fetch_failed(&mut self, err: &RemoteError) -> Resolution {
        self.notices.raise(
            Severity::Error,
            None,
            format!("Couldn't refresh the trip ({err})."),
        );
        Resolution::RolledBack
    }

    fn note_failure(&mut self, err: &RemoteError) {
        if err.needs_resync() {
            self.resync_requested = true;
        }
    }

    /// Lays in-flight creates and deletes back over a freshly hydrated
    /// displayed tree.
    pub fn reproject_structure(&self, store: &mut EntityStore) {
        for record in self.in_flight.values() {
            match record {
                InFlight::Create { parent, draft } => {
                    if !store.displayed().contains(&draft.id) {
                        store.insert(parent, usize::MAX, draft.clone().into_node(0), false);
                    }
                }
                InFlight::Delete { entity, .. } => {
                    store.remove(entity, false);
                }
                _ => {}
            }
        }
        for entity in &self.deferred_deletes {
            store.remove(entity, false);
        }
    }

    /// True while a create for `id` has not been answered yet.
    pub fn creating(&self, id: &EntityId) -> bool {
        self.in_flight
            .values()
            .any(|record| matches!(record, InFlight::Create { draft, .. } if &draft.id == id))
    }

    /// Ids whose local state was discarded by a failed create.
    pub fn take_dropped(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.dropped)
    }

    pub fn take_resync_request(&mut self) -> bool {
        std::mem::take(&mut self.resync_requested)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.deferred_deletes.is_empty()
    }
}

fn unexpected(reply: &RemoteReply, request: &str) -> RemoteError {
    let kind = match reply {
        RemoteReply::Entity(_) => "entity",
        RemoteReply::Order(_) => "order",
        RemoteReply::Created(_) => "created",
        RemoteReply::Deleted => "deleted",
        RemoteReply::Trip(_) => "trip",
    };
    RemoteError::Conflict(format!("unexpected {kind} reply to {request}"))
}
