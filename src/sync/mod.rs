//! Optimistic local state for one trip.
//!
//! Every user intent is applied to the displayed tree right away. Text edits
//! are debounced per field, and the resulting writes go to the remote on
//! worker threads. Answers come back through [`SyncEngine::pump`], where
//! stale ones are dropped and failures roll the displayed tree back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use indexmap::IndexMap;
use thiserror::Error;

use crate::config::SyncConfig;
use crate::model::{
    validate_edit, ChildDraft, EntityId, Field, FieldKey, FieldValue, Patch, Trip,
    ValidationError,
};

pub mod coalescer;
pub mod executor;
pub mod guard;
pub mod notice;
pub mod reorder;
pub mod store;
pub mod transport;

use coalescer::{EditCoalescer, ScheduledCommit};
use executor::{FieldChange, Mutation, MutationExecutor, Resolution};
use guard::SyncState;
use notice::Notice;
use store::{EntityStore, Listener, SubscriptionId};
use transport::{Completion, RemoteError, RemoteService, Transport, WorkerTransport};

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no entity {0} in this trip")]
    MissingEntity(EntityId),
    #[error("the trip itself cannot be deleted here")]
    RootDelete,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStatus {
    Clean,
    /// Edited locally, waiting for the quiet period to end.
    Scheduled,
    Syncing,
    RolledBack,
}

pub struct SyncEngine {
    trip_id: EntityId,
    store: EntityStore,
    coalescer: EditCoalescer,
    executor: MutationExecutor,
    completions: Receiver<Completion>,
    clock: Box<dyn Clock>,
}

impl SyncEngine {
    pub fn new(
        trip: Trip,
        config: &SyncConfig,
        transport: Box<dyn Transport>,
        completions: Receiver<Completion>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let trip_id = trip.id.clone();
        Self {
            executor: MutationExecutor::new(trip_id.clone(), transport),
            trip_id,
            store: EntityStore::new(trip),
            coalescer: EditCoalescer::new(config.text_quiet, config.discrete_quiet),
            completions,
            clock,
        }
    }

    /// Loads `trip_id` from `remote` and starts the worker pool that carries
    /// writes to it.
    pub fn connect(
        remote: Arc<dyn RemoteService>,
        trip_id: &EntityId,
        config: &SyncConfig,
    ) -> Result<Self, SyncError> {
        let trip = remote.fetch_trip(trip_id)?;
        let (transport, completions) = WorkerTransport::spawn(remote, config.workers);
        tracing::info!(
            trip = %trip_id,
            workers = transport.worker_count(),
            "sync engine connected"
        );
        Ok(Self::new(
            trip,
            config,
            Box::new(transport),
            completions,
            Box::new(SystemClock),
        ))
    }

    pub fn trip_id(&self) -> &EntityId {
        &self.trip_id
    }

    /// The tree the UI should render.
    pub fn snapshot(&self) -> &Trip {
        self.store.displayed()
    }

    /// The last state the remote confirmed.
    pub fn canonical(&self) -> &Trip {
        self.store.canonical()
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        self.store.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Applies a field edit locally and schedules its commit. Edits to
    /// entities that are already gone are ignored.
    pub fn edit_field(
        &mut self,
        entity: &EntityId,
        field: Field,
        value: FieldValue,
    ) -> Result<(), SyncError> {
        let Some(target) = self.store.displayed().entity(entity) else {
            tracing::debug!(%entity, %field, "edit for missing entity ignored");
            return Ok(());
        };
        validate_edit(&target, field, &value)?;

        let key = FieldKey::new(entity.clone(), field);
        let must_write = self.executor.guard().is_pending(&key);
        if must_write {
            self.executor.supersede(&key);
        }
        self.store
            .apply(&Patch::single(entity.clone(), field, value.clone()), false);
        let now = self.clock.now();
        let deadline = self.coalescer.record(key, value, now, must_write);
        if deadline <= now {
            self.flush_due(now);
        }
        Ok(())
    }

    /// Moves `item` to `to_index` among the children of `parent`. Returns
    /// false when the move changes nothing.
    pub fn move_sibling(
        &mut self,
        parent: &EntityId,
        item: &EntityId,
        to_index: usize,
    ) -> Result<bool, SyncError> {
        let siblings = self
            .store
            .displayed()
            .child_ids(parent)
            .ok_or_else(|| SyncError::MissingEntity(parent.clone()))?;
        let Some(plan) = reorder::plan_move(&siblings, item, to_index) else {
            return Ok(false);
        };
        tracing::debug!(%parent, %item, from = plan.from, to = plan.to, "moving sibling");
        self.executor.execute(
            &mut self.store,
            Mutation::Reorder {
                parent: parent.clone(),
                plan,
            },
        );
        Ok(true)
    }

    /// Adds a new child and returns its id, which stays valid after the
    /// remote confirms it.
    pub fn add_child(&mut self, parent: &EntityId, draft: ChildDraft) -> Result<EntityId, SyncError> {
        let target = self
            .store
            .displayed()
            .entity(parent)
            .ok_or_else(|| SyncError::MissingEntity(parent.clone()))?;
        draft.validate_under(&target)?;
        let id = draft.id.clone();
        self.executor.execute(
            &mut self.store,
            Mutation::Create {
                parent: parent.clone(),
                draft,
            },
        );
        Ok(id)
    }

    /// Removes `entity` and everything under it. Scheduled edits for the
    /// subtree are cancelled.
    pub fn delete_entity(&mut self, entity: &EntityId) -> Result<bool, SyncError> {
        if entity == &self.trip_id {
            return Err(SyncError::RootDelete);
        }
        if !self.store.displayed().contains(entity) {
            return Ok(false);
        }
        let subtree = self.store.displayed().subtree_ids(entity);
        let cancelled = self.coalescer.cancel_entities(&subtree);
        if cancelled > 0 {
            tracing::debug!(%entity, cancelled, "dropped scheduled edits of deleted subtree");
        }
        self.executor.execute(
            &mut self.store,
            Mutation::Delete {
                entity: entity.clone(),
            },
        );
        Ok(true)
    }

    /// Asks the remote for a fresh copy of the trip.
    pub fn refresh(&mut self) {
        self.executor.fetch(&mut self.store);
    }

    /// Periodic driver: commits edits whose quiet period ended and applies
    /// any answers that arrived.
    pub fn tick(&mut self) -> usize {
        let now = self.clock.now();
        self.flush_due(now);
        self.pump()
    }

    pub fn flush_due(&mut self, now: Instant) {
        let due = self.coalescer.take_due(now);
        self.commit(due, now);
    }

    /// Commits every scheduled edit now, ignoring quiet periods.
    pub fn flush_all(&mut self) {
        let now = self.clock.now();
        let all = self.coalescer.take_all();
        self.commit(all, now);
    }

    fn commit(&mut self, commits: Vec<ScheduledCommit>, now: Instant) {
        let mut batches: IndexMap<EntityId, Vec<FieldChange>> = IndexMap::new();
        for commit in commits {
            let Some(previous) = self.store.canonical_value(&commit.key) else {
                if self.executor.creating(&commit.key.entity) {
                    // Not on the remote yet; try again once the create lands.
                    self.coalescer
                        .record(commit.key, commit.value, now, commit.must_write);
                } else {
                    tracing::debug!(key = %commit.key, "dropping edit for vanished entity");
                    self.store.settle_to_canonical(&commit.key);
                }
                continue;
            };
            if !commit.must_write && previous == commit.value {
                tracing::trace!(key = %commit.key, edits = commit.edits, "edit matches remote, skipped");
                self.store.settle_to_canonical(&commit.key);
                continue;
            }
            tracing::debug!(key = %commit.key, edits = commit.edits, "committing edit");
            batches
                .entry(commit.key.entity)
                .or_default()
                .push(FieldChange {
                    field: commit.key.field,
                    value: commit.value,
                    previous,
                });
        }
        for (entity, changes) in batches {
            self.executor
                .execute(&mut self.store, Mutation::UpdateFields { entity, changes });
        }
    }

    /// Applies every completion that has arrived so far. Returns how many
    /// were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.handle_completion(completion);
            handled += 1;
        }
        if self.executor.take_resync_request() {
            tracing::info!(trip = %self.trip_id, "local state diverged, refetching");
            self.refresh();
        }
        handled
    }

    pub fn handle_completion(&mut self, completion: Completion) {
        if let Resolution::Hydrate(trip) = self.executor.complete(&mut self.store, completion) {
            self.hydrate(trip);
        }
        let dropped = self.executor.take_dropped();
        if !dropped.is_empty() {
            self.coalescer.cancel_entities(&dropped);
        }
    }

    fn hydrate(&mut self, trip: Trip) {
        let coalescer = &self.coalescer;
        let guard = self.executor.guard();
        self.store.hydrate(trip, |key| {
            coalescer.is_scheduled(key) || guard.is_pending(key)
        });
        self.executor.reproject_structure(&mut self.store);
        tracing::debug!(trip = %self.trip_id, "hydrated from remote");
    }

    /// Blocks until no request is in flight or `timeout` passes. Scheduled
    /// edits are not flushed; call [`SyncEngine::flush_all`] first for that.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if self.executor.is_idle() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.completions.recv_timeout(remaining) {
                Ok(completion) => self.handle_completion(completion),
                Err(RecvTimeoutError::Timeout) => return self.executor.is_idle(),
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("completion channel closed while waiting");
                    return false;
                }
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.coalescer.is_empty() && self.executor.is_idle()
    }

    pub fn field_status(&self, key: &FieldKey) -> FieldStatus {
        if self.coalescer.is_scheduled(key) {
            return FieldStatus::Scheduled;
        }
        match self.executor.guard().state(key) {
            SyncState::Pending(_) => FieldStatus::Syncing,
            SyncState::RolledBack(_) => FieldStatus::RolledBack,
            SyncState::Idle | SyncState::Committed(_) => FieldStatus::Clean,
        }
    }

    /// Requests sent and not yet answered.
    pub fn pending_writes(&self) -> usize {
        self.executor.in_flight()
    }

    pub fn scheduled_edits(&self) -> usize {
        self.coalescer.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.coalescer.next_deadline()
    }

    pub fn notices(&self) -> &[Notice] {
        self.executor.notices().all()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.executor.notices_mut().take()
    }

    pub fn dismiss_notice(&mut self, id: u64) -> bool {
        self.executor.notices_mut().dismiss(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use crossbeam_channel::{unbounded, Sender};
    use parking_lot::Mutex;

    use super::executor::tests::ManualTransport;
    use super::transport::{Dispatch, RemoteReply, RemoteRequest};
    use super::*;
    use crate::model::{DraftKind, EntityRecord, EntryType};

    const TEXT_QUIET: Duration = Duration::from_millis(2000);

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<Instant>>);

    impl ManualClock {
        fn advance(&self, by: Duration) {
            *self.0.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.0.lock()
        }
    }

    struct Harness {
        engine: SyncEngine,
        transport: ManualTransport,
        replies: Sender<Completion>,
        clock: ManualClock,
    }

    impl Harness {
        fn new() -> Self {
            let transport = ManualTransport::default();
            let clock = ManualClock(Arc::new(Mutex::new(Instant::now())));
            let (replies, completions) = unbounded();
            let config = SyncConfig {
                text_quiet: TEXT_QUIET,
                discrete_quiet: Duration::ZERO,
                ..SyncConfig::default()
            };
            let engine = SyncEngine::new(
                sample_trip(),
                &config,
                Box::new(transport.clone()),
                completions,
                Box::new(clock.clone()),
            );
            Self {
                engine,
                transport,
                replies,
                clock,
            }
        }

        fn wait(&mut self, by: Duration) {
            self.clock.advance(by);
            self.engine.tick();
        }

        fn reply(&mut self, dispatch: &Dispatch, outcome: Result<RemoteReply, RemoteError>) {
            self.replies
                .send(Completion {
                    id: dispatch.id,
                    outcome,
                })
                .unwrap();
            self.engine.pump();
        }

        /// Answers an update with the values it carried.
        fn accept(&mut self, dispatch: &Dispatch) {
            let RemoteRequest::UpdateField { entity, patch } = &dispatch.request else {
                panic!("expected an update, got {:?}", dispatch.request);
            };
            let record = EntityRecord {
                id: entity.clone(),
                fields: patch.clone(),
            };
            self.reply(dispatch, Ok(RemoteReply::Entity(record)));
        }
    }

    fn id(name: &str) -> EntityId {
        EntityId::from(name)
    }

    fn sample_trip() -> Trip {
        let mut trip = Trip::new(id("trip"), "Lisbon");
        let day = ChildDraft {
            id: id("day1"),
            title: "Alfama".into(),
            kind: DraftKind::Day { date: None },
        };
        trip.push_child(&id("trip"), day.into_node(0));
        let place = ChildDraft {
            id: id("castle"),
            title: "Castelo".into(),
            kind: DraftKind::Entry {
                entry_type: EntryType::Place,
            },
        };
        trip.push_child(&id("day1"), place.into_node(0));
        let todos = ChildDraft {
            id: id("todos"),
            title: "Before leaving".into(),
            kind: DraftKind::Entry {
                entry_type: EntryType::Todos,
            },
        };
        trip.push_child(&id("day1"), todos.into_node(1));
        for (index, name) in ["A", "B", "C"].iter().enumerate() {
            let todo = ChildDraft {
                id: id(name),
                title: format!("todo {name}"),
                kind: DraftKind::Todo,
            };
            trip.push_child(&id("todos"), todo.into_node(index as u32));
        }
        trip
    }

    fn title(entity: &str) -> FieldKey {
        FieldKey::new(id(entity), Field::Title)
    }

    fn shown(engine: &SyncEngine, entity: &str) -> Option<FieldValue> {
        engine.snapshot().field(&id(entity), Field::Title)
    }

    #[test]
    fn typing_burst_sends_one_write_with_the_last_value() {
        let mut h = Harness::new();
        for text in ["Lisb", "Lisbo", "Lisbon", "Lisbon!"] {
            h.engine
                .edit_field(&id("castle"), Field::Title, FieldValue::text(text))
                .unwrap();
            h.wait(Duration::from_millis(500));
        }
        assert!(h.transport.take().is_empty());
        assert_eq!(h.engine.field_status(&title("castle")), FieldStatus::Scheduled);

        h.wait(TEXT_QUIET - Duration::from_millis(500));
        let sent = h.transport.take();
        assert_eq!(sent.len(), 1);
        assert_matches!(
            &sent[0].request,
            RemoteRequest::UpdateField { patch, .. }
                if patch == &vec![(Field::Title, FieldValue::text("Lisbon!"))]
        );
        assert_eq!(h.engine.field_status(&title("castle")), FieldStatus::Syncing);

        h.accept(&sent[0]);
        assert_eq!(h.engine.field_status(&title("castle")), FieldStatus::Clean);
        assert_eq!(h.engine.snapshot(), h.engine.canonical());
    }

    #[test]
    fn next_deadline_tracks_the_latest_keystroke() {
        let mut h = Harness::new();
        assert_eq!(h.engine.next_deadline(), None);
        let start = h.clock.now();
        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("C"))
            .unwrap();
        assert_eq!(h.engine.next_deadline(), Some(start + TEXT_QUIET));

        h.wait(Duration::from_millis(700));
        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("Ca"))
            .unwrap();
        let typed_at = start + Duration::from_millis(700);
        assert_eq!(h.engine.next_deadline(), Some(typed_at + TEXT_QUIET));

        h.wait(TEXT_QUIET);
        assert_eq!(h.engine.next_deadline(), None);
    }

    #[test]
    fn edit_back_to_the_saved_value_sends_nothing() {
        let mut h = Harness::new();
        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("Castle"))
            .unwrap();
        h.wait(Duration::from_millis(300));
        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("Castelo"))
            .unwrap();
        h.wait(TEXT_QUIET);
        assert!(h.transport.take().is_empty());
        assert!(h.engine.is_idle());
        assert_eq!(h.engine.field_status(&title("castle")), FieldStatus::Clean);
    }

    #[test]
    fn edits_show_up_before_the_remote_answers() {
        let mut h = Harness::new();
        h.engine
            .edit_field(&id("castle"), Field::Address, FieldValue::text("R. de Santa Cruz"))
            .unwrap();
        assert_eq!(
            h.engine.snapshot().field(&id("castle"), Field::Address),
            Some(FieldValue::text("R. de Santa Cruz"))
        );
        assert_eq!(
            h.engine.canonical().field(&id("castle"), Field::Address),
            Some(FieldValue::text(""))
        );
    }

    #[test]
    fn rejected_write_restores_the_pre_edit_tree() {
        let mut h = Harness::new();
        let before = h.engine.snapshot().clone();
        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("Castle of St George"))
            .unwrap();
        h.wait(TEXT_QUIET);
        let sent = h.transport.take();
        h.reply(&sent[0], Err(RemoteError::Rejected("read only".into())));

        assert_eq!(h.engine.snapshot(), &before);
        assert_eq!(h.engine.field_status(&title("castle")), FieldStatus::RolledBack);
        let notices = h.engine.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].target, Some(id("castle")));
    }

    #[test]
    fn late_answer_for_an_older_write_is_ignored() {
        let mut h = Harness::new();
        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("One"))
            .unwrap();
        h.wait(TEXT_QUIET);
        let first = h.transport.take().remove(0);

        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("Two"))
            .unwrap();
        h.wait(TEXT_QUIET);
        let second = h.transport.take().remove(0);

        h.accept(&second);
        h.reply(&first, Err(RemoteError::Transient("timeout".into())));
        assert_eq!(shown(&h.engine, "castle"), Some(FieldValue::text("Two")));
        assert_eq!(
            h.engine.canonical().field(&id("castle"), Field::Title),
            Some(FieldValue::text("Two"))
        );
        assert!(h.engine.notices().is_empty());
    }

    #[test]
    fn reverting_during_an_inflight_write_still_writes() {
        let mut h = Harness::new();
        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("Castle"))
            .unwrap();
        h.wait(TEXT_QUIET);
        let first = h.transport.take().remove(0);

        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("Castelo"))
            .unwrap();
        h.accept(&first);
        assert_eq!(shown(&h.engine, "castle"), Some(FieldValue::text("Castelo")));

        h.wait(TEXT_QUIET);
        let sent = h.transport.take();
        assert_eq!(sent.len(), 1);
        h.accept(&sent[0]);
        assert_eq!(
            h.engine.canonical().field(&id("castle"), Field::Title),
            Some(FieldValue::text("Castelo"))
        );
    }

    #[test]
    fn toggles_are_sent_without_waiting() {
        let mut h = Harness::new();
        h.engine
            .edit_field(&id("B"), Field::Completed, FieldValue::Flag(true))
            .unwrap();
        let sent = h.transport.take();
        assert_eq!(sent.len(), 1);
        assert_matches!(&sent[0].request, RemoteRequest::UpdateField { entity, .. } if entity == &id("B"));
    }

    #[test]
    fn failed_todo_move_puts_the_list_back() {
        let mut h = Harness::new();
        assert!(h.engine.move_sibling(&id("todos"), &id("C"), 0).unwrap());
        assert_eq!(
            h.engine.snapshot().child_ids(&id("todos")).unwrap(),
            vec![id("C"), id("A"), id("B")]
        );
        let sent = h.transport.take();
        assert_matches!(
            &sent[0].request,
            RemoteRequest::ReorderSiblings { ordered, .. }
                if ordered == &vec![id("C"), id("A"), id("B")]
        );

        h.reply(&sent[0], Err(RemoteError::Transient("offline".into())));
        assert_eq!(
            h.engine.snapshot().child_ids(&id("todos")).unwrap(),
            vec![id("A"), id("B"), id("C")]
        );
        assert_eq!(h.engine.snapshot(), h.engine.canonical());
        assert_eq!(h.engine.notices().len(), 1);
    }

    #[test]
    fn confirmed_move_updates_both_trees() {
        let mut h = Harness::new();
        h.engine.move_sibling(&id("todos"), &id("A"), 2).unwrap();
        let sent = h.transport.take();
        h.reply(
            &sent[0],
            Ok(RemoteReply::Order(vec![id("B"), id("C"), id("A")])),
        );
        assert_eq!(
            h.engine.canonical().child_ids(&id("todos")).unwrap(),
            vec![id("B"), id("C"), id("A")]
        );
        assert!(!h.engine.move_sibling(&id("todos"), &id("A"), 2).unwrap());
    }

    #[test]
    fn deleting_drops_scheduled_edits_of_the_subtree() {
        let mut h = Harness::new();
        h.engine
            .edit_field(&id("A"), Field::Title, FieldValue::text("passport"))
            .unwrap();
        assert!(h.engine.delete_entity(&id("todos")).unwrap());
        assert_eq!(h.engine.scheduled_edits(), 0);
        h.wait(TEXT_QUIET);
        let sent = h.transport.take();
        assert_eq!(sent.len(), 1);
        assert_matches!(&sent[0].request, RemoteRequest::DeleteEntity { entity } if entity == &id("todos"));
        assert!(!h.engine.snapshot().contains(&id("A")));

        h.reply(&sent[0], Ok(RemoteReply::Deleted));
        assert!(!h.engine.canonical().contains(&id("A")));
        assert!(h.engine.is_idle());
    }

    #[test]
    fn edits_to_a_new_child_wait_for_its_create() {
        let mut h = Harness::new();
        let todo = h
            .engine
            .add_child(&id("todos"), ChildDraft::todo("adapter"))
            .unwrap();
        h.engine
            .edit_field(&todo, Field::Title, FieldValue::text("travel adapter"))
            .unwrap();
        h.wait(TEXT_QUIET);
        let sent = h.transport.take();
        assert_eq!(sent.len(), 1);
        let RemoteRequest::CreateChild { draft, .. } = &sent[0].request else {
            panic!("expected a create");
        };
        let created = draft.clone().into_node(3);
        h.reply(&sent[0], Ok(RemoteReply::Created(created)));
        assert_eq!(shown(&h.engine, todo.as_str()), Some(FieldValue::text("travel adapter")));

        h.wait(TEXT_QUIET);
        let sent = h.transport.take();
        assert_eq!(sent.len(), 1);
        assert_matches!(&sent[0].request, RemoteRequest::UpdateField { entity, .. } if entity == &todo);
    }

    #[test]
    fn not_found_triggers_a_refetch() {
        let mut h = Harness::new();
        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("Castle"))
            .unwrap();
        h.wait(TEXT_QUIET);
        let update = h.transport.take().remove(0);
        h.reply(&update, Err(RemoteError::NotFound(id("castle"))));

        let sent = h.transport.take();
        assert_eq!(sent.len(), 1);
        assert_matches!(&sent[0].request, RemoteRequest::FetchTrip { trip } if trip == &id("trip"));

        let mut fresh = sample_trip();
        fresh.remove(&id("castle"));
        h.reply(&sent[0], Ok(RemoteReply::Trip(fresh.clone())));
        assert_eq!(h.engine.snapshot(), &fresh);
        assert_eq!(h.engine.canonical(), &fresh);
    }

    #[test]
    fn refetch_keeps_edits_still_being_typed() {
        let mut h = Harness::new();
        h.engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("Castle"))
            .unwrap();
        h.engine.refresh();
        let fetch = h.transport.take().remove(0);
        h.reply(&fetch, Ok(RemoteReply::Trip(sample_trip())));
        assert_eq!(shown(&h.engine, "castle"), Some(FieldValue::text("Castle")));
        assert_eq!(h.engine.field_status(&title("castle")), FieldStatus::Scheduled);
    }

    #[test]
    fn invalid_edits_are_rejected_without_touching_the_tree() {
        let mut h = Harness::new();
        let before = h.engine.snapshot().clone();
        let err = h
            .engine
            .edit_field(&id("castle"), Field::Title, FieldValue::text("   "))
            .unwrap_err();
        assert_matches!(err, SyncError::Validation(ValidationError::EmptyTitle));
        assert_matches!(
            h.engine.delete_entity(&id("trip")),
            Err(SyncError::RootDelete)
        );
        assert_matches!(
            h.engine.add_child(&id("ghost"), ChildDraft::todo("x")),
            Err(SyncError::MissingEntity(_))
        );
        h.engine
            .edit_field(&id("ghost"), Field::Title, FieldValue::text("boo"))
            .unwrap();
        assert_eq!(h.engine.snapshot(), &before);
        assert!(h.transport.take().is_empty());
    }

    #[test]
    fn flush_all_ignores_quiet_periods() {
        let mut h = Harness::new();
        h.engine
            .edit_field(&id("castle"), Field::Description, FieldValue::text("views"))
            .unwrap();
        h.engine.flush_all();
        let sent = h.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(h.engine.pending_writes(), 1);
        h.accept(&sent[0]);
        assert!(h.engine.wait_idle(Duration::from_millis(10)));
    }
}
