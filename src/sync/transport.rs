use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;

use crate::model::{ChildDraft, EntityId, EntityRecord, Field, FieldValue, Node, Trip};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Transient(String),
    #[error("remote rejected the change: {0}")]
    Rejected(String),
    #[error("{0} does not exist on the remote")]
    NotFound(EntityId),
    #[error("remote state conflict: {0}")]
    Conflict(String),
}

impl RemoteError {
    /// Errors meaning the local tree no longer matches the remote one.
    pub fn needs_resync(&self) -> bool {
        matches!(self, RemoteError::NotFound(_) | RemoteError::Conflict(_))
    }
}

/// The authoritative store. Calls block and run on transport workers, never
/// on the UI thread.
pub trait RemoteService: Send + Sync {
    fn update_field(
        &self,
        entity: &EntityId,
        patch: &[(Field, FieldValue)],
    ) -> Result<EntityRecord, RemoteError>;

    fn reorder_siblings(
        &self,
        parent: &EntityId,
        ordered: &[EntityId],
    ) -> Result<Vec<EntityId>, RemoteError>;

    fn create_child(&self, parent: &EntityId, draft: &ChildDraft) -> Result<Node, RemoteError>;

    fn delete_entity(&self, entity: &EntityId) -> Result<(), RemoteError>;

    fn fetch_trip(&self, trip: &EntityId) -> Result<Trip, RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    UpdateField {
        entity: EntityId,
        patch: Vec<(Field, FieldValue)>,
    },
    ReorderSiblings {
        parent: EntityId,
        ordered: Vec<EntityId>,
    },
    CreateChild {
        parent: EntityId,
        draft: ChildDraft,
    },
    DeleteEntity {
        entity: EntityId,
    },
    FetchTrip {
        trip: EntityId,
    },
}

impl RemoteRequest {
    pub fn execute(&self, remote: &dyn RemoteService) -> Result<RemoteReply, RemoteError> {
        match self {
            RemoteRequest::UpdateField { entity, patch } => {
                remote.update_field(entity, patch).map(RemoteReply::Entity)
            }
            RemoteRequest::ReorderSiblings { parent, ordered } => remote
                .reorder_siblings(parent, ordered)
                .map(RemoteReply::Order),
            RemoteRequest::CreateChild { parent, draft } => {
                remote.create_child(parent, draft).map(RemoteReply::Created)
            }
            RemoteRequest::DeleteEntity { entity } => {
                remote.delete_entity(entity).map(|()| RemoteReply::Deleted)
            }
            RemoteRequest::FetchTrip { trip } => remote.fetch_trip(trip).map(RemoteReply::Trip),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RemoteRequest::UpdateField { .. } => "update_field",
            RemoteRequest::ReorderSiblings { .. } => "reorder_siblings",
            RemoteRequest::CreateChild { .. } => "create_child",
            RemoteRequest::DeleteEntity { .. } => "delete_entity",
            RemoteRequest::FetchTrip { .. } => "fetch_trip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteReply {
    Entity(EntityRecord),
    Order(Vec<EntityId>),
    Created(Node),
    Deleted,
    Trip(Trip),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub id: RequestId,
    /// Requests sharing a lane reach the remote in dispatch order.
    pub lane: EntityId,
    pub request: RemoteRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: RequestId,
    pub outcome: Result<RemoteReply, RemoteError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transport is shut down")]
pub struct TransportClosed;

/// Carries requests to the remote. Completions come back later on the
/// channel paired with the transport. Requests in the same lane must run in
/// the order they were sent; different lanes may overtake each other.
pub trait Transport {
    fn send(&self, dispatch: Dispatch) -> Result<(), TransportClosed>;
}

/// Runs remote calls on a small pool of worker threads. Each worker owns a
/// queue and every lane maps to exactly one worker.
pub struct WorkerTransport {
    queues: Vec<Sender<Dispatch>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerTransport {
    pub fn spawn(remote: Arc<dyn RemoteService>, workers: usize) -> (Self, Receiver<Completion>) {
        let (completion_tx, completion_rx) = unbounded::<Completion>();
        let mut queues = Vec::new();
        let mut handles = Vec::new();
        for index in 0..workers.max(1) {
            let (queue_tx, queue_rx) = unbounded::<Dispatch>();
            let completions = completion_tx.clone();
            let remote = Arc::clone(&remote);
            let spawned = thread::Builder::new()
                .name(format!("tripdesk-remote-{index}"))
                .spawn(move || worker_loop(remote.as_ref(), &queue_rx, &completions));
            match spawned {
                Ok(handle) => {
                    queues.push(queue_tx);
                    handles.push(handle);
                }
                Err(err) => tracing::error!(?err, "failed to spawn transport worker"),
            }
        }
        (
            Self {
                queues,
                workers: handles,
            },
            completion_rx,
        )
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn queue_for(&self, lane: &EntityId) -> Option<&Sender<Dispatch>> {
        if self.queues.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        lane.hash(&mut hasher);
        let index = (hasher.finish() % self.queues.len() as u64) as usize;
        self.queues.get(index)
    }
}

impl Transport for WorkerTransport {
    fn send(&self, dispatch: Dispatch) -> Result<(), TransportClosed> {
        let Some(queue) = self.queue_for(&dispatch.lane) else {
            return Err(TransportClosed);
        };
        queue.send(dispatch).map_err(|_| TransportClosed)
    }
}

impl Drop for WorkerTransport {
    fn drop(&mut self) {
        // Closing the queues lets every worker fall out of its loop.
        self.queues.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("transport worker panicked");
            }
        }
    }
}

fn worker_loop(
    remote: &dyn RemoteService,
    requests: &Receiver<Dispatch>,
    completions: &Sender<Completion>,
) {
    for dispatch in requests.iter() {
        let label = dispatch.request.label();
        let outcome = dispatch.request.execute(remote);
        if let Err(err) = &outcome {
            tracing::debug!(request = %dispatch.id, label, %err, "remote call failed");
        } else {
            tracing::trace!(request = %dispatch.id, label, "remote call finished");
        }
        let completion = Completion {
            id: dispatch.id,
            outcome,
        };
        if completions.send(completion).is_err() {
            // Engine is gone; nobody is waiting for answers any more.
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    /// Answers fetches only, slowly for ids starting with "slow".
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<EntityId>>,
    }

    impl RemoteService for Recorder {
        fn update_field(
            &self,
            _entity: &EntityId,
            _patch: &[(Field, FieldValue)],
        ) -> Result<EntityRecord, RemoteError> {
            unreachable!()
        }

        fn reorder_siblings(
            &self,
            _parent: &EntityId,
            _ordered: &[EntityId],
        ) -> Result<Vec<EntityId>, RemoteError> {
            unreachable!()
        }

        fn create_child(&self, _parent: &EntityId, _draft: &ChildDraft) -> Result<Node, RemoteError> {
            unreachable!()
        }

        fn delete_entity(&self, _entity: &EntityId) -> Result<(), RemoteError> {
            unreachable!()
        }

        fn fetch_trip(&self, trip: &EntityId) -> Result<Trip, RemoteError> {
            if trip.as_str().starts_with("slow") {
                thread::sleep(Duration::from_millis(200));
            }
            self.calls.lock().push(trip.clone());
            Err(RemoteError::NotFound(trip.clone()))
        }
    }

    fn fetch(id: u64, lane: &str, trip: &str) -> Dispatch {
        Dispatch {
            id: RequestId(id),
            lane: EntityId::from(lane),
            request: RemoteRequest::FetchTrip {
                trip: EntityId::from(trip),
            },
        }
    }

    #[test]
    fn one_lane_runs_in_dispatch_order_across_a_pool() {
        let remote = Arc::new(Recorder::default());
        let (transport, completions) = WorkerTransport::spawn(remote.clone(), 4);
        assert_eq!(transport.worker_count(), 4);

        transport.send(fetch(1, "lisbon", "slow-first")).unwrap();
        transport.send(fetch(2, "lisbon", "second")).unwrap();
        let answered: Vec<RequestId> = (0..2)
            .map(|_| completions.recv_timeout(Duration::from_secs(5)).unwrap().id)
            .collect();

        assert_eq!(answered, vec![RequestId(1), RequestId(2)]);
        assert_eq!(
            *remote.calls.lock(),
            vec![EntityId::from("slow-first"), EntityId::from("second")]
        );
    }

    #[test]
    fn dropping_the_transport_stops_its_workers() {
        let remote = Arc::new(Recorder::default());
        let (transport, completions) = WorkerTransport::spawn(remote, 2);
        transport.send(fetch(1, "porto", "quick")).unwrap();
        let first = completions.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.outcome, Err(RemoteError::NotFound(EntityId::from("quick"))));

        drop(transport);
        assert!(completions.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
