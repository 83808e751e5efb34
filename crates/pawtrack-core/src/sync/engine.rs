//! Engine facade used by applications

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::dispatcher::{initial_status, Command, Dispatcher};
use super::persist::{spawn_writer, StatePersister};
use super::{
    ConnectivityMonitor, FlushReport, PendingOperationLog, ReconciledView, SyncEvent,
    SyncReconciler,
};
use crate::config::EngineConfig;
use crate::db::KvStore;
use crate::error::{Error, Result, UndoError};
use crate::models::{
    Booking, BookingStatus, Change, Collection, Entity, EntityId, OperationId, Patch,
    PendingOperation, Query, SyncConflict, Visit, VisitTimeline,
};
use crate::remote::RemoteStore;
use crate::state::SyncStatus;
use crate::timer::{self, TimerProjection};
use crate::undo::UndoController;
use crate::util::lock;

const EVENT_CAPACITY: usize = 256;

/// Stream of reconciled views for one query
pub type ReconciledViewStream = BoxStream<'static, ReconciledView>;

/// Handle to a running sync engine.
///
/// Mutations return as soon as they are in the local log; the dispatcher
/// task sends them to the remote store in the background.
pub struct SyncEngine {
    config: EngineConfig,
    reconciler: Arc<SyncReconciler>,
    undo: UndoController,
    remote: Arc<dyn RemoteStore>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// Wakes the state writer after every mutation
    persist_requests: Mutex<Option<mpsc::Sender<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Restore persisted state and start the background tasks
    pub async fn open(
        config: EngineConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self> {
        let config = config.validate()?;

        let mut log = PendingOperationLog::restore(kv.as_ref()).await?;
        log.drain_confirmed();
        let unconfirmed = log.unconfirmed_len();
        let log = Arc::new(Mutex::new(log));
        let reconciler = Arc::new(SyncReconciler::restore(log, kv.as_ref()).await?);

        let conn = connectivity.current();
        let (status_tx, status) = watch::channel(initial_status(conn, unconfirmed));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, receiver) = mpsc::unbounded_channel();
        let persister = Arc::new(StatePersister::new(Arc::clone(&reconciler), kv));
        let (persist_requests, writer) = spawn_writer(Arc::clone(&persister));

        let dispatcher = Dispatcher {
            reconciler: Arc::clone(&reconciler),
            remote: Arc::clone(&remote),
            connectivity: Arc::clone(&connectivity),
            persister,
            status: status_tx,
            events: events.clone(),
            refresh_page_size: config.refresh_page_size,
            last_seen: conn,
            waiting_for_reconnect: false,
        };
        let dispatcher = tokio::spawn(dispatcher.run(receiver));

        let listener = {
            let commands = commands.downgrade();
            let mut transitions = connectivity.transitions();
            tokio::spawn(async move {
                while let Some(state) = transitions.next().await {
                    tracing::debug!(?state, "Connectivity changed");
                    let Some(commands) = commands.upgrade() else {
                        break;
                    };
                    if commands.send(Command::Connectivity(state)).is_err() {
                        break;
                    }
                }
            })
        };

        tracing::info!(
            pending = unconfirmed,
            reachable = conn.is_reachable(),
            "Sync engine started"
        );

        let engine = Self {
            undo: UndoController::new(Arc::clone(&reconciler)),
            config,
            reconciler,
            remote,
            commands,
            status,
            events,
            dispatcher: Mutex::new(Some(dispatcher)),
            persist_requests: Mutex::new(Some(persist_requests)),
            writer: Mutex::new(Some(writer)),
            tasks: Mutex::new(vec![listener]),
        };
        if unconfirmed > 0 {
            engine.kick();
        }
        Ok(engine)
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Issue a mutation; returns once it is in the local log.
    ///
    /// Visit check-in, check-out and undo have their own operations; a
    /// generic visit update cannot write the actual times.
    pub fn mutate(
        &self,
        collection: &Collection,
        entity_id: &EntityId,
        change: Change,
    ) -> Result<OperationId> {
        if let Change::Create(patch) | Change::Update(patch) = &change {
            patch.validate()?;
        }
        if collection.is_visits() {
            match &change {
                Change::Create(patch) => Visit::validate_creation(patch)?,
                Change::Update(patch) => Visit::validate_update(patch)?,
                Change::Delete => {}
            }
        }
        let id = self.reconciler.enqueue(collection, entity_id, change);
        self.kick();
        Ok(id)
    }

    /// Subscribe to the reconciled view of a query.
    ///
    /// The first subscription of a query opens its change feed.
    pub fn reconciled_view(&self, query: &Query) -> ReconciledViewStream {
        let (receiver, first) = self.reconciler.register(query);
        if first {
            self.spawn_feed(query);
        }
        futures::stream::unfold((receiver, true), |(mut receiver, initial)| async move {
            if !initial {
                receiver.changed().await.ok()?;
            }
            let view = receiver.borrow_and_update().clone();
            Some((view, (receiver, false)))
        })
        .boxed()
    }

    /// Current reconciled view of a query, without opening a feed
    pub fn snapshot(&self, query: &Query) -> ReconciledView {
        self.reconciler.view(query)
    }

    pub fn entity(&self, collection: &Collection, entity_id: &EntityId) -> Option<Entity> {
        self.reconciler.entity(collection, entity_id)
    }

    /// A visit as currently reconciled, if visible
    pub fn visit(&self, entity_id: &EntityId) -> Result<Option<Visit>> {
        self.reconciler
            .entity(&Collection::visits(), entity_id)
            .map(|entity| Visit::from_entity(&entity))
            .transpose()
    }

    pub fn create_visit(
        &self,
        entity_id: &EntityId,
        timeline: &VisitTimeline,
        booking_id: Option<&str>,
        sitter_id: Option<&str>,
    ) -> Result<OperationId> {
        let patch = Visit::creation_patch(timeline, booking_id, sitter_id);
        self.mutate(&Collection::visits(), entity_id, Change::Create(patch))
    }

    /// Start a visit; the server stamps `actualStart`
    pub fn check_in(&self, entity_id: &EntityId) -> Result<OperationId> {
        let id = self
            .reconciler
            .enqueue_checked(&Collection::visits(), entity_id, |entity| {
                let visit = require_visit(entity, entity_id)?;
                if visit.is_started() {
                    return Err(Error::InvalidInput(format!(
                        "Visit {entity_id} is already checked in"
                    )));
                }
                Ok(Change::Update(Visit::check_in_patch()))
            })?;
        self.kick();
        Ok(id)
    }

    /// End a visit; the server stamps `actualEnd`
    pub fn check_out(&self, entity_id: &EntityId) -> Result<OperationId> {
        let id = self
            .reconciler
            .enqueue_checked(&Collection::visits(), entity_id, |entity| {
                let visit = require_visit(entity, entity_id)?;
                if !visit.is_started() {
                    return Err(Error::InvalidInput(format!(
                        "Visit {entity_id} cannot be checked out before it is checked in"
                    )));
                }
                if visit.is_ended() {
                    return Err(Error::InvalidInput(format!(
                        "Visit {entity_id} is already checked out"
                    )));
                }
                Ok(Change::Update(Visit::check_out_patch()))
            })?;
        self.kick();
        Ok(id)
    }

    /// Reverse a check-in that has not been followed by a check-out
    pub fn undo(&self, entity_id: &EntityId) -> std::result::Result<OperationId, UndoError> {
        let id = self.undo.undo(entity_id)?;
        self.kick();
        Ok(id)
    }

    pub fn create_booking(&self, entity_id: &EntityId, booking: &Booking) -> Result<OperationId> {
        booking.validate()?;
        self.mutate(
            &Collection::bookings(),
            entity_id,
            Change::Create(booking.to_patch()?),
        )
    }

    pub fn update_booking(&self, entity_id: &EntityId, patch: Patch) -> Result<OperationId> {
        self.require(&Collection::bookings(), entity_id)?;
        self.mutate(&Collection::bookings(), entity_id, Change::Update(patch))
    }

    pub fn cancel_booking(&self, entity_id: &EntityId) -> Result<OperationId> {
        self.update_booking(entity_id, Booking::status_patch(BookingStatus::Cancelled))
    }

    pub fn delete_booking(&self, entity_id: &EntityId) -> Result<OperationId> {
        self.require(&Collection::bookings(), entity_id)?;
        self.mutate(&Collection::bookings(), entity_id, Change::Delete)
    }

    /// Live countdown of a visit at `now`
    pub fn projection(&self, entity_id: &EntityId, now: DateTime<Utc>) -> Result<TimerProjection> {
        let visit = self
            .visit(entity_id)?
            .ok_or_else(|| Error::NotFound(format!("Visit {entity_id}")))?;
        Ok(timer::project(&visit.timeline, now))
    }

    /// Tick a visit's projection at the configured cadence
    pub fn watch_timer(&self, entity_id: &EntityId) -> watch::Receiver<Option<TimerProjection>> {
        let reconciler = Arc::clone(&self.reconciler);
        let entity_id = entity_id.clone();
        timer::spawn_ticker(self.config.tick_interval(), move || {
            let entity = reconciler.entity(&Collection::visits(), &entity_id)?;
            let visit = Visit::from_entity(&entity).ok()?;
            Some(timer::project(&visit.timeline, Utc::now()))
        })
    }

    /// Run one dispatch pass now and wait for it
    pub async fn flush(&self) -> Result<FlushReport> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Flush(reply))?;
        response.await.map_err(|_| Error::EngineStopped)
    }

    /// Re-fetch every subscribed query; returns the number of documents applied
    pub async fn refresh(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Refresh(reply))?;
        response.await.map_err(|_| Error::EngineStopped)
    }

    /// Make a rejected operation eligible for dispatch again
    pub fn retry(&self, operation_id: OperationId) -> Result<()> {
        lock(self.reconciler.log()).clear_failure(operation_id)?;
        tracing::info!(operation_id = %operation_id, "Retrying rejected operation");
        self.kick();
        Ok(())
    }

    /// Drop a rejected operation and its local effect
    pub fn discard(&self, operation_id: OperationId) -> Result<PendingOperation> {
        let operation = lock(self.reconciler.log()).withdraw(operation_id)?;
        tracing::info!(
            operation_id = %operation_id,
            entity_id = %operation.entity_id,
            "Discarded rejected operation"
        );
        self.reconciler.republish();
        self.kick();
        Ok(operation)
    }

    /// Unconfirmed operations for an entity, in issue order
    pub fn pending_for(&self, entity_id: &EntityId) -> Vec<PendingOperation> {
        lock(self.reconciler.log()).pending_for(entity_id)
    }

    /// Every unconfirmed operation, in issue order
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        lock(self.reconciler.log()).unconfirmed().cloned().collect()
    }

    pub fn failed_operations(&self) -> Vec<PendingOperation> {
        lock(self.reconciler.log()).failed()
    }

    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.reconciler.conflicts()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Write the log and entity cache to the key-value store
    pub async fn persist(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Persist(reply))?;
        response.await.map_err(|_| Error::EngineStopped)?
    }

    /// Persist and stop every background task
    pub async fn shutdown(self) -> Result<()> {
        lock(&self.persist_requests).take();
        let writer = lock(&self.writer).take();
        if let Some(handle) = writer {
            if let Err(error) = handle.await {
                tracing::warn!("State writer task failed: {error}");
            }
        }

        let (reply, response) = oneshot::channel();
        self.send(Command::Shutdown(reply))?;
        let persisted = response.await.map_err(|_| Error::EngineStopped)?;

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(handle) = dispatcher {
            if let Err(error) = handle.await {
                tracing::warn!("Dispatcher task failed: {error}");
            }
        }
        tracing::info!("Sync engine stopped");
        persisted
    }

    fn require(&self, collection: &Collection, entity_id: &EntityId) -> Result<Entity> {
        self.reconciler
            .entity(collection, entity_id)
            .ok_or_else(|| Error::NotFound(format!("{collection}/{entity_id}")))
    }

    fn spawn_feed(&self, query: &Query) {
        let reconciler = Arc::clone(&self.reconciler);
        let mut feed = self.remote.change_feed(query);
        let collection = query.collection.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                reconciler.apply_event(event);
            }
            tracing::debug!(collection = %collection, "Change feed ended");
        });
        lock(&self.tasks).push(handle);
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::EngineStopped)
    }

    fn kick(&self) {
        self.request_persist();
        if self.send(Command::Kick).is_err() {
            tracing::warn!("Sync engine has stopped; mutation stays queued locally");
        }
    }

    /// The log reaches storage without waiting for an in-flight write
    fn request_persist(&self) {
        if let Some(requests) = lock(&self.persist_requests).as_ref() {
            // Full means a queued write will pick this change up
            let _ = requests.try_send(());
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.writer).take() {
            handle.abort();
        }
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
    }
}

fn require_visit(entity: Option<&Entity>, entity_id: &EntityId) -> Result<Visit> {
    let entity = entity.ok_or_else(|| Error::NotFound(format!("Visit {entity_id}")))?;
    if entity.collection.as_str() != Collection::VISITS {
        return Err(Error::InvalidInput(format!("{entity_id} is not a visit")));
    }
    Visit::from_entity(entity)
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryKvStore;
    use crate::error::WriteError;
    use crate::remote::{DisconnectedRemote, InMemoryRemoteStore};
    use crate::state::ConnState;
    use crate::sync::ManualConnectivity;
    use chrono::TimeZone;

    fn timeline() -> VisitTimeline {
        VisitTimeline::scheduled(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
        )
        .unwrap()
    }

    async fn offline_engine() -> SyncEngine {
        SyncEngine::open(
            EngineConfig::default(),
            Arc::new(DisconnectedRemote),
            Arc::new(ManualConnectivity::new(ConnState::Unreachable)),
            Arc::new(MemoryKvStore::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn mutations_are_visible_before_dispatch() {
        let engine = offline_engine().await;
        let id = EntityId::new("visit-1").unwrap();
        engine.create_visit(&id, &timeline(), None, None).unwrap();

        let visit = engine.visit(&id).unwrap().unwrap();
        assert_eq!(visit.timeline, timeline());
        assert_eq!(engine.pending_for(&id).len(), 1);
        assert_eq!(*engine.status().borrow(), SyncStatus::Offline);
    }

    #[tokio::test]
    async fn check_out_requires_check_in() {
        let engine = offline_engine().await;
        let id = EntityId::new("visit-1").unwrap();
        engine.create_visit(&id, &timeline(), None, None).unwrap();

        assert!(matches!(engine.check_out(&id), Err(Error::InvalidInput(_))));
        engine.check_in(&id).unwrap();
        assert!(matches!(engine.check_in(&id), Err(Error::InvalidInput(_))));
        engine.check_out(&id).unwrap();
        assert!(matches!(engine.check_out(&id), Err(Error::InvalidInput(_))));
        assert_eq!(engine.pending_for(&id).len(), 3);
    }

    #[tokio::test]
    async fn visit_updates_cannot_move_the_schedule() {
        let engine = offline_engine().await;
        let id = EntityId::new("visit-1").unwrap();
        engine.create_visit(&id, &timeline(), None, None).unwrap();

        let patch = Patch::new().set("scheduledStart", "2024-05-01T09:00:00.000Z");
        assert!(engine
            .mutate(&Collection::visits(), &id, Change::Update(patch))
            .is_err());
    }

    #[tokio::test]
    async fn visit_creates_must_be_unstarted_and_well_formed() {
        let engine = offline_engine().await;
        let id = EntityId::new("visit-1").unwrap();

        let started = Visit::creation_patch(&timeline(), None, None)
            .set("actualStart", "2024-05-01T10:00:00.000Z");
        assert!(matches!(
            engine.mutate(&Collection::visits(), &id, Change::Create(started)),
            Err(Error::InvalidInput(_))
        ));
        let unscheduled = Patch::new().set("status", "scheduled");
        assert!(matches!(
            engine.mutate(&Collection::visits(), &id, Change::Create(unscheduled)),
            Err(Error::InvalidInput(_))
        ));
        assert!(engine.pending_for(&id).is_empty());
        assert!(engine.visit(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn flush_reports_offline() {
        let engine = offline_engine().await;
        let id = EntityId::new("visit-1").unwrap();
        engine.create_visit(&id, &timeline(), None, None).unwrap();

        let report = engine.flush().await.unwrap();
        assert!(report.offline);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn rejected_operation_can_be_discarded() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = SyncEngine::open(
            EngineConfig::default(),
            remote.clone(),
            Arc::new(ManualConnectivity::new(ConnState::Reachable)),
            Arc::new(MemoryKvStore::new()),
        )
        .await
        .unwrap();

        remote.fail_next_write(WriteError::rejected("permission-denied", "read only"));
        let id = EntityId::new("visit-1").unwrap();
        let operation = engine.create_visit(&id, &timeline(), None, None).unwrap();
        engine.flush().await.unwrap();

        let failed = engine.failed_operations();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, operation);
        assert_eq!(*engine.status().borrow(), SyncStatus::Error);

        engine.discard(operation).unwrap();
        assert!(engine.visit(&id).unwrap().is_none());
        assert!(engine.failed_operations().is_empty());
        assert!(engine.pending_for(&id).is_empty());
    }
}
