//! Merge of authoritative snapshots with unconfirmed local mutations.
//!
//! The reconciler keeps the last confirmed document per entity (with the
//! server time it was written at) and derives every published view from
//! that cache plus the unconfirmed entries of the pending log, applied in
//! issue order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use super::{decode_blob, encode_blob, PendingOperationLog, SharedLog};
use crate::db::{keys, KvStore};
use crate::error::{ReconciliationError, Result};
use crate::models::{
    Booking, Change, Collection, Entity, EntityId, FieldChange, Fields, OperationId, OperationKind,
    PendingOperation, Query, SyncConflict, SyncState, VisitTimeline, LAST_WRITER_WINS,
};
use crate::remote::{Ack, ChangeEvent, DocumentChange, RemoteDocument};
use crate::util::lock;

/// Entities visible to one query, sorted by id
pub type ReconciledView = Vec<Entity>;

/// What happened to a change-feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Echo of an unconfirmed local write, discarded unread
    Suppressed,
    Applied {
        applied: usize,
        /// Older than the cached document
        stale: usize,
        /// Dropped as malformed
        malformed: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedDocument {
    fields: Fields,
    #[serde(default)]
    update_time: Option<DateTime<Utc>>,
}

type DocumentCache = BTreeMap<Collection, BTreeMap<EntityId, CachedDocument>>;

struct RegisteredView {
    query: Query,
    sender: watch::Sender<ReconciledView>,
}

#[derive(Default)]
struct ReconcilerState {
    cache: DocumentCache,
    conflicted: BTreeSet<(Collection, EntityId)>,
    conflicts: Vec<SyncConflict>,
    next_conflict_id: u64,
    views: Vec<RegisteredView>,
}

/// Publishes reconciled views and folds confirmations into the cache
pub struct SyncReconciler {
    state: Mutex<ReconcilerState>,
    log: SharedLog,
}

impl SyncReconciler {
    pub fn new(log: SharedLog) -> Self {
        Self {
            state: Mutex::new(ReconcilerState::default()),
            log,
        }
    }

    /// Rebuild a reconciler from the entity cache saved by [`Self::encode_state`]
    pub async fn restore(log: SharedLog, kv: &dyn KvStore) -> Result<Self> {
        let reconciler = Self::new(log);
        if let Some(raw) = kv.get(keys::ENTITY_CACHE).await? {
            lock(&reconciler.state).cache = decode_blob(&raw)?;
        }
        Ok(reconciler)
    }

    pub fn log(&self) -> &SharedLog {
        &self.log
    }

    /// Start publishing a query. The flag is true the first time a query is seen.
    pub fn register(&self, query: &Query) -> (watch::Receiver<ReconciledView>, bool) {
        let mut state = lock(&self.state);
        if let Some(view) = state.views.iter().find(|view| view.query == *query) {
            return (view.sender.subscribe(), false);
        }
        let initial = state.view(query, &lock(&self.log));
        let (sender, receiver) = watch::channel(initial);
        state.views.push(RegisteredView {
            query: query.clone(),
            sender,
        });
        (receiver, true)
    }

    pub fn registered_queries(&self) -> Vec<Query> {
        lock(&self.state)
            .views
            .iter()
            .map(|view| view.query.clone())
            .collect()
    }

    /// Current reconciled view of a query, without subscribing
    pub fn view(&self, query: &Query) -> ReconciledView {
        let state = lock(&self.state);
        let view = state.view(query, &lock(&self.log));
        view
    }

    /// One reconciled entity, if it is visible locally
    pub fn entity(&self, collection: &Collection, entity_id: &EntityId) -> Option<Entity> {
        let state = lock(&self.state);
        let entity = state.entity(collection, entity_id, &lock(&self.log));
        entity
    }

    /// Enqueue a mutation built from the entity's current reconciled state.
    ///
    /// The check and the enqueue happen under one lock, so no other mutation
    /// can slip in between.
    pub fn enqueue_checked<E>(
        &self,
        collection: &Collection,
        entity_id: &EntityId,
        build: impl FnOnce(Option<&Entity>) -> std::result::Result<Change, E>,
    ) -> std::result::Result<OperationId, E> {
        let mut state = lock(&self.state);
        let mut log = lock(&self.log);
        let current = state.entity(collection, entity_id, &log);
        let change = build(current.as_ref())?;
        let id = log.enqueue(collection.clone(), entity_id.clone(), change, Utc::now());
        state.publish(&log);
        Ok(id)
    }

    /// Enqueue a mutation unconditionally and publish it
    pub fn enqueue(
        &self,
        collection: &Collection,
        entity_id: &EntityId,
        change: Change,
    ) -> OperationId {
        let mut state = lock(&self.state);
        let mut log = lock(&self.log);
        let id = log.enqueue(collection.clone(), entity_id.clone(), change, Utc::now());
        state.publish(&log);
        id
    }

    /// Consume one change-feed event
    pub fn apply_event(&self, event: ChangeEvent) -> EventOutcome {
        if event.metadata.has_unconfirmed_local_writes {
            tracing::debug!(
                collection = %event.collection,
                changes = event.changes.len(),
                "Suppressed echo of unconfirmed local write"
            );
            return EventOutcome::Suppressed;
        }

        let mut state = lock(&self.state);
        let log = lock(&self.log);
        let (mut applied, mut stale, mut malformed) = (0, 0, 0);
        for change in event.changes {
            match state.apply_confirmed(&event.collection, change, &log) {
                Ok(true) => applied += 1,
                Ok(false) => stale += 1,
                Err(error) => {
                    tracing::warn!(collection = %event.collection, "{error}");
                    malformed += 1;
                }
            }
        }
        state.publish(&log);

        EventOutcome::Applied {
            applied,
            stale,
            malformed,
        }
    }

    /// Fold a write acknowledgment into the cache and drop the operation.
    ///
    /// Returns false when the operation is no longer in the log.
    pub fn apply_ack(&self, operation_id: OperationId, ack: &Ack) -> bool {
        let mut state = lock(&self.state);
        let mut log = lock(&self.log);
        let Some(operation) = log.get(operation_id).cloned() else {
            return false;
        };
        state.fold_ack(&operation, ack);
        log.mark_confirmed(operation_id);
        log.drain_confirmed();
        state.publish(&log);
        true
    }

    /// Apply a one-shot fetch of a query.
    ///
    /// With `complete` set the fetch returned every matching document, so
    /// cached matches missing from it were deleted remotely.
    pub fn apply_refresh(
        &self,
        query: &Query,
        documents: Vec<RemoteDocument>,
        complete: bool,
    ) -> usize {
        let mut state = lock(&self.state);
        let log = lock(&self.log);
        let mut seen = BTreeSet::new();
        for document in documents {
            let id = document.id.clone();
            match state.apply_confirmed(&query.collection, DocumentChange::Upsert(document), &log) {
                Ok(_) => {
                    seen.insert(id);
                }
                Err(error) => tracing::warn!(collection = %query.collection, "{error}"),
            }
        }

        if complete {
            if let Some(documents) = state.cache.get_mut(&query.collection) {
                documents.retain(|id, document| {
                    seen.contains(id.as_str())
                        || !query.matches_fields(&document.fields)
                        || log.unconfirmed_for(&query.collection, id).next().is_some()
                });
            }
        }
        state.publish(&log);
        seen.len()
    }

    /// Recompute and publish every registered view
    pub fn republish(&self) {
        let mut state = lock(&self.state);
        let log = lock(&self.log);
        state.publish(&log);
    }

    /// LWW resolutions recorded so far
    pub fn conflicts(&self) -> Vec<SyncConflict> {
        lock(&self.state).conflicts.clone()
    }

    /// Serialize the log and the entity cache as one consistent pair
    pub fn encode_state(&self) -> Result<(String, String)> {
        let state = lock(&self.state);
        let log = lock(&self.log);
        Ok((log.encode()?, encode_blob(&state.cache)?))
    }
}

impl ReconcilerState {
    /// Returns `Ok(false)` when the change is older than the cached document.
    fn apply_confirmed(
        &mut self,
        collection: &Collection,
        change: DocumentChange,
        log: &PendingOperationLog,
    ) -> std::result::Result<bool, ReconciliationError> {
        let raw_id = change.document_id().to_string();
        let entity_id = EntityId::new(raw_id.as_str())
            .map_err(|error| ReconciliationError::malformed(&raw_id, error.to_string()))?;
        let cached_time = self
            .cache
            .get(collection)
            .and_then(|documents| documents.get(&entity_id))
            .and_then(|document| document.update_time);

        match change {
            DocumentChange::Upsert(document) => {
                let Value::Object(fields) = document.fields else {
                    return Err(ReconciliationError::malformed(
                        raw_id,
                        "fields must be a JSON object",
                    ));
                };
                let update_time = document.update_time.ok_or_else(|| {
                    ReconciliationError::malformed(&raw_id, "confirmed snapshot has no update time")
                })?;
                validate_document(collection, &entity_id, &fields)?;

                if cached_time.is_some_and(|cached| cached > update_time) {
                    tracing::debug!(entity_id = %entity_id, "Ignored stale snapshot");
                    return Ok(false);
                }

                let previous = self
                    .cache
                    .get(collection)
                    .and_then(|documents| documents.get(&entity_id))
                    .map(|document| document.fields.clone());
                self.detect_conflict(
                    collection,
                    &entity_id,
                    previous.as_ref(),
                    &fields,
                    update_time,
                    log,
                );
                self.cache.entry(collection.clone()).or_default().insert(
                    entity_id,
                    CachedDocument {
                        fields,
                        update_time: Some(update_time),
                    },
                );
                Ok(true)
            }
            DocumentChange::Removed { update_time, .. } => {
                if let (Some(cached), Some(removed_at)) = (cached_time, update_time) {
                    if cached > removed_at {
                        tracing::debug!(entity_id = %entity_id, "Ignored stale removal");
                        return Ok(false);
                    }
                }
                if let Some(documents) = self.cache.get_mut(collection) {
                    documents.remove(&entity_id);
                }
                Ok(true)
            }
        }
    }

    /// Record an LWW resolution when a confirmed value lands on a field
    /// that an unconfirmed local operation also writes.
    fn detect_conflict(
        &mut self,
        collection: &Collection,
        entity_id: &EntityId,
        previous: Option<&Fields>,
        incoming: &Fields,
        incoming_updated_at: DateTime<Utc>,
        log: &PendingOperationLog,
    ) {
        let pending: Vec<&PendingOperation> = log.unconfirmed_for(collection, entity_id).collect();
        let Some(newest) = pending.last() else {
            return;
        };

        let mut intended: BTreeMap<&str, Vec<Option<&Value>>> = BTreeMap::new();
        let mut stamped = BTreeSet::new();
        for operation in &pending {
            for (name, change) in operation.payload.iter() {
                match change {
                    FieldChange::Set(value) => {
                        intended.entry(name.as_str()).or_default().push(Some(value));
                    }
                    FieldChange::Clear => intended.entry(name.as_str()).or_default().push(None),
                    FieldChange::ServerTimestamp => {
                        stamped.insert(name.as_str());
                    }
                }
            }
        }

        let fields: Vec<String> = intended
            .iter()
            .filter(|(name, _)| !stamped.contains(*name))
            .filter(|(name, values)| {
                let now = incoming.get(**name);
                let before = previous.and_then(|fields| fields.get(**name));
                now != before && !values.contains(&now)
            })
            .map(|(name, _)| (*name).to_string())
            .collect();
        if fields.is_empty() {
            return;
        }

        tracing::warn!(
            entity_id = %entity_id,
            operation_id = %newest.id,
            fields = ?fields,
            "Remote change overlaps a pending local write; keeping the local write"
        );
        let conflict = SyncConflict {
            id: self.next_conflict_id,
            entity_id: entity_id.clone(),
            operation_id: newest.id,
            fields,
            local_issued_at: newest.issued_at,
            incoming_updated_at,
            resolved_at: Utc::now(),
            strategy: LAST_WRITER_WINS.to_string(),
        };
        self.next_conflict_id += 1;
        self.conflicts.push(conflict);
        self.conflicted
            .insert((collection.clone(), entity_id.clone()));
    }

    fn fold_ack(&mut self, operation: &PendingOperation, ack: &Ack) {
        let documents = self.cache.entry(operation.collection.clone()).or_default();
        let cached_time = documents
            .get(&operation.entity_id)
            .and_then(|document| document.update_time);
        // A snapshot at or after the ack already contains this write.
        if cached_time
            .zip(ack.update_time)
            .is_some_and(|(cached, acked)| cached >= acked)
        {
            return;
        }

        match operation.kind {
            OperationKind::Delete => {
                documents.remove(&operation.entity_id);
            }
            OperationKind::Create | OperationKind::Update => {
                let document = documents
                    .entry(operation.entity_id.clone())
                    .or_insert_with(|| CachedDocument {
                        fields: Fields::new(),
                        update_time: None,
                    });
                operation.payload.apply(
                    &mut document.fields,
                    &mut BTreeSet::new(),
                    Some(&ack.server_timestamps),
                );
                document.update_time = ack.update_time;
            }
        }
    }

    fn reconcile(
        &self,
        collection: &Collection,
        only: Option<&EntityId>,
        log: &PendingOperationLog,
    ) -> BTreeMap<EntityId, Entity> {
        let wanted = |id: &EntityId| only.is_none_or(|only| only == id);

        let mut entities: BTreeMap<EntityId, Entity> = self
            .cache
            .get(collection)
            .into_iter()
            .flatten()
            .filter(|(id, _)| wanted(id))
            .map(|(id, document)| {
                (
                    id.clone(),
                    Entity {
                        id: id.clone(),
                        collection: collection.clone(),
                        fields: document.fields.clone(),
                        sync_state: SyncState::Clean,
                        awaiting_server: BTreeSet::new(),
                    },
                )
            })
            .collect();

        for operation in log
            .unconfirmed()
            .filter(|op| op.collection == *collection && wanted(&op.entity_id))
        {
            match operation.kind {
                OperationKind::Delete => {
                    entities.remove(&operation.entity_id);
                }
                OperationKind::Create => {
                    let entity = entities
                        .entry(operation.entity_id.clone())
                        .or_insert_with(|| Entity {
                            id: operation.entity_id.clone(),
                            collection: collection.clone(),
                            fields: Fields::new(),
                            sync_state: SyncState::Clean,
                            awaiting_server: BTreeSet::new(),
                        });
                    overlay(entity, operation);
                }
                OperationKind::Update => {
                    if let Some(entity) = entities.get_mut(&operation.entity_id) {
                        overlay(entity, operation);
                    }
                }
            }
        }

        for (conflict_collection, id) in &self.conflicted {
            if conflict_collection == collection {
                if let Some(entity) = entities.get_mut(id) {
                    entity.sync_state = SyncState::Conflicted;
                }
            }
        }
        entities
    }

    fn view(&self, query: &Query, log: &PendingOperationLog) -> ReconciledView {
        let mut view: ReconciledView = self
            .reconcile(&query.collection, None, log)
            .into_values()
            .filter(|entity| query.matches(entity))
            .collect();
        if let Some(limit) = query.limit {
            view.truncate(limit);
        }
        view
    }

    fn entity(
        &self,
        collection: &Collection,
        entity_id: &EntityId,
        log: &PendingOperationLog,
    ) -> Option<Entity> {
        self.reconcile(collection, Some(entity_id), log)
            .remove(entity_id)
    }

    fn publish(&mut self, log: &PendingOperationLog) {
        self.conflicted
            .retain(|(collection, id)| log.unconfirmed_for(collection, id).next().is_some());

        for view in &self.views {
            let next = self.view(&view.query, log);
            view.sender.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
        }
    }
}

fn overlay(entity: &mut Entity, operation: &PendingOperation) {
    operation
        .payload
        .apply(&mut entity.fields, &mut entity.awaiting_server, None);
    entity.sync_state = SyncState::PendingWrite(operation.id);
}

/// Reject confirmed documents the typed models cannot read
fn validate_document(
    collection: &Collection,
    entity_id: &EntityId,
    fields: &Fields,
) -> std::result::Result<(), ReconciliationError> {
    let entity = Entity {
        id: entity_id.clone(),
        collection: collection.clone(),
        fields: fields.clone(),
        sync_state: SyncState::Clean,
        awaiting_server: BTreeSet::new(),
    };
    let checked = match collection.as_str() {
        Collection::VISITS => VisitTimeline::from_entity(&entity).map(|_| ()),
        Collection::BOOKINGS => Booking::from_entity(&entity).map(|_| ()),
        _ => Ok(()),
    };
    checked.map_err(|error| ReconciliationError::malformed(entity_id.as_str(), error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Patch, Visit};
    use crate::remote::SnapshotMetadata;
    use crate::util::format_timestamp;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn setup() -> SyncReconciler {
        SyncReconciler::new(Arc::new(Mutex::new(PendingOperationLog::new())))
    }

    fn visit_id() -> EntityId {
        EntityId::new("visit-1").unwrap()
    }

    fn visit_fields(status: &str) -> Value {
        json!({
            "scheduledStart": format_timestamp(at(10, 0)),
            "scheduledEnd": format_timestamp(at(11, 0)),
            "status": status,
        })
    }

    fn snapshot(fields: Value, update_time: DateTime<Utc>) -> ChangeEvent {
        ChangeEvent {
            collection: Collection::visits(),
            changes: vec![DocumentChange::Upsert(RemoteDocument {
                id: "visit-1".to_string(),
                fields,
                update_time: Some(update_time),
            })],
            metadata: SnapshotMetadata::confirmed(),
        }
    }

    fn status_of(reconciler: &SyncReconciler) -> Option<String> {
        reconciler
            .entity(&Collection::visits(), &visit_id())
            .and_then(|entity| entity.str_field("status").map(str::to_string))
    }

    #[test]
    fn test_echo_never_changes_the_view() {
        let reconciler = setup();
        let (receiver, _) = reconciler.register(&Query::collection(Collection::visits()));
        let mut echo = snapshot(visit_fields("in_progress"), at(10, 5));
        echo.metadata = SnapshotMetadata::local_echo();

        assert_eq!(reconciler.apply_event(echo), EventOutcome::Suppressed);
        assert!(receiver.borrow().is_empty());
        assert!(!receiver.has_changed().unwrap());
    }

    #[test]
    fn test_pending_update_overlays_confirmed_snapshot() {
        let reconciler = setup();
        reconciler.apply_event(snapshot(visit_fields("scheduled"), at(9, 0)));

        let operation = reconciler.enqueue(
            &Collection::visits(),
            &visit_id(),
            Change::Update(Visit::check_in_patch()),
        );
        let entity = reconciler.entity(&Collection::visits(), &visit_id()).unwrap();
        assert_eq!(entity.sync_state, SyncState::PendingWrite(operation));
        assert_eq!(entity.str_field("status"), Some("in_progress"));
        assert!(entity.is_awaiting_server("actualStart"));
    }

    #[test]
    fn test_stale_snapshot_is_ignored() {
        let reconciler = setup();
        reconciler.apply_event(snapshot(visit_fields("completed"), at(10, 30)));
        let outcome = reconciler.apply_event(snapshot(visit_fields("scheduled"), at(10, 0)));

        assert_eq!(
            outcome,
            EventOutcome::Applied {
                applied: 0,
                stale: 1,
                malformed: 0
            }
        );
        assert_eq!(status_of(&reconciler).as_deref(), Some("completed"));
    }

    #[test]
    fn test_malformed_document_does_not_block_others() {
        let reconciler = setup();
        let event = ChangeEvent {
            collection: Collection::visits(),
            changes: vec![
                DocumentChange::Upsert(RemoteDocument {
                    id: "broken".to_string(),
                    fields: json!({ "status": "scheduled" }),
                    update_time: Some(at(9, 0)),
                }),
                DocumentChange::Upsert(RemoteDocument {
                    id: "visit-1".to_string(),
                    fields: visit_fields("scheduled"),
                    update_time: Some(at(9, 0)),
                }),
            ],
            metadata: SnapshotMetadata::confirmed(),
        };

        let outcome = reconciler.apply_event(event);
        assert_eq!(
            outcome,
            EventOutcome::Applied {
                applied: 1,
                stale: 0,
                malformed: 1
            }
        );
        assert_eq!(
            reconciler
                .view(&Query::collection(Collection::visits()))
                .len(),
            1
        );
    }

    #[test]
    fn test_overlapping_remote_change_is_recorded_as_conflict() {
        let reconciler = setup();
        reconciler.apply_event(snapshot(visit_fields("scheduled"), at(9, 0)));
        let operation = reconciler.enqueue(
            &Collection::visits(),
            &visit_id(),
            Change::Update(Patch::new().set("status", "in_progress")),
        );

        reconciler.apply_event(snapshot(visit_fields("completed"), at(9, 30)));

        let conflicts = reconciler.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].operation_id, operation);
        assert_eq!(conflicts[0].fields, vec!["status".to_string()]);
        assert_eq!(conflicts[0].strategy, LAST_WRITER_WINS);
        let entity = reconciler.entity(&Collection::visits(), &visit_id()).unwrap();
        assert_eq!(entity.sync_state, SyncState::Conflicted);
        assert_eq!(entity.str_field("status"), Some("in_progress"));

        let ack = Ack {
            update_time: Some(at(9, 31)),
            server_timestamps: BTreeMap::new(),
        };
        assert!(reconciler.apply_ack(operation, &ack));
        let entity = reconciler.entity(&Collection::visits(), &visit_id()).unwrap();
        assert_eq!(entity.sync_state, SyncState::Clean);
        assert_eq!(entity.str_field("status"), Some("in_progress"));
    }

    #[test]
    fn test_own_confirmed_write_is_not_a_conflict() {
        let reconciler = setup();
        reconciler.apply_event(snapshot(visit_fields("scheduled"), at(9, 0)));
        reconciler.enqueue(
            &Collection::visits(),
            &visit_id(),
            Change::Update(Patch::new().set("status", "in_progress")),
        );
        reconciler.apply_event(snapshot(visit_fields("in_progress"), at(9, 30)));

        assert!(reconciler.conflicts().is_empty());
    }

    #[test]
    fn test_ack_resolves_server_timestamp_and_drains() {
        let reconciler = setup();
        reconciler.apply_event(snapshot(visit_fields("scheduled"), at(9, 0)));
        let operation = reconciler.enqueue(
            &Collection::visits(),
            &visit_id(),
            Change::Update(Visit::check_in_patch()),
        );

        let ack = Ack {
            update_time: Some(at(10, 10)),
            server_timestamps: BTreeMap::from([("actualStart".to_string(), at(10, 10))]),
        };
        reconciler.apply_ack(operation, &ack);

        let entity = reconciler.entity(&Collection::visits(), &visit_id()).unwrap();
        assert!(entity.is_clean());
        assert_eq!(entity.timestamp_field("actualStart").unwrap(), Some(at(10, 10)));
        assert!(lock(reconciler.log()).is_empty());
        assert!(!reconciler.apply_ack(operation, &ack));
    }

    #[test]
    fn test_ack_older_than_cached_snapshot_keeps_snapshot() {
        let reconciler = setup();
        reconciler.apply_event(snapshot(visit_fields("scheduled"), at(9, 0)));
        let operation = reconciler.enqueue(
            &Collection::visits(),
            &visit_id(),
            Change::Update(Patch::new().set("status", "in_progress")),
        );
        reconciler.apply_event(snapshot(visit_fields("completed"), at(9, 0) + Duration::hours(1)));

        reconciler.apply_ack(
            operation,
            &Ack {
                update_time: Some(at(9, 30)),
                server_timestamps: BTreeMap::new(),
            },
        );
        assert_eq!(status_of(&reconciler).as_deref(), Some("completed"));
    }

    #[test]
    fn test_delete_ack_without_server_time_removes_document() {
        let reconciler = setup();
        // Snapshot stamped by a server clock running ahead of this machine
        let ahead = Utc::now() + Duration::days(1);
        reconciler.apply_event(snapshot(visit_fields("scheduled"), ahead));
        let operation = reconciler.enqueue(&Collection::visits(), &visit_id(), Change::Delete);
        assert!(reconciler.entity(&Collection::visits(), &visit_id()).is_none());

        let ack = Ack {
            update_time: None,
            server_timestamps: BTreeMap::new(),
        };
        assert!(reconciler.apply_ack(operation, &ack));
        assert!(reconciler.entity(&Collection::visits(), &visit_id()).is_none());
        assert!(lock(reconciler.log()).is_empty());
    }

    #[test]
    fn test_complete_refresh_drops_missing_documents() {
        let reconciler = setup();
        reconciler.apply_event(snapshot(visit_fields("scheduled"), at(9, 0)));
        let query = Query::collection(Collection::visits());

        assert_eq!(reconciler.apply_refresh(&query, Vec::new(), false), 0);
        assert_eq!(reconciler.view(&query).len(), 1);

        reconciler.apply_refresh(&query, Vec::new(), true);
        assert!(reconciler.view(&query).is_empty());
    }

    #[test]
    fn test_enqueue_checked_rejects_without_enqueueing() {
        let reconciler = setup();
        let result: std::result::Result<OperationId, &str> = reconciler.enqueue_checked(
            &Collection::visits(),
            &visit_id(),
            |entity| entity.map(|_| Change::Delete).ok_or("missing"),
        );
        assert_eq!(result, Err("missing"));
        assert!(lock(reconciler.log()).is_empty());
    }

    #[tokio::test]
    async fn test_cache_survives_restore() {
        let kv = crate::db::MemoryKvStore::new();
        let reconciler = setup();
        reconciler.apply_event(snapshot(visit_fields("scheduled"), at(9, 0)));
        let (_, cache) = reconciler.encode_state().unwrap();
        kv.put(keys::ENTITY_CACHE, &cache).await.unwrap();

        let log = Arc::new(Mutex::new(PendingOperationLog::new()));
        let restored = SyncReconciler::restore(log, &kv).await.unwrap();
        assert_eq!(status_of(&restored).as_deref(), Some("scheduled"));
    }
}
