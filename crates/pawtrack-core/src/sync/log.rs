//! Ordered log of locally issued, unconfirmed mutations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{decode_blob, encode_blob};
use crate::db::{keys, KvStore};
use crate::error::{Error, Result};
use crate::models::{
    Change, Collection, DispatchFailure, EntityId, OperationId, OperationKind, PendingOperation,
};

/// Queue of mutations the remote store has not confirmed yet.
///
/// Entries stay in issue order. They leave the log only through
/// [`drain_confirmed`](Self::drain_confirmed) after confirmation, or
/// through [`withdraw`](Self::withdraw) once rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingOperationLog {
    entries: Vec<PendingOperation>,
    next_seq: u64,
}

impl PendingOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mutation and return its id.
    ///
    /// A `Create` for an entity that already has an unconfirmed `Create`
    /// returns the existing operation id instead of queueing a second one.
    pub fn enqueue(
        &mut self,
        collection: Collection,
        entity_id: EntityId,
        change: Change,
        issued_at: DateTime<Utc>,
    ) -> OperationId {
        let kind = change.kind();
        if kind == OperationKind::Create {
            if let Some(existing) = self.entries.iter().find(|op| {
                !op.confirmed
                    && op.kind == OperationKind::Create
                    && op.collection == collection
                    && op.entity_id == entity_id
            }) {
                tracing::debug!(
                    entity_id = %entity_id,
                    operation_id = %existing.id,
                    "Create already queued, reusing pending operation"
                );
                return existing.id;
            }
        }

        let operation = PendingOperation {
            id: OperationId::new(),
            seq: self.next_seq,
            entity_id,
            collection,
            kind,
            payload: change.into_payload(),
            issued_at,
            confirmed: false,
            attempts: 0,
            last_failure: None,
        };
        self.next_seq += 1;
        let id = operation.id;
        self.entries.push(operation);
        id
    }

    /// Record the remote store's acknowledgment. Returns false for unknown ids.
    pub fn mark_confirmed(&mut self, id: OperationId) -> bool {
        match self.entries.iter_mut().find(|op| op.id == id) {
            Some(operation) => {
                operation.confirmed = true;
                operation.last_failure = None;
                true
            }
            None => false,
        }
    }

    /// Unconfirmed operations for one entity, in issue order
    pub fn pending_for(&self, entity_id: &EntityId) -> Vec<PendingOperation> {
        self.entries
            .iter()
            .filter(|op| !op.confirmed && op.entity_id == *entity_id)
            .cloned()
            .collect()
    }

    /// Remove and return every confirmed entry
    pub fn drain_confirmed(&mut self) -> Vec<PendingOperation> {
        let (confirmed, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|op| op.confirmed);
        self.entries = pending;
        confirmed
    }

    /// Unconfirmed operations across all entities, in issue order
    pub fn unconfirmed(&self) -> impl Iterator<Item = &PendingOperation> {
        self.entries.iter().filter(|op| !op.confirmed)
    }

    /// Unconfirmed operations for one entity of one collection
    pub fn unconfirmed_for<'a>(
        &'a self,
        collection: &'a Collection,
        entity_id: &'a EntityId,
    ) -> impl Iterator<Item = &'a PendingOperation> + 'a {
        self.unconfirmed()
            .filter(move |op| op.collection == *collection && op.entity_id == *entity_id)
    }

    pub fn get(&self, id: OperationId) -> Option<&PendingOperation> {
        self.entries.iter().find(|op| op.id == id)
    }

    /// Rejected operations waiting for the user
    pub fn failed(&self) -> Vec<PendingOperation> {
        self.entries
            .iter()
            .filter(|op| op.is_terminal_failed())
            .cloned()
            .collect()
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.unconfirmed().count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn record_attempt(&mut self, id: OperationId) {
        if let Some(operation) = self.entries.iter_mut().find(|op| op.id == id) {
            operation.attempts = operation.attempts.saturating_add(1);
        }
    }

    pub(crate) fn record_failure(&mut self, id: OperationId, failure: DispatchFailure) {
        if let Some(operation) = self.entries.iter_mut().find(|op| op.id == id) {
            operation.last_failure = Some(failure);
        }
    }

    /// Make a rejected operation eligible for dispatch again
    pub fn clear_failure(&mut self, id: OperationId) -> Result<()> {
        let operation = self
            .entries
            .iter_mut()
            .find(|op| op.id == id && !op.confirmed)
            .ok_or_else(|| Error::NotFound(format!("Pending operation {id}")))?;
        operation.last_failure = None;
        Ok(())
    }

    /// Remove a rejected operation for good
    pub fn withdraw(&mut self, id: OperationId) -> Result<PendingOperation> {
        let index = self
            .entries
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| Error::NotFound(format!("Pending operation {id}")))?;
        if !self.entries[index].is_terminal_failed() {
            return Err(Error::InvalidInput(format!(
                "Operation {id} has not been rejected; only rejected operations can be discarded"
            )));
        }
        Ok(self.entries.remove(index))
    }

    pub fn encode(&self) -> Result<String> {
        encode_blob(self)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut log: Self = decode_blob(raw)?;
        log.entries.sort_by_key(|op| op.seq);
        let after_last = log.entries.last().map_or(0, |op| op.seq + 1);
        log.next_seq = log.next_seq.max(after_last);
        Ok(log)
    }

    /// Write the log to durable storage
    pub async fn persist(&self, kv: &dyn KvStore) -> Result<()> {
        kv.put(keys::PENDING_OPERATIONS, &self.encode()?).await
    }

    /// Load the log from durable storage; empty when nothing was saved
    pub async fn restore(kv: &dyn KvStore) -> Result<Self> {
        match kv.get(keys::PENDING_OPERATIONS).await? {
            Some(raw) => Self::decode(&raw),
            None => Ok(Self::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryKvStore;
    use crate::error::WriteError;
    use crate::models::Patch;
    use pretty_assertions::assert_eq;

    fn visit(id: &str) -> EntityId {
        EntityId::new(id).unwrap()
    }

    fn enqueue(log: &mut PendingOperationLog, id: &str, change: Change) -> OperationId {
        log.enqueue(Collection::visits(), visit(id), change, Utc::now())
    }

    fn reject(log: &mut PendingOperationLog, id: OperationId) {
        let error = WriteError::rejected("permission-denied", "nope");
        log.record_failure(id, DispatchFailure::from_error(&error, Utc::now()));
    }

    #[test]
    fn test_duplicate_create_returns_existing_id() {
        let mut log = PendingOperationLog::new();
        let first = enqueue(&mut log, "v1", Change::Create(Patch::new()));
        let second = enqueue(&mut log, "v1", Change::Create(Patch::new()));

        assert_eq!(first, second);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_create_after_confirmation_is_queued() {
        let mut log = PendingOperationLog::new();
        let first = enqueue(&mut log, "v1", Change::Create(Patch::new()));
        log.mark_confirmed(first);
        let second = enqueue(&mut log, "v1", Change::Create(Patch::new()));

        assert_ne!(first, second);
    }

    #[test]
    fn test_pending_for_keeps_issue_order() {
        let mut log = PendingOperationLog::new();
        let a = enqueue(&mut log, "v1", Change::Create(Patch::new()));
        enqueue(&mut log, "v2", Change::Delete);
        let b = enqueue(&mut log, "v1", Change::Update(Patch::new().set("notes", "x")));

        let ids: Vec<_> = log.pending_for(&visit("v1")).iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_drain_confirmed_removes_only_confirmed() {
        let mut log = PendingOperationLog::new();
        let a = enqueue(&mut log, "v1", Change::Create(Patch::new()));
        let b = enqueue(&mut log, "v1", Change::Delete);
        assert!(log.mark_confirmed(a));
        assert!(!log.mark_confirmed(OperationId::new()));

        let drained = log.drain_confirmed();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, a);
        assert_eq!(log.unconfirmed().map(|op| op.id).collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn test_withdraw_requires_rejection() {
        let mut log = PendingOperationLog::new();
        let id = enqueue(&mut log, "v1", Change::Delete);

        assert!(log.withdraw(id).is_err());
        reject(&mut log, id);
        assert_eq!(log.failed().len(), 1);
        assert_eq!(log.withdraw(id).unwrap().id, id);
        assert!(log.is_empty());
    }

    #[test]
    fn test_clear_failure_makes_operation_dispatchable() {
        let mut log = PendingOperationLog::new();
        let id = enqueue(&mut log, "v1", Change::Delete);
        reject(&mut log, id);
        assert!(!log.get(id).unwrap().is_dispatchable());

        log.clear_failure(id).unwrap();
        assert!(log.get(id).unwrap().is_dispatchable());
        assert!(log.clear_failure(OperationId::new()).is_err());
    }

    #[test]
    fn test_decode_continues_sequence() {
        let mut log = PendingOperationLog::new();
        enqueue(&mut log, "v1", Change::Create(Patch::new()));
        enqueue(&mut log, "v1", Change::Delete);

        let mut restored = PendingOperationLog::decode(&log.encode().unwrap()).unwrap();
        assert_eq!(restored, log);
        let next = enqueue(&mut restored, "v2", Change::Delete);
        assert_eq!(restored.get(next).unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let kv = MemoryKvStore::new();
        assert!(PendingOperationLog::restore(&kv).await.unwrap().is_empty());

        let mut log = PendingOperationLog::new();
        let id = enqueue(&mut log, "v1", Change::Update(Patch::new().clear("notes")));
        log.record_attempt(id);
        log.persist(&kv).await.unwrap();

        let restored = PendingOperationLog::restore(&kv).await.unwrap();
        assert_eq!(restored.get(id).unwrap().attempts, 1);
        assert_eq!(restored, log);
    }
}
