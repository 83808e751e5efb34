//! Contract with the authoritative remote store, plus adapters.
//!
//! The engine only depends on [`RemoteStore`]. Change-feed events arrive as
//! raw, unvalidated documents; the reconciler owns validation so that one
//! malformed document cannot break a feed for everything else.

mod http;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WriteError;
use crate::models::{Collection, EntityId, OperationId, OperationKind, Patch, PendingOperation, Query};

pub use http::HttpRemoteStore;
pub use memory::InMemoryRemoteStore;

/// Stream of change events for one query
pub type ChangeFeed = BoxStream<'static, ChangeEvent>;

/// Provenance reported by the transport for a change event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Served from the transport's local cache rather than the server
    pub from_cache: bool,
    /// Reflects a local write the server has not acknowledged yet
    pub has_unconfirmed_local_writes: bool,
}

impl SnapshotMetadata {
    pub const fn confirmed() -> Self {
        Self {
            from_cache: false,
            has_unconfirmed_local_writes: false,
        }
    }

    pub const fn local_echo() -> Self {
        Self {
            from_cache: true,
            has_unconfirmed_local_writes: true,
        }
    }
}

/// A document as delivered by the remote store, not yet validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    /// Must be a JSON object
    pub fields: Value,
    /// Server time of the last write; required for confirmed snapshots
    #[serde(default)]
    pub update_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentChange {
    Upsert(RemoteDocument),
    Removed {
        id: String,
        #[serde(default)]
        update_time: Option<DateTime<Utc>>,
    },
}

impl DocumentChange {
    pub fn document_id(&self) -> &str {
        match self {
            Self::Upsert(document) => &document.id,
            Self::Removed { id, .. } => id,
        }
    }
}

/// One delivery from a change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub changes: Vec<DocumentChange>,
    pub metadata: SnapshotMetadata,
}

/// A mutation sent to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub operation_id: OperationId,
    pub collection: Collection,
    pub entity_id: EntityId,
    pub kind: OperationKind,
    pub payload: Patch,
}

impl From<&PendingOperation> for WriteRequest {
    fn from(operation: &PendingOperation) -> Self {
        Self {
            operation_id: operation.id,
            collection: operation.collection.clone(),
            entity_id: operation.entity_id.clone(),
            kind: operation.kind,
            payload: operation.payload.clone(),
        }
    }
}

/// Acknowledgment of a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Server time the write was recorded at, when the server reported one
    #[serde(default)]
    pub update_time: Option<DateTime<Utc>>,
    /// Values the server assigned to server-timestamp fields
    #[serde(default)]
    pub server_timestamps: BTreeMap<String, DateTime<Utc>>,
}

/// The authoritative key-document store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Subscribe to changes for a query
    fn change_feed(&self, query: &Query) -> ChangeFeed;

    /// Create, update, or delete one document
    async fn write(&self, request: WriteRequest) -> Result<Ack, WriteError>;

    /// Fetch up to `page_size` confirmed documents matching a query
    async fn fetch(&self, query: &Query, page_size: usize)
        -> Result<Vec<RemoteDocument>, WriteError>;
}

/// Remote store used when no remote is configured.
///
/// Every call fails as transient, so mutations stay queued.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedRemote;

#[async_trait]
impl RemoteStore for DisconnectedRemote {
    fn change_feed(&self, _query: &Query) -> ChangeFeed {
        Box::pin(futures::stream::empty())
    }

    async fn write(&self, _request: WriteRequest) -> Result<Ack, WriteError> {
        Err(WriteError::transient("no remote store configured"))
    }

    async fn fetch(
        &self,
        _query: &Query,
        _page_size: usize,
    ) -> Result<Vec<RemoteDocument>, WriteError> {
        Err(WriteError::transient("no remote store configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_change_wire_format() {
        let raw = json!([
            { "type": "upsert", "id": "v1", "fields": { "status": "scheduled" }, "update_time": "2024-05-01T10:00:00Z" },
            { "type": "removed", "id": "v2" }
        ]);
        let changes: Vec<DocumentChange> = serde_json::from_value(raw).unwrap();
        assert_eq!(changes[0].document_id(), "v1");
        assert!(matches!(&changes[1], DocumentChange::Removed { id, update_time: None } if id == "v2"));
    }

    #[tokio::test]
    async fn disconnected_remote_fails_transiently() {
        let request = WriteRequest {
            operation_id: OperationId::new(),
            collection: Collection::visits(),
            entity_id: EntityId::new("v1").unwrap(),
            kind: OperationKind::Delete,
            payload: Patch::new(),
        };
        let error = DisconnectedRemote.write(request).await.unwrap_err();
        assert!(error.is_retryable());
    }
}
