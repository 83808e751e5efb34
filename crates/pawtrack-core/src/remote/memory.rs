//! In-process authoritative store.
//!
//! Behaves like a document database with a latency-compensated client SDK:
//! every write is first echoed to subscribers flagged as carrying an
//! unconfirmed local write, then applied and delivered again as a confirmed
//! snapshot. Tests can pause writes between the two steps, inject failures,
//! and write documents as another client would.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::{
    Ack, ChangeEvent, ChangeFeed, DocumentChange, RemoteDocument, RemoteStore, SnapshotMetadata,
    WriteRequest,
};
use crate::error::WriteError;
use crate::models::{Collection, Fields, OperationKind, Query};
use crate::util::lock;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredDocument {
    fields: Fields,
    update_time: DateTime<Utc>,
}

struct Subscriber {
    collection: Collection,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<Collection, BTreeMap<String, StoredDocument>>,
    subscribers: Vec<Subscriber>,
    writes: Vec<WriteRequest>,
    failures: VecDeque<WriteError>,
    last_update: Option<DateTime<Utc>>,
}

impl MemoryState {
    fn broadcast(&mut self, event: &ChangeEvent) {
        self.subscribers.retain(|subscriber| {
            subscriber.collection != event.collection || subscriber.sender.send(event.clone()).is_ok()
        });
    }

    /// Server time for the next write, strictly increasing
    fn next_update_time(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self.last_update {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_update = Some(next);
        next
    }

    fn document(&self, collection: &Collection, id: &str) -> Option<&StoredDocument> {
        self.documents.get(collection).and_then(|docs| docs.get(id))
    }

    /// What the writer's local cache would show before the server answers
    fn local_echo(&self, request: &WriteRequest) -> ChangeEvent {
        let id = request.entity_id.to_string();
        let change = if request.kind == OperationKind::Delete {
            DocumentChange::Removed {
                id,
                update_time: None,
            }
        } else {
            let mut fields = self
                .document(&request.collection, &id)
                .map(|doc| doc.fields.clone())
                .unwrap_or_default();
            request
                .payload
                .apply(&mut fields, &mut BTreeSet::new(), None);
            DocumentChange::Upsert(RemoteDocument {
                id,
                fields: Value::Object(fields),
                update_time: None,
            })
        };
        ChangeEvent {
            collection: request.collection.clone(),
            changes: vec![change],
            metadata: SnapshotMetadata::local_echo(),
        }
    }

    fn commit(&mut self, request: &WriteRequest, now: DateTime<Utc>) -> Result<Ack, WriteError> {
        let id = request.entity_id.to_string();
        let exists = self.document(&request.collection, &id).is_some();
        match request.kind {
            OperationKind::Create if exists => {
                return Err(WriteError::rejected(
                    "already-exists",
                    format!("{}/{id} already exists", request.collection),
                ));
            }
            OperationKind::Update if !exists => {
                return Err(WriteError::rejected(
                    "not-found",
                    format!("{}/{id} does not exist", request.collection),
                ));
            }
            _ => {}
        }

        let update_time = self.next_update_time(now);
        let server_timestamps: BTreeMap<String, DateTime<Utc>> = request
            .payload
            .server_timestamp_fields()
            .into_iter()
            .map(|name| (name, update_time))
            .collect();

        let change = if request.kind == OperationKind::Delete {
            if let Some(docs) = self.documents.get_mut(&request.collection) {
                docs.remove(&id);
            }
            DocumentChange::Removed {
                id,
                update_time: Some(update_time),
            }
        } else {
            let docs = self
                .documents
                .entry(request.collection.clone())
                .or_default();
            let document = docs.entry(id.clone()).or_insert_with(|| StoredDocument {
                fields: Fields::new(),
                update_time,
            });
            request.payload.apply(
                &mut document.fields,
                &mut BTreeSet::new(),
                Some(&server_timestamps),
            );
            document.update_time = update_time;
            DocumentChange::Upsert(RemoteDocument {
                id,
                fields: Value::Object(document.fields.clone()),
                update_time: Some(update_time),
            })
        };

        self.broadcast(&ChangeEvent {
            collection: request.collection.clone(),
            changes: vec![change],
            metadata: SnapshotMetadata::confirmed(),
        });

        Ok(Ack {
            update_time: Some(update_time),
            server_timestamps,
        })
    }
}

/// In-memory authoritative store for tests, demos, and offline sessions
#[derive(Clone)]
pub struct InMemoryRemoteStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Clock,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::with_clock(Utc::now)
    }

    /// Use a custom source of server time
    pub fn with_clock(clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock: Arc::new(clock),
            paused: Arc::new(paused),
        }
    }

    /// Hold every write after its local echo until [`Self::resume_writes`]
    pub fn pause_writes(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.paused.send_replace(false);
    }

    /// Make the next write fail with `error` before reaching the store
    pub fn fail_next_write(&self, error: WriteError) {
        lock(&self.state).failures.push_back(error);
    }

    /// Every write received, in arrival order (including failed ones)
    pub fn writes(&self) -> Vec<WriteRequest> {
        lock(&self.state).writes.clone()
    }

    /// Current authoritative fields of one document
    pub fn document(&self, collection: &Collection, id: &str) -> Option<Fields> {
        lock(&self.state)
            .document(collection, id)
            .map(|doc| doc.fields.clone())
    }

    /// Ids of every document in a collection
    pub fn document_ids(&self, collection: &Collection) -> Vec<String> {
        lock(&self.state)
            .documents
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Write a document the way another client would
    pub fn put_document(&self, collection: &Collection, id: &str, fields: Fields) -> DateTime<Utc> {
        let mut state = lock(&self.state);
        let update_time = state.next_update_time((self.clock)());
        state
            .documents
            .entry(collection.clone())
            .or_default()
            .insert(
                id.to_string(),
                StoredDocument {
                    fields: fields.clone(),
                    update_time,
                },
            );
        state.broadcast(&ChangeEvent {
            collection: collection.clone(),
            changes: vec![DocumentChange::Upsert(RemoteDocument {
                id: id.to_string(),
                fields: Value::Object(fields),
                update_time: Some(update_time),
            })],
            metadata: SnapshotMetadata::confirmed(),
        });
        update_time
    }

    /// Deliver an arbitrary event to subscribers of its collection
    pub fn emit(&self, event: ChangeEvent) {
        lock(&self.state).broadcast(&event);
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = lock(&self.state);
        state
            .subscribers
            .retain(|subscriber| !subscriber.sender.is_closed());
        state.subscribers.len()
    }

    fn matching_documents(state: &MemoryState, query: &Query, limit: usize) -> Vec<RemoteDocument> {
        state
            .documents
            .get(&query.collection)
            .into_iter()
            .flat_map(|docs| docs.iter())
            .filter(|(_, doc)| query.matches_fields(&doc.fields))
            .take(limit)
            .map(|(id, doc)| RemoteDocument {
                id: id.clone(),
                fields: Value::Object(doc.fields.clone()),
                update_time: Some(doc.update_time),
            })
            .collect()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn change_feed(&self, query: &Query) -> ChangeFeed {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = lock(&self.state);
            let initial = Self::matching_documents(&state, query, usize::MAX);
            // Receiver is alive, so the initial snapshot cannot fail to send.
            let _ = sender.send(ChangeEvent {
                collection: query.collection.clone(),
                changes: initial.into_iter().map(DocumentChange::Upsert).collect(),
                metadata: SnapshotMetadata::confirmed(),
            });
            state.subscribers.push(Subscriber {
                collection: query.collection.clone(),
                sender,
            });
        }

        futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        })
        .boxed()
    }

    async fn write(&self, request: WriteRequest) -> Result<Ack, WriteError> {
        {
            let mut state = lock(&self.state);
            state.writes.push(request.clone());
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            let echo = state.local_echo(&request);
            state.broadcast(&echo);
        }

        let mut paused = self.paused.subscribe();
        // The sender lives in `self`, so this only returns once resumed.
        let _ = paused.wait_for(|paused| !*paused).await;

        let now = (self.clock)();
        lock(&self.state).commit(&request, now)
    }

    async fn fetch(
        &self,
        query: &Query,
        page_size: usize,
    ) -> Result<Vec<RemoteDocument>, WriteError> {
        let limit = query.limit.map_or(page_size, |limit| limit.min(page_size));
        Ok(Self::matching_documents(&lock(&self.state), query, limit))
    }
}
