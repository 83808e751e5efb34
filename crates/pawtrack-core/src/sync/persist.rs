//! Writes the pending log and entity cache to the key-value store

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::SyncReconciler;
use crate::db::{keys, KvStore};
use crate::error::Result;
use crate::util::format_timestamp;

pub(crate) struct StatePersister {
    reconciler: Arc<SyncReconciler>,
    kv: Arc<dyn KvStore>,
    /// Serializes writers so an older encoding never lands after a newer one
    gate: Mutex<()>,
}

impl StatePersister {
    pub(crate) fn new(reconciler: Arc<SyncReconciler>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            reconciler,
            kv,
            gate: Mutex::new(()),
        }
    }

    /// Encode the current state and write both blobs in one commit
    pub(crate) async fn persist(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        let (log, cache) = self.reconciler.encode_state()?;
        self.kv
            .put_many(&[
                (keys::PENDING_OPERATIONS, log.as_str()),
                (keys::ENTITY_CACHE, cache.as_str()),
            ])
            .await
    }

    pub(crate) async fn persist_quietly(&self) {
        if let Err(error) = self.persist().await {
            tracing::warn!("Failed to persist sync state: {error}");
        }
    }

    pub(crate) async fn record_sync_time(&self) {
        let _gate = self.gate.lock().await;
        if let Err(error) = self
            .kv
            .put(keys::LAST_SYNC_AT, &format_timestamp(Utc::now()))
            .await
        {
            tracing::warn!("Failed to record last sync time: {error}");
        }
    }
}

/// Persist whenever a request arrives.
///
/// The channel holds one request, so mutations issued while a write is
/// running collapse into a single follow-up write.
pub(crate) fn spawn_writer(persister: Arc<StatePersister>) -> (mpsc::Sender<()>, JoinHandle<()>) {
    let (requests, mut pending) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        while pending.recv().await.is_some() {
            persister.persist_quietly().await;
        }
        tracing::debug!("State writer stopped");
    });
    (requests, handle)
}
