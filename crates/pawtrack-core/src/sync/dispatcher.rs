//! Background task that replays the pending log against the remote store.
//!
//! There is exactly one dispatcher per engine and it sends one write at a
//! time, oldest first. That gives per-entity FIFO and exact issue-order
//! replay after reconnecting; an entity whose oldest operation was
//! rejected is skipped until the user retries or discards it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::persist::StatePersister;
use super::{ConnectivityMonitor, SyncReconciler};
use crate::error::{Result, WriteError};
use crate::models::{Collection, DispatchFailure, EntityId, OperationId, PendingOperation};
use crate::remote::{RemoteStore, WriteRequest};
use crate::state::{ConnState, SyncStatus};
use crate::util::lock;

/// Notifications about dispatch progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The remote store acknowledged an operation
    Confirmed {
        operation_id: OperationId,
        entity_id: EntityId,
    },
    /// A write failed; rejected operations wait for `retry` or `discard`
    Failed {
        operation_id: OperationId,
        entity_id: EntityId,
        error: WriteError,
    },
    /// Replay after reconnecting finished
    Replayed { confirmed: usize, remaining: usize },
    /// Registered queries were re-fetched
    Refreshed { queries: usize, documents: usize },
}

/// Outcome of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub confirmed: usize,
    pub rejected: usize,
    /// Operations still waiting, including ones behind a transient failure
    pub remaining: usize,
    /// The pass was skipped because the remote store is unreachable
    pub offline: bool,
}

pub(crate) enum Command {
    Kick,
    Flush(oneshot::Sender<FlushReport>),
    Connectivity(ConnState),
    Refresh(oneshot::Sender<usize>),
    Persist(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

pub(crate) struct Dispatcher {
    pub(crate) reconciler: Arc<SyncReconciler>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) connectivity: Arc<dyn ConnectivityMonitor>,
    pub(crate) persister: Arc<StatePersister>,
    pub(crate) status: watch::Sender<SyncStatus>,
    pub(crate) events: broadcast::Sender<SyncEvent>,
    pub(crate) refresh_page_size: usize,
    /// Last reachability the dispatcher acted on
    pub(crate) last_seen: ConnState,
    /// Set by a transient failure; kicks wait for a reconnect or explicit flush
    pub(crate) waiting_for_reconnect: bool,
}

impl Dispatcher {
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Kick => {
                    self.observe(self.connectivity.current()).await;
                    if self.last_seen.is_reachable() && !self.waiting_for_reconnect {
                        self.flush_pass().await;
                    }
                    self.persister.persist_quietly().await;
                }
                Command::Flush(reply) => {
                    self.observe(self.connectivity.current()).await;
                    let report = if self.last_seen.is_reachable() {
                        self.waiting_for_reconnect = false;
                        self.flush_pass().await
                    } else {
                        self.offline_report()
                    };
                    self.persister.persist_quietly().await;
                    let _ = reply.send(report);
                }
                Command::Connectivity(state) => {
                    self.observe(state).await;
                }
                Command::Refresh(reply) => {
                    let documents = self.refresh().await;
                    let _ = reply.send(documents);
                }
                Command::Persist(reply) => {
                    let _ = reply.send(self.persister.persist().await);
                }
                Command::Shutdown(reply) => {
                    let _ = reply.send(self.persister.persist().await);
                    break;
                }
            }
        }
        tracing::debug!("Dispatcher stopped");
    }

    /// Track reachability; an unreachable-to-reachable edge triggers replay
    async fn observe(&mut self, state: ConnState) {
        let reconnected = !self.last_seen.is_reachable() && state.is_reachable();
        self.last_seen = state;
        if reconnected {
            self.waiting_for_reconnect = false;
            self.replay().await;
        } else {
            self.update_status();
        }
    }

    async fn replay(&mut self) {
        let drained = lock(self.reconciler.log()).drain_confirmed().len();
        if drained > 0 {
            tracing::debug!(drained, "Drained confirmed operations before replay");
        }

        let report = self.flush_pass().await;
        tracing::info!(
            confirmed = report.confirmed,
            rejected = report.rejected,
            remaining = report.remaining,
            "Replayed pending operations after reconnecting"
        );
        let _ = self.events.send(SyncEvent::Replayed {
            confirmed: report.confirmed,
            remaining: report.remaining,
        });

        if self.last_seen.is_reachable() {
            self.refresh().await;
        }
        self.persister.persist_quietly().await;
    }

    /// Send every dispatchable operation, oldest first.
    ///
    /// Stops at the first transient failure so nothing overtakes it. After
    /// that only a reconnect or an explicit flush starts another pass.
    async fn flush_pass(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        let mut blocked: HashSet<(Collection, EntityId)> = HashSet::new();
        let mut after_seq: Option<u64> = None;

        loop {
            let next = {
                let log = lock(self.reconciler.log());
                let found = log
                    .unconfirmed()
                    .filter(|op| after_seq.is_none_or(|seq| op.seq > seq))
                    .find(|op| {
                        let key = (op.collection.clone(), op.entity_id.clone());
                        if blocked.contains(&key) {
                            return false;
                        }
                        if op.is_terminal_failed() {
                            blocked.insert(key);
                            return false;
                        }
                        true
                    })
                    .cloned();
                found
            };
            let Some(operation) = next else {
                break;
            };
            after_seq = Some(operation.seq);
            self.status.send_replace(SyncStatus::Syncing);

            match self.dispatch(&operation).await {
                Ok(()) => report.confirmed += 1,
                Err(error) if error.is_retryable() => {
                    self.waiting_for_reconnect = true;
                    break;
                }
                Err(_) => {
                    report.rejected += 1;
                    blocked.insert((operation.collection.clone(), operation.entity_id.clone()));
                }
            }
        }

        report.remaining = lock(self.reconciler.log()).unconfirmed_len();
        self.update_status();
        report
    }

    async fn dispatch(&self, operation: &PendingOperation) -> std::result::Result<(), WriteError> {
        lock(self.reconciler.log()).record_attempt(operation.id);
        tracing::debug!(
            operation_id = %operation.id,
            entity_id = %operation.entity_id,
            kind = %operation.kind,
            "Dispatching operation"
        );

        match self.remote.write(WriteRequest::from(operation)).await {
            Ok(ack) => {
                if self.reconciler.apply_ack(operation.id, &ack) {
                    let _ = self.events.send(SyncEvent::Confirmed {
                        operation_id: operation.id,
                        entity_id: operation.entity_id.clone(),
                    });
                }
                Ok(())
            }
            Err(error) => {
                tracing::warn!(
                    operation_id = %operation.id,
                    entity_id = %operation.entity_id,
                    retryable = error.is_retryable(),
                    "Dispatch failed: {error}"
                );
                lock(self.reconciler.log())
                    .record_failure(operation.id, DispatchFailure::from_error(&error, Utc::now()));
                if !error.is_retryable() {
                    self.reconciler.republish();
                }
                let _ = self.events.send(SyncEvent::Failed {
                    operation_id: operation.id,
                    entity_id: operation.entity_id.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Re-fetch every registered query; returns the number of documents applied
    async fn refresh(&self) -> usize {
        let queries = self.reconciler.registered_queries();
        let fetches = queries
            .iter()
            .map(|query| self.remote.fetch(query, self.refresh_page_size));
        let results = join_all(fetches).await;

        let mut documents = 0;
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(page) => {
                    let complete = page.len() < self.refresh_page_size;
                    documents += self.reconciler.apply_refresh(query, page, complete);
                }
                Err(error) => {
                    tracing::warn!(collection = %query.collection, "Refresh failed: {error}");
                }
            }
        }

        if !queries.is_empty() {
            tracing::info!(queries = queries.len(), documents, "Refreshed reconciled views");
            self.persister.record_sync_time().await;
        }
        let _ = self.events.send(SyncEvent::Refreshed {
            queries: queries.len(),
            documents,
        });
        documents
    }

    fn offline_report(&self) -> FlushReport {
        FlushReport {
            remaining: lock(self.reconciler.log()).unconfirmed_len(),
            offline: true,
            ..FlushReport::default()
        }
    }

    fn update_status(&self) {
        let status = {
            let log = lock(self.reconciler.log());
            if !self.last_seen.is_reachable() {
                SyncStatus::Offline
            } else if log.unconfirmed().any(PendingOperation::is_terminal_failed) {
                SyncStatus::Error
            } else if log.unconfirmed_len() == 0 {
                SyncStatus::Synced
            } else {
                SyncStatus::Syncing
            }
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }
}

/// Initial status before the dispatcher has run
pub(crate) fn initial_status(state: ConnState, unconfirmed: usize) -> SyncStatus {
    if !state.is_reachable() {
        SyncStatus::Offline
    } else if unconfirmed == 0 {
        SyncStatus::Synced
    } else {
        SyncStatus::Syncing
    }
}
