//! Offline-first synchronization.
//!
//! Mutations land in the [`PendingOperationLog`] first and are published
//! immediately through the [`SyncReconciler`], which overlays them on the
//! last authoritative snapshot. A single dispatcher task replays the log
//! against the [`RemoteStore`](crate::remote::RemoteStore) in issue order.

mod connectivity;
mod dispatcher;
mod engine;
mod log;
mod persist;
mod reconciler;

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use connectivity::{ConnectivityMonitor, ManualConnectivity};
pub use dispatcher::{FlushReport, SyncEvent};
pub use engine::{ReconciledViewStream, SyncEngine};
pub use log::PendingOperationLog;
pub use reconciler::{EventOutcome, ReconciledView, SyncReconciler};

/// The pending log, shared between the engine, reconciler and dispatcher
pub type SharedLog = Arc<Mutex<PendingOperationLog>>;

/// Version written into every persisted blob
const BLOB_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    schema_version: u32,
    payload: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    payload: T,
}

#[derive(Deserialize)]
struct VersionHeader {
    schema_version: u32,
}

pub(crate) fn encode_blob<T: Serialize>(payload: &T) -> Result<String> {
    Ok(serde_json::to_string(&EnvelopeRef {
        schema_version: BLOB_SCHEMA_VERSION,
        payload,
    })?)
}

pub(crate) fn decode_blob<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let header: VersionHeader = serde_json::from_str(raw)?;
    if header.schema_version != BLOB_SCHEMA_VERSION {
        return Err(Error::InvalidInput(format!(
            "Unsupported blob schema version {} (expected {BLOB_SCHEMA_VERSION})",
            header.schema_version
        )));
    }
    let envelope: Envelope<T> = serde_json::from_str(raw)?;
    Ok(envelope.payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_envelope_rejects_unknown_versions() {
        let encoded = encode_blob(&vec![1, 2, 3]).unwrap();
        assert_eq!(decode_blob::<Vec<i32>>(&encoded).unwrap(), vec![1, 2, 3]);

        let future = r#"{ "schema_version": 99, "payload": [] }"#;
        let error = decode_blob::<Vec<i32>>(future).unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }
}
