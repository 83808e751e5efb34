//! Sync conflict model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityId, OperationId};

/// Strategy name recorded for every resolution
pub const LAST_WRITER_WINS: &str = "lww";

/// Recorded sync conflict resolved by strategy (e.g., LWW)
///
/// Raised when a confirmed snapshot changes a field that an unconfirmed
/// local operation also writes. The local operation keeps winning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict sequence number, local to this process
    pub id: u64,
    /// Entity involved in the conflict
    pub entity_id: EntityId,
    /// Local operation that overrode the incoming value
    pub operation_id: OperationId,
    /// Fields both sides wrote
    pub fields: Vec<String>,
    /// When the local operation was issued
    pub local_issued_at: DateTime<Utc>,
    /// Server time of the incoming snapshot
    pub incoming_updated_at: DateTime<Utc>,
    /// Resolution timestamp
    pub resolved_at: DateTime<Utc>,
    /// Resolution strategy name
    pub strategy: String,
}
