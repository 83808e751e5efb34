//! Shared cross-platform state types.

use serde::{Deserialize, Serialize};

/// Reachability of the remote store as reported by the connectivity monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Reachable,
    Unreachable,
}

impl ConnState {
    pub const fn is_reachable(self) -> bool {
        matches!(self, Self::Reachable)
    }
}

/// Unified sync status surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Remote store unreachable; mutations are queued locally.
    Offline,
    /// A dispatch pass is running.
    Syncing,
    /// Every local mutation has been confirmed.
    Synced,
    /// At least one mutation was rejected and needs user action.
    Error,
}
