//! Pending operation model

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Collection, EntityId, Fields};
use crate::error::{Error, Result, WriteError};
use crate::util::format_timestamp;

/// Locally generated operation identifier, using UUID v7 (time-sortable).
///
/// Stable across retries; remote stores may use it as an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// What a mutation does to one top-level field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum FieldChange {
    Set(Value),
    Clear,
    /// Filled in with the time the remote store records the write.
    ServerTimestamp,
}

/// Field-level payload of a mutation.
///
/// Keys are top-level field names only; nested data is written as a whole
/// nested value. Dotted paths are rejected by [`Patch::validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(BTreeMap<String, FieldChange>);

impl Patch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a patch that sets every field of a JSON object
    pub fn from_fields(fields: Fields) -> Self {
        Self(
            fields
                .into_iter()
                .map(|(name, value)| (name, FieldChange::Set(value)))
                .collect(),
        )
    }

    #[must_use]
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), FieldChange::Set(value.into()));
        self
    }

    #[must_use]
    pub fn clear(mut self, name: impl Into<String>) -> Self {
        self.0.insert(name.into(), FieldChange::Clear);
        self
    }

    #[must_use]
    pub fn server_timestamp(mut self, name: impl Into<String>) -> Self {
        self.0.insert(name.into(), FieldChange::ServerTimestamp);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldChange> {
        self.0.get(name)
    }

    pub fn touches(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldChange)> {
        self.0.iter()
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.0.keys() {
            if name.trim().is_empty() {
                return Err(Error::InvalidInput("Field name must not be empty".into()));
            }
            if name.contains('.') {
                return Err(Error::InvalidInput(format!(
                    "Field '{name}' looks like a dotted path; write the nested value whole"
                )));
            }
        }
        Ok(())
    }

    /// Names of fields the server must timestamp
    pub fn server_timestamp_fields(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, change)| matches!(change, FieldChange::ServerTimestamp))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Split into `(set, cleared, server-timestamped)` for wire formats
    pub fn split(&self) -> (Fields, Vec<String>, Vec<String>) {
        let mut set = Fields::new();
        let mut cleared = Vec::new();
        let mut stamped = Vec::new();
        for (name, change) in &self.0 {
            match change {
                FieldChange::Set(value) => {
                    set.insert(name.clone(), value.clone());
                }
                FieldChange::Clear => cleared.push(name.clone()),
                FieldChange::ServerTimestamp => stamped.push(name.clone()),
            }
        }
        (set, cleared, stamped)
    }

    /// Apply this patch to a field map.
    ///
    /// Server timestamps are written only when `resolved` carries a value
    /// for the field; otherwise the field keeps its current value and is
    /// added to `awaiting`.
    pub fn apply(
        &self,
        fields: &mut Fields,
        awaiting: &mut BTreeSet<String>,
        resolved: Option<&BTreeMap<String, DateTime<Utc>>>,
    ) {
        for (name, change) in &self.0 {
            match change {
                FieldChange::Set(value) => {
                    fields.insert(name.clone(), value.clone());
                    awaiting.remove(name);
                }
                FieldChange::Clear => {
                    fields.remove(name);
                    awaiting.remove(name);
                }
                FieldChange::ServerTimestamp => {
                    match resolved.and_then(|stamps| stamps.get(name)) {
                        Some(at) => {
                            fields.insert(name.clone(), Value::String(format_timestamp(*at)));
                            awaiting.remove(name);
                        }
                        None => {
                            awaiting.insert(name.clone());
                        }
                    }
                }
            }
        }
    }
}

/// A mutation requested by the application
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Create(Patch),
    Update(Patch),
    Delete,
}

impl Change {
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Create(_) => OperationKind::Create,
            Self::Update(_) => OperationKind::Update,
            Self::Delete => OperationKind::Delete,
        }
    }

    pub fn into_payload(self) -> Patch {
        match self {
            Self::Create(patch) | Self::Update(patch) => patch,
            Self::Delete => Patch::new(),
        }
    }
}

/// Most recent dispatch failure of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchFailure {
    pub message: String,
    /// Rejections block automatic retry until the user acts.
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

impl DispatchFailure {
    pub fn from_error(error: &WriteError, failed_at: DateTime<Utc>) -> Self {
        Self {
            message: error.to_string(),
            retryable: error.is_retryable(),
            failed_at,
        }
    }
}

/// A locally issued mutation that the remote store has not yet confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    /// Position in the log's issue order
    pub seq: u64,
    pub entity_id: EntityId,
    pub collection: Collection,
    pub kind: OperationKind,
    /// Field changes captured when the operation was issued
    pub payload: Patch,
    pub issued_at: DateTime<Utc>,
    pub confirmed: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_failure: Option<DispatchFailure>,
}

impl PendingOperation {
    /// Rejected by the remote store and waiting for the user
    pub fn is_terminal_failed(&self) -> bool {
        !self.confirmed
            && self
                .last_failure
                .as_ref()
                .is_some_and(|failure| !failure.retryable)
    }

    /// Eligible for automatic dispatch
    pub fn is_dispatchable(&self) -> bool {
        !self.confirmed && !self.is_terminal_failed()
    }
}
