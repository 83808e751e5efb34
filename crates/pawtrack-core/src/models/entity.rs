//! Synchronized entity model

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::OperationId;
use crate::error::{Error, Result};
use crate::util::parse_timestamp;

/// Top-level document fields, as stored by the remote store.
pub type Fields = serde_json::Map<String, Value>;

/// Identifier of a synchronized document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap an identifier assigned elsewhere (trimmed, non-empty, no `/`)
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("Entity id must not be empty".into()));
        }
        if trimmed.contains('/') {
            return Err(Error::InvalidInput(format!(
                "Entity id '{trimmed}' must not contain '/'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Generate a fresh, time-sortable identifier for locally created entities
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Name of a remote collection (e.g. `visits`, `bookings`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection(String);

impl Collection {
    pub const VISITS: &'static str = "visits";
    pub const BOOKINGS: &'static str = "bookings";

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(name))
        } else {
            Err(Error::InvalidInput(format!(
                "Invalid collection name '{name}'"
            )))
        }
    }

    #[must_use]
    pub fn visits() -> Self {
        Self(Self::VISITS.to_string())
    }

    #[must_use]
    pub fn bookings() -> Self {
        Self(Self::BOOKINGS.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_visits(&self) -> bool {
        self.0 == Self::VISITS
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Synchronization tag carried by every published entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "operation", rename_all = "snake_case")]
pub enum SyncState {
    /// Published fields equal the last authoritative snapshot.
    Clean,
    /// A local mutation is waiting for acknowledgment; the id is the newest one.
    PendingWrite(OperationId),
    /// The authoritative value changed while a local write was in flight.
    /// The local write still wins (last writer wins).
    Conflicted,
}

/// A record in the reconciled view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub collection: Collection,
    /// Authoritative fields with unconfirmed local mutations applied on top
    pub fields: Fields,
    pub sync_state: SyncState,
    /// Fields whose value will be assigned by the server on acknowledgment
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub awaiting_server: BTreeSet<String>,
}

impl Entity {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|value| !value.is_null())
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Read an RFC 3339 timestamp field; absent or `null` reads as `None`
    pub fn timestamp_field(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.field(name) {
            None => Ok(None),
            Some(value) => parse_timestamp(value).map(Some).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Field '{name}' of {} is not an RFC 3339 timestamp",
                    self.id
                ))
            }),
        }
    }

    pub fn is_awaiting_server(&self, name: &str) -> bool {
        self.awaiting_server.contains(name)
    }

    pub const fn is_clean(&self) -> bool {
        matches!(self.sync_state, SyncState::Clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(fields: Value) -> Entity {
        Entity {
            id: EntityId::new("visit-1").unwrap(),
            collection: Collection::visits(),
            fields: fields.as_object().cloned().unwrap(),
            sync_state: SyncState::Clean,
            awaiting_server: BTreeSet::new(),
        }
    }

    #[test]
    fn test_entity_id_rejects_blank_and_paths() {
        assert!(EntityId::new("  ").is_err());
        assert!(EntityId::new("a/b").is_err());
        assert_eq!(EntityId::new(" v1 ").unwrap().as_str(), "v1");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(EntityId::generate(), EntityId::generate());
    }

    #[test]
    fn test_collection_names() {
        assert!(Collection::new("visits").is_ok());
        assert!(Collection::new("pet_owners").is_ok());
        assert!(Collection::new("").is_err());
        assert!(Collection::new("visits/1").is_err());
        assert!(Collection::visits().is_visits());
    }

    #[test]
    fn test_null_fields_read_as_absent() {
        let entity = entity(json!({ "actualStart": null, "status": "scheduled" }));
        assert!(entity.field("actualStart").is_none());
        assert_eq!(entity.str_field("status"), Some("scheduled"));
        assert_eq!(entity.timestamp_field("actualStart").unwrap(), None);
    }

    #[test]
    fn test_timestamp_field_rejects_garbage() {
        let entity = entity(json!({ "actualStart": "soon" }));
        assert!(entity.timestamp_field("actualStart").is_err());
    }
}
