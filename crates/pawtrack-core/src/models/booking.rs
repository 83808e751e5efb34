//! Booking model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Entity, Patch};
use crate::error::{Error, Result};

/// Field names of a booking document
pub mod fields {
    pub const STARTS_AT: &str = "startsAt";
    pub const ENDS_AT: &str = "endsAt";
    pub const STATUS: &str = "status";
    pub const SITTER_ID: &str = "sitterId";
    pub const NOTES: &str = "notes";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Walk,
    DropIn,
    Boarding,
    HouseSitting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    #[default]
    Requested,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }
}

/// Pet details, stored as one nested value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pet {
    pub name: String,
    pub species: String,
}

/// A booking document.
///
/// Serialized field-for-field into the entity map; this is the only place a
/// booking is converted to or from untyped fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sitter_id: Option<String>,
    pub pet: Pet,
    pub service: ServiceKind,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub status: BookingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Booking {
    pub fn from_entity(entity: &Entity) -> Result<Self> {
        let fields = entity
            .fields
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::InvalidInput("Booking owner is required".to_string()));
        }
        if self.pet.name.trim().is_empty() {
            return Err(Error::InvalidInput("Pet name is required".to_string()));
        }
        validate_window(self.starts_at, self.ends_at)
    }

    /// Patch that writes every field of this booking
    pub fn to_patch(&self) -> Result<Patch> {
        match serde_json::to_value(self)? {
            Value::Object(fields) => Ok(Patch::from_fields(fields)),
            _ => Err(Error::InvalidInput(
                "Booking did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn reschedule_patch(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Result<Patch> {
        validate_window(starts_at, ends_at)?;
        Ok(Patch::new()
            .set(fields::STARTS_AT, serde_json::to_value(starts_at)?)
            .set(fields::ENDS_AT, serde_json::to_value(ends_at)?))
    }

    pub fn status_patch(status: BookingStatus) -> Patch {
        Patch::new().set(fields::STATUS, status.as_str())
    }
}

fn validate_window(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Result<()> {
    if ends_at <= starts_at {
        return Err(Error::InvalidInput(
            "Booking must end after it starts".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Collection, EntityId, Fields, SyncState};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn booking() -> Booking {
        Booking {
            owner_id: "owner-1".to_string(),
            sitter_id: None,
            pet: Pet {
                name: "Biscuit".to_string(),
                species: "dog".to_string(),
            },
            service: ServiceKind::Walk,
            starts_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
            ends_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            status: BookingStatus::Requested,
            notes: None,
        }
    }

    #[test]
    fn test_patch_keeps_pet_nested() {
        let patch = booking().to_patch().unwrap();
        assert!(patch.touches("pet"));
        assert!(!patch.touches("pet.name"));
        assert!(patch.validate().is_ok());
    }

    #[test]
    fn test_entity_round_trip_through_patch() {
        let original = booking();
        let mut fields = Fields::new();
        original
            .to_patch()
            .unwrap()
            .apply(&mut fields, &mut BTreeSet::new(), None);
        let entity = Entity {
            id: EntityId::new("booking-1").unwrap(),
            collection: Collection::bookings(),
            fields,
            sync_state: SyncState::Clean,
            awaiting_server: BTreeSet::new(),
        };
        assert_eq!(Booking::from_entity(&entity).unwrap(), original);
    }

    #[test]
    fn test_validate_rejects_bad_window() {
        let mut invalid = booking();
        invalid.ends_at = invalid.starts_at;
        assert!(invalid.validate().is_err());
        assert!(Booking::reschedule_patch(invalid.ends_at, invalid.starts_at).is_err());
    }

    #[test]
    fn test_validate_requires_owner_and_pet() {
        let mut invalid = booking();
        invalid.owner_id = "  ".to_string();
        assert!(invalid.validate().is_err());
        assert!(booking().validate().is_ok());
    }
}
