//! Visit model and check-in/check-out timeline

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Entity, EntityId, FieldChange, Patch};
use crate::error::{Error, Result};
use crate::util::{format_timestamp, parse_timestamp};

/// Field names of a visit document
pub mod fields {
    pub const SCHEDULED_START: &str = "scheduledStart";
    pub const SCHEDULED_END: &str = "scheduledEnd";
    pub const ACTUAL_START: &str = "actualStart";
    pub const ACTUAL_END: &str = "actualEnd";
    pub const STATUS: &str = "status";
    pub const BOOKING_ID: &str = "bookingId";
    pub const SITTER_ID: &str = "sitterId";
}

/// Convenience status mirrored next to the timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    #[default]
    Scheduled,
    InProgress,
    Completed,
}

impl VisitStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scheduled" => Some(Self::Scheduled),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Where a visit is in its lifecycle, judged from confirmed timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelinePhase {
    NotStarted,
    Active,
    Completed,
}

/// Scheduled and actual times of a visit.
///
/// Actual times only ever come from server acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitTimeline {
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
}

impl VisitTimeline {
    /// A timeline that has not started yet
    pub fn scheduled(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(Error::InvalidInput(
                "Visit must end after it starts".to_string(),
            ));
        }
        Ok(Self {
            scheduled_start: start,
            scheduled_end: end,
            actual_start: None,
            actual_end: None,
        })
    }

    /// Read the timeline out of a reconciled visit entity
    pub fn from_entity(entity: &Entity) -> Result<Self> {
        let scheduled_start = required_timestamp(entity, fields::SCHEDULED_START)?;
        let scheduled_end = required_timestamp(entity, fields::SCHEDULED_END)?;
        let actual_start = entity.timestamp_field(fields::ACTUAL_START)?;
        let actual_end = entity.timestamp_field(fields::ACTUAL_END)?;

        if actual_end.is_some() && actual_start.is_none() {
            return Err(Error::InvalidInput(format!(
                "Visit {} has an end time without a start time",
                entity.id
            )));
        }

        Ok(Self {
            scheduled_start,
            scheduled_end,
            actual_start,
            actual_end,
        })
    }

    pub fn scheduled_duration(&self) -> Duration {
        self.scheduled_end - self.scheduled_start
    }

    pub const fn phase(&self) -> TimelinePhase {
        match (self.actual_start, self.actual_end) {
            (None, _) => TimelinePhase::NotStarted,
            (Some(_), None) => TimelinePhase::Active,
            (Some(_), Some(_)) => TimelinePhase::Completed,
        }
    }
}

fn required_timestamp(entity: &Entity, name: &str) -> Result<DateTime<Utc>> {
    entity
        .timestamp_field(name)?
        .ok_or_else(|| Error::InvalidInput(format!("Visit {} is missing '{name}'", entity.id)))
}

/// A visit as seen by the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub id: EntityId,
    pub booking_id: Option<String>,
    pub sitter_id: Option<String>,
    pub status: VisitStatus,
    pub timeline: VisitTimeline,
    /// Check-in sent, server time not yet known
    pub start_pending: bool,
    /// Check-out sent, server time not yet known
    pub end_pending: bool,
}

impl Visit {
    pub fn from_entity(entity: &Entity) -> Result<Self> {
        let timeline = VisitTimeline::from_entity(entity)?;
        let status = entity
            .str_field(fields::STATUS)
            .and_then(VisitStatus::parse)
            .unwrap_or_default();

        Ok(Self {
            id: entity.id.clone(),
            booking_id: entity.str_field(fields::BOOKING_ID).map(str::to_string),
            sitter_id: entity.str_field(fields::SITTER_ID).map(str::to_string),
            status,
            timeline,
            start_pending: entity.is_awaiting_server(fields::ACTUAL_START),
            end_pending: entity.is_awaiting_server(fields::ACTUAL_END),
        })
    }

    /// Started, counting a check-in that is still waiting for the server
    pub const fn is_started(&self) -> bool {
        self.timeline.actual_start.is_some() || self.start_pending
    }

    /// Ended, counting a check-out that is still waiting for the server
    pub const fn is_ended(&self) -> bool {
        self.timeline.actual_end.is_some() || self.end_pending
    }

    pub fn creation_patch(
        timeline: &VisitTimeline,
        booking_id: Option<&str>,
        sitter_id: Option<&str>,
    ) -> Patch {
        let mut patch = Patch::new()
            .set(
                fields::SCHEDULED_START,
                format_timestamp(timeline.scheduled_start),
            )
            .set(fields::SCHEDULED_END, format_timestamp(timeline.scheduled_end))
            .set(fields::STATUS, VisitStatus::Scheduled.as_str());
        if let Some(booking_id) = booking_id {
            patch = patch.set(fields::BOOKING_ID, booking_id);
        }
        if let Some(sitter_id) = sitter_id {
            patch = patch.set(fields::SITTER_ID, sitter_id);
        }
        patch
    }

    pub fn check_in_patch() -> Patch {
        Patch::new()
            .server_timestamp(fields::ACTUAL_START)
            .set(fields::STATUS, VisitStatus::InProgress.as_str())
    }

    pub fn check_out_patch() -> Patch {
        Patch::new()
            .server_timestamp(fields::ACTUAL_END)
            .set(fields::STATUS, VisitStatus::Completed.as_str())
    }

    /// Compensating patch issued by undo
    pub fn undo_start_patch() -> Patch {
        Patch::new()
            .clear(fields::ACTUAL_START)
            .set(fields::STATUS, VisitStatus::Scheduled.as_str())
    }

    /// Reject a generic update that would break the timeline rules.
    ///
    /// Scheduled times are immutable. The actual times and the status
    /// mirror change only through check-in, check-out and undo, which
    /// build their own patches.
    pub fn validate_update(patch: &Patch) -> Result<()> {
        for name in [fields::SCHEDULED_START, fields::SCHEDULED_END] {
            if patch.touches(name) {
                return Err(Error::InvalidInput(format!(
                    "'{name}' cannot change once a visit is created"
                )));
            }
        }
        for name in LIFECYCLE_FIELDS {
            if patch.touches(name) {
                return Err(Error::InvalidInput(format!(
                    "'{name}' only changes through check-in, check-out or undo"
                )));
            }
        }
        Ok(())
    }

    /// Reject a create that is not a well-formed, unstarted visit
    pub fn validate_creation(patch: &Patch) -> Result<()> {
        let start = scheduled_time(patch, fields::SCHEDULED_START)?;
        let end = scheduled_time(patch, fields::SCHEDULED_END)?;
        VisitTimeline::scheduled(start, end)?;

        for name in [fields::ACTUAL_START, fields::ACTUAL_END] {
            if patch.touches(name) {
                return Err(Error::InvalidInput(format!(
                    "A new visit cannot carry '{name}'; check in after creating it"
                )));
            }
        }
        match patch.get(fields::STATUS) {
            None => Ok(()),
            Some(FieldChange::Set(Value::String(status)))
                if status == VisitStatus::Scheduled.as_str() =>
            {
                Ok(())
            }
            Some(_) => Err(Error::InvalidInput(format!(
                "A new visit must have status '{}'",
                VisitStatus::Scheduled.as_str()
            ))),
        }
    }
}

const LIFECYCLE_FIELDS: [&str; 3] = [fields::ACTUAL_START, fields::ACTUAL_END, fields::STATUS];

fn scheduled_time(patch: &Patch, name: &str) -> Result<DateTime<Utc>> {
    match patch.get(name) {
        Some(FieldChange::Set(value)) => parse_timestamp(value).ok_or_else(|| {
            Error::InvalidInput(format!("'{name}' must be an RFC 3339 timestamp"))
        }),
        _ => Err(Error::InvalidInput(format!("A new visit needs '{name}'"))),
    }
}
