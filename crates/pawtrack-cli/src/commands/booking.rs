use std::path::Path;

use chrono::{DateTime, Utc};
use pawtrack_core::models::{booking, Pet, ServiceKind};
use pawtrack_core::{Booking, BookingStatus, Patch};

use crate::commands::common::{
    entity_id_or_generate, normalize_text, open_session, parse_entity_id, report_outcome,
};
use crate::error::CliError;

pub struct NewBooking {
    pub id: Option<String>,
    pub owner: String,
    pub pet: String,
    pub species: String,
    pub service: ServiceKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sitter: Option<String>,
    pub notes: Option<String>,
}

impl NewBooking {
    pub fn into_booking(self) -> Booking {
        Booking {
            owner_id: self.owner.trim().to_string(),
            sitter_id: self.sitter,
            pet: Pet {
                name: self.pet.trim().to_string(),
                species: self.species.trim().to_string(),
            },
            service: self.service,
            starts_at: self.start,
            ends_at: self.end,
            status: BookingStatus::Requested,
            notes: self.notes.and_then(|notes| normalize_text(&[notes])),
        }
    }
}

pub async fn run_add(request: NewBooking, db_path: &Path) -> Result<(), CliError> {
    let booking_id = entity_id_or_generate(request.id.as_deref())?;
    let booking = request.into_booking();
    booking.validate()?;

    let session = open_session(db_path).await?;
    session.engine.create_booking(&booking_id, &booking)?;
    let report = session.finish().await?;
    report_outcome("Requested booking", &booking_id, report);
    Ok(())
}

pub async fn run_notes(id: &str, text: &[String], db_path: &Path) -> Result<(), CliError> {
    let booking_id = parse_entity_id(id)?;
    let patch = match normalize_text(text) {
        Some(notes) => Patch::new().set(booking::fields::NOTES, notes),
        None => Patch::new().clear(booking::fields::NOTES),
    };

    let session = open_session(db_path).await?;
    session.engine.update_booking(&booking_id, patch)?;
    let report = session.finish().await?;
    report_outcome("Updated notes of", &booking_id, report);
    Ok(())
}

pub async fn run_cancel(id: &str, db_path: &Path) -> Result<(), CliError> {
    let booking_id = parse_entity_id(id)?;
    let session = open_session(db_path).await?;
    session.engine.cancel_booking(&booking_id)?;
    let report = session.finish().await?;
    report_outcome("Cancelled booking", &booking_id, report);
    Ok(())
}

pub async fn run_delete(id: &str, db_path: &Path) -> Result<(), CliError> {
    let booking_id = parse_entity_id(id)?;
    let session = open_session(db_path).await?;
    session.engine.delete_booking(&booking_id)?;
    let report = session.finish().await?;
    report_outcome("Deleted booking", &booking_id, report);
    Ok(())
}
