use std::path::Path;

use pawtrack_core::{Booking, Collection, Query, Visit};

use crate::cli::ListTarget;
use crate::commands::common::{
    format_booking_lines, format_visit_lines, open_session, visit_to_list_item, BookingListItem,
    VisitListItem,
};
use crate::error::CliError;

pub async fn run_list(target: ListTarget, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let session = open_session(db_path).await?;
    let result = match target {
        ListTarget::Visits => print_visits(&session.engine, as_json),
        ListTarget::Bookings => print_bookings(&session.engine, as_json),
    };
    session.finish().await?;
    result
}

fn print_visits(engine: &pawtrack_core::SyncEngine, as_json: bool) -> Result<(), CliError> {
    let view = engine.snapshot(&Query::collection(Collection::visits()));
    let visits = view
        .into_iter()
        .map(|entity| Visit::from_entity(&entity).map(|visit| (visit, entity)))
        .collect::<Result<Vec<_>, _>>()?;

    if as_json {
        let json_items = visits
            .iter()
            .map(|(visit, entity)| visit_to_list_item(visit, entity))
            .collect::<Vec<VisitListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if visits.is_empty() {
        println!("No visits.");
    } else {
        for line in format_visit_lines(&visits) {
            println!("{line}");
        }
    }
    Ok(())
}

fn print_bookings(engine: &pawtrack_core::SyncEngine, as_json: bool) -> Result<(), CliError> {
    let view = engine.snapshot(&Query::collection(Collection::bookings()));
    let bookings = view
        .into_iter()
        .map(|entity| {
            Booking::from_entity(&entity).map(|booking| (entity.id, booking, entity.sync_state))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if as_json {
        let json_items = bookings
            .into_iter()
            .map(|(id, booking, sync_state)| BookingListItem {
                id: id.to_string(),
                booking,
                sync_state,
            })
            .collect::<Vec<BookingListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if bookings.is_empty() {
        println!("No bookings.");
    } else {
        for line in format_booking_lines(&bookings) {
            println!("{line}");
        }
    }
    Ok(())
}
