use std::path::Path;

use chrono::{DateTime, Utc};
use pawtrack_core::VisitTimeline;

use crate::commands::common::{
    entity_id_or_generate, format_projection, open_session, parse_entity_id, report_outcome,
};
use crate::error::CliError;

pub async fn run_create(
    id: Option<&str>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    booking: Option<&str>,
    sitter: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let timeline = VisitTimeline::scheduled(start, end)?;
    let visit_id = entity_id_or_generate(id)?;

    let session = open_session(db_path).await?;
    session
        .engine
        .create_visit(&visit_id, &timeline, booking, sitter)?;
    let report = session.finish().await?;
    report_outcome("Scheduled visit", &visit_id, report);
    Ok(())
}

pub async fn run_check_in(id: &str, db_path: &Path) -> Result<(), CliError> {
    let visit_id = parse_entity_id(id)?;
    let session = open_session(db_path).await?;
    session.engine.check_in(&visit_id)?;
    let report = session.finish().await?;
    report_outcome("Checked in", &visit_id, report);
    Ok(())
}

pub async fn run_check_out(id: &str, db_path: &Path) -> Result<(), CliError> {
    let visit_id = parse_entity_id(id)?;
    let session = open_session(db_path).await?;
    session.engine.check_out(&visit_id)?;
    let report = session.finish().await?;
    report_outcome("Checked out", &visit_id, report);
    Ok(())
}

pub async fn run_undo(id: &str, db_path: &Path) -> Result<(), CliError> {
    let visit_id = parse_entity_id(id)?;
    let session = open_session(db_path).await?;
    session.engine.undo(&visit_id)?;
    let report = session.finish().await?;
    report_outcome("Undid check-in of", &visit_id, report);
    Ok(())
}

pub async fn run_timer(id: &str, watch: bool, db_path: &Path) -> Result<(), CliError> {
    let visit_id = parse_entity_id(id)?;
    let session = open_session(db_path).await?;

    if watch {
        let mut timer = session.engine.watch_timer(&visit_id);
        loop {
            let projection = *timer.borrow_and_update();
            match projection {
                Some(projection) => println!("{}", format_projection(&projection)),
                None => {
                    println!("Visit {visit_id} is no longer visible");
                    break;
                }
            }
            tokio::select! {
                changed = timer.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    } else {
        let projection = session.engine.projection(&visit_id, Utc::now())?;
        println!("{}", format_projection(&projection));
    }

    session.finish().await?;
    Ok(())
}
