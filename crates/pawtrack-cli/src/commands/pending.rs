use std::path::Path;

use crate::commands::common::{
    format_pending_lines, format_sync_conflict_lines, open_session, parse_entity_id,
    parse_operation_id, pending_to_item, PendingItem,
};
use crate::error::CliError;

pub async fn run_pending(
    entity: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let entity_id = entity.map(parse_entity_id).transpose()?;
    let session = open_session(db_path).await?;
    let operations = match &entity_id {
        Some(entity_id) => session.engine.pending_for(entity_id),
        None => session.engine.pending_operations(),
    };
    session.finish().await?;

    if as_json {
        let json_items = operations
            .iter()
            .map(pending_to_item)
            .collect::<Vec<PendingItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("Nothing pending.");
        return Ok(());
    }
    for line in format_pending_lines(&operations) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_retry(operation_id: &str, db_path: &Path) -> Result<(), CliError> {
    let operation_id = parse_operation_id(operation_id)?;
    let session = open_session(db_path).await?;
    session.engine.retry(operation_id)?;
    let online = session.is_online();
    session.finish().await?;
    if online {
        println!("Retried {operation_id}");
    } else {
        println!("Re-queued {operation_id}");
    }
    Ok(())
}

pub async fn run_discard(operation_id: &str, db_path: &Path) -> Result<(), CliError> {
    let operation_id = parse_operation_id(operation_id)?;
    let session = open_session(db_path).await?;
    let discarded = session.engine.discard(operation_id)?;
    session.finish().await?;
    println!(
        "Discarded {} of {}/{}",
        discarded.kind, discarded.collection, discarded.entity_id
    );
    Ok(())
}

pub async fn run_conflicts(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let session = open_session(db_path).await?;
    let conflicts = session.engine.conflicts();
    session.finish().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }
    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}
