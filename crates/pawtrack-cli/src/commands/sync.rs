use std::path::Path;

use pawtrack_core::{Collection, Query};

use crate::commands::common::open_session;
use crate::error::CliError;

pub async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let session = open_session(db_path).await?;
    if !session.is_online() {
        session.finish().await?;
        return Err(CliError::SyncNotConfigured);
    }

    let report = session.engine.flush().await?;
    for collection in [Collection::visits(), Collection::bookings()] {
        // Registering the query is what makes refresh pull it.
        drop(session.engine.reconciled_view(&Query::collection(collection)));
    }
    let documents = session.engine.refresh().await?;
    session.finish().await?;

    println!(
        "Sync completed: {} sent, {} rejected, {} still queued, {documents} documents pulled",
        report.confirmed, report.rejected, report.remaining
    );
    Ok(())
}
