use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pawtrack_core::db::{Database, KvStore, LibSqlKvStore};
use pawtrack_core::models::{SyncConflict, VisitStatus};
use pawtrack_core::remote::{DisconnectedRemote, HttpRemoteStore, RemoteStore};
use pawtrack_core::sync::FlushReport;
use pawtrack_core::timer::TimerProjection;
use pawtrack_core::{
    Booking, ConnState, EngineConfig, Entity, EntityId, ManualConnectivity, OperationId,
    PendingOperation, SyncEngine, SyncState, Visit,
};
use serde::Serialize;

use crate::error::CliError;

pub const ENV_DB_PATH: &str = "PAWTRACK_DB_PATH";

#[derive(Debug, Serialize)]
pub struct VisitListItem {
    pub id: String,
    pub status: VisitStatus,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub booking_id: Option<String>,
    pub sitter_id: Option<String>,
    pub sync_state: SyncState,
}

#[derive(Debug, Serialize)]
pub struct BookingListItem {
    pub id: String,
    #[serde(flatten)]
    pub booking: Booking,
    pub sync_state: SyncState,
}

#[derive(Debug, Serialize)]
pub struct PendingItem {
    pub id: String,
    pub seq: u64,
    pub collection: String,
    pub entity_id: String,
    pub kind: String,
    pub issued_at: DateTime<Utc>,
    pub attempts: u32,
    pub failed: bool,
    pub last_error: Option<String>,
}

/// An engine opened for the duration of one command
pub struct Session {
    pub engine: SyncEngine,
    online: bool,
}

impl Session {
    pub const fn is_online(&self) -> bool {
        self.online
    }

    /// Send what can be sent, then persist and stop the engine
    pub async fn finish(self) -> Result<Option<FlushReport>, CliError> {
        let report = if self.online {
            Some(self.engine.flush().await?)
        } else {
            None
        };
        self.engine.shutdown().await?;
        Ok(report)
    }
}

pub async fn open_session(db_path: &Path) -> Result<Session, CliError> {
    let config = EngineConfig::from_env()?;
    let database = Database::open(db_path).await?;
    let kv: Arc<dyn KvStore> = Arc::new(LibSqlKvStore::new(database));

    let (remote, state): (Arc<dyn RemoteStore>, ConnState) = if config.remote_base_url.is_some()
    {
        (
            Arc::new(HttpRemoteStore::from_config(&config)?),
            ConnState::Reachable,
        )
    } else {
        tracing::debug!("No remote configured; operations stay queued locally");
        (Arc::new(DisconnectedRemote), ConnState::Unreachable)
    };
    let connectivity = Arc::new(ManualConnectivity::new(state));

    let engine = SyncEngine::open(config, remote, connectivity, kv).await?;
    Ok(Session {
        engine,
        online: state.is_reachable(),
    })
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os(ENV_DB_PATH).map(PathBuf::from)) {
        return Ok(path);
    }
    default_db_path()
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("pawtrack").join("pawtrack.db"))
        .ok_or(CliError::NoDataDir)
}

pub fn parse_entity_id(raw: &str) -> Result<EntityId, CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyId);
    }
    Ok(EntityId::new(trimmed)?)
}

/// Use the given id, or generate one when none was passed
pub fn entity_id_or_generate(raw: Option<&str>) -> Result<EntityId, CliError> {
    raw.map_or_else(|| Ok(EntityId::generate()), parse_entity_id)
}

pub fn parse_operation_id(raw: &str) -> Result<OperationId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidOperationId(raw.trim().to_string()))
}

pub fn normalize_text(parts: &[String]) -> Option<String> {
    let joined = parts.join(" ");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn report_outcome(action: &str, id: &EntityId, report: Option<FlushReport>) {
    match report {
        Some(report) if report.remaining == 0 && report.rejected == 0 => {
            println!("{action} {id} (synced)");
        }
        Some(report) => println!(
            "{action} {id} ({} queued, {} rejected)",
            report.remaining, report.rejected
        ),
        None => println!("{action} {id} (queued offline)"),
    }
}

pub fn visit_to_list_item(visit: &Visit, entity: &Entity) -> VisitListItem {
    VisitListItem {
        id: visit.id.to_string(),
        status: visit.status,
        scheduled_start: visit.timeline.scheduled_start,
        scheduled_end: visit.timeline.scheduled_end,
        actual_start: visit.timeline.actual_start,
        actual_end: visit.timeline.actual_end,
        booking_id: visit.booking_id.clone(),
        sitter_id: visit.sitter_id.clone(),
        sync_state: entity.sync_state,
    }
}

pub fn format_visit_lines(visits: &[(Visit, Entity)]) -> Vec<String> {
    visits
        .iter()
        .map(|(visit, entity)| {
            let started = match (visit.timeline.actual_start, visit.start_pending) {
                (Some(started), _) => format!("started {}", format_clock(started)),
                (None, true) => "starting...".to_string(),
                (None, false) => "not started".to_string(),
            };
            format!(
                "{}  {:<11}  {}-{}  {}{}",
                visit.id,
                visit.status.as_str(),
                format_clock(visit.timeline.scheduled_start),
                format_clock(visit.timeline.scheduled_end),
                started,
                sync_marker(entity.sync_state)
            )
        })
        .collect()
}

pub fn format_booking_lines(bookings: &[(EntityId, Booking, SyncState)]) -> Vec<String> {
    bookings
        .iter()
        .map(|(id, booking, sync_state)| {
            format!(
                "{}  {:<9}  {} ({})  {}  {}{}",
                id,
                booking.status.as_str(),
                booking.pet.name,
                booking.owner_id,
                format_date_time(booking.starts_at),
                format_clock(booking.ends_at),
                sync_marker(*sync_state)
            )
        })
        .collect()
}

pub fn pending_to_item(operation: &PendingOperation) -> PendingItem {
    PendingItem {
        id: operation.id.to_string(),
        seq: operation.seq,
        collection: operation.collection.to_string(),
        entity_id: operation.entity_id.to_string(),
        kind: operation.kind.to_string(),
        issued_at: operation.issued_at,
        attempts: operation.attempts,
        failed: operation.is_terminal_failed(),
        last_error: operation
            .last_failure
            .as_ref()
            .map(|failure| failure.message.clone()),
    }
}

pub fn format_pending_lines(operations: &[PendingOperation]) -> Vec<String> {
    operations
        .iter()
        .map(|operation| {
            let state = match &operation.last_failure {
                Some(failure) if !failure.retryable => format!("  REJECTED: {}", failure.message),
                Some(failure) => format!("  retrying: {}", failure.message),
                None => String::new(),
            };
            format!(
                "{:>4}  {}  {:<6}  {}/{}  {}{}",
                operation.seq,
                operation.id,
                operation.kind,
                operation.collection,
                operation.entity_id,
                format_date_time(operation.issued_at),
                state
            )
        })
        .collect()
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<4}  entity={}  fields={}  local={} incoming={}",
                format_date_time(conflict.resolved_at),
                conflict.strategy,
                conflict.entity_id,
                conflict.fields.join(","),
                format_date_time(conflict.local_issued_at),
                format_date_time(conflict.incoming_updated_at)
            )
        })
        .collect()
}

pub fn format_projection(projection: &TimerProjection) -> String {
    let variance = projection
        .start_variance
        .filter(|variance| !variance.is_zero())
        .map(|variance| {
            let minutes = variance.num_minutes();
            if minutes > 0 {
                format!("  (started {minutes}m late)")
            } else {
                format!("  (started {}m early)", -minutes)
            }
        })
        .unwrap_or_default();
    let state = if projection.is_overtime {
        "overtime"
    } else {
        "remaining"
    };
    format!(
        "{} {state}  elapsed {}m{variance}",
        projection.countdown_label(),
        projection.elapsed.num_minutes()
    )
}

pub fn format_date_time(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn format_clock(value: DateTime<Utc>) -> String {
    value.format("%H:%M").to_string()
}

const fn sync_marker(state: SyncState) -> &'static str {
    match state {
        SyncState::Clean => "",
        SyncState::PendingWrite(_) => "  *",
        SyncState::Conflicted => "  !",
    }
}
