//! pawtrack-core - Core library for Pawtrack
//!
//! This crate contains the offline-first sync engine, the visit and booking
//! models, and the local persistence layer used by every Pawtrack client.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod state;
pub mod sync;
pub mod timer;
pub mod undo;
pub mod util;

pub use config::EngineConfig;
pub use error::{Error, ReconciliationError, Result, UndoError, WriteError};
pub use models::{
    Booking, BookingStatus, Change, Collection, Entity, EntityId, OperationId, Patch,
    PendingOperation, Query, SyncState, Visit, VisitTimeline,
};
pub use state::{ConnState, SyncStatus};
pub use sync::{ManualConnectivity, SyncEngine, SyncEvent};
pub use timer::TimerProjection;
