//! Data models for Pawtrack

pub mod booking;
mod entity;
mod operation;
mod query;
mod sync_conflict;
pub mod visit;

pub use booking::{Booking, BookingStatus, Pet, ServiceKind};
pub use entity::{Collection, Entity, EntityId, Fields, SyncState};
pub use operation::{
    Change, DispatchFailure, FieldChange, OperationId, OperationKind, Patch, PendingOperation,
};
pub use query::{FieldFilter, Query};
pub use sync_conflict::{SyncConflict, LAST_WRITER_WINS};
pub use visit::{TimelinePhase, Visit, VisitStatus, VisitTimeline};
