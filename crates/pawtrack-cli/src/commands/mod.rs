pub mod booking;
pub mod common;
pub mod completions;
pub mod list;
pub mod pending;
pub mod sync;
pub mod visit;
