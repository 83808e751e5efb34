//! Local durable storage for Pawtrack

mod connection;
mod kv_store;
mod migrations;

pub use connection::Database;
pub use kv_store::{keys, KvStore, LibSqlKvStore, MemoryKvStore};
