//! Persistence layer - SQLite runtime state and event history

mod database;

pub use database::{StateStore, SCHEMA_VERSION};
