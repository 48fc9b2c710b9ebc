//! multiserve - Supervise multiple model-server instances on one host
//!
//! Instances are started, stopped and restarted under per-instance file
//! locks, their runtime state lives in SQLite, and a background daemon keeps
//! that state honest by probing health and reconciling against the OS
//! process table.

pub mod core;
pub mod error;
pub mod persistence;
mod platform;

pub use crate::core::{Engine, EngineSettings};
pub use crate::error::{ConfigError, EngineError, Result};

/// Application name constant
pub const APP_NAME: &str = "multiserve";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
