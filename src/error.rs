//! Error types shared by every engine component

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::InstanceStatus;

/// Errors raised while resolving instance configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("instance '{0}' is not configured")]
    NotFound(String),

    #[error("failed to read configuration from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration for '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Errors raised by control operations (start, stop, lock, reconcile)
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("timed out after {waited:?} waiting for lock on '{name}' (held by pid {holder_pid} for '{operation}')")]
    LockTimeout {
        name: String,
        waited: Duration,
        holder_pid: u32,
        operation: String,
    },

    #[error("lock file error for '{name}': {source}")]
    Lock {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("instance '{name}' is already {status} (pid {pid:?})")]
    DuplicateStart {
        name: String,
        status: InstanceStatus,
        pid: Option<u32>,
    },

    #[error("no runtime state for instance '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("process error for '{name}': {reason}")]
    Process { name: String, reason: String },

    #[error("port {port} cannot be used by '{name}': {reason}")]
    PortUnavailable {
        name: String,
        port: u16,
        reason: String,
    },

    #[error("instance '{name}' reached its restart limit ({max_retries})")]
    RestartLimitExceeded { name: String, max_retries: u32 },

    #[error("state store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("state store schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("state store is unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn process(name: &str, reason: impl Into<String>) -> Self {
        Self::Process {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
