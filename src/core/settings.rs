//! Engine settings management

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::config::default_args_template;
use crate::error::{ConfigError, Result};

/// Name of the settings file inside the data directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Engine-wide settings shared by commands and the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    // Paths
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Server executable every instance runs
    pub executable_path: PathBuf,
    /// Argument template; `{model}`, `{host}`, `{port}` and `{name}` are expanded
    pub launch_args: Vec<String>,

    // Locking
    /// How long to wait for an instance lock
    pub lock_timeout_ms: u64,
    /// Poll interval while a lock is contended
    pub lock_retry_interval_ms: u64,
    /// Age after which any lock is reclaimable
    pub lock_stale_timeout_ms: u64,
    /// Lock wait used by the daemon; it prefers skipping a tick over blocking
    pub daemon_lock_timeout_ms: u64,

    // Process control
    /// Time between SIGTERM and SIGKILL
    pub stop_grace_period_ms: u64,
    /// Delay before confirming a freshly spawned process is alive
    pub spawn_check_delay_ms: u64,

    // Daemon
    /// Health check interval
    pub health_check_interval_ms: u64,
    /// Reconcile interval
    pub reconcile_interval_ms: u64,
    /// Minimum spacing between two reconcile runs
    pub reconcile_min_interval_ms: u64,
    /// Report OS processes of the managed executable without runtime rows
    pub detect_orphans: bool,
    /// Budget for shutdown callbacks
    pub shutdown_timeout_ms: u64,
    /// Upper bound on concurrent probes within one tick
    pub probe_workers: usize,

    // Logs
    /// Rotate instance logs above this size
    pub log_max_bytes: u64,
    /// Number of rotated files kept
    pub log_keep: usize,

    // Ports
    /// First port considered by the allocator
    pub port_range_start: u16,
    /// Last port considered by the allocator
    pub port_range_end: u16,

    // History
    /// Keep events for N days (0 = forever)
    pub event_retention_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_directory: None,
            executable_path: PathBuf::from("llama-server"),
            launch_args: default_args_template(),

            lock_timeout_ms: 10_000,
            lock_retry_interval_ms: 100,
            lock_stale_timeout_ms: 300_000,
            daemon_lock_timeout_ms: 500,

            stop_grace_period_ms: 10_000,
            spawn_check_delay_ms: 200,

            health_check_interval_ms: 10_000,
            reconcile_interval_ms: 60_000,
            reconcile_min_interval_ms: 5_000,
            detect_orphans: true,
            shutdown_timeout_ms: 10_000,
            probe_workers: 4,

            log_max_bytes: 10 * 1024 * 1024,
            log_keep: 5,

            port_range_start: 8080,
            port_range_end: 8180,

            event_retention_days: 30,
        }
    }
}

impl EngineSettings {
    /// Load settings from `<data>/settings.json`, falling back to defaults
    pub fn load(data_directory: Option<PathBuf>) -> Result<Self> {
        let base = data_directory
            .clone()
            .unwrap_or_else(Self::default_data_directory);
        let path = base.join(SETTINGS_FILE);

        let mut settings = if path.exists() {
            Self::from_file(&path)?
        } else {
            debug!("No settings file at {:?}, using defaults", path);
            Self::default()
        };
        if data_directory.is_some() {
            settings.data_directory = data_directory;
        }
        settings.validate();
        Ok(settings)
    }

    /// Parse settings from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(settings)
    }

    fn default_data_directory() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("multiserve")
    }

    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory
            .clone()
            .unwrap_or_else(Self::default_data_directory)
    }

    /// Get the state database path
    pub fn get_database_path(&self) -> PathBuf {
        self.get_data_directory().join("state.db")
    }

    /// Get the lock directory
    pub fn get_locks_directory(&self) -> PathBuf {
        self.get_data_directory().join("locks")
    }

    /// Get the instance logs directory
    pub fn get_logs_directory(&self) -> PathBuf {
        self.get_data_directory().join("logs")
    }

    /// Get the instance configuration file
    pub fn get_instances_file(&self) -> PathBuf {
        self.get_data_directory().join("instances.json")
    }

    /// Get the file the daemon publishes its status to
    pub fn get_daemon_status_path(&self) -> PathBuf {
        self.get_data_directory().join("daemon-status.json")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.lock_retry_interval_ms = self.lock_retry_interval_ms.max(10);
        self.lock_timeout_ms = self.lock_timeout_ms.max(self.lock_retry_interval_ms);
        self.health_check_interval_ms = self.health_check_interval_ms.max(100);
        self.reconcile_interval_ms = self.reconcile_interval_ms.max(100);
        self.probe_workers = self.probe_workers.clamp(1, 64);
        self.log_keep = self.log_keep.max(1);
        if self.port_range_start > self.port_range_end {
            warn!(
                "Port range {}-{} is inverted, swapping",
                self.port_range_start, self.port_range_end
            );
            std::mem::swap(&mut self.port_range_start, &mut self.port_range_end);
        }
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn lock_stale_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_stale_timeout_ms)
    }

    pub fn daemon_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.daemon_lock_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn spawn_check_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_check_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn reconcile_min_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_min_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
