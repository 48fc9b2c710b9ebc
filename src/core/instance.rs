//! Instance model - Configuration snapshots and persisted runtime state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// No process is running
    Stopped,
    /// Process spawned, not yet confirmed alive
    Starting,
    /// Process confirmed alive
    Running,
    /// Termination in progress
    Stopping,
    /// Unrecoverable fault; needs operator attention
    Error,
}

impl InstanceStatus {
    /// Statuses during which a pid is recorded
    pub fn is_active(&self) -> bool {
        match self {
            Self::Starting | Self::Running | Self::Stopping => true,
            Self::Stopped | Self::Error => false,
        }
    }

    /// Whether a fresh `start` is allowed from this status
    pub fn can_start(&self) -> bool {
        match self {
            Self::Stopped | Self::Error => true,
            Self::Starting | Self::Running | Self::Stopping => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

/// Health of a running instance as last observed by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Loading,
    Healthy,
    Unhealthy,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Loading => "loading",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "loading" => Ok(Self::Loading),
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown health status '{}'", other)),
        }
    }
}

/// Which probe strategy a healthcheck uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeKind {
    /// GET `http://host:port{path}` and inspect the JSON `status` field
    Http {
        #[serde(default = "default_health_path")]
        path: String,
    },
    /// Plain TCP connect
    Tcp,
    /// Operator-supplied command; `{host}` and `{port}` are substituted in args
    Custom {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Healthcheck parameters for one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub probe: ProbeKind,
    /// Time between checks
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Per-check timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before acting
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Grace window after start during which failures are not counted
    #[serde(default)]
    pub start_period_ms: u64,
}

const fn default_interval_ms() -> u64 {
    30_000
}
const fn default_timeout_ms() -> u64 {
    5_000
}
const fn default_retries() -> u32 {
    3
}

impl HealthCheckConfig {
    pub fn new(probe: ProbeKind) -> Self {
        Self {
            probe,
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            start_period_ms: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn start_period(&self) -> Duration {
        Duration::from_millis(self.start_period_ms)
    }
}

/// When and how often a failing instance is restarted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_max_retries() -> u32 {
    5
}
const fn default_initial_delay_ms() -> u64 {
    1_000
}
const fn default_multiplier() -> f64 {
    2.0
}
const fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Immutable configuration snapshot for one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Unique instance name
    pub name: String,
    /// Model (or other payload) the server should load
    pub model: PathBuf,
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Extra command line arguments appended after the generated ones
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Environment variables to set
    #[serde(default)]
    pub environment: Vec<(String, String)>,
    /// Working directory (defaults to the executable's directory)
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub healthcheck: Option<HealthCheckConfig>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>, model: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            host: default_host(),
            port,
            arguments: Vec::new(),
            environment: Vec::new(),
            working_directory: None,
            healthcheck: None,
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn with_arguments(mut self, args: Vec<String>) -> Self {
        self.arguments = args;
        self
    }

    pub fn with_healthcheck(mut self, healthcheck: HealthCheckConfig) -> Self {
        self.healthcheck = Some(healthcheck);
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }
}

/// Persisted runtime record of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub name: String,
    pub pid: Option<u32>,
    pub status: InstanceStatus,
    pub health: HealthStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Port claimed while the instance is active
    pub port: Option<u16>,
    /// Process start time (seconds since epoch) captured at spawn
    pub signature: Option<u64>,
}

impl RuntimeState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: None,
            status: InstanceStatus::Stopped,
            health: HealthStatus::Unknown,
            start_time: None,
            restart_count: 0,
            last_error: None,
            last_seen: None,
            port: None,
            signature: None,
        }
    }

    /// Get uptime if a start time is recorded and the instance is active
    pub fn uptime(&self) -> Option<chrono::Duration> {
        if !self.status.is_active() {
            return None;
        }
        self.start_time.map(|started| Utc::now() - started)
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        match self.uptime() {
            Some(duration) => format_duration_secs(duration.num_seconds().max(0) as u64),
            None => "-".to_string(),
        }
    }

    /// Mark instance as starting with a freshly spawned process
    pub fn mark_starting(&mut self, pid: u32, port: u16, signature: Option<u64>) {
        let now = Utc::now();
        self.status = InstanceStatus::Starting;
        self.health = HealthStatus::Unknown;
        self.pid = Some(pid);
        self.port = Some(port);
        self.signature = signature;
        self.start_time = Some(now);
        self.last_seen = Some(now);
        self.last_error = None;
    }

    /// Mark instance as running
    pub fn mark_running(&mut self) {
        self.status = InstanceStatus::Running;
        self.last_seen = Some(Utc::now());
    }

    /// Mark instance as stopping
    pub fn mark_stopping(&mut self) {
        self.status = InstanceStatus::Stopping;
        self.health = HealthStatus::Unknown;
    }

    /// Mark instance as stopped, releasing pid and port
    pub fn mark_stopped(&mut self) {
        self.status = InstanceStatus::Stopped;
        self.health = HealthStatus::Unknown;
        self.pid = None;
        self.port = None;
        self.signature = None;
    }

    /// Mark instance as failed, releasing pid and port
    pub fn mark_error(&mut self, error: impl Into<String>) {
        self.status = InstanceStatus::Error;
        self.health = HealthStatus::Unknown;
        self.pid = None;
        self.port = None;
        self.signature = None;
        self.last_error = Some(error.into());
    }

    /// Record a probe outcome; ignored unless running
    pub fn set_health(&mut self, health: HealthStatus) {
        if self.status == InstanceStatus::Running {
            self.health = health;
            self.last_seen = Some(Utc::now());
        }
    }
}

/// Format a number of seconds as a short human-readable string
pub fn format_duration_secs(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

/// One entry of the append-only audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub detail: Option<String>,
}

/// Event type labels written by the engine
pub mod event_types {
    pub const STARTING: &str = "starting";
    pub const RUNNING: &str = "running";
    pub const STOPPING: &str = "stopping";
    pub const STOPPED: &str = "stopped";
    pub const SPAWN_FAILED: &str = "spawn_failed";
    pub const EXITED: &str = "exited";
    pub const RESTARTED: &str = "restarted";
    pub const HEALTH: &str = "health";
    pub const PROCESS_MISSING: &str = "process_missing";
    pub const PID_REUSED: &str = "pid_reused";
    pub const INCONSISTENT: &str = "inconsistent";
    pub const STALE_RUNTIME: &str = "stale_runtime";
    pub const ORPHAN_CLEANUP: &str = "orphan_cleanup";
    pub const PURGED: &str = "purged";
    pub const ERROR: &str = "error";
}
