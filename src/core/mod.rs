//! Core module - locking, process supervision, health and reconciliation

pub mod backoff;
pub mod config;
pub mod daemon;
mod engine;
pub mod health;
pub mod instance;
pub mod lock;
pub mod logs;
pub mod ports;
pub mod process;
pub mod reconcile;
pub mod settings;
pub mod validator;

pub use config::{ConfigStore, JsonConfigStore, LaunchResolver, ServerLaunchResolver};
pub use daemon::{DaemonService, DaemonStatus};
pub use engine::{Engine, InstanceSummary};
pub use instance::{
    event_types, format_duration_secs, Event, HealthCheckConfig, HealthStatus, InstanceConfig,
    InstanceStatus, ProbeKind, RestartPolicy, RuntimeState,
};
pub use lock::{InstanceLock, LockInfo, LockManager, MultiInstanceLock};
pub use process::ProcessSupervisor;
pub use reconcile::{
    ReconcileAction, ReconcileOutcome, ReconcileReport, ReconcileScheduler, Reconciler,
};
pub use settings::EngineSettings;
pub use validator::{OrphanProcess, ProcessCheck, ProcessValidator};
