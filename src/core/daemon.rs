//! Background service driving health checks and reconciliation

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::engine::Engine;
use super::health::{HealthAction, HealthMonitor};
use super::reconcile::ReconcileScheduler;
use crate::platform;

/// Work run once the loop has exited
pub type ShutdownCallback = Box<dyn FnOnce() + Send + 'static>;

/// Snapshot of the daemon, also published to `daemon-status.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub instances_monitored: usize,
    pub health_checks_performed: u64,
    pub reconciliations_performed: u64,
}

impl DaemonStatus {
    /// Read a published status; `running` is cleared when its pid is gone
    pub fn read(path: &Path) -> Option<Self> {
        let json = std::fs::read_to_string(path).ok()?;
        let mut status: Self = match serde_json::from_str(&json) {
            Ok(status) => status,
            Err(e) => {
                warn!("Unreadable daemon status at {:?}: {}", path, e);
                return None;
            }
        };
        if status.running && !platform::is_process_running(status.pid) {
            status.running = false;
        }
        Some(status)
    }
}

/// Runs the health and reconcile schedules until stopped
pub struct DaemonService {
    engine: Arc<Engine>,
    monitor: Arc<HealthMonitor>,
    scheduler: Arc<ReconcileScheduler>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    started: Mutex<Option<(Instant, DateTime<Utc>)>>,
    callbacks: Mutex<Vec<ShutdownCallback>>,
    health_interval: Duration,
    reconcile_interval: Duration,
    shutdown_timeout: Duration,
}

impl DaemonService {
    pub fn new(engine: Arc<Engine>) -> Self {
        let settings = engine.settings();
        let health_interval = settings.health_check_interval();
        let reconcile_interval = settings.reconcile_interval();
        let shutdown_timeout = settings.shutdown_timeout();
        let monitor = Arc::new(engine.health_monitor());
        let scheduler = Arc::new(engine.reconcile_scheduler());
        let (shutdown, _) = watch::channel(false);

        Self {
            engine,
            monitor,
            scheduler,
            running: AtomicBool::new(false),
            shutdown,
            started: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            health_interval,
            reconcile_interval,
            shutdown_timeout,
        }
    }

    /// Override both schedule intervals
    pub fn with_intervals(mut self, health: Duration, reconcile: Duration) -> Self {
        self.health_interval = health;
        self.reconcile_interval = reconcile;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register work to run after the loop exits
    pub fn on_shutdown(&self, callback: ShutdownCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(callback);
    }

    /// Request shutdown; `is_running` turns false immediately
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Daemon stop requested");
        }
        self.shutdown.send_replace(true);
    }

    pub fn status(&self) -> DaemonStatus {
        let started = *self
            .started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        DaemonStatus {
            running: self.is_running(),
            pid: std::process::id(),
            started_at: started.map(|(_, at)| at),
            uptime_secs: started.map(|(since, _)| since.elapsed().as_secs()).unwrap_or(0),
            instances_monitored: self.monitor.instances_monitored(),
            health_checks_performed: self.monitor.checks_performed(),
            reconciliations_performed: self.scheduler.run_count().unwrap_or_else(|e| {
                warn!("Could not read reconcile run count: {}", e);
                0
            }),
        }
    }

    /// Run both schedules until `stop` is called
    pub async fn run(&self) -> crate::error::Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            info!("Daemon stopped before it started");
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        *self
            .started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((Instant::now(), Utc::now()));

        info!(
            pid = std::process::id(),
            health_interval = ?self.health_interval,
            reconcile_interval = ?self.reconcile_interval,
            "Daemon started"
        );

        // A pass still running when stop arrives is left behind here
        let mut in_flight = self
            .await_pass("stale cleanup", self.spawn_stale_cleanup(), &mut shutdown_rx)
            .await;

        let mut next_health = tokio::time::Instant::now();
        let mut next_reconcile = tokio::time::Instant::now();

        while in_flight.is_none() && self.is_running() {
            let now = tokio::time::Instant::now();
            if now >= next_health {
                in_flight = self
                    .await_pass("health", self.spawn_health_pass(), &mut shutdown_rx)
                    .await;
                if in_flight.is_some() {
                    break;
                }
                next_health = tokio::time::Instant::now() + self.health_interval;
            }
            if self.is_running() && now >= next_reconcile {
                in_flight = self
                    .await_pass("reconcile", self.spawn_reconcile_pass(), &mut shutdown_rx)
                    .await;
                if in_flight.is_some() {
                    break;
                }
                next_reconcile = tokio::time::Instant::now() + self.reconcile_interval;
            }
            self.write_status();

            let wake = next_health.min(next_reconcile);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        let drain = async {
            self.run_shutdown_callbacks().await;
            if let Some(pass) = in_flight {
                if let Err(e) = pass.await {
                    error!("Interrupted pass panicked: {}", e);
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!(
                "Shutdown exceeded {:?}, abandoning in-flight work",
                self.shutdown_timeout
            );
        }
        self.write_status();
        info!("Daemon stopped");
        Ok(())
    }

    /// Wait for a pass, or hand it back unfinished once stop is requested
    async fn await_pass(
        &self,
        pass: &'static str,
        mut handle: JoinHandle<()>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let interrupted = tokio::select! {
            joined = &mut handle => {
                if let Err(e) = joined {
                    error!("{} pass panicked: {}", pass, e);
                }
                false
            }
            _ = stop_requested(shutdown_rx) => true,
        };
        if !interrupted {
            return None;
        }
        warn!("Stop requested during {} pass, not waiting for it", pass);
        Some(handle)
    }

    /// Clear rows left active by a daemon or command that died
    fn spawn_stale_cleanup(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = engine
                .validator()
                .cleanup_stale_runtime(engine.store(), engine.locks())
            {
                warn!("Stale runtime cleanup failed: {}", e);
            }
        })
    }

    fn spawn_health_pass(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let monitor = Arc::clone(&self.monitor);
        tokio::task::spawn_blocking(move || {
            for (name, status) in engine.supervisor().reap_exited() {
                info!(instance = %name, "Child exited with {}", status);
            }
            let reports = match monitor.run_checks() {
                Ok(reports) => reports,
                Err(e) => {
                    error!("Health pass failed: {}", e);
                    return;
                }
            };
            for report in reports {
                match report.action {
                    HealthAction::None | HealthAction::Muted => {}
                    HealthAction::Failed(ref reason) => {
                        warn!(instance = %report.name, "Health action failed: {}", reason)
                    }
                    ref action => {
                        debug!(instance = %report.name, ?action, "Health action taken")
                    }
                }
            }
        })
    }

    fn spawn_reconcile_pass(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let scheduler = Arc::clone(&self.scheduler);
        tokio::task::spawn_blocking(move || {
            let detect_orphans = engine.settings().detect_orphans;
            match scheduler.run(true, detect_orphans) {
                Ok(Some(report)) => {
                    if report.actions_taken > 0 || !report.orphans.is_empty() {
                        info!(
                            checked = report.total_checked,
                            actions = report.actions_taken,
                            orphans = report.orphans.len(),
                            "Reconcile pass complete"
                        );
                    }
                }
                Ok(None) => debug!("Reconcile pass skipped"),
                Err(e) => error!("Reconcile pass failed: {}", e),
            }
            maintain(&engine);
        })
    }

    async fn run_shutdown_callbacks(&self) {
        let callbacks: Vec<ShutdownCallback> = std::mem::take(
            &mut *self
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if callbacks.is_empty() {
            return;
        }

        let count = callbacks.len();
        let task = tokio::task::spawn_blocking(move || {
            for callback in callbacks {
                callback();
            }
        });
        match task.await {
            Ok(()) => debug!("Ran {} shutdown callback(s)", count),
            Err(e) => error!("Shutdown callback panicked: {}", e),
        }
    }

    fn write_status(&self) {
        let path = self.engine.settings().get_daemon_status_path();
        let result = serde_json::to_string_pretty(&self.status())
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(&path, json));
        if let Err(e) = result {
            warn!("Failed to write daemon status to {:?}: {}", path, e);
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone
async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Log truncation and event pruning run alongside reconciliation
fn maintain(engine: &Engine) {
    match engine.store().list_runtime() {
        Ok(states) => {
            for state in states.iter().filter(|s| s.status.is_active()) {
                if let Err(e) = engine.supervisor().rotator().copy_truncate_if_needed(&state.name) {
                    warn!(instance = %state.name, "Log rotation failed: {}", e);
                }
            }
        }
        Err(e) => warn!("Could not list runtime state for log rotation: {}", e),
    }

    match engine
        .store()
        .prune_events(engine.settings().event_retention_days)
    {
        Ok(0) => {}
        Ok(pruned) => info!("Pruned {} old event(s)", pruned),
        Err(e) => warn!("Event pruning failed: {}", e),
    }
}
