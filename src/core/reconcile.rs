//! Reconciliation of persisted runtime state with the OS process table

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::ConfigStore;
use super::instance::{event_types, InstanceStatus};
use super::lock::LockManager;
use super::validator::{OrphanProcess, ProcessCheck, ProcessValidator};
use crate::error::{ConfigError, EngineError, Result};
use crate::persistence::StateStore;

/// Corrective action taken for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    None,
    MarkedStopped,
    MarkedError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub name: String,
    pub action: ReconcileAction,
    pub message: String,
}

impl ReconcileOutcome {
    fn new(name: &str, action: ReconcileAction, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            action,
            message: message.into(),
        }
    }
}

/// Summary of one `reconcile_all` pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub total_checked: usize,
    pub actions_taken: usize,
    pub stopped_count: usize,
    pub error_count: usize,
    /// Stopped rows removed because their configuration is gone
    pub purged_count: usize,
    /// Instances that could not be reconciled this pass
    pub failed_count: usize,
    pub orphans: Vec<OrphanProcess>,
    pub outcomes: Vec<ReconcileOutcome>,
}

/// Corrects drift between runtime rows and reality
pub struct Reconciler {
    store: Arc<StateStore>,
    locks: Arc<LockManager>,
    validator: Arc<ProcessValidator>,
    configs: Arc<dyn ConfigStore>,
    lock_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<StateStore>,
        locks: Arc<LockManager>,
        validator: Arc<ProcessValidator>,
        configs: Arc<dyn ConfigStore>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            validator,
            configs,
            lock_timeout,
        }
    }

    /// Bring one instance's row in line with what the OS reports
    pub fn reconcile_instance(&self, name: &str, auto_cleanup: bool) -> Result<ReconcileOutcome> {
        // Unlocked pre-check keeps idle instances free of lock traffic
        match self.store.get_runtime(name)? {
            None => return Ok(ReconcileOutcome::new(name, ReconcileAction::None, "no runtime state")),
            Some(state) if state.status == InstanceStatus::Stopped => {
                return Ok(ReconcileOutcome::new(name, ReconcileAction::None, "already stopped"))
            }
            Some(_) => {}
        }

        let _guard = self
            .locks
            .acquire_with_timeout(name, "reconcile", self.lock_timeout)?;
        let Some(mut state) = self.store.get_runtime(name)? else {
            return Ok(ReconcileOutcome::new(name, ReconcileAction::None, "no runtime state"));
        };

        match state.status {
            InstanceStatus::Stopped => Ok(ReconcileOutcome::new(name, ReconcileAction::None, "already stopped")),
            InstanceStatus::Error => Ok(ReconcileOutcome::new(
                name,
                ReconcileAction::None,
                format!(
                    "in error state: {}",
                    state.last_error.as_deref().unwrap_or("unknown")
                ),
            )),
            InstanceStatus::Starting | InstanceStatus::Running | InstanceStatus::Stopping => {
                let Some(pid) = state.pid else {
                    let reason = format!("{} without a recorded pid", state.status);
                    state.mark_error(reason.clone());
                    self.store
                        .save_runtime(&state, event_types::INCONSISTENT, Some(&reason))?;
                    warn!(instance = name, "{}", reason);
                    return Ok(ReconcileOutcome::new(name, ReconcileAction::MarkedError, reason));
                };

                match self.validator.validate_process(pid, state.signature) {
                    ProcessCheck::Alive => {
                        self.store.update_runtime_seen(name)?;
                        Ok(ReconcileOutcome::new(name, ReconcileAction::None, format!("pid {} alive", pid)))
                    }
                    check @ (ProcessCheck::Missing | ProcessCheck::Zombie) => {
                        let message = match check {
                            ProcessCheck::Zombie => format!("pid {} exited (zombie)", pid),
                            _ => format!("pid {} not found", pid),
                        };
                        if !auto_cleanup {
                            return Ok(ReconcileOutcome::new(
                                name,
                                ReconcileAction::None,
                                format!("{}; cleanup disabled", message),
                            ));
                        }
                        state.mark_stopped();
                        self.store
                            .save_runtime(&state, event_types::PROCESS_MISSING, Some(&message))?;
                        info!(instance = name, "Marked stopped: {}", message);
                        Ok(ReconcileOutcome::new(name, ReconcileAction::MarkedStopped, message))
                    }
                    ProcessCheck::PidReused => {
                        let message = format!("pid {} now belongs to another process", pid);
                        if !auto_cleanup {
                            return Ok(ReconcileOutcome::new(
                                name,
                                ReconcileAction::None,
                                format!("{}; cleanup disabled", message),
                            ));
                        }
                        state.mark_error(message.clone());
                        self.store
                            .save_runtime(&state, event_types::PID_REUSED, Some(&message))?;
                        warn!(instance = name, "Marked error: {}", message);
                        Ok(ReconcileOutcome::new(name, ReconcileAction::MarkedError, message))
                    }
                }
            }
        }
    }

    /// Reconcile every runtime row, optionally reporting orphan processes
    pub fn reconcile_all(&self, auto_cleanup: bool, detect_orphans: bool) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let rows = self.store.list_runtime()?;

        for state in &rows {
            report.total_checked += 1;
            match self.reconcile_instance(&state.name, auto_cleanup) {
                Ok(outcome) => {
                    match outcome.action {
                        ReconcileAction::None => {}
                        ReconcileAction::MarkedStopped => report.stopped_count += 1,
                        ReconcileAction::MarkedError => report.error_count += 1,
                    }
                    if outcome.action != ReconcileAction::None {
                        report.actions_taken += 1;
                    }
                    report.outcomes.push(outcome);
                }
                Err(e) => {
                    report.failed_count += 1;
                    self.record_failure(&state.name, &e);
                }
            }
        }

        if auto_cleanup {
            for state in &rows {
                match self.purge_if_unconfigured(&state.name) {
                    Ok(true) => report.purged_count += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failed_count += 1;
                        self.record_failure(&state.name, &e);
                    }
                }
            }
        }

        if detect_orphans {
            let known: HashSet<u32> = self
                .store
                .list_runtime()?
                .iter()
                .filter_map(|s| s.pid)
                .collect();
            report.orphans = self.validator.find_orphaned_processes(&known);
            report.total_checked += report.orphans.len();
            for orphan in &report.orphans {
                warn!(pid = orphan.pid, name = %orphan.name, "Orphaned process of the managed executable");
            }
        }

        debug!(
            checked = report.total_checked,
            actions = report.actions_taken,
            "Reconcile pass finished"
        );
        Ok(report)
    }

    /// Delete a Stopped row whose configuration no longer exists
    fn purge_if_unconfigured(&self, name: &str) -> Result<bool> {
        match self.configs.get_instance_config(name) {
            Ok(_) => return Ok(false),
            Err(ConfigError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let _guard = self
            .locks
            .acquire_with_timeout(name, "orphan_cleanup", self.lock_timeout)?;
        match self.store.get_runtime(name)? {
            Some(state) if state.status == InstanceStatus::Stopped => {
                let removed = self.store.delete_runtime(
                    name,
                    event_types::ORPHAN_CLEANUP,
                    Some("configuration removed"),
                )?;
                if removed {
                    info!(instance = name, "Removed runtime state of unconfigured instance");
                }
                Ok(removed)
            }
            _ => Ok(false),
        }
    }

    /// Per-instance failures never abort a pass
    fn record_failure(&self, name: &str, error: &EngineError) {
        warn!(instance = name, "Reconcile failed: {}", error);
        if error.is_transient() {
            return;
        }
        if let Err(e) = self
            .store
            .log_event(name, event_types::ERROR, Some(&format!("reconcile: {}", error)))
        {
            warn!(instance = name, "Could not log error event: {}", e);
        }
    }
}

/// Job name under which full passes are recorded in the state store
const RECONCILE_JOB: &str = "reconcile";

/// Rate-limits `reconcile_all` and counts completed runs
///
/// The last start time and the count are kept in the state store, so the
/// daemon and one-off commands share one limit.
pub struct ReconcileScheduler {
    reconciler: Arc<Reconciler>,
    store: Arc<StateStore>,
    min_interval: Duration,
}

impl ReconcileScheduler {
    pub fn new(reconciler: Arc<Reconciler>, store: Arc<StateStore>, min_interval: Duration) -> Self {
        Self {
            reconciler,
            store,
            min_interval,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Run a pass unless one ran within the minimum interval; `None` when skipped
    pub fn run(&self, auto_cleanup: bool, detect_orphans: bool) -> Result<Option<ReconcileReport>> {
        self.run_within(self.min_interval, auto_cleanup, detect_orphans)
    }

    /// Run a pass regardless of the limit; it still counts as the latest run
    pub fn run_now(&self, auto_cleanup: bool, detect_orphans: bool) -> Result<ReconcileReport> {
        self.run_within(Duration::ZERO, auto_cleanup, detect_orphans)?
            .ok_or_else(|| EngineError::StoreUnavailable("reconcile run was not claimed".to_string()))
    }

    fn run_within(
        &self,
        min_interval: Duration,
        auto_cleanup: bool,
        detect_orphans: bool,
    ) -> Result<Option<ReconcileReport>> {
        if !self.store.claim_scheduled_run(RECONCILE_JOB, min_interval)? {
            debug!("Skipping reconcile, last run within {:?}", min_interval);
            return Ok(None);
        }

        let report = self.reconciler.reconcile_all(auto_cleanup, detect_orphans)?;
        self.store.complete_scheduled_run(RECONCILE_JOB)?;
        Ok(Some(report))
    }

    /// Completed passes across every process sharing the store
    pub fn run_count(&self) -> Result<u64> {
        Ok(self.store.scheduled_run_info(RECONCILE_JOB)?.0)
    }

    /// Start time of the most recent pass
    pub fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.store.scheduled_run_info(RECONCILE_JOB)?.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StaticConfigStore;
    use crate::core::{InstanceConfig, RuntimeState};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        locks: Arc<LockManager>,
        reconciler: Arc<Reconciler>,
    }

    fn fixture(configured: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.initialize().unwrap();
        let locks = Arc::new(
            LockManager::new(
                dir.path(),
                Duration::from_secs(1),
                Duration::from_millis(10),
                Duration::from_secs(300),
            )
            .unwrap(),
        );
        let configs: Arc<dyn ConfigStore> = Arc::new(
            StaticConfigStore::new(
                configured
                    .iter()
                    .enumerate()
                    .map(|(i, name)| InstanceConfig::new(*name, "m", 9000 + i as u16))
                    .collect(),
            )
            .unwrap(),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::new(ProcessValidator::new(None)),
            configs,
            Duration::from_secs(1),
        ));
        Fixture {
            _dir: dir,
            store,
            locks,
            reconciler,
        }
    }

    fn running(store: &StateStore, name: &str, pid: u32, signature: Option<u64>) {
        let mut state = RuntimeState::new(name);
        state.mark_starting(pid, 9000, signature);
        state.mark_running();
        store.save_runtime(&state, event_types::RUNNING, None).unwrap();
    }

    #[test]
    fn missing_row_and_stopped_row_need_nothing() {
        let f = fixture(&["demo"]);
        let outcome = f.reconciler.reconcile_instance("demo", true).unwrap();
        assert_eq!(outcome.action, ReconcileAction::None);
        assert_eq!(outcome.message, "no runtime state");

        f.store
            .save_runtime(&RuntimeState::new("demo"), event_types::STOPPED, None)
            .unwrap();
        let outcome = f.reconciler.reconcile_instance("demo", true).unwrap();
        assert_eq!(outcome.action, ReconcileAction::None);
        assert_eq!(outcome.message, "already stopped");
    }

    #[test]
    fn never_spawned_pid_is_marked_stopped() {
        let f = fixture(&["demo"]);
        running(&f.store, "demo", 999_999_999, None);

        let outcome = f.reconciler.reconcile_instance("demo", true).unwrap();
        assert_eq!(outcome.action, ReconcileAction::MarkedStopped);

        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.status, InstanceStatus::Stopped);
        assert_eq!(state.pid, None);

        let missing = f
            .store
            .get_recent_events(Some("demo"), 10)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == event_types::PROCESS_MISSING)
            .count();
        assert_eq!(missing, 1);
        assert!(!f.locks.is_locked("demo"));
    }

    #[test]
    fn cleanup_disabled_leaves_row_alone() {
        let f = fixture(&["demo"]);
        running(&f.store, "demo", 999_999_999, None);

        let outcome = f.reconciler.reconcile_instance("demo", false).unwrap();
        assert_eq!(outcome.action, ReconcileAction::None);
        assert!(outcome.message.contains("cleanup disabled"));
        assert_eq!(
            f.store.get_runtime("demo").unwrap().unwrap().status,
            InstanceStatus::Running
        );
    }

    #[test]
    fn reused_pid_is_marked_error() {
        let f = fixture(&["demo"]);
        running(&f.store, "demo", std::process::id(), Some(1));

        let outcome = f.reconciler.reconcile_instance("demo", true).unwrap();
        assert_eq!(outcome.action, ReconcileAction::MarkedError);
        assert_eq!(
            f.store.get_runtime("demo").unwrap().unwrap().status,
            InstanceStatus::Error
        );
    }

    #[test]
    fn active_row_without_pid_is_inconsistent() {
        let f = fixture(&["demo"]);
        let mut state = RuntimeState::new("demo");
        state.status = InstanceStatus::Running;
        f.store.save_runtime(&state, event_types::RUNNING, None).unwrap();

        let outcome = f.reconciler.reconcile_instance("demo", true).unwrap();
        assert_eq!(outcome.action, ReconcileAction::MarkedError);
        let events = f.store.get_recent_events(Some("demo"), 1).unwrap();
        assert_eq!(events[0].event_type, event_types::INCONSISTENT);
    }

    #[test]
    fn live_process_gets_heartbeat_only() {
        let f = fixture(&["demo"]);
        running(&f.store, "demo", std::process::id(), None);
        let events_before = f.store.get_recent_events(Some("demo"), 10).unwrap().len();

        let outcome = f.reconciler.reconcile_instance("demo", true).unwrap();
        assert_eq!(outcome.action, ReconcileAction::None);
        assert_eq!(
            f.store.get_recent_events(Some("demo"), 10).unwrap().len(),
            events_before
        );
    }

    #[test]
    fn reconcile_all_tallies_and_purges_unconfigured() {
        let f = fixture(&["dead", "idle"]);
        running(&f.store, "dead", 999_999_999, None);
        f.store
            .save_runtime(&RuntimeState::new("idle"), event_types::STOPPED, None)
            .unwrap();
        f.store
            .save_runtime(&RuntimeState::new("removed"), event_types::STOPPED, None)
            .unwrap();

        let report = f.reconciler.reconcile_all(true, false).unwrap();
        assert_eq!(report.total_checked, 3);
        assert_eq!(report.actions_taken, 1);
        assert_eq!(report.stopped_count, 1);
        assert_eq!(report.error_count, 0);
        assert_eq!(report.purged_count, 1);
        assert!(f.store.get_runtime("removed").unwrap().is_none());
        assert!(f.store.get_runtime("idle").unwrap().is_some());
    }

    #[test]
    fn error_row_is_left_alone() {
        let f = fixture(&["demo"]);
        let mut state = RuntimeState::new("demo");
        state.mark_error("crashed on load");
        f.store.save_runtime(&state, event_types::ERROR, None).unwrap();
        let events_before = f.store.get_recent_events(Some("demo"), 10).unwrap().len();

        let outcome = f.reconciler.reconcile_instance("demo", true).unwrap();
        assert_eq!(outcome.action, ReconcileAction::None);
        assert_eq!(outcome.message, "in error state: crashed on load");

        let after = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Error);
        assert_eq!(after.pid, None);
        assert_eq!(
            f.store.get_recent_events(Some("demo"), 10).unwrap().len(),
            events_before
        );
    }

    #[test]
    fn scheduler_enforces_min_interval() {
        let f = fixture(&[]);
        let hour = Duration::from_secs(3600);
        let scheduler = ReconcileScheduler::new(Arc::clone(&f.reconciler), Arc::clone(&f.store), hour);

        assert!(scheduler.run(true, false).unwrap().is_some());
        assert!(scheduler.run(true, false).unwrap().is_none());
        assert_eq!(scheduler.run_count().unwrap(), 1);
        assert!(scheduler.last_run().unwrap().is_some());

        let eager = ReconcileScheduler::new(Arc::clone(&f.reconciler), Arc::clone(&f.store), Duration::ZERO);
        eager.run(true, false).unwrap();
        eager.run(true, false).unwrap();
        assert_eq!(eager.run_count().unwrap(), 3);
    }

    #[test]
    fn schedulers_on_one_store_share_the_limit() {
        let f = fixture(&[]);
        let hour = Duration::from_secs(3600);
        let daemon = ReconcileScheduler::new(Arc::clone(&f.reconciler), Arc::clone(&f.store), hour);
        let command = ReconcileScheduler::new(Arc::clone(&f.reconciler), Arc::clone(&f.store), hour);

        assert!(daemon.run(true, false).unwrap().is_some());
        assert!(command.run(true, false).unwrap().is_none());
        assert_eq!(command.run_count().unwrap(), 1);
        assert_eq!(daemon.last_run().unwrap(), command.last_run().unwrap());

        // A forced pass still counts and resets the window for everyone
        command.run_now(true, false).unwrap();
        assert_eq!(daemon.run_count().unwrap(), 2);
        assert!(daemon.run(true, false).unwrap().is_none());
    }
}
