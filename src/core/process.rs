//! Process supervision - Spawning, stopping and restarting instances
//!
//! Every transition here runs under the instance lock and is persisted with
//! exactly one event, so commands and the daemon serialize on the same path.

use std::collections::HashMap;
use std::fs::File;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::backoff::BackoffCalculator;
use super::config::{ConfigStore, LaunchCommand, LaunchResolver};
use super::instance::{event_types, HealthStatus, InstanceStatus, RuntimeState};
use super::lock::{InstanceLock, LockManager};
use super::logs::LogRotator;
use super::ports::PortAllocator;
use super::settings::EngineSettings;
use super::validator::{ProcessCheck, ProcessValidator};
use crate::error::{EngineError, Result};
use crate::persistence::StateStore;
use crate::platform;

/// Poll interval while waiting for a process to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait after SIGKILL before giving up
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Spawns and controls instance processes
pub struct ProcessSupervisor {
    store: Arc<StateStore>,
    locks: Arc<LockManager>,
    configs: Arc<dyn ConfigStore>,
    launcher: Arc<dyn LaunchResolver>,
    validator: Arc<ProcessValidator>,
    ports: PortAllocator,
    rotator: LogRotator,
    grace_period: Duration,
    spawn_check_delay: Duration,
    daemon_lock_timeout: Duration,
    /// Children spawned by this process, kept so they can be reaped
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessSupervisor {
    pub fn new(
        store: Arc<StateStore>,
        locks: Arc<LockManager>,
        configs: Arc<dyn ConfigStore>,
        launcher: Arc<dyn LaunchResolver>,
        validator: Arc<ProcessValidator>,
        settings: &EngineSettings,
    ) -> Self {
        let ports = PortAllocator::new(
            Arc::clone(&store),
            Arc::clone(&configs),
            settings.port_range(),
        );
        Self {
            store,
            locks,
            configs,
            launcher,
            validator,
            ports,
            rotator: LogRotator::from_settings(settings),
            grace_period: settings.stop_grace_period(),
            spawn_check_delay: settings.spawn_check_delay(),
            daemon_lock_timeout: settings.daemon_lock_timeout(),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn rotator(&self) -> &LogRotator {
        &self.rotator
    }

    fn children(&self) -> MutexGuard<'_, HashMap<String, Child>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self, name: &str, operation: &str) -> Result<InstanceLock<'_>> {
        self.locks.acquire(name, operation)
    }

    /// Short lock wait used by the daemon, which would rather skip a tick
    fn daemon_lock(&self, name: &str, operation: &str) -> Result<InstanceLock<'_>> {
        self.locks
            .acquire_with_timeout(name, operation, self.daemon_lock_timeout)
    }

    // === Start ===

    /// Start an instance; an explicit start resets its restart budget
    pub fn start_instance(&self, name: &str) -> Result<RuntimeState> {
        let _guard = self.lock(name, "start")?;
        self.start_locked(name, true)
    }

    fn start_locked(&self, name: &str, reset_restarts: bool) -> Result<RuntimeState> {
        let config = self.configs.get_instance_config(name)?;
        let mut state = self
            .store
            .get_runtime(name)?
            .unwrap_or_else(|| RuntimeState::new(name));

        if !state.status.can_start() {
            return Err(EngineError::DuplicateStart {
                name: name.to_string(),
                status: state.status,
                pid: state.pid,
            });
        }

        let check = self.ports.validate_port_for_instance(config.port, name)?;
        if !check.valid {
            return Err(EngineError::PortUnavailable {
                name: name.to_string(),
                port: config.port,
                reason: check.message,
            });
        }

        let command = match self.launcher.build_command(&config) {
            Ok(command) => command,
            Err(e) => {
                state.mark_error(e.to_string());
                self.store
                    .save_runtime(&state, event_types::SPAWN_FAILED, Some(&e.to_string()))?;
                return Err(e.into());
            }
        };

        info!(
            instance = name,
            program = ?command.program,
            port = config.port,
            "Spawning instance"
        );
        let child = match self.spawn(name, &command) {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("failed to spawn {:?}: {}", command.program, e);
                error!(instance = name, "{}", reason);
                state.mark_error(reason.clone());
                self.store
                    .save_runtime(&state, event_types::SPAWN_FAILED, Some(&reason))?;
                return Err(EngineError::process(name, reason));
            }
        };

        let pid = child.id();
        if reset_restarts {
            state.restart_count = 0;
        }
        state.mark_starting(pid, config.port, self.validator.capture_signature(pid));
        self.children().insert(name.to_string(), child);

        if let Err(e) =
            self.store
                .save_runtime(&state, event_types::STARTING, Some(&format!("pid {}", pid)))
        {
            // Never leave a process running that no row records
            warn!(instance = name, pid, "Could not record start, killing process");
            let _ = platform::kill_process(pid);
            self.wait_for_exit(name, pid, KILL_WAIT);
            return Err(e);
        }

        std::thread::sleep(self.spawn_check_delay);
        if let Some(status) = self.reap(name) {
            let reason = format!("exited during startup with {}", status);
            warn!(instance = name, pid, "{}", reason);
            state.mark_error(reason.clone());
            self.store
                .save_runtime(&state, event_types::EXITED, Some(&reason))?;
            return Err(EngineError::process(name, reason));
        }

        state.mark_running();
        self.store
            .save_runtime(&state, event_types::RUNNING, Some(&format!("pid {}", pid)))?;
        info!(instance = name, pid, "Instance running");
        Ok(state)
    }

    fn spawn(&self, name: &str, command: &LaunchCommand) -> std::io::Result<Child> {
        let log: File = self.rotator.open_for_append(name)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&command.program);
        if let Some(ref work_dir) = command.working_directory {
            cmd.current_dir(work_dir);
        }
        cmd.args(&command.args);
        for (key, value) in &command.environment {
            cmd.env(key, value);
        }

        // Detach from our session so the instance outlives the command
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
    }

    // === Stop ===

    /// Stop an instance, escalating to SIGKILL after the grace period
    pub fn stop_instance(&self, name: &str, grace_period: Option<Duration>) -> Result<RuntimeState> {
        let _guard = self.lock(name, "stop")?;
        self.stop_locked(name, grace_period.unwrap_or(self.grace_period))
    }

    fn stop_locked(&self, name: &str, grace_period: Duration) -> Result<RuntimeState> {
        let mut state = self
            .store
            .get_runtime(name)?
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;

        if state.status == InstanceStatus::Stopped {
            debug!(instance = name, "Already stopped");
            return Ok(state);
        }

        let detail = match state.pid {
            Some(pid) => {
                let signature = state.signature;
                state.mark_stopping();
                self.store
                    .save_runtime(&state, event_types::STOPPING, Some(&format!("pid {}", pid)))?;
                self.terminate(name, pid, signature, grace_period)
            }
            None => "no process recorded".to_string(),
        };

        state.mark_stopped();
        self.store
            .save_runtime(&state, event_types::STOPPED, Some(&detail))?;
        self.release_child(name);
        info!(instance = name, "Instance stopped: {}", detail);
        Ok(state)
    }

    /// Signal `pid` and wait for it; returns a description of what happened
    fn terminate(
        &self,
        name: &str,
        pid: u32,
        signature: Option<u64>,
        grace_period: Duration,
    ) -> String {
        match self.validator.validate_process(pid, signature) {
            ProcessCheck::Alive => {}
            ProcessCheck::Missing | ProcessCheck::Zombie => {
                self.reap(name);
                return format!("pid {} had already exited", pid);
            }
            ProcessCheck::PidReused => {
                warn!(instance = name, pid, "Pid now belongs to another process, not signalling");
                return format!("pid {} was reused, not signalled", pid);
            }
        }

        if let Err(e) = platform::terminate_process(pid) {
            warn!(instance = name, pid, "SIGTERM failed: {}", e);
        }
        if self.wait_for_exit(name, pid, grace_period) {
            return format!("pid {} terminated", pid);
        }

        warn!(
            instance = name,
            pid,
            "Still alive after {:?}, sending SIGKILL",
            grace_period
        );
        if let Err(e) = platform::kill_process(pid) {
            warn!(instance = name, pid, "SIGKILL failed: {}", e);
        }
        if self.wait_for_exit(name, pid, KILL_WAIT) {
            format!("pid {} killed", pid)
        } else {
            error!(instance = name, pid, "Process survived SIGKILL");
            format!("pid {} did not exit after SIGKILL", pid)
        }
    }

    /// Poll until `pid` is gone or `timeout` passes
    ///
    /// Our own child only counts as gone once its exit status is collected,
    /// so a stopped instance never lingers as a zombie.
    fn wait_for_exit(&self, name: &str, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reap(name).is_some() {
                return true;
            }
            let owned = self.children().contains_key(name);
            if !owned && !self.validator.validate_process(pid, None).is_alive() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Collect the exit status of our child for `name`, if it has exited
    fn reap(&self, name: &str) -> Option<ExitStatus> {
        let mut children = self.children();
        let child = children.get_mut(name)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                children.remove(name);
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(instance = name, "Error checking child status: {}", e);
                None
            }
        }
    }

    /// Forget our child for `name` once it has exited
    fn release_child(&self, name: &str) {
        let mut children = self.children();
        let Some(child) = children.get_mut(name) else {
            return;
        };
        match child.try_wait() {
            Ok(Some(_)) => {
                children.remove(name);
            }
            Ok(None) => {
                warn!(
                    instance = name,
                    pid = child.id(),
                    "Child still running, keeping it for a later reap"
                );
            }
            Err(e) => {
                warn!(instance = name, "Error checking child status: {}", e);
                children.remove(name);
            }
        }
    }

    /// Reap every exited child; returns the names that exited
    pub fn reap_exited(&self) -> Vec<(String, ExitStatus)> {
        let mut children = self.children();
        let mut exited = Vec::new();
        children.retain(|name, child| match child.try_wait() {
            Ok(Some(status)) => {
                exited.push((name.clone(), status));
                false
            }
            _ => true,
        });
        exited
    }

    // === Restart ===

    /// Backoff owed before the next restart of `name`
    ///
    /// Fails with `RestartLimitExceeded` once the budget is spent.
    pub fn restart_delay(&self, name: &str) -> Result<Duration> {
        let config = self.configs.get_instance_config(name)?;
        let attempt = self.restart_attempt(name, config.restart_policy.max_retries)?;
        Ok(BackoffCalculator::from_policy(&config.restart_policy).delay(attempt))
    }

    fn restart_attempt(&self, name: &str, max_retries: u32) -> Result<u32> {
        let attempt = self
            .store
            .get_runtime(name)?
            .map(|s| s.restart_count)
            .unwrap_or(0);
        if attempt >= max_retries {
            return Err(EngineError::RestartLimitExceeded {
                name: name.to_string(),
                max_retries,
            });
        }
        Ok(attempt)
    }

    /// Wait out the backoff, then stop and start the instance
    ///
    /// The instance lock is only taken after the backoff, so other commands
    /// are not blocked while we wait. If the instance changed state during
    /// the wait the restart is abandoned.
    pub fn restart_instance(&self, name: &str) -> Result<RuntimeState> {
        let before = self.store.get_runtime(name)?.map(|s| (s.status, s.pid));
        let delay = self.restart_delay(name)?;
        info!(instance = name, ?delay, "Restarting instance after backoff");
        std::thread::sleep(delay);

        let _guard = self.lock(name, "restart")?;
        let now = self.store.get_runtime(name)?.map(|s| (s.status, s.pid));
        if now != before {
            return Err(EngineError::process(
                name,
                "state changed during restart backoff, restart abandoned",
            ));
        }
        self.restart_locked(name)
    }

    /// Restart `name` now if it is still running as `pid`
    ///
    /// Used by the health monitor once a scheduled backoff has elapsed;
    /// returns `None` when the instance was stopped or restarted meanwhile.
    pub fn restart_running(&self, name: &str, pid: u32) -> Result<Option<RuntimeState>> {
        let _guard = self.lock(name, "restart")?;
        match self.store.get_runtime(name)? {
            Some(state) if state.status == InstanceStatus::Running && state.pid == Some(pid) => {
                self.restart_locked(name).map(Some)
            }
            _ => {
                debug!(instance = name, pid, "Restart superseded, skipping");
                Ok(None)
            }
        }
    }

    fn restart_locked(&self, name: &str) -> Result<RuntimeState> {
        let config = self.configs.get_instance_config(name)?;
        let attempt = self.restart_attempt(name, config.restart_policy.max_retries)?;

        if self.store.get_runtime(name)?.is_some() {
            self.stop_locked(name, self.grace_period)?;
        }
        info!(instance = name, attempt = attempt + 1, "Restarting instance");

        let started = self.start_locked(name, false);
        let mut state = match self.store.get_runtime(name)? {
            Some(state) => state,
            None => return started,
        };
        state.restart_count = attempt + 1;
        let detail = match &started {
            Ok(_) => format!("attempt {}", attempt + 1),
            Err(e) => format!("attempt {} failed: {}", attempt + 1, e),
        };
        self.store
            .save_runtime(&state, event_types::RESTARTED, Some(&detail))?;
        started.map(|_| state)
    }

    // === Daemon transitions ===

    /// Record a probe outcome; only a change of health is a transition
    pub fn record_health(
        &self,
        name: &str,
        health: HealthStatus,
        detail: Option<&str>,
    ) -> Result<Option<RuntimeState>> {
        let _guard = self.daemon_lock(name, "health")?;
        let Some(mut state) = self.store.get_runtime(name)? else {
            return Ok(None);
        };
        if state.status != InstanceStatus::Running {
            return Ok(None);
        }

        if state.health == health {
            self.store.update_runtime_seen(name)?;
        } else {
            debug!(instance = name, from = %state.health, to = %health, "Health changed");
            state.set_health(health);
            let detail = match detail {
                Some(d) => format!("{}: {}", health, d),
                None => health.to_string(),
            };
            self.store
                .save_runtime(&state, event_types::HEALTH, Some(&detail))?;
        }
        Ok(Some(state))
    }

    /// Stop the process (if any) and leave the instance in Error
    pub fn mark_error(&self, name: &str, reason: &str) -> Result<RuntimeState> {
        let _guard = self.lock(name, "mark_error")?;
        let mut state = self
            .store
            .get_runtime(name)?
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;

        if let Some(pid) = state.pid {
            self.terminate(name, pid, state.signature, self.grace_period);
            self.release_child(name);
        }
        state.mark_error(reason);
        self.store
            .save_runtime(&state, event_types::ERROR, Some(reason))?;
        warn!(instance = name, "Instance marked as error: {}", reason);
        Ok(state)
    }

    /// Delete the runtime row of an inactive instance
    pub fn purge_instance(&self, name: &str) -> Result<bool> {
        let _guard = self.lock(name, "purge")?;
        if let Some(state) = self.store.get_runtime(name)? {
            if state.status.is_active() {
                return Err(EngineError::process(
                    name,
                    format!("cannot purge while {}; stop it first", state.status),
                ));
            }
        }
        let removed = self
            .store
            .delete_runtime(name, event_types::PURGED, Some("explicit purge"))?;
        if removed {
            info!(instance = name, "Runtime state purged");
        }
        Ok(removed)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::config::{ServerLaunchResolver, StaticConfigStore};
    use crate::core::{InstanceConfig, RestartPolicy};
    use std::net::{Ipv4Addr, TcpListener};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        supervisor: ProcessSupervisor,
    }

    fn free_port() -> u16 {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn fixture(executable: &str, args: &[&str], configs: Vec<InstanceConfig>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings {
            data_directory: Some(dir.path().to_path_buf()),
            stop_grace_period_ms: 2_000,
            spawn_check_delay_ms: 100,
            ..Default::default()
        };
        let store = Arc::new(StateStore::open(&settings.get_database_path()).unwrap());
        store.initialize().unwrap();
        let locks = Arc::new(LockManager::from_settings(&settings).unwrap());
        let configs: Arc<dyn ConfigStore> = Arc::new(StaticConfigStore::new(configs).unwrap());
        let launcher: Arc<dyn LaunchResolver> = Arc::new(
            ServerLaunchResolver::new(executable)
                .with_args_template(args.iter().map(|s| s.to_string()).collect()),
        );
        let validator = Arc::new(ProcessValidator::new(None));
        let supervisor = ProcessSupervisor::new(
            Arc::clone(&store),
            locks,
            configs,
            launcher,
            validator,
            &settings,
        );
        Fixture {
            _dir: dir,
            store,
            supervisor,
        }
    }

    #[test]
    fn start_then_stop() {
        let f = fixture("sleep", &["30"], vec![InstanceConfig::new("demo", "m", free_port())]);

        let state = f.supervisor.start_instance("demo").unwrap();
        assert_eq!(state.status, InstanceStatus::Running);
        let pid = state.pid.unwrap();
        assert!(platform::is_process_running(pid));

        let stopped = f.supervisor.stop_instance("demo", None).unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert_eq!(stopped.pid, None);
        assert!(!platform::is_process_running(pid));

        let types: Vec<String> = f
            .store
            .get_recent_events(Some("demo"), 10)
            .unwrap()
            .into_iter()
            .rev()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["starting", "running", "stopping", "stopped"]);
    }

    #[test]
    fn second_start_is_refused() {
        let f = fixture("sleep", &["30"], vec![InstanceConfig::new("demo", "m", free_port())]);
        let first = f.supervisor.start_instance("demo").unwrap();

        match f.supervisor.start_instance("demo") {
            Err(EngineError::DuplicateStart { status, pid, .. }) => {
                assert_eq!(status, InstanceStatus::Running);
                assert_eq!(pid, first.pid);
            }
            other => panic!("expected DuplicateStart, got {:?}", other),
        }
        f.supervisor.stop_instance("demo", None).unwrap();
    }

    #[test]
    fn missing_executable_records_error() {
        let f = fixture(
            "/nonexistent/server",
            &[],
            vec![InstanceConfig::new("demo", "m", free_port())],
        );
        assert!(f.supervisor.start_instance("demo").is_err());
        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.status, InstanceStatus::Error);
        assert!(state.last_error.is_some());
    }

    #[test]
    fn immediate_exit_is_an_error() {
        let f = fixture("false", &[], vec![InstanceConfig::new("demo", "m", free_port())]);
        assert!(matches!(
            f.supervisor.start_instance("demo"),
            Err(EngineError::Process { .. })
        ));
        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.status, InstanceStatus::Error);
        assert_eq!(state.pid, None);
    }

    #[test]
    fn unknown_instance_is_config_error() {
        let f = fixture("sleep", &["30"], Vec::new());
        assert!(matches!(
            f.supervisor.start_instance("ghost"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn restart_counts_and_enforces_limit() {
        let policy = RestartPolicy {
            enabled: true,
            max_retries: 1,
            initial_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 50,
        };
        let config = InstanceConfig::new("demo", "m", free_port()).with_restart_policy(policy);
        let f = fixture("sleep", &["30"], vec![config]);

        let first = f.supervisor.start_instance("demo").unwrap();
        let restarted = f.supervisor.restart_instance("demo").unwrap();
        assert_eq!(restarted.restart_count, 1);
        assert_eq!(restarted.status, InstanceStatus::Running);
        assert_ne!(restarted.pid, first.pid);

        assert!(matches!(
            f.supervisor.restart_instance("demo"),
            Err(EngineError::RestartLimitExceeded { max_retries: 1, .. })
        ));

        f.supervisor.stop_instance("demo", None).unwrap();
        // An explicit start resets the budget
        let again = f.supervisor.start_instance("demo").unwrap();
        assert_eq!(again.restart_count, 0);
        f.supervisor.stop_instance("demo", None).unwrap();
    }

    #[test]
    fn repeated_stops_leave_no_zombies() {
        let f = fixture("sleep", &["30"], vec![InstanceConfig::new("demo", "m", free_port())]);

        for _ in 0..8 {
            let pid = f.supervisor.start_instance("demo").unwrap().pid.unwrap();
            f.supervisor
                .stop_instance("demo", Some(Duration::from_millis(500)))
                .unwrap();
            // kill(pid, 0) still succeeds for an unreaped child
            assert!(!platform::is_process_running(pid), "pid {} left behind", pid);
            assert!(f.supervisor.children().is_empty());
        }
    }

    #[test]
    fn stop_is_not_blocked_by_restart_backoff() {
        let policy = RestartPolicy {
            enabled: true,
            max_retries: 3,
            initial_delay_ms: 1_500,
            multiplier: 1.0,
            max_delay_ms: 1_500,
        };
        let config = InstanceConfig::new("demo", "m", free_port()).with_restart_policy(policy);
        let f = Arc::new(fixture("sleep", &["30"], vec![config]));
        let pid = f.supervisor.start_instance("demo").unwrap().pid.unwrap();

        let restarter = {
            let f = Arc::clone(&f);
            std::thread::spawn(move || f.supervisor.restart_instance("demo"))
        };
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        let stopped = f.supervisor.stop_instance("demo", None).unwrap();
        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert!(!platform::is_process_running(pid));

        // The restart notices the stop and leaves the instance alone
        assert!(restarter.join().unwrap().is_err());
        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.status, InstanceStatus::Stopped);
        assert_eq!(state.restart_count, 0);
    }

    #[test]
    fn restart_running_skips_a_replaced_pid() {
        let f = fixture("sleep", &["30"], vec![InstanceConfig::new("demo", "m", free_port())]);
        let pid = f.supervisor.start_instance("demo").unwrap().pid.unwrap();

        assert!(f.supervisor.restart_running("demo", pid + 1).unwrap().is_none());
        let restarted = f.supervisor.restart_running("demo", pid).unwrap().unwrap();
        assert_ne!(restarted.pid, Some(pid));
        assert_eq!(restarted.restart_count, 1);

        f.supervisor.stop_instance("demo", None).unwrap();
        assert!(f.supervisor.restart_running("demo", pid).unwrap().is_none());
    }

    #[test]
    fn health_changes_are_events_and_repeats_are_heartbeats() {
        let f = fixture("sleep", &["30"], vec![InstanceConfig::new("demo", "m", free_port())]);
        f.supervisor.start_instance("demo").unwrap();
        let before = f.store.get_recent_events(Some("demo"), 50).unwrap().len();

        f.supervisor
            .record_health("demo", HealthStatus::Healthy, None)
            .unwrap();
        f.supervisor
            .record_health("demo", HealthStatus::Healthy, None)
            .unwrap();
        let after = f.store.get_recent_events(Some("demo"), 50).unwrap().len();
        assert_eq!(after, before + 1);

        f.supervisor.stop_instance("demo", None).unwrap();
        assert!(f
            .supervisor
            .record_health("demo", HealthStatus::Healthy, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn purge_refuses_active_instance() {
        let f = fixture("sleep", &["30"], vec![InstanceConfig::new("demo", "m", free_port())]);
        f.supervisor.start_instance("demo").unwrap();
        assert!(f.supervisor.purge_instance("demo").is_err());

        f.supervisor.stop_instance("demo", None).unwrap();
        assert!(f.supervisor.purge_instance("demo").unwrap());
        assert!(f.store.get_runtime("demo").unwrap().is_none());
    }

    #[test]
    fn mark_error_kills_process() {
        let f = fixture("sleep", &["30"], vec![InstanceConfig::new("demo", "m", free_port())]);
        let pid = f.supervisor.start_instance("demo").unwrap().pid.unwrap();

        let state = f.supervisor.mark_error("demo", "probe budget exhausted").unwrap();
        assert_eq!(state.status, InstanceStatus::Error);
        assert!(!platform::is_process_running(pid));
    }
}
