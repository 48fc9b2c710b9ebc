//! Periodic health checks and the restart decisions they drive

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::probe::{probe_for, HealthProbe, ProbeResult, ProbeStatus, ProbeTarget};
use crate::core::backoff::BackoffCalculator;
use crate::core::config::ConfigStore;
use crate::core::instance::{
    event_types, HealthCheckConfig, HealthStatus, InstanceStatus, RestartPolicy,
};
use crate::core::process::ProcessSupervisor;
use crate::error::{EngineError, Result};
use crate::persistence::StateStore;

/// Delay before the first recheck after a failure
const RECHECK_BASE: Duration = Duration::from_secs(1);

/// What the monitor did after one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    /// Nothing beyond recording health
    None,
    /// Failure counted toward the retry budget
    Counted { failures: u32 },
    /// Failure inside the start period; recorded but not counted
    Muted,
    /// Threshold reached; a restart will run once the backoff elapses
    RestartScheduled { delay: Duration },
    Restarted,
    MarkedUnhealthy,
    /// Restart budget exhausted; instance stopped and left in Error
    MarkedError,
    /// The follow-up action itself failed
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct HealthCheckReport {
    pub name: String,
    /// `None` for a scheduled restart, which runs no check
    pub result: Option<ProbeResult>,
    pub action: HealthAction,
}

/// Per-instance failure bookkeeping, reset whenever the pid changes
struct Tracker {
    pid: Option<u32>,
    failures: u32,
    next_due: Instant,
    backoff: BackoffCalculator,
    /// Checks pause while a restart is pending
    restart_at: Option<Instant>,
}

impl Tracker {
    fn new(pid: Option<u32>, interval: Duration, now: Instant) -> Self {
        Self {
            pid,
            failures: 0,
            next_due: now,
            backoff: BackoffCalculator::new(RECHECK_BASE.min(interval), 2.0, interval),
            restart_at: None,
        }
    }
}

struct Job {
    name: String,
    target: ProbeTarget,
    healthcheck: HealthCheckConfig,
    policy: RestartPolicy,
    probe: Box<dyn HealthProbe>,
    in_start_period: bool,
}

struct DueRestart {
    name: String,
    pid: u32,
}

/// Runs due probes for running instances
pub struct HealthMonitor {
    supervisor: Arc<ProcessSupervisor>,
    store: Arc<StateStore>,
    configs: Arc<dyn ConfigStore>,
    max_workers: usize,
    trackers: Mutex<HashMap<String, Tracker>>,
    checks_performed: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        store: Arc<StateStore>,
        configs: Arc<dyn ConfigStore>,
        max_workers: usize,
    ) -> Self {
        Self {
            supervisor,
            store,
            configs,
            max_workers: max_workers.max(1),
            trackers: Mutex::new(HashMap::new()),
            checks_performed: AtomicU64::new(0),
        }
    }

    fn trackers(&self) -> MutexGuard<'_, HashMap<String, Tracker>> {
        self.trackers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Instances with a healthcheck currently being tracked
    pub fn instances_monitored(&self) -> usize {
        self.trackers().len()
    }

    pub fn checks_performed(&self) -> u64 {
        self.checks_performed.load(Ordering::Relaxed)
    }

    /// Probe every running instance that is due and act on the results
    ///
    /// Restarts whose backoff has elapsed run first.
    pub fn run_checks(&self) -> Result<Vec<HealthCheckReport>> {
        let (jobs, restarts) = self.collect_due(Instant::now())?;

        let mut reports = Vec::with_capacity(jobs.len() + restarts.len());
        for due in restarts {
            let action = self.restart_due(&due);
            reports.push(HealthCheckReport {
                name: due.name,
                result: None,
                action,
            });
        }
        if jobs.is_empty() {
            return Ok(reports);
        }
        debug!("Running {} health check(s)", jobs.len());

        let mut results = Vec::with_capacity(jobs.len());
        for chunk in jobs.chunks(self.max_workers) {
            std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|job| {
                        scope.spawn(move || {
                            job.probe.check(&job.target, job.healthcheck.timeout())
                        })
                    })
                    .collect();
                for handle in handles {
                    // Probes do not panic; a result lost to one is skipped
                    results.push(handle.join().ok());
                }
            });
        }
        self.checks_performed
            .fetch_add(jobs.len() as u64, Ordering::Relaxed);

        for (job, result) in jobs.into_iter().zip(results) {
            let Some(result) = result else {
                warn!(instance = %job.name, "Probe panicked");
                continue;
            };
            let action = self.handle_result(&job, &result);
            reports.push(HealthCheckReport {
                name: job.name,
                result: Some(result),
                action,
            });
        }
        Ok(reports)
    }

    fn collect_due(&self, now: Instant) -> Result<(Vec<Job>, Vec<DueRestart>)> {
        let running: Vec<_> = self
            .store
            .list_runtime()?
            .into_iter()
            .filter(|s| s.status == InstanceStatus::Running)
            .collect();

        let mut trackers = self.trackers();
        trackers.retain(|name, _| running.iter().any(|s| &s.name == name));

        let mut jobs = Vec::new();
        let mut restarts = Vec::new();
        for state in running {
            let config = match self.configs.get_instance_config(&state.name) {
                Ok(config) => config,
                Err(e) => {
                    debug!(instance = %state.name, "Skipping health check: {}", e);
                    trackers.remove(&state.name);
                    continue;
                }
            };
            let Some(healthcheck) = config.healthcheck.clone() else {
                trackers.remove(&state.name);
                continue;
            };

            let tracker = trackers
                .entry(state.name.clone())
                .or_insert_with(|| Tracker::new(state.pid, healthcheck.interval(), now));
            if tracker.pid != state.pid {
                *tracker = Tracker::new(state.pid, healthcheck.interval(), now);
            }
            if let Some(restart_at) = tracker.restart_at {
                if restart_at <= now {
                    tracker.restart_at = None;
                    if let Some(pid) = state.pid {
                        restarts.push(DueRestart {
                            name: state.name.clone(),
                            pid,
                        });
                    }
                }
                continue;
            }
            if tracker.next_due > now {
                continue;
            }

            let in_start_period = state
                .uptime()
                .and_then(|u| u.to_std().ok())
                .map(|uptime| uptime < healthcheck.start_period())
                .unwrap_or(false);

            jobs.push(Job {
                target: ProbeTarget::new(config.host.clone(), config.port),
                probe: probe_for(&healthcheck),
                name: state.name,
                policy: config.restart_policy,
                healthcheck,
                in_start_period,
            });
        }
        Ok((jobs, restarts))
    }

    fn handle_result(&self, job: &Job, result: &ProbeResult) -> HealthAction {
        let name = job.name.as_str();
        let health = result.status.to_health();
        if let Err(e) = self.supervisor.record_health(name, health, Some(&result.detail)) {
            warn!(instance = name, "Could not record health: {}", e);
        }

        let interval = job.healthcheck.interval();
        let now = Instant::now();

        // Decide under the tracker lock, act after releasing it
        let failures = {
            let mut trackers = self.trackers();
            let Some(tracker) = trackers.get_mut(name) else {
                return HealthAction::None;
            };

            if result.status == ProbeStatus::Loading {
                tracker.next_due = now + interval;
                return HealthAction::None;
            }
            if !result.status.is_failure() {
                tracker.failures = 0;
                tracker.backoff.reset();
                tracker.next_due = now + interval;
                return HealthAction::None;
            }

            if job.in_start_period {
                tracker.next_due = now + interval;
                debug!(instance = name, "Failure during start period: {}", result.detail);
                return HealthAction::Muted;
            }

            tracker.failures += 1;
            tracker.next_due = now + tracker.backoff.next_delay().min(interval);
            if tracker.failures < job.healthcheck.retries.max(1) {
                debug!(
                    instance = name,
                    failures = tracker.failures,
                    "Health check failed: {}",
                    result.detail
                );
                return HealthAction::Counted {
                    failures: tracker.failures,
                };
            }
            let failures = tracker.failures;
            tracker.failures = 0;
            failures
        };

        warn!(
            instance = name,
            failures,
            "Health check failure threshold reached: {}",
            result.detail
        );
        self.act_on_threshold(job)
    }

    fn act_on_threshold(&self, job: &Job) -> HealthAction {
        let name = job.name.as_str();
        if !job.policy.enabled {
            return match self
                .supervisor
                .record_health(name, HealthStatus::Unhealthy, Some("failure threshold reached"))
            {
                Ok(_) => HealthAction::MarkedUnhealthy,
                Err(e) => self.failed(name, e),
            };
        }

        // The backoff is waited out by later passes, not by sleeping here
        match self.supervisor.restart_delay(name) {
            Ok(delay) => {
                if let Some(tracker) = self.trackers().get_mut(name) {
                    tracker.restart_at = Some(Instant::now() + delay);
                }
                info!(instance = name, ?delay, "Restart scheduled");
                HealthAction::RestartScheduled { delay }
            }
            Err(EngineError::RestartLimitExceeded { max_retries, .. }) => {
                self.budget_exhausted(name, max_retries)
            }
            Err(e) => self.failed(name, e),
        }
    }

    fn restart_due(&self, due: &DueRestart) -> HealthAction {
        let name = due.name.as_str();
        match self.supervisor.restart_running(name, due.pid) {
            Ok(Some(state)) => {
                info!(
                    instance = name,
                    restart_count = state.restart_count,
                    "Restarted unhealthy instance"
                );
                HealthAction::Restarted
            }
            Ok(None) => HealthAction::None,
            Err(EngineError::RestartLimitExceeded { max_retries, .. }) => {
                self.budget_exhausted(name, max_retries)
            }
            Err(e) => self.failed(name, e),
        }
    }

    fn budget_exhausted(&self, name: &str, max_retries: u32) -> HealthAction {
        let reason = format!("restart budget of {} exhausted", max_retries);
        match self.supervisor.mark_error(name, &reason) {
            Ok(_) => HealthAction::MarkedError,
            Err(e) => self.failed(name, e),
        }
    }

    fn failed(&self, name: &str, error: EngineError) -> HealthAction {
        warn!(instance = name, "Health follow-up failed: {}", error);
        let detail = error.to_string();
        if let Err(e) = self.store.log_event(name, event_types::ERROR, Some(&detail)) {
            warn!(instance = name, "Could not log error event: {}", e);
        }
        HealthAction::Failed(detail)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::config::{LaunchResolver, ServerLaunchResolver, StaticConfigStore};
    use crate::core::instance::{InstanceConfig, ProbeKind, RuntimeState};
    use crate::core::lock::LockManager;
    use crate::core::settings::EngineSettings;
    use crate::core::validator::ProcessValidator;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        supervisor: Arc<ProcessSupervisor>,
        monitor: HealthMonitor,
    }

    fn free_port() -> u16 {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(check: &str, retries: u32, start_period_ms: u64, policy: RestartPolicy) -> InstanceConfig {
        let kind = ProbeKind::Custom {
            command: check.to_string(),
            args: Vec::new(),
        };
        config_with(kind, free_port(), retries, start_period_ms, policy)
    }

    fn config_with(
        kind: ProbeKind,
        port: u16,
        retries: u32,
        start_period_ms: u64,
        policy: RestartPolicy,
    ) -> InstanceConfig {
        let mut healthcheck = HealthCheckConfig::new(kind);
        healthcheck.interval_ms = 10;
        healthcheck.timeout_ms = 2_000;
        healthcheck.retries = retries;
        healthcheck.start_period_ms = start_period_ms;
        InstanceConfig::new("demo", "m", port)
            .with_healthcheck(healthcheck)
            .with_restart_policy(policy)
    }

    /// Answer successive connections with the given status lines and bodies
    fn serve_sequence(responses: Vec<(&'static str, &'static str)>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        port
    }

    /// Record a running row for this test process without spawning anything
    fn record_running(store: &StateStore, port: u16) {
        let mut state = RuntimeState::new("demo");
        state.mark_starting(std::process::id(), port, None);
        state.mark_running();
        store
            .save_runtime(&state, event_types::RUNNING, None)
            .unwrap();
    }

    fn fixture(config: InstanceConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings {
            data_directory: Some(dir.path().to_path_buf()),
            spawn_check_delay_ms: 50,
            stop_grace_period_ms: 2_000,
            ..Default::default()
        };
        let store = Arc::new(StateStore::open(&settings.get_database_path()).unwrap());
        store.initialize().unwrap();
        let configs: Arc<dyn ConfigStore> = Arc::new(StaticConfigStore::new(vec![config]).unwrap());
        let launcher: Arc<dyn LaunchResolver> =
            Arc::new(ServerLaunchResolver::new("sleep").with_args_template(vec!["30".to_string()]));
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&store),
            Arc::new(LockManager::from_settings(&settings).unwrap()),
            Arc::clone(&configs),
            launcher,
            Arc::new(ProcessValidator::new(None)),
            &settings,
        ));
        let monitor = HealthMonitor::new(Arc::clone(&supervisor), Arc::clone(&store), configs, 2);
        Fixture {
            _dir: dir,
            store,
            supervisor,
            monitor,
        }
    }

    /// Run checks until one is due, waiting out any recheck delay
    fn check_once(monitor: &HealthMonitor) -> HealthCheckReport {
        for _ in 0..100 {
            if let Some(report) = monitor.run_checks().unwrap().into_iter().next() {
                return report;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("no health check became due");
    }

    #[test]
    fn passing_probe_marks_healthy() {
        let f = fixture(config("true", 3, 0, RestartPolicy::default()));
        f.supervisor.start_instance("demo").unwrap();

        assert_eq!(check_once(&f.monitor).action, HealthAction::None);
        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.health, HealthStatus::Healthy);
        assert_eq!(f.monitor.checks_performed(), 1);
        assert_eq!(f.monitor.instances_monitored(), 1);

        f.supervisor.stop_instance("demo", None).unwrap();
        assert!(f.monitor.run_checks().unwrap().is_empty());
        assert_eq!(f.monitor.instances_monitored(), 0);
    }

    #[test]
    fn failures_without_policy_mark_unhealthy() {
        let f = fixture(config("false", 2, 0, RestartPolicy::default()));
        f.supervisor.start_instance("demo").unwrap();

        assert_eq!(
            check_once(&f.monitor).action,
            HealthAction::Counted { failures: 1 }
        );
        assert_eq!(check_once(&f.monitor).action, HealthAction::MarkedUnhealthy);

        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.status, InstanceStatus::Running);
        assert_eq!(state.health, HealthStatus::Unhealthy);
        f.supervisor.stop_instance("demo", None).unwrap();
    }

    #[test]
    fn success_resets_counted_failures() {
        let marker_dir = tempfile::tempdir().unwrap();
        let marker = marker_dir.path().join("ready");
        let kind = ProbeKind::Custom {
            command: "test".to_string(),
            args: vec!["-f".to_string(), marker.display().to_string()],
        };
        let f = fixture(config_with(kind, free_port(), 3, 0, RestartPolicy::default()));
        f.supervisor.start_instance("demo").unwrap();

        assert_eq!(check_once(&f.monitor).action, HealthAction::Counted { failures: 1 });
        assert_eq!(check_once(&f.monitor).action, HealthAction::Counted { failures: 2 });

        std::fs::write(&marker, b"").unwrap();
        assert_eq!(check_once(&f.monitor).action, HealthAction::None);
        assert_eq!(
            f.store.get_runtime("demo").unwrap().unwrap().health,
            HealthStatus::Healthy
        );

        // Two more failures would have crossed the threshold without the reset
        std::fs::remove_file(&marker).unwrap();
        assert_eq!(check_once(&f.monitor).action, HealthAction::Counted { failures: 1 });
        assert_eq!(check_once(&f.monitor).action, HealthAction::Counted { failures: 2 });
        f.supervisor.stop_instance("demo", None).unwrap();
    }

    #[test]
    fn http_loading_neither_counts_nor_resets() {
        let port = serve_sequence(vec![
            ("500 Internal Server Error", "{}"),
            ("503 Service Unavailable", r#"{"error":{"message":"Loading model"}}"#),
            ("500 Internal Server Error", "{}"),
            ("200 OK", r#"{"status":"ok"}"#),
            ("500 Internal Server Error", "{}"),
        ]);
        let kind = ProbeKind::Http {
            path: "/health".to_string(),
        };
        let f = fixture(config_with(kind, port, 5, 0, RestartPolicy::default()));
        record_running(&f.store, port);
        let health = || f.store.get_runtime("demo").unwrap().unwrap().health;

        assert_eq!(check_once(&f.monitor).action, HealthAction::Counted { failures: 1 });
        assert_eq!(health(), HealthStatus::Error);

        let report = check_once(&f.monitor);
        assert_eq!(report.action, HealthAction::None);
        assert_eq!(report.result.map(|r| r.status), Some(ProbeStatus::Loading));
        assert_eq!(health(), HealthStatus::Loading);

        // The earlier failure is still on the books
        assert_eq!(check_once(&f.monitor).action, HealthAction::Counted { failures: 2 });

        assert_eq!(check_once(&f.monitor).action, HealthAction::None);
        assert_eq!(health(), HealthStatus::Healthy);

        assert_eq!(check_once(&f.monitor).action, HealthAction::Counted { failures: 1 });
        assert_eq!(f.monitor.checks_performed(), 5);
    }

    #[test]
    fn pending_restart_is_dropped_when_instance_stops() {
        let policy = RestartPolicy {
            enabled: true,
            max_retries: 3,
            initial_delay_ms: 200,
            multiplier: 1.0,
            max_delay_ms: 200,
        };
        let f = fixture(config("false", 1, 0, policy));
        f.supervisor.start_instance("demo").unwrap();

        assert!(matches!(
            check_once(&f.monitor).action,
            HealthAction::RestartScheduled { .. }
        ));
        // Checks pause while the restart is pending
        assert!(f.monitor.run_checks().unwrap().is_empty());

        f.supervisor.stop_instance("demo", None).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(f.monitor.run_checks().unwrap().is_empty());
        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.status, InstanceStatus::Stopped);
        assert_eq!(state.restart_count, 0);
    }

    #[test]
    fn start_period_mutes_failures() {
        let f = fixture(config("false", 1, 60_000, RestartPolicy::default()));
        f.supervisor.start_instance("demo").unwrap();

        assert_eq!(check_once(&f.monitor).action, HealthAction::Muted);
        assert_eq!(check_once(&f.monitor).action, HealthAction::Muted);
        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.health, HealthStatus::Unhealthy);
        f.supervisor.stop_instance("demo", None).unwrap();
    }

    #[test]
    fn restart_until_budget_exhausted_then_error() {
        let policy = RestartPolicy {
            enabled: true,
            max_retries: 1,
            initial_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 20,
        };
        let f = fixture(config("false", 1, 0, policy));
        let first_pid = f.supervisor.start_instance("demo").unwrap().pid;

        assert!(matches!(
            check_once(&f.monitor).action,
            HealthAction::RestartScheduled { .. }
        ));
        assert_eq!(check_once(&f.monitor).action, HealthAction::Restarted);
        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.restart_count, 1);
        assert_ne!(state.pid, first_pid);

        assert_eq!(check_once(&f.monitor).action, HealthAction::MarkedError);
        let state = f.store.get_runtime("demo").unwrap().unwrap();
        assert_eq!(state.status, InstanceStatus::Error);
        assert_eq!(state.pid, None);
    }
}
