//! Process identity checks against the OS process table

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, warn};

use super::instance::event_types;
use super::lock::LockManager;
use crate::error::Result;
use crate::persistence::StateStore;

/// Start times read twice may differ by rounding; allow this much slack (seconds)
const SIGNATURE_TOLERANCE: u64 = 1;

/// What the OS says about a recorded pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCheck {
    /// Exists and matches the recorded signature
    Alive,
    /// No such process
    Missing,
    /// Exited but not yet reaped by its parent
    Zombie,
    /// A different process now has this pid
    PidReused,
}

impl ProcessCheck {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// OS process running the managed executable without a runtime row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanProcess {
    pub pid: u32,
    pub name: String,
    pub command: Vec<String>,
}

/// Confirms persisted pids still identify the processes this engine spawned
pub struct ProcessValidator {
    system: Mutex<System>,
    /// File name of the managed executable, for orphan detection
    executable_name: Option<String>,
}

impl ProcessValidator {
    pub fn new(executable_name: Option<String>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            executable_name,
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh_one(system: &mut System, pid: u32) {
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::new(),
        );
    }

    /// Start time of `pid` in seconds since the epoch
    pub fn capture_signature(&self, pid: u32) -> Option<u64> {
        let mut system = self.system();
        Self::refresh_one(&mut system, pid);
        system.process(Pid::from_u32(pid)).map(|p| p.start_time())
    }

    /// Check that `pid` is alive and, when a signature was captured, still the same process
    pub fn validate_process(&self, pid: u32, signature: Option<u64>) -> ProcessCheck {
        let mut system = self.system();
        Self::refresh_one(&mut system, pid);

        let Some(process) = system.process(Pid::from_u32(pid)) else {
            return ProcessCheck::Missing;
        };
        if process.status() == ProcessStatus::Zombie {
            return ProcessCheck::Zombie;
        }
        match signature {
            Some(expected) if process.start_time().abs_diff(expected) > SIGNATURE_TOLERANCE => {
                debug!(
                    pid,
                    expected,
                    found = process.start_time(),
                    "Process start time does not match"
                );
                ProcessCheck::PidReused
            }
            _ => ProcessCheck::Alive,
        }
    }

    /// Processes of the managed executable whose pid is not in `known_pids`
    pub fn find_orphaned_processes(&self, known_pids: &HashSet<u32>) -> Vec<OrphanProcess> {
        let Some(executable) = self.executable_name.as_deref() else {
            return Vec::new();
        };

        let mut system = self.system();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new()
                .with_exe(UpdateKind::OnlyIfNotSet)
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );

        let own_pid = std::process::id();
        let mut orphans: Vec<OrphanProcess> = system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid && !known_pids.contains(&pid.as_u32()))
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .filter(|(_, process)| {
                let exe_matches = process
                    .exe()
                    .and_then(|e| e.file_name())
                    .map(|n| n.to_string_lossy() == executable)
                    .unwrap_or(false);
                exe_matches || process.name().to_string_lossy() == executable
            })
            .map(|(pid, process)| OrphanProcess {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().to_string(),
                command: process
                    .cmd()
                    .iter()
                    .map(|s| s.to_string_lossy().to_string())
                    .collect(),
            })
            .collect();
        orphans.sort_by_key(|o| o.pid);
        orphans
    }

    /// Mark active rows whose pid no longer validates as stopped
    ///
    /// Each row is re-checked under its instance lock; instances whose lock
    /// cannot be taken are skipped until the next run.
    pub fn cleanup_stale_runtime(&self, store: &StateStore, locks: &LockManager) -> Result<usize> {
        let mut cleaned = 0;
        for state in store.list_runtime()? {
            let Some(pid) = state.pid else { continue };
            if !state.status.is_active() || self.validate_process(pid, state.signature).is_alive() {
                continue;
            }

            let _guard = match locks.acquire(&state.name, "cleanup_stale_runtime") {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(instance = %state.name, "Skipping stale runtime cleanup: {}", e);
                    continue;
                }
            };

            let Some(mut current) = store.get_runtime(&state.name)? else {
                continue;
            };
            let Some(current_pid) = current.pid else {
                continue;
            };
            let check = self.validate_process(current_pid, current.signature);
            if !current.status.is_active() || check.is_alive() {
                continue;
            }

            current.mark_stopped();
            store.save_runtime(
                &current,
                event_types::STALE_RUNTIME,
                Some(&format!("pid {} {:?}", current_pid, check)),
            )?;
            cleaned += 1;
        }

        if cleaned > 0 {
            info!("Cleaned up {} stale runtime record(s)", cleaned);
        }
        Ok(cleaned)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::{InstanceStatus, RuntimeState};
    use std::process::Command;
    use std::time::Duration;

    #[test]
    fn own_process_validates_with_its_signature() {
        let validator = ProcessValidator::new(None);
        let pid = std::process::id();
        let signature = validator.capture_signature(pid);
        assert!(signature.is_some());
        assert_eq!(validator.validate_process(pid, signature), ProcessCheck::Alive);
        assert_eq!(validator.validate_process(pid, None), ProcessCheck::Alive);
    }

    #[test]
    fn wrong_signature_means_pid_reuse() {
        let validator = ProcessValidator::new(None);
        assert_eq!(
            validator.validate_process(std::process::id(), Some(1)),
            ProcessCheck::PidReused
        );
    }

    #[test]
    fn never_spawned_pid_is_missing() {
        let validator = ProcessValidator::new(None);
        assert_eq!(validator.validate_process(999_999_999, None), ProcessCheck::Missing);
        assert_eq!(validator.capture_signature(999_999_999), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unreaped_child_is_a_zombie() {
        let mut child = Command::new("true").spawn().unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let validator = ProcessValidator::new(None);
        assert_eq!(validator.validate_process(child.id(), None), ProcessCheck::Zombie);
        child.wait().unwrap();
    }

    #[test]
    fn orphans_are_matched_by_executable_name() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        std::thread::sleep(Duration::from_millis(100));

        let validator = ProcessValidator::new(Some("sleep".to_string()));
        let orphans = validator.find_orphaned_processes(&HashSet::new());
        assert!(orphans.iter().any(|o| o.pid == pid));

        let known: HashSet<u32> = [pid].into_iter().collect();
        let orphans = validator.find_orphaned_processes(&known);
        assert!(!orphans.iter().any(|o| o.pid == pid));

        assert!(ProcessValidator::new(None)
            .find_orphaned_processes(&HashSet::new())
            .is_empty());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn cleanup_marks_dead_rows_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let locks = LockManager::new(
            dir.path(),
            Duration::from_secs(1),
            Duration::from_millis(10),
            Duration::from_secs(300),
        )
        .unwrap();

        let mut dead = RuntimeState::new("dead");
        dead.mark_starting(999_999_999, 9100, None);
        dead.mark_running();
        store.save_runtime(&dead, event_types::RUNNING, None).unwrap();

        let mut alive = RuntimeState::new("alive");
        alive.mark_starting(std::process::id(), 9101, None);
        alive.mark_running();
        store.save_runtime(&alive, event_types::RUNNING, None).unwrap();

        let validator = ProcessValidator::new(None);
        assert_eq!(validator.cleanup_stale_runtime(&store, &locks).unwrap(), 1);
        assert_eq!(
            store.get_runtime("dead").unwrap().unwrap().status,
            InstanceStatus::Stopped
        );
        assert_eq!(
            store.get_runtime("alive").unwrap().unwrap().status,
            InstanceStatus::Running
        );
        assert!(!locks.is_locked("dead"));
    }
}
