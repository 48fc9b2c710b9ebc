//! Per-instance exclusive locks shared across processes
//!
//! A lock is a file `<locks>/<name>.lock` created with `O_EXCL`. It records
//! the holder pid, creation time and operation so waiters can report who
//! they are blocked on and reclaim locks left behind by dead holders.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use super::settings::EngineSettings;
use crate::error::{EngineError, Result};
use crate::platform;

const LOCK_EXTENSION: &str = "lock";

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq)]
pub struct LockInfo {
    pub pid: u32,
    /// Seconds since the Unix epoch
    pub created: f64,
    pub operation: String,
}

impl LockInfo {
    fn new(operation: &str) -> Self {
        Self {
            pid: std::process::id(),
            created: epoch_secs(),
            operation: operation.replace(['\n', '\r'], " "),
        }
    }

    fn parse(text: &str) -> Option<Self> {
        let mut pid = None;
        let mut created = None;
        let mut operation = String::new();
        for line in text.lines() {
            match line.split_once('=') {
                Some(("pid", v)) => pid = v.trim().parse().ok(),
                Some(("created", v)) => created = v.trim().parse().ok(),
                Some(("operation", v)) => operation = v.to_string(),
                _ => {}
            }
        }
        Some(Self {
            pid: pid?,
            created: created?,
            operation,
        })
    }

    fn render(&self) -> String {
        format!(
            "pid={}\ncreated={:.6}\noperation={}\n",
            self.pid, self.created, self.operation
        )
    }

    /// Time since the lock was taken
    pub fn age(&self) -> Duration {
        Duration::from_secs_f64((epoch_secs() - self.created).max(0.0))
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Issues and tracks instance locks for this process
///
/// Locks are re-entrant per thread: acquiring a name the calling thread
/// already holds through this manager only bumps a depth counter. Any other
/// holder (another thread, manager or process) is contention.
pub struct LockManager {
    lock_dir: PathBuf,
    timeout: Duration,
    retry_interval: Duration,
    stale_timeout: Duration,
    /// name -> (owning thread, re-entrancy depth)
    held: Mutex<HashMap<String, (ThreadId, usize)>>,
}

impl LockManager {
    pub fn new(
        lock_dir: impl Into<PathBuf>,
        timeout: Duration,
        retry_interval: Duration,
        stale_timeout: Duration,
    ) -> Result<Self> {
        let lock_dir = lock_dir.into();
        std::fs::create_dir_all(&lock_dir)?;
        Ok(Self {
            lock_dir,
            timeout,
            retry_interval: retry_interval.max(Duration::from_millis(1)),
            stale_timeout,
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        Self::new(
            settings.get_locks_directory(),
            settings.lock_timeout(),
            settings.lock_retry_interval(),
            settings.lock_stale_timeout(),
        )
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.{}", name, LOCK_EXTENSION))
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, (ThreadId, usize)>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire the lock on `name` using the configured timeout
    pub fn acquire(&self, name: &str, operation: &str) -> Result<InstanceLock<'_>> {
        self.acquire_with_timeout(name, operation, self.timeout)
    }

    /// Acquire the lock on `name`, waiting at most `timeout`
    pub fn acquire_with_timeout(
        &self,
        name: &str,
        operation: &str,
        timeout: Duration,
    ) -> Result<InstanceLock<'_>> {
        let started = Instant::now();
        loop {
            if self.try_acquire(name, operation)? {
                return Ok(InstanceLock {
                    manager: self,
                    name: name.to_string(),
                });
            }

            let waited = started.elapsed();
            if waited >= timeout {
                let holder = self.read_lock(name);
                debug!(instance = name, ?waited, "Lock wait timed out");
                return Err(EngineError::LockTimeout {
                    name: name.to_string(),
                    waited,
                    holder_pid: holder.as_ref().map(|h| h.pid).unwrap_or(0),
                    operation: holder.map(|h| h.operation).unwrap_or_default(),
                });
            }
            std::thread::sleep(self.retry_interval.min(timeout - waited));
        }
    }

    /// One acquisition attempt; `Ok(false)` means someone else holds it
    fn try_acquire(&self, name: &str, operation: &str) -> Result<bool> {
        let mut held = self.held();
        if let Some((owner, depth)) = held.get_mut(name) {
            if *owner != std::thread::current().id() {
                return Ok(false);
            }
            *depth += 1;
            return Ok(true);
        }

        let path = self.lock_path(name);
        // Two passes: the second runs after a stale lock was reclaimed
        for _ in 0..2 {
            match create_lock_file(&path, &LockInfo::new(operation)) {
                Ok(()) => {
                    held.insert(name.to_string(), (std::thread::current().id(), 1));
                    debug!(instance = name, operation, "Lock acquired");
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !self.reclaim_if_stale(name, &path) {
                        return Ok(false);
                    }
                }
                Err(source) => {
                    return Err(EngineError::Lock {
                        name: name.to_string(),
                        source,
                    })
                }
            }
        }
        Ok(false)
    }

    /// Remove the lock file if its holder is gone or it outlived the stale timeout
    fn reclaim_if_stale(&self, name: &str, path: &Path) -> bool {
        let Ok(text) = std::fs::read_to_string(path) else {
            // Vanished between create and read; just retry
            return true;
        };

        let stale_reason = match LockInfo::parse(&text) {
            Some(info) if !platform::is_process_running(info.pid) => {
                format!("holder pid {} is gone", info.pid)
            }
            Some(info) if info.age() > self.stale_timeout => {
                format!("held by pid {} for {:?}", info.pid, info.age())
            }
            Some(_) => return false,
            // Unparseable: either being written right now or corrupt
            None => match file_age(path) {
                Some(age) if age > self.stale_timeout => "unreadable lock file".to_string(),
                _ => return false,
            },
        };

        // Only remove the exact lock we judged stale
        match std::fs::read_to_string(path) {
            Ok(current) if current == text => {}
            _ => return true,
        }
        match std::fs::remove_file(path) {
            Ok(()) => {
                warn!(instance = name, "Reclaimed stale lock: {}", stale_reason);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(instance = name, "Failed to remove stale lock: {}", e);
                false
            }
        }
    }

    /// Release one level of the lock on `name`; releasing an unheld name is a no-op
    pub fn release(&self, name: &str) {
        let mut held = self.held();
        let Some((_, depth)) = held.get_mut(name) else {
            return;
        };
        *depth -= 1;
        if *depth > 0 {
            return;
        }
        held.remove(name);

        let path = self.lock_path(name);
        // Never delete a lock someone else reclaimed from us
        match std::fs::read_to_string(&path).ok().as_deref().and_then(LockInfo::parse) {
            Some(info) if info.pid == std::process::id() => {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(instance = name, "Failed to remove lock file: {}", e);
                }
            }
            Some(info) => {
                warn!(
                    instance = name,
                    "Lock file now owned by pid {}, leaving it", info.pid
                );
            }
            None => {}
        }
        debug!(instance = name, "Lock released");
    }

    /// Acquire locks on several instances in sorted order
    ///
    /// Duplicates are ignored. On failure every lock taken so far is
    /// released in reverse order.
    pub fn multi_instance_lock<S: AsRef<str>>(
        &self,
        names: &[S],
        operation: &str,
    ) -> Result<MultiInstanceLock<'_>> {
        let mut sorted: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let started = Instant::now();
        let mut guard = MultiInstanceLock { locks: Vec::new() };
        for name in sorted {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            guard
                .locks
                .push(self.acquire_with_timeout(name, operation, remaining)?);
        }
        Ok(guard)
    }

    /// Whether any process currently has a lock file for `name`
    pub fn is_locked(&self, name: &str) -> bool {
        self.lock_path(name).exists()
    }

    /// Read the lock file for `name`, if present and well-formed
    pub fn read_lock(&self, name: &str) -> Option<LockInfo> {
        std::fs::read_to_string(self.lock_path(name))
            .ok()
            .as_deref()
            .and_then(LockInfo::parse)
    }

    /// Names with a lock file on disk
    pub fn list_locks(&self) -> Result<Vec<(String, Option<LockInfo>)>> {
        let mut locks = Vec::new();
        for entry in std::fs::read_dir(&self.lock_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            locks.push((name.to_string(), self.read_lock(name)));
        }
        locks.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(locks)
    }

    /// Remove every stale lock file; returns how many were removed
    pub fn cleanup_stale_locks(&self) -> Result<usize> {
        let mut removed = 0;
        for (name, _) in self.list_locks()? {
            if self.held().contains_key(&name) {
                continue;
            }
            let path = self.lock_path(&name);
            if path.exists() && self.reclaim_if_stale(&name, &path) && !path.exists() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} stale lock(s)", removed);
        }
        Ok(removed)
    }
}

fn create_lock_file(path: &Path, info: &LockInfo) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(info.render().as_bytes())?;
    file.sync_all()
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Held lock on one instance; released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct InstanceLock<'a> {
    manager: &'a LockManager,
    name: String,
}

impl InstanceLock<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for InstanceLock<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.name);
    }
}

/// Held locks on several instances; released in reverse order on drop
#[must_use = "the locks are released as soon as the guard is dropped"]
pub struct MultiInstanceLock<'a> {
    locks: Vec<InstanceLock<'a>>,
}

impl MultiInstanceLock<'_> {
    /// Locked names in acquisition order
    pub fn names(&self) -> Vec<&str> {
        self.locks.iter().map(|l| l.name()).collect()
    }
}

impl Drop for MultiInstanceLock<'_> {
    fn drop(&mut self) {
        while let Some(lock) = self.locks.pop() {
            drop(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manager(dir: &Path) -> LockManager {
        LockManager::new(
            dir.join("locks"),
            Duration::from_millis(200),
            Duration::from_millis(10),
            Duration::from_secs(300),
        )
        .unwrap()
    }

    #[test]
    fn acquire_writes_holder_and_release_removes() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let guard = locks.acquire("demo", "start").unwrap();
        let info = locks.read_lock("demo").unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.operation, "start");
        assert!(locks.is_locked("demo"));

        drop(guard);
        assert!(!locks.is_locked("demo"));
        // Releasing again is harmless
        locks.release("demo");
    }

    #[test]
    fn nested_acquire_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let outer = locks.acquire("demo", "restart").unwrap();
        let inner = locks.acquire("demo", "stop").unwrap();
        drop(inner);
        assert!(locks.is_locked("demo"));
        drop(outer);
        assert!(!locks.is_locked("demo"));
    }

    #[test]
    fn second_manager_times_out_and_names_holder() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager(dir.path());
        let second = manager(dir.path());

        let _guard = first.acquire("demo", "start").unwrap();
        let contended = second.acquire("demo", "stop");
        match contended {
            Err(EngineError::LockTimeout {
                holder_pid,
                operation,
                ..
            }) => {
                assert_eq!(holder_pid, std::process::id());
                assert_eq!(operation, "start");
            }
            other => panic!("expected LockTimeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn lock_of_dead_holder_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        std::fs::write(
            locks.lock_path("demo"),
            format!("pid=999999999\ncreated={}\noperation=start\n", epoch_secs()),
        )
        .unwrap();

        let _guard = locks.acquire("demo", "start").unwrap();
        assert_eq!(locks.read_lock("demo").unwrap().pid, std::process::id());
    }

    #[test]
    fn old_lock_of_live_holder_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        std::fs::write(
            locks.lock_path("demo"),
            format!("pid={}\ncreated=0.0\noperation=start\n", std::process::id()),
        )
        .unwrap();

        assert!(locks.acquire("demo", "stop").is_ok());
    }

    #[test]
    fn multi_lock_sorts_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let guard = locks
            .multi_instance_lock(&["beta", "alpha", "beta"], "reconcile")
            .unwrap();
        assert_eq!(guard.names(), vec!["alpha", "beta"]);
        assert!(locks.is_locked("alpha") && locks.is_locked("beta"));

        drop(guard);
        assert!(!locks.is_locked("alpha") && !locks.is_locked("beta"));
    }

    #[test]
    fn multi_lock_failure_releases_partial_set() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager(dir.path());
        let second = manager(dir.path());

        let _held = first.acquire("beta", "start").unwrap();
        assert!(second
            .multi_instance_lock(&["alpha", "beta"], "reconcile")
            .is_err());
        assert!(!second.is_locked("alpha"));
    }

    #[test]
    fn overlapping_multi_locks_do_not_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let lock_dir = dir.path().join("locks");
        let completed = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = [vec!["x", "y"], vec!["y", "x"]]
            .into_iter()
            .map(|names| {
                let lock_dir = lock_dir.clone();
                let completed = Arc::clone(&completed);
                std::thread::spawn(move || {
                    let locks = LockManager::new(
                        lock_dir,
                        Duration::from_secs(10),
                        Duration::from_millis(1),
                        Duration::from_secs(300),
                    )
                    .unwrap();
                    for _ in 0..20 {
                        let _guard = locks.multi_instance_lock(&names, "test").unwrap();
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn cleanup_removes_only_stale_locks() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        for name in ["gone-a", "gone-b"] {
            std::fs::write(
                locks.lock_path(name),
                format!("pid=999999999\ncreated={}\noperation=start\n", epoch_secs()),
            )
            .unwrap();
        }
        let _live = locks.acquire("live", "start").unwrap();

        assert_eq!(locks.cleanup_stale_locks().unwrap(), 2);
        assert!(locks.is_locked("live"));
        assert_eq!(locks.list_locks().unwrap().len(), 1);
    }
}
