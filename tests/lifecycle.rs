//! End-to-end scenarios against a real data directory, using `sleep` as the
//! managed server

#![cfg(unix)]

use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use multiserve::core::{
    event_types, DaemonService, Engine, EngineSettings, InstanceStatus, LockManager,
    ReconcileAction, RuntimeState,
};
use multiserve::EngineError;

fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn settings(dir: &Path) -> EngineSettings {
    EngineSettings {
        data_directory: Some(dir.to_path_buf()),
        executable_path: "sleep".into(),
        launch_args: vec!["30".to_string()],
        stop_grace_period_ms: 2_000,
        spawn_check_delay_ms: 100,
        detect_orphans: false,
        ..Default::default()
    }
}

fn write_instances(dir: &Path, names: &[&str]) {
    let instances: Vec<serde_json::Value> = names
        .iter()
        .map(|name| serde_json::json!({ "name": name, "model": "model.gguf", "port": free_port() }))
        .collect();
    std::fs::write(
        dir.join("instances.json"),
        serde_json::json!({ "instances": instances }).to_string(),
    )
    .unwrap();
}

fn open(dir: &Path) -> Engine {
    Engine::open(settings(dir)).unwrap()
}

fn event_types_for(engine: &Engine, name: &str) -> Vec<String> {
    engine
        .store()
        .get_recent_events(Some(name), 100)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[test]
fn killed_instance_is_reconciled_to_stopped() {
    let dir = tempfile::tempdir().unwrap();
    write_instances(dir.path(), &["demo"]);
    let engine = open(dir.path());

    let state = engine.supervisor().start_instance("demo").unwrap();
    assert_eq!(state.status, InstanceStatus::Running);
    let pid = state.pid.unwrap();

    let killed = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());
    std::thread::sleep(Duration::from_millis(200));

    let outcome = engine.reconciler().reconcile_instance("demo", true).unwrap();
    assert_eq!(outcome.action, ReconcileAction::MarkedStopped);

    let state = engine.instance_status("demo").unwrap().unwrap();
    assert_eq!(state.status, InstanceStatus::Stopped);
    assert_eq!(state.pid, None);
    assert_eq!(state.port, None);

    let missing = event_types_for(&engine, "demo")
        .into_iter()
        .filter(|t| t == event_types::PROCESS_MISSING)
        .count();
    assert_eq!(missing, 1);

    // A second pass has nothing left to correct
    let again = engine.reconciler().reconcile_instance("demo", true).unwrap();
    assert_eq!(again.action, ReconcileAction::None);
}

#[test]
fn second_start_is_refused_while_running() {
    let dir = tempfile::tempdir().unwrap();
    write_instances(dir.path(), &["demo"]);
    let engine = open(dir.path());

    let first = engine.supervisor().start_instance("demo").unwrap();
    let err = engine.supervisor().start_instance("demo").unwrap_err();
    assert!(matches!(err, EngineError::DuplicateStart { .. }));

    // The refused start changed nothing
    let state = engine.instance_status("demo").unwrap().unwrap();
    assert_eq!(state.pid, first.pid);
    assert_eq!(state.status, InstanceStatus::Running);

    engine.supervisor().stop_instance("demo", None).unwrap();
}

#[test]
fn second_handle_sees_and_stops_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    write_instances(dir.path(), &["demo"]);
    let first = open(dir.path());
    let second = open(dir.path());

    let started = first.supervisor().start_instance("demo").unwrap();
    let seen = second.instance_status("demo").unwrap().unwrap();
    assert_eq!(seen.pid, started.pid);

    let stopped = second.supervisor().stop_instance("demo", None).unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    assert_eq!(
        first.instance_status("demo").unwrap().unwrap().status,
        InstanceStatus::Stopped
    );
}

#[test]
fn never_spawned_pid_is_marked_stopped() {
    let dir = tempfile::tempdir().unwrap();
    write_instances(dir.path(), &["ghost"]);
    let engine = open(dir.path());

    let mut state = RuntimeState::new("ghost");
    state.mark_starting(999_999_999, 9999, None);
    state.mark_running();
    engine
        .store()
        .save_runtime(&state, event_types::RUNNING, None)
        .unwrap();

    let report = engine.reconciler().reconcile_all(true, false).unwrap();
    assert_eq!(report.stopped_count, 1);
    assert_eq!(
        engine.instance_status("ghost").unwrap().unwrap().status,
        InstanceStatus::Stopped
    );
}

#[test]
fn held_lock_blocks_a_second_manager_until_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let locks = dir.path().join("locks");
    let holder = LockManager::new(
        &locks,
        Duration::from_secs(1),
        Duration::from_millis(10),
        Duration::from_secs(300),
    )
    .unwrap();
    let waiter = LockManager::new(
        &locks,
        Duration::from_millis(300),
        Duration::from_millis(10),
        Duration::from_secs(300),
    )
    .unwrap();

    let _guard = holder.acquire("demo", "start").unwrap();
    let started = Instant::now();
    let err = waiter.acquire("demo", "stop").map(|_| ()).unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(matches!(err, EngineError::LockTimeout { ref name, .. } if name.as_str() == "demo"));
    assert!(err.is_transient());
}

#[tokio::test]
async fn daemon_stops_promptly() {
    let dir = tempfile::tempdir().unwrap();
    write_instances(dir.path(), &["demo"]);
    let engine = Arc::new(open(dir.path()));
    let daemon = Arc::new(DaemonService::new(engine));

    let runner = Arc::clone(&daemon);
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopped_at = Instant::now();
    daemon.stop();
    assert!(!daemon.is_running());
    handle.await.unwrap().unwrap();
    assert!(stopped_at.elapsed() < Duration::from_secs(1));
    assert!(dir.path().join("daemon-status.json").exists());
}
