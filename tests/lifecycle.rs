//! Full native lifecycle against a real subprocess: install from local
//! storage, start, observe output, stop.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use vertex::config::VertexConfig;
use vertex::containers::{ContainerStatus, LogKind, Registry, Supervisor};
use vertex::events::{container_topic, Event, EventBus};

fn write_fixture(dir: &Path) {
    let vertex_dir = dir.join(".vertex");
    fs::create_dir_all(&vertex_dir).unwrap();
    fs::write(
        vertex_dir.join("service.yml"),
        "id: hello\nname: Hello\nversion: 1\nmethods:\n  native: {}\n",
    )
    .unwrap();

    let script = dir.join("hello.sh");
    fs::write(&script, "#!/bin/sh\necho hi\nexec sleep 30\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn install_start_stop_native() {
    let storage = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    write_fixture(source.path());

    let config = VertexConfig::new(storage.path());
    let bus = EventBus::new();
    let registry = Arc::new(Registry::new(bus.clone()));
    let supervisor = Supervisor::new(config, registry, bus.clone()).unwrap();

    let container = supervisor
        .install(
            &format!("localstorage:{}", source.path().display()),
            false,
            false,
        )
        .await
        .unwrap();
    let uuid = container.uuid;
    assert_eq!(container.status().await, ContainerStatus::Off);

    let events = bus.subscribe(&container_topic(uuid));

    // Start: the spawn itself must complete well within a second.
    timeout(Duration::from_secs(1), supervisor.start(uuid))
        .await
        .expect("start timed out")
        .unwrap();
    assert_eq!(container.status().await, ContainerStatus::Running);

    // The process output shows up in the ring buffer shortly after.
    let mut saw_hi = false;
    for _ in 0..50 {
        if container
            .logs
            .lines()
            .await
            .iter()
            .any(|l| l.kind == LogKind::Out && l.message == "hi")
        {
            saw_hi = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(saw_hi, "expected the process output in the log ring");

    supervisor.stop(uuid).await.unwrap();
    assert_eq!(container.status().await, ContainerStatus::Off);

    // The on-disk log file carries the prefixed line.
    let logs_dir = source.path().join(".vertex").join("logs");
    let mut contents = String::new();
    for entry in fs::read_dir(&logs_dir).unwrap() {
        contents.push_str(&fs::read_to_string(entry.unwrap().path()).unwrap());
    }
    assert!(
        contents.contains("[stdout] hi"),
        "log file should contain the prefixed line, got: {contents:?}"
    );

    // The observed status transitions form a valid path of the lifecycle
    // state machine: starting -> running -> stopping -> off.
    let mut statuses = Vec::new();
    while let Some(event) = events.try_recv() {
        if let Event::StatusChanged { status, .. } = event {
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            ContainerStatus::Starting,
            ContainerStatus::Running,
            ContainerStatus::Stopping,
            ContainerStatus::Off,
        ]
    );
}

#[tokio::test]
async fn uninstall_removes_everything() {
    let storage = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    write_fixture(source.path());

    let config = VertexConfig::new(storage.path());
    let bus = EventBus::new();
    let registry = Arc::new(Registry::new(bus.clone()));
    let supervisor = Supervisor::new(config.clone(), registry, bus).unwrap();

    let container = supervisor
        .install(
            &format!("localstorage:{}", source.path().display()),
            false,
            false,
        )
        .await
        .unwrap();
    let uuid = container.uuid;

    supervisor.start(uuid).await.unwrap();
    // Uninstall while running force-stops first.
    supervisor.uninstall(uuid).await.unwrap();

    assert!(!supervisor.registry().exists(uuid).await);
    assert!(!config.container_path(uuid).exists());
    // The linked source survives; only the link is gone.
    assert!(source.path().join("hello.sh").exists());
}

#[tokio::test]
async fn process_exit_turns_the_container_off() {
    let storage = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();

    let vertex_dir = source.path().join(".vertex");
    fs::create_dir_all(&vertex_dir).unwrap();
    fs::write(
        vertex_dir.join("service.yml"),
        "id: oneshot\nname: One Shot\nmethods:\n  native: {}\n",
    )
    .unwrap();
    let script = source.path().join("oneshot.sh");
    fs::write(&script, "#!/bin/sh\necho done\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let config = VertexConfig::new(storage.path());
    let bus = EventBus::new();
    let registry = Arc::new(Registry::new(bus.clone()));
    let supervisor = Supervisor::new(config, registry, bus).unwrap();

    let container = supervisor
        .install(
            &format!("localstorage:{}", source.path().display()),
            false,
            false,
        )
        .await
        .unwrap();

    supervisor.start(container.uuid).await.unwrap();

    // The reaper notices the exit and flips the status without any Stop.
    let mut turned_off = false;
    for _ in 0..50 {
        if container.status().await == ContainerStatus::Off {
            turned_off = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(turned_off, "expected the reaper to set the container off");
}
