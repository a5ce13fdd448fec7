//! End-to-end supervisor scenarios with real workers
//!
//! These tests fork real processes and reap with `waitpid(-1)`, so every
//! forking test holds `FORK_LOCK` and drains its children before releasing
//! it; otherwise concurrent tests would steal each other's exits.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{Pid, Uid};

use svcd::catalog::{Account, Priority, ServiceSpec};
use svcd::supervisor::{Status, Supervisor};

static FORK_LOCK: Mutex<()> = Mutex::new(());
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn lock_forking() -> std::sync::MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/svcd-test-{}-{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn spec(name: &str, executable: &str) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        executable_path: PathBuf::from(executable),
        arguments: Vec::new(),
        stdio_path: None,
        priority: Priority::Normal,
        keep_alive: false,
        lazy: false,
        multi_instance: false,
        accept_socket_connections: false,
        socket_path: None,
        socket_permissions: 0o600,
        user: None,
        account: None,
        working_directory: None,
        environment: Vec::new(),
        boot_modes: vec!["graphical".to_string()],
    }
}

/// Shell snippet verifying the socket-takeover contract from inside the
/// worker: the marker variable is set and fd 3 is a socket.
const TAKEOVER_CHECK: &str = r#"[ "$SOCKET_TAKEOVER" = 1 ] && [ -S /proc/self/fd/3 ]"#;

fn shell_spec(name: &str, script: &str) -> ServiceSpec {
    let mut spec = spec(name, "/bin/sh");
    spec.arguments = vec!["-c".to_string(), script.to_string()];
    spec
}

/// Reap everything this test forked, so the next test starts clean.
fn drain_children() {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn test_eager_keep_alive_respawns_after_clean_exit() {
    let _guard = lock_forking();

    let mut supervisor = Supervisor::new("graphical");
    let mut service = spec("A", "/bin/true");
    service.keep_alive = true;
    supervisor.register(service);

    supervisor.activate("A");
    let first_pid = supervisor.state("A").unwrap().pid.expect("worker spawned");
    assert_eq!(supervisor.tracked_workers(), 1);
    assert_eq!(supervisor.service_for_pid(first_pid).unwrap(), "A");

    let mut respawned = None;
    for _ in 0..500 {
        supervisor.reap_children();
        // A clean exit respawns within the same reap call, so the registry
        // never stays empty between observations.
        assert_eq!(supervisor.tracked_workers(), 1);
        let state = supervisor.state("A").unwrap();
        assert_eq!(state.restart_attempts, 0);
        if let Some(pid) = state.pid {
            if pid != first_pid {
                respawned = Some(pid);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(respawned.is_some(), "worker was never respawned");
    assert_eq!(supervisor.state("A").unwrap().last_exit_code, Some(0));

    drop(supervisor);
    drain_children();
}

#[tokio::test]
async fn test_registry_tracks_single_worker_until_exit() {
    let _guard = lock_forking();

    let mut supervisor = Supervisor::new("graphical");
    let mut service = spec("Sleeper", "/bin/sleep");
    service.arguments = vec!["60".to_string()];
    supervisor.register(service);

    supervisor.activate("Sleeper");
    let state = supervisor.state("Sleeper").unwrap();
    assert_eq!(state.status, Status::Running);
    let pid = state.pid.expect("worker spawned");
    assert_eq!(supervisor.tracked_workers(), 1);
    assert_eq!(supervisor.service_for_pid(pid).unwrap(), "Sleeper");

    kill(pid, Signal::SIGTERM).unwrap();
    for _ in 0..500 {
        supervisor.reap_children();
        if supervisor.state("Sleeper").unwrap().pid.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let state = supervisor.state("Sleeper").unwrap();
    assert!(state.pid.is_none());
    assert_eq!(state.status, Status::Inactive);
    assert_eq!(state.last_exit_code, Some(128 + Signal::SIGTERM as i32));
    assert_eq!(supervisor.tracked_workers(), 0);

    drop(supervisor);
    drain_children();
}

#[tokio::test]
async fn test_flap_and_give_up_after_three_fast_failures() {
    let _guard = lock_forking();

    let mut supervisor = Supervisor::new("graphical");
    let mut service = spec("D", "/bin/false");
    service.keep_alive = true;
    supervisor.register(service);

    supervisor.activate("D");

    let mut seen_attempts = Vec::new();
    for _ in 0..500 {
        supervisor.reap_children();
        let state = supervisor.state("D").unwrap();
        if seen_attempts.last() != Some(&state.restart_attempts) {
            seen_attempts.push(state.restart_attempts);
        }
        if state.status == Status::Cooling {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let state = supervisor.state("D").unwrap();
    assert_eq!(state.status, Status::Cooling);
    assert_eq!(state.restart_attempts, 2);
    assert!(state.pid.is_none());
    assert_eq!(state.last_exit_code, Some(1));
    assert_eq!(supervisor.tracked_workers(), 0);
    // Strictly increasing within the burst.
    assert!(seen_attempts.windows(2).all(|pair| pair[0] < pair[1]));

    // No further activation happens once the service is cooling.
    supervisor.reap_children();
    assert!(supervisor.state("D").unwrap().pid.is_none());

    drop(supervisor);
    drain_children();
}

#[tokio::test]
async fn test_lazy_takeover_handoff() {
    let _guard = lock_forking();
    let dir = unique_test_dir();
    let socket_path = dir.join("b.sock");

    let mut supervisor = Supervisor::new("graphical");
    let mut service = shell_spec("B", TAKEOVER_CHECK);
    service.lazy = true;
    service.socket_path = Some(socket_path.clone());
    service.socket_permissions = 0o660;
    supervisor.register(service);

    supervisor.prepare_sockets().unwrap();
    let metadata = std::fs::metadata(&socket_path).unwrap();
    assert_eq!(metadata.permissions().mode() & 0o7777, 0o660);

    let mut ready_rx = supervisor.take_ready_rx().unwrap();
    supervisor.activate_all();

    let state = supervisor.state("B").unwrap();
    assert_eq!(state.status, Status::Listening);
    assert!(state.listener_armed());
    assert!(state.pid.is_none());
    let listen_fd = state.listen_fd.expect("listener prepared");

    let _client = UnixStream::connect(&socket_path).unwrap();
    let ready = tokio::time::timeout(Duration::from_secs(5), ready_rx.recv())
        .await
        .expect("readiness never fired")
        .expect("channel closed");
    assert_eq!(ready.name, "B");

    supervisor.handle_socket_ready("B");
    let state = supervisor.state("B").unwrap();
    assert_eq!(state.status, Status::Running);
    assert!(!state.listener_armed());
    assert!(state.pid.is_some());
    // The listener is stable across spawns.
    assert_eq!(state.listen_fd, Some(listen_fd));

    for _ in 0..500 {
        supervisor.reap_children();
        if supervisor.state("B").unwrap().pid.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Exit 0 proves SOCKET_TAKEOVER=1 was set and fd 3 was the socket.
    assert_eq!(supervisor.state("B").unwrap().last_exit_code, Some(0));
    assert_eq!(supervisor.state("B").unwrap().listen_fd, Some(listen_fd));

    drop(supervisor);
    drain_children();
}

#[tokio::test]
async fn test_inetd_style_accept_spawns_per_connection() {
    let _guard = lock_forking();
    let dir = unique_test_dir();
    let socket_path = dir.join("c.sock");

    let mut supervisor = Supervisor::new("graphical");
    let mut service = shell_spec("C", TAKEOVER_CHECK);
    service.lazy = true;
    service.multi_instance = true;
    service.accept_socket_connections = true;
    service.socket_path = Some(socket_path.clone());
    supervisor.register(service);

    supervisor.prepare_sockets().unwrap();
    let mut ready_rx = supervisor.take_ready_rx().unwrap();
    supervisor.activate_all();

    for round in 0..3 {
        let _client = UnixStream::connect(&socket_path).unwrap();
        let ready = tokio::time::timeout(Duration::from_secs(5), ready_rx.recv())
            .await
            .unwrap_or_else(|_| panic!("readiness never fired on round {round}"))
            .expect("channel closed");
        assert_eq!(ready.name, "C");

        supervisor.handle_socket_ready("C");

        // Multi-instance workers are never tracked; the listener stays armed.
        let state = supervisor.state("C").unwrap();
        assert_eq!(state.status, Status::Listening);
        assert!(state.listener_armed());
        assert!(state.pid.is_none());
        assert_eq!(supervisor.tracked_workers(), 0);

        // The worker saw its accepted fd as fd 3.
        match waitpid(Pid::from_raw(-1), None).unwrap() {
            WaitStatus::Exited(_, code) => assert_eq!(code, 0, "round {round}"),
            other => panic!("unexpected wait status on round {round}: {other:?}"),
        }
    }

    drop(supervisor);
    drain_children();
}

#[tokio::test]
async fn test_disabled_by_boot_mode() {
    let dir = unique_test_dir();
    let socket_path = dir.join("e.sock");

    let mut supervisor = Supervisor::new("text");
    let mut service = spec("E", "/bin/true");
    service.socket_path = Some(socket_path.clone());
    supervisor.register(service);

    supervisor.prepare_sockets().unwrap();
    supervisor.activate_all();

    let state = supervisor.state("E").unwrap();
    assert_eq!(state.status, Status::Disabled);
    assert!(state.listen_fd.is_none());
    assert!(state.pid.is_none());
    assert!(!socket_path.exists());

    // Introspection still lists the spec.
    let reports = supervisor.report();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "E");
    assert_eq!(reports[0].pid, None);
}

#[tokio::test]
async fn test_privilege_drop_sets_identity_and_home() {
    if !Uid::effective().is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let Ok(account) = Account::from_name("nobody") else {
        eprintln!("skipping: no 'nobody' account");
        return;
    };

    let _guard = lock_forking();

    let script = format!(
        r#"[ "$(id -u)" = "{}" ] && [ "$(id -g)" = "{}" ] && [ "$HOME" = "{}" ]"#,
        account.uid.as_raw(),
        account.gid.as_raw(),
        account.home_directory.display()
    );

    let mut supervisor = Supervisor::new("graphical");
    let mut service = shell_spec("F", &script);
    service.user = Some("nobody".to_string());
    service.account = Some(account);
    supervisor.register(service);

    supervisor.activate("F");
    for _ in 0..500 {
        supervisor.reap_children();
        if supervisor.state("F").unwrap().pid.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(supervisor.state("F").unwrap().last_exit_code, Some(0));

    drop(supervisor);
    drain_children();
}
