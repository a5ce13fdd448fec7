//! Service supervisor
//!
//! Owns the loaded specs, their runtime states, the pid registry and the
//! readiness channel. Everything here runs on the event loop; the only
//! other tasks are the per-listener readiness watchers, which never touch
//! supervisor state.

mod notifier;
mod report;
mod socket;
mod spawn;
mod state;

pub use notifier::{SocketNotifier, SocketReady};
pub use report::ServiceReport;
pub use socket::{create_listener, SocketSetupError, LISTEN_BACKLOG};
pub use spawn::SpawnError;
pub use state::{ServiceState, Status, FAST_EXIT_WINDOW, FAST_RETRY_LIMIT};

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tokio::sync::mpsc;

use crate::catalog::{ConfigFile, ServiceSpec};

use spawn::WorkerContext;

/// How a reaped worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(Signal),
}

impl ExitOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Shell-style encoding: 128+signal for signaled exits.
    pub fn code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signal) => 128 + *signal as i32,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

struct ServiceEntry {
    spec: ServiceSpec,
    state: ServiceState,
}

/// The supervisor: one per process, driven by the event loop.
pub struct Supervisor {
    boot_mode: String,
    /// Registration order, which is catalog order.
    order: Vec<String>,
    entries: HashMap<String, ServiceEntry>,
    /// Live tracked workers. Never contains multi-instance pids.
    registry: HashMap<Pid, String>,
    ready_tx: mpsc::Sender<SocketReady>,
    ready_rx: Option<mpsc::Receiver<SocketReady>>,
}

impl Supervisor {
    pub fn new(boot_mode: &str) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(64);
        Self {
            boot_mode: boot_mode.to_string(),
            order: Vec::new(),
            entries: HashMap::new(),
            registry: HashMap::new(),
            ready_tx,
            ready_rx: Some(ready_rx),
        }
    }

    /// Take the readiness receiver, to be drained by the event loop.
    pub fn take_ready_rx(&mut self) -> Option<mpsc::Receiver<SocketReady>> {
        self.ready_rx.take()
    }

    /// Load every group of the catalog. A rejected service is logged and
    /// skipped; it never takes the supervisor down.
    pub fn load_catalog(&mut self, config: &ConfigFile) {
        let names: Vec<String> = config.groups().map(str::to_string).collect();
        for name in names {
            match ServiceSpec::load(config, &name) {
                Ok(spec) => self.register(spec),
                Err(err) => log::error!("Refusing to register {name}: {err}"),
            }
        }
    }

    /// Register one validated spec. Boot-mode gating happens here: a spec
    /// not enabled for the current mode is parked in Disabled and never
    /// gets a socket or a worker.
    pub fn register(&mut self, spec: ServiceSpec) {
        if self.entries.contains_key(&spec.name) {
            log::warn!("{}: already registered, ignoring duplicate", spec.name);
            return;
        }

        let mut state = ServiceState::new();
        if !spec.is_enabled(&self.boot_mode) {
            log::info!("{}: disabled in {} mode", spec.name, self.boot_mode);
            state.status = Status::Disabled;
        }

        self.order.push(spec.name.clone());
        self.entries.insert(spec.name.clone(), ServiceEntry { spec, state });
    }

    /// Create and bind every eligible listener. Runs to completion before
    /// any worker is spawned, so services can rely on each other's sockets
    /// existing. Any failure is fatal to the supervisor.
    pub fn prepare_sockets(&mut self) -> Result<(), SocketSetupError> {
        for name in &self.order {
            let Some(entry) = self.entries.get_mut(name) else {
                continue;
            };
            if entry.state.status == Status::Disabled {
                continue;
            }
            let Some(path) = &entry.spec.socket_path else {
                continue;
            };

            let fd = socket::create_listener(
                path,
                entry.spec.socket_permissions,
                entry.spec.account.as_ref(),
            )?;
            entry.state.listen_fd = Some(fd);
            log::info!("{name}: listening on {} (fd {fd})", path.display());
        }
        Ok(())
    }

    /// Activate every enabled service in catalog order.
    pub fn activate_all(&mut self) {
        for name in self.order.clone() {
            let status = self.entries[&name].state.status;
            if status == Status::Disabled {
                continue;
            }
            self.activate(&name);
        }
    }

    /// Start a service: arm the listener for lazy services, spawn a worker
    /// otherwise. Callers guarantee no tracked worker is alive.
    pub fn activate(&mut self, name: &str) {
        let Some(entry) = self.entries.get_mut(name) else {
            log::error!("Cannot activate unknown service {name}");
            return;
        };
        if entry.state.status == Status::Disabled {
            return;
        }
        debug_assert!(entry.state.pid.is_none());

        if entry.spec.lazy {
            let Some(listen_fd) = entry.state.listen_fd else {
                log::error!("{name}: lazy service has no listener to arm");
                return;
            };
            entry.state.notifier = Some(SocketNotifier::arm(
                name.to_string(),
                listen_fd,
                entry.spec.accept_socket_connections,
                self.ready_tx.clone(),
            ));
            entry.state.status = Status::Listening;
            log::info!("{name}: waiting for activity on its socket");
        } else {
            let handoff_fd = entry.state.listen_fd.unwrap_or(-1);
            self.spawn(name, handoff_fd);
        }
    }

    /// A watched listener became readable.
    pub fn handle_socket_ready(&mut self, name: &str) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        // Stale message: the notifier was disarmed while it was in flight.
        if entry.state.notifier.is_none() {
            return;
        }
        let Some(listen_fd) = entry.state.listen_fd else {
            return;
        };

        if entry.spec.accept_socket_connections {
            let accepted =
                unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if accepted < 0 {
                log::warn!(
                    "{name}: accept failed: {}",
                    std::io::Error::last_os_error()
                );
                return;
            }
            self.spawn(name, accepted);
            // The worker holds its own dup; the listener stays armed.
            unsafe { libc::close(accepted) };
        } else {
            if let Some(notifier) = entry.state.notifier.take() {
                notifier.disarm();
            }
            // The worker takes over the listener itself.
            self.spawn(name, listen_fd);
        }
    }

    /// Fork a worker, handing it `handoff_fd` as fd 3 when non-negative.
    fn spawn(&mut self, name: &str, handoff_fd: RawFd) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        entry.state.run_timer_start = Some(Instant::now());

        let ctx = match WorkerContext::prepare(&entry.spec, handoff_fd) {
            Ok(ctx) => ctx,
            Err(err) => {
                log::error!("Failed to spawn {name}: {err}");
                return;
            }
        };

        match unsafe { fork() } {
            Ok(ForkResult::Child) => spawn::exec_worker(&ctx),
            Ok(ForkResult::Parent { child }) => {
                log::info!("{name}: started worker (pid {child})");
                if !entry.spec.multi_instance {
                    entry.state.pid = Some(child);
                    entry.state.status = Status::Running;
                    self.registry.insert(child, name.to_string());
                }
            }
            Err(errno) => {
                // No worker came to exist, so the restart policy does not
                // apply; the service stays as it was.
                log::error!("Failed to spawn {name}: {}", SpawnError::Fork(errno));
            }
        }
    }

    /// Drain every pending child exit. Called on SIGCHLD.
    pub fn reap_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.on_child_reaped(pid, ExitOutcome::Exited(code));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.on_child_reaped(pid, ExitOutcome::Signaled(signal));
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(err) => {
                    log::error!("waitpid failed: {err}");
                    break;
                }
            }
        }
    }

    /// Route one reaped pid to its owning service. Exits of untracked pids
    /// (multi-instance workers) are observed and discarded.
    pub fn on_child_reaped(&mut self, pid: Pid, outcome: ExitOutcome) {
        let Some(name) = self.registry.get(&pid).cloned() else {
            log::debug!("Reaped untracked pid {pid} ({outcome})");
            return;
        };
        self.service_exited(&name, pid, outcome);
    }

    /// Apply the restart policy to an observed worker exit.
    fn service_exited(&mut self, name: &str, pid: Pid, outcome: ExitOutcome) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };

        self.registry.remove(&pid);
        entry.state.pid = None;
        entry.state.status = Status::Inactive;
        entry.state.last_exit_code = Some(outcome.code());
        log::info!("{name}: worker (pid {pid}) exited with {outcome}");

        if !entry.spec.keep_alive {
            return;
        }

        let run_time = entry
            .state
            .run_timer_start
            .map(|start| start.elapsed())
            .unwrap_or_default();

        match state::decide_restart(outcome.is_clean(), run_time, entry.state.restart_attempts) {
            state::RestartDecision::Resume => entry.state.restart_attempts = 0,
            state::RestartDecision::Retry => {
                match entry.state.restart_attempts {
                    0 => log::warn!("Trying again"),
                    _ => log::warn!("Third time's a charm?"),
                }
                entry.state.restart_attempts += 1;
            }
            state::RestartDecision::GiveUp => {
                log::error!("Giving up on {name}");
                entry.state.status = Status::Cooling;
                return;
            }
        }

        self.activate(name);
    }

    /// Snapshot every service, in catalog order.
    pub fn report(&self) -> Vec<ServiceReport> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|entry| ServiceReport::new(&entry.spec, &entry.state))
            .collect()
    }

    pub fn spec(&self, name: &str) -> Option<&ServiceSpec> {
        self.entries.get(name).map(|entry| &entry.spec)
    }

    pub fn state(&self, name: &str) -> Option<&ServiceState> {
        self.entries.get(name).map(|entry| &entry.state)
    }

    /// The service owning a live tracked worker, if any.
    pub fn service_for_pid(&self, pid: Pid) -> Option<&str> {
        self.registry.get(&pid).map(String::as_str)
    }

    pub fn tracked_workers(&self) -> usize {
        self.registry.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
