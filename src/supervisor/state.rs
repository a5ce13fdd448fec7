//! Per-service runtime state
//!
//! ```text
//!     ┌──────────┐  activate (lazy)   ┌───────────┐
//!     │ Inactive │───────────────────▶│ Listening │◀─┐ readiness (accept)
//!     └────┬─────┘                    └─────┬─────┘──┘
//!          │ activate                       │ readiness (takeover)
//!     ┌────▼─────┐◀──────────────────────────┘
//!     │ Running  │──exit, keep-alive──▶ Running (respawn)
//!     └────┬─────┘
//!          │ exit                  quick failures exhausted
//!     ┌────▼─────┐                    ┌─────────┐
//!     │ Inactive │                    │ Cooling │
//!     └──────────┘                    └─────────┘
//! ```
//!
//! Disabled is entered at registration when the boot mode does not match,
//! and is terminal.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::unistd::Pid;

use super::notifier::SocketNotifier;

/// A failed run shorter than this counts as a flap.
pub const FAST_EXIT_WINDOW: Duration = Duration::from_millis(1000);

/// How many flaps in a row are forgiven before the supervisor gives up.
pub const FAST_RETRY_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Inactive,
    /// Lazy service armed on its listener, no worker yet.
    Listening,
    /// A tracked worker is alive.
    Running,
    /// Gave up restarting after repeated quick failures.
    Cooling,
    /// Not eligible in the current boot mode.
    Disabled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Listening => "listening",
            Self::Running => "running",
            Self::Cooling => "cooling",
            Self::Disabled => "disabled",
        }
    }
}

/// Mutable side of a service. One per registered spec.
#[derive(Debug, Default)]
pub struct ServiceState {
    pub status: Status,
    /// Listener created at most once, held for the supervisor's lifetime.
    pub listen_fd: Option<RawFd>,
    /// Tracked worker. Never set for multi-instance services.
    pub pid: Option<Pid>,
    /// When the most recent worker was spawned.
    pub run_timer_start: Option<Instant>,
    /// Quick failures in the current burst.
    pub restart_attempts: u32,
    /// Most recent observed exit (128+signal for signaled exits).
    pub last_exit_code: Option<i32>,
    pub(crate) notifier: Option<SocketNotifier>,
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a readiness watcher is currently registered.
    pub fn listener_armed(&self) -> bool {
        self.notifier.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartDecision {
    /// Clean exit or long run: reset the flap counter and respawn.
    Resume,
    /// Quick failure with retries left: count it and respawn.
    Retry,
    /// Quick failure, retries exhausted.
    GiveUp,
}

/// The restart policy, as a pure function of the observed exit.
///
/// A run of exactly `FAST_EXIT_WINDOW` counts as a long run.
pub(crate) fn decide_restart(
    exited_cleanly: bool,
    run_time: Duration,
    attempts: u32,
) -> RestartDecision {
    if exited_cleanly || run_time >= FAST_EXIT_WINDOW {
        RestartDecision::Resume
    } else if attempts < FAST_RETRY_LIMIT {
        RestartDecision::Retry
    } else {
        RestartDecision::GiveUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_state_new() {
        let state = ServiceState::new();
        assert_eq!(state.status, Status::Inactive);
        assert!(state.pid.is_none());
        assert!(state.listen_fd.is_none());
        assert!(!state.listener_armed());
        assert_eq!(state.restart_attempts, 0);
    }

    #[test]
    fn test_quick_failure_retries_then_gives_up() {
        assert_eq!(decide_restart(false, ms(10), 0), RestartDecision::Retry);
        assert_eq!(decide_restart(false, ms(10), 1), RestartDecision::Retry);
        assert_eq!(decide_restart(false, ms(10), 2), RestartDecision::GiveUp);
    }

    #[test]
    fn test_window_boundary() {
        // 999 ms is still a flap; 1000 ms is a long run.
        assert_eq!(decide_restart(false, ms(999), 0), RestartDecision::Retry);
        assert_eq!(decide_restart(false, ms(1000), 2), RestartDecision::Resume);
        assert_eq!(decide_restart(false, ms(500), 2), RestartDecision::GiveUp);
    }

    #[test]
    fn test_clean_exit_always_resumes() {
        assert_eq!(decide_restart(true, ms(1), 0), RestartDecision::Resume);
        assert_eq!(decide_restart(true, ms(1), 2), RestartDecision::Resume);
        assert_eq!(decide_restart(true, ms(5000), 1), RestartDecision::Resume);
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(Status::Inactive.as_str(), "inactive");
        assert_eq!(Status::Listening.as_str(), "listening");
        assert_eq!(Status::Running.as_str(), "running");
        assert_eq!(Status::Cooling.as_str(), "cooling");
        assert_eq!(Status::Disabled.as_str(), "disabled");
    }
}
