//! Listener readiness watching
//!
//! Watches a lazy service's listening socket and tells the supervisor when a
//! client shows up. The watcher only detects readiness; accepting, forking
//! and all state changes stay on the supervisor's event loop.

use std::os::unix::io::RawFd;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Message sent when a watched listener becomes readable.
#[derive(Debug)]
pub struct SocketReady {
    pub name: String,
}

/// Owned handle to a watcher task. Held by the service state; its presence
/// is the "listener armed" flag.
#[derive(Debug)]
pub struct SocketNotifier {
    task: JoinHandle<()>,
}

impl SocketNotifier {
    /// Start watching `fd`. With `keep_armed` the watcher keeps reporting
    /// readiness (inetd-style accept services); otherwise it stops after the
    /// first report and the listener is handed to the worker.
    pub fn arm(name: String, fd: RawFd, keep_armed: bool, tx: mpsc::Sender<SocketReady>) -> Self {
        let task = tokio::spawn(watch_listener(name, fd, keep_armed, tx));
        Self { task }
    }

    /// Explicitly deregister the watcher.
    pub fn disarm(self) {
        self.task.abort();
    }
}

async fn watch_listener(name: String, fd: RawFd, keep_armed: bool, tx: mpsc::Sender<SocketReady>) {
    let async_fd = match AsyncFd::with_interest(fd, Interest::READABLE) {
        Ok(async_fd) => async_fd,
        Err(err) => {
            log::error!("{name}: failed to watch listener fd {fd}: {err}");
            return;
        }
    };

    loop {
        match async_fd.ready(Interest::READABLE).await {
            Ok(mut guard) => {
                log::debug!("{name}: activity on listener fd {fd}");
                if tx.send(SocketReady { name: name.clone() }).await.is_err() {
                    break;
                }
                guard.clear_ready();
                if !keep_armed {
                    break;
                }
            }
            Err(err) => {
                log::error!("{name}: error waiting on listener: {err}");
                break;
            }
        }
    }
}
