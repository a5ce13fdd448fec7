//! Worker process spawning
//!
//! The context a worker needs (argv, environment, credentials, stdio and
//! handoff plumbing) is assembled in the parent so the child branch is a
//! plain sequence of syscalls ending in `execve`. The child never returns:
//! it either execs, exits 1 on a privilege-drop failure, or aborts.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::process;

use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};

use crate::catalog::ServiceSpec;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("fork failed: {0}")]
    Fork(nix::Error),

    #[error("path or argument contains a NUL byte: {0}")]
    BadString(#[from] std::ffi::NulError),
}

struct WorkerCredentials {
    uid: Uid,
    gid: Gid,
    extra_gids: Vec<Gid>,
}

/// Everything the child branch needs, prepared before fork.
pub(super) struct WorkerContext {
    name: String,
    executable: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    working_directory: Option<CString>,
    stdio_path: Option<CString>,
    nice: i32,
    handoff_fd: RawFd,
    credentials: Option<WorkerCredentials>,
}

impl WorkerContext {
    pub(super) fn prepare(spec: &ServiceSpec, handoff_fd: RawFd) -> Result<Self, SpawnError> {
        let executable = path_cstring(&spec.executable_path)?;

        let mut argv = Vec::with_capacity(spec.arguments.len() + 1);
        argv.push(executable.clone());
        for argument in &spec.arguments {
            argv.push(CString::new(argument.as_str())?);
        }

        // The worker environment: the supervisor's own, plus the takeover
        // marker, the account home, and the catalog's extra entries. The
        // parent environment itself is never touched.
        let mut envp = Vec::new();
        for (key, value) in std::env::vars() {
            envp.push(CString::new(format!("{key}={value}"))?);
        }
        if handoff_fd >= 0 {
            envp.push(CString::new("SOCKET_TAKEOVER=1")?);
        }
        if let Some(account) = &spec.account {
            envp.push(CString::new(format!(
                "HOME={}",
                account.home_directory.display()
            ))?);
        }
        for entry in &spec.environment {
            envp.push(CString::new(entry.as_str())?);
        }

        let credentials = spec.account.as_ref().map(|account| WorkerCredentials {
            uid: account.uid,
            gid: account.gid,
            extra_gids: account.extra_gids.clone(),
        });

        Ok(Self {
            name: spec.name.clone(),
            executable,
            argv,
            envp,
            working_directory: spec
                .working_directory
                .as_deref()
                .map(path_cstring)
                .transpose()?,
            stdio_path: spec.stdio_path.as_deref().map(path_cstring).transpose()?,
            nice: spec.priority.nice_value(),
            handoff_fd,
            credentials,
        })
    }
}

fn path_cstring(path: &Path) -> Result<CString, std::ffi::NulError> {
    CString::new(path.as_os_str().as_bytes())
}

/// Child branch of spawn. Runs between fork and exec, and never returns.
pub(super) fn exec_worker(ctx: &WorkerContext) -> ! {
    if let Some(dir) = &ctx.working_directory {
        if unsafe { libc::chdir(dir.as_ptr()) } < 0 {
            child_abort(&ctx.name, "chdir");
        }
    }

    if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, ctx.nice) } < 0 {
        child_abort(&ctx.name, "setpriority");
    }

    wire_stdio(ctx);

    if ctx.handoff_fd >= 0 {
        if ctx.handoff_fd == 3 {
            // Already in place; just make sure it survives exec.
            if unsafe { libc::fcntl(3, libc::F_SETFD, 0) } < 0 {
                child_abort(&ctx.name, "fcntl");
            }
        } else if unsafe { libc::dup2(ctx.handoff_fd, 3) } < 0 {
            // dup2 leaves the new fd without close-on-exec.
            child_abort(&ctx.name, "dup2");
        }
    }

    if let Some(credentials) = &ctx.credentials {
        // gid first, then supplementary groups, then uid; once the uid is
        // dropped the others are no longer permitted.
        let dropped = setgid(credentials.gid)
            .and_then(|_| setgroups(&credentials.extra_gids))
            .and_then(|_| setuid(credentials.uid));
        if dropped.is_err() {
            eprintln!(
                "{}: failed to drop privileges (uid={}, gid={})",
                ctx.name, credentials.uid, credentials.gid
            );
            process::exit(1);
        }
    }

    let _ = nix::unistd::execve(&ctx.executable, &ctx.argv, &ctx.envp);
    eprintln!(
        "{}: exec {:?} failed: {}",
        ctx.name,
        ctx.executable,
        io::Error::last_os_error()
    );
    process::abort();
}

/// Wire fds 0/1/2 to the configured stdio file, or to /dev/null.
fn wire_stdio(ctx: &WorkerContext) {
    match &ctx.stdio_path {
        Some(path) => unsafe {
            libc::close(0);
            let fd = libc::open(path.as_ptr(), libc::O_RDWR);
            if fd < 0 {
                child_abort(&ctx.name, "open");
            }
            if fd != 0 {
                libc::dup2(fd, 0);
                libc::close(fd);
            }
            libc::dup2(0, 1);
            libc::dup2(0, 2);
            if libc::isatty(0) == 1 {
                libc::ioctl(0, libc::TIOCSCTTY, 0);
            }
        },
        None => unsafe {
            // Detach from the controlling tty before stdin goes away.
            if libc::isatty(0) == 1 {
                libc::ioctl(0, libc::TIOCNOTTY, 0);
            }
            libc::close(0);
            libc::close(1);
            libc::close(2);
            let fd = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
            if fd != 0 {
                child_abort(&ctx.name, "open /dev/null");
            }
            libc::dup2(0, 1);
            libc::dup2(0, 2);
        },
    }
}

fn child_abort(name: &str, what: &str) -> ! {
    eprintln!("{name}: {what} failed: {}", io::Error::last_os_error());
    process::abort();
}
