//! Listening socket setup for socket-activated services
//!
//! Listeners are created, owned and bound before any worker exists, and are
//! kept open for the supervisor's lifetime so clients never observe a gap
//! across worker restarts.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::catalog::{sun_path_capacity, Account};

pub const LISTEN_BACKLOG: libc::c_int = 16;

#[derive(Debug, thiserror::Error)]
pub enum SocketSetupError {
    #[error("failed to create parent directories for {0}: {1}")]
    CreateDirectories(PathBuf, #[source] io::Error),

    #[error("failed to create socket for {0}: {1}")]
    Create(PathBuf, #[source] io::Error),

    #[error("failed to set owner of socket {0}: {1}")]
    Chown(PathBuf, #[source] io::Error),

    #[error("failed to set permissions of socket {0}: {1}")]
    Chmod(PathBuf, #[source] io::Error),

    #[error("failed to bind {0}: {1}")]
    Bind(PathBuf, #[source] io::Error),

    #[error("failed to listen on {0}: {1}")]
    Listen(PathBuf, #[source] io::Error),
}

/// Create, own, permission, bind and listen on a UNIX stream socket.
///
/// The socket is close-on-exec so workers never inherit it by accident; the
/// one fd a worker does need is re-duped without the flag at spawn time. The
/// owner and mode are applied to the fd before bind so the socket file is
/// born with them.
pub fn create_listener(
    path: &Path,
    permissions: u32,
    account: Option<&Account>,
) -> Result<RawFd, SocketSetupError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| SocketSetupError::CreateDirectories(path.to_path_buf(), err))?;
    }

    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(SocketSetupError::Create(
            path.to_path_buf(),
            io::Error::last_os_error(),
        ));
    }

    if let Some(account) = account {
        if unsafe { libc::fchown(fd, account.uid.as_raw(), account.gid.as_raw()) } < 0 {
            return Err(fail(fd, path, SocketSetupError::Chown));
        }
    }

    if unsafe { libc::fchmod(fd, permissions as libc::mode_t) } < 0 {
        return Err(fail(fd, path, SocketSetupError::Chmod));
    }

    let addr = socket_address(path);
    let addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    if unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len) } < 0 {
        return Err(fail(fd, path, SocketSetupError::Bind));
    }

    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
        return Err(fail(fd, path, SocketSetupError::Listen));
    }

    Ok(fd)
}

fn fail(
    fd: RawFd,
    path: &Path,
    make: fn(PathBuf, io::Error) -> SocketSetupError,
) -> SocketSetupError {
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    make(path.to_path_buf(), err)
}

fn socket_address(path: &Path) -> libc::sockaddr_un {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Catalog validation guarantees the path plus NUL fits.
    debug_assert!(bytes.len() < sun_path_capacity());
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::fs::PermissionsExt;

    fn test_path(name: &str) -> PathBuf {
        let dir = PathBuf::from(format!("/tmp/svcd-socket-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_creates_socket_file_with_mode() {
        let path = test_path("mode.sock");
        let fd = create_listener(&path, 0o660, None).unwrap();
        assert!(fd >= 0);

        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.file_type().is_socket());
        assert_eq!(metadata.permissions().mode() & 0o7777, 0o660);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_creates_missing_parent_directories() {
        let path = test_path("nested").join("deeper/parent.sock");
        let fd = create_listener(&path, 0o600, None).unwrap();
        assert!(path.exists());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_bind_fails_on_existing_socket_file() {
        let path = test_path("dup.sock");
        let fd = create_listener(&path, 0o600, None).unwrap();
        let result = create_listener(&path, 0o600, None);
        assert!(matches!(result, Err(SocketSetupError::Bind(..))));
        unsafe { libc::close(fd) };
    }
}
