//! User account resolution
//!
//! `User=` entries are resolved once, at catalog load, into the credential
//! set a worker will drop to.

use std::ffi::CString;
use std::path::PathBuf;

use nix::unistd::{getgrouplist, Gid, Uid, User};

/// Resolved identity for a service's workers.
#[derive(Debug, Clone)]
pub struct Account {
    pub uid: Uid,
    pub gid: Gid,
    /// Supplementary groups, primary group included.
    pub extra_gids: Vec<Gid>,
    pub home_directory: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("no such user")]
    NoSuchUser,

    #[error("account database error: {0}")]
    Lookup(#[from] nix::Error),

    #[error("user name contains a NUL byte")]
    BadName(#[from] std::ffi::NulError),
}

impl Account {
    pub fn from_name(name: &str) -> Result<Self, AccountError> {
        let user = User::from_name(name)?.ok_or(AccountError::NoSuchUser)?;
        let c_name = CString::new(name)?;
        let extra_gids = getgrouplist(&c_name, user.gid)?;

        Ok(Self {
            uid: user.uid,
            gid: user.gid,
            extra_gids,
            home_directory: user.dir,
        })
    }
}
