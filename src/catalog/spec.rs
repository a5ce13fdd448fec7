//! Typed service definitions
//!
//! One catalog group becomes one `ServiceSpec`. All cross-field constraints
//! are checked here, before any socket or process exists, so the runtime
//! paths can rely on them.

use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use super::{Account, ConfigFile};

/// Scheduling priority levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Numeric encoding used by the introspection record.
    pub fn scheduling_value(&self) -> u32 {
        match self {
            Self::Low => 10,
            Self::Normal => 30,
            Self::High => 50,
        }
    }

    /// Nice value applied to workers. Static scheduler priorities are
    /// rejected for ordinary policies on Linux, so the levels translate to
    /// niceness instead.
    pub(crate) fn nice_value(&self) -> i32 {
        match self {
            Self::Low => 5,
            Self::Normal => 0,
            Self::High => -5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("service {0} is not present in the catalog")]
    NoSuchService(String),

    #[error("{service}: unknown Priority value '{value}'")]
    UnknownPriority { service: String, value: String },

    #[error("{service}: Lazy requires Socket")]
    LazyWithoutSocket { service: String },

    #[error("{service}: AcceptSocketConnections requires Socket, Lazy and MultiInstance")]
    AcceptWithoutLazyMultiInstance { service: String },

    #[error("{service}: MultiInstance cannot be combined with KeepAlive")]
    MultiInstanceKeepAlive { service: String },

    #[error("{service}: Socket path '{path}' does not fit a socket address")]
    SocketPathTooLong { service: String, path: String },

    #[error("{service}: invalid SocketPermissions value '{value}'")]
    InvalidSocketPermissions { service: String, value: String },

    #[error("{service}: BootModes must name at least one mode")]
    EmptyBootModes { service: String },
}

/// Immutable description of one service, validated at load.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub executable_path: PathBuf,
    pub arguments: Vec<String>,
    pub stdio_path: Option<PathBuf>,
    pub priority: Priority,
    pub keep_alive: bool,
    pub lazy: bool,
    pub multi_instance: bool,
    pub accept_socket_connections: bool,
    pub socket_path: Option<PathBuf>,
    /// Mode bits for the socket file, masked to 04777.
    pub socket_permissions: u32,
    /// Raw `User=` value, kept for introspection.
    pub user: Option<String>,
    pub account: Option<Account>,
    pub working_directory: Option<PathBuf>,
    /// `KEY=VALUE` entries appended to the worker environment.
    pub environment: Vec<String>,
    pub boot_modes: Vec<String>,
}

impl ServiceSpec {
    /// Build one spec from its catalog group.
    pub fn load(config: &ConfigFile, name: &str) -> Result<Self, ConfigError> {
        if !config.has_group(name) {
            return Err(ConfigError::NoSuchService(name.to_string()));
        }

        let executable_path =
            PathBuf::from(config.read_entry_or(name, "Executable", &format!("/bin/{name}")));
        let arguments = split_on(&config.read_entry_or(name, "Arguments", ""), ' ');
        let stdio_path = config.read_entry(name, "StdIO").map(PathBuf::from);

        let priority = match config.read_entry(name, "Priority") {
            None => Priority::default(),
            Some(value) => {
                Priority::parse(value).ok_or_else(|| ConfigError::UnknownPriority {
                    service: name.to_string(),
                    value: value.to_string(),
                })?
            }
        };

        let keep_alive = config.read_bool_entry(name, "KeepAlive");
        let lazy = config.read_bool_entry(name, "Lazy");
        let multi_instance = config.read_bool_entry(name, "MultiInstance");
        let accept_socket_connections = config.read_bool_entry(name, "AcceptSocketConnections");

        let user = config.read_entry(name, "User").map(str::to_string);
        let account = user.as_deref().and_then(|user| match Account::from_name(user) {
            Ok(account) => Some(account),
            Err(err) => {
                log::warn!("Failed to resolve user {user}: {err}");
                None
            }
        });

        let working_directory = config.read_entry(name, "WorkingDirectory").map(PathBuf::from);
        let environment = split_on(&config.read_entry_or(name, "Environment", ""), ' ');
        let boot_modes = split_on(&config.read_entry_or(name, "BootModes", "graphical"), ',');

        let socket_path = config.read_entry(name, "Socket").map(PathBuf::from);
        let permissions_string = config.read_entry_or(name, "SocketPermissions", "0600");
        let socket_permissions = u32::from_str_radix(&permissions_string, 8)
            .map(|mode| mode & 0o4777)
            .map_err(|_| ConfigError::InvalidSocketPermissions {
                service: name.to_string(),
                value: permissions_string,
            })?;

        // Lazy requires Socket.
        if lazy && socket_path.is_none() {
            return Err(ConfigError::LazyWithoutSocket {
                service: name.to_string(),
            });
        }
        // AcceptSocketConnections always requires Socket, Lazy and MultiInstance.
        if accept_socket_connections && !(socket_path.is_some() && lazy && multi_instance) {
            return Err(ConfigError::AcceptWithoutLazyMultiInstance {
                service: name.to_string(),
            });
        }
        // MultiInstance doesn't work with KeepAlive.
        if multi_instance && keep_alive {
            return Err(ConfigError::MultiInstanceKeepAlive {
                service: name.to_string(),
            });
        }
        // The path (plus NUL) must fit into the address passed to bind().
        if let Some(path) = &socket_path {
            if path.as_os_str().as_bytes().len() >= sun_path_capacity() {
                return Err(ConfigError::SocketPathTooLong {
                    service: name.to_string(),
                    path: path.display().to_string(),
                });
            }
        }
        if boot_modes.is_empty() {
            return Err(ConfigError::EmptyBootModes {
                service: name.to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            executable_path,
            arguments,
            stdio_path,
            priority,
            keep_alive,
            lazy,
            multi_instance,
            accept_socket_connections,
            socket_path,
            socket_permissions,
            user,
            account,
            working_directory,
            environment,
            boot_modes,
        })
    }

    /// Whether this service participates in the given boot mode.
    pub fn is_enabled(&self, boot_mode: &str) -> bool {
        self.boot_modes.iter().any(|mode| mode == boot_mode)
    }
}

/// Split on the separator, without quoting. Empty pieces are dropped, so
/// empty input yields an empty sequence.
fn split_on(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}

/// Byte capacity of `sockaddr_un.sun_path` on this platform.
pub(crate) fn sun_path_capacity() -> usize {
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("low"), Some(Priority::Low));
        assert_eq!(Priority::parse("normal"), Some(Priority::Normal));
        assert_eq!(Priority::parse("high"), Some(Priority::High));
        assert_eq!(Priority::parse("HIGH"), None);
        assert_eq!(Priority::parse("idle"), None);
    }

    #[test]
    fn test_priority_values() {
        assert_eq!(Priority::Low.scheduling_value(), 10);
        assert_eq!(Priority::Normal.scheduling_value(), 30);
        assert_eq!(Priority::High.scheduling_value(), 50);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_split_on_drops_empty_pieces() {
        assert_eq!(split_on("", ' '), Vec::<String>::new());
        assert_eq!(split_on("a b", ' '), vec!["a", "b"]);
        assert_eq!(split_on("a  b", ' '), vec!["a", "b"]);
        assert_eq!(split_on("graphical,text", ','), vec!["graphical", "text"]);
    }

    #[test]
    fn test_sun_path_capacity_is_sane() {
        // 108 on Linux; the exact number only has to be positive and small.
        let capacity = sun_path_capacity();
        assert!(capacity > 0 && capacity <= 256);
    }
}
