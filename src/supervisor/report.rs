//! Structured per-service snapshots for introspection

use std::path::PathBuf;

use serde::Serialize;

use crate::catalog::ServiceSpec;

use super::state::ServiceState;

/// Snapshot of one service: the declarative fields plus the live pid and
/// flap counter. `pid` is null whenever no tracked worker is alive.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub name: String,
    pub executable_path: PathBuf,
    pub stdio_file_path: Option<PathBuf>,
    pub priority: u32,
    pub keep_alive: bool,
    pub socket_path: Option<PathBuf>,
    pub socket_permissions: u32,
    pub lazy: bool,
    pub user: Option<String>,
    pub multi_instance: bool,
    pub accept_socket_connections: bool,
    pub pid: Option<i32>,
    pub restart_attempts: u32,
    pub working_directory: Option<PathBuf>,
}

impl ServiceReport {
    pub fn new(spec: &ServiceSpec, state: &ServiceState) -> Self {
        Self {
            name: spec.name.clone(),
            executable_path: spec.executable_path.clone(),
            stdio_file_path: spec.stdio_path.clone(),
            priority: spec.priority.scheduling_value(),
            keep_alive: spec.keep_alive,
            socket_path: spec.socket_path.clone(),
            socket_permissions: spec.socket_permissions,
            lazy: spec.lazy,
            user: spec.user.clone(),
            multi_instance: spec.multi_instance,
            accept_socket_connections: spec.accept_socket_connections,
            pid: state.pid.map(|pid| pid.as_raw()),
            restart_attempts: state.restart_attempts,
            working_directory: spec.working_directory.clone(),
        }
    }
}
