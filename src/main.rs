//! svcd - declarative service supervisor daemon
//!
//! Loads the catalog, binds every declared socket, activates all enabled
//! services and then sits on the event loop: SIGCHLD drives reaping and
//! restarts, readiness messages drive lazy activation, SIGUSR1 dumps the
//! service state as JSON to the log.

use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use svcd::catalog::ConfigFile;
use svcd::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "svcd")]
#[command(about = "Declarative service supervisor with socket activation")]
struct Args {
    /// Path to the service catalog
    #[arg(long, default_value = "/etc/svcd.conf")]
    config: PathBuf,

    /// Boot mode gating which services are eligible
    #[arg(long, default_value = "graphical")]
    boot_mode: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ConfigFile::open(&args.config)?;

    let mut supervisor = Supervisor::new(&args.boot_mode);
    supervisor.load_catalog(&config);

    // All listeners exist and are bound before the first worker runs, so
    // services may connect to each other's sockets right away.
    supervisor.prepare_sockets()?;
    supervisor.activate_all();

    let mut ready_rx = supervisor
        .take_ready_rx()
        .ok_or("readiness channel already taken")?;
    let mut sigchld = signal(SignalKind::child())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    log::info!(
        "Supervising {} services (boot mode {})",
        supervisor.len(),
        args.boot_mode
    );

    loop {
        tokio::select! {
            _ = sigchld.recv() => supervisor.reap_children(),
            _ = sigusr1.recv() => dump_state(&supervisor),
            Some(ready) = ready_rx.recv() => supervisor.handle_socket_ready(&ready.name),
        }
    }
}

fn dump_state(supervisor: &Supervisor) {
    match serde_json::to_string_pretty(&supervisor.report()) {
        Ok(json) => log::info!("Service state:\n{json}"),
        Err(err) => log::error!("Failed to serialize service state: {err}"),
    }
}
