//! svcd - declarative service supervisor
//!
//! Reads an INI-style service catalog, creates listening sockets on behalf
//! of the services that declare one, and starts workers eagerly or on first
//! socket activity. Exited workers are respawned according to a per-service
//! keep-alive policy with flap detection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                      svcd                        │
//! ├──────────────────────────────────────────────────┤
//! │  Catalog Loader  │  Socket Activator  │  Reaper  │
//! ├──────────────────────────────────────────────────┤
//! │          Supervisor (lifecycle engine)           │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod supervisor;

pub use catalog::{ConfigFile, ServiceSpec};
pub use supervisor::Supervisor;
