//! Host Agent Daemon
//!
//! On-box control plane for a deployed application. Receives encrypted
//! administration commands over local Unix-socket channels, dispatches
//! them through a task registry, and returns framed, encrypted
//! responses. One control connection at a time; in-flight work is
//! always allowed to finish before the agent reports itself stopped.

pub mod config;
pub mod events;
pub mod health;
pub mod listener;
pub mod processor;
pub mod provision;
pub mod registry;
pub mod tasks;

/// Version reported by `versioncheck` and the SystemInfo task.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
