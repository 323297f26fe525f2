//! IPC module for host-to-daemon communication
//!
//! Provides a Unix socket server that exposes the cache operations and the
//! memory-pressure notification to processes outside the daemon.

pub mod protocol;
pub mod server;

pub use protocol::{Command, Response};
pub use server::IpcServer;
