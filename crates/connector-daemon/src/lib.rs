//! Mount Connector Daemon Library
//!
//! Core functionality for the connector daemon:
//! - Preflight resolution of the mount helper binaries
//! - Mount helper invocation building and temporary config files
//! - Per-connection process sessions relaying helper stdio
//! - Unix socket server and connection handling

pub mod connection;
pub mod mount;
pub mod preflight;
pub mod server;
pub mod session;
