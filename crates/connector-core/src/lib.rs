//! Mount Connector Core Library
//!
//! Shared functionality for the connector daemon and its clients:
//! - Versioned newline-delimited JSON command protocol
//! - Configuration resolution and hierarchy
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{Command, Direction, PROTOCOL_VERSION, ProtocolError};
