//! Versioned command protocol spoken over the connector socket.
//!
//! Every message is a single line of JSON:
//!
//! ```text
//! {"version":"v1","cmd":"<name>","payload":{...}}
//! ```
//!
//! The payload is decoded only after the version has been checked and the
//! command name resolved to one of the [`Command`] variants.

mod codec;
mod types;

pub use codec::{Envelope, PROTOCOL_VERSION, ProtocolError, decode, decode_envelope, encode};
pub use types::*;
