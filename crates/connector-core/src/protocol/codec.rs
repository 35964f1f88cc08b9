//! Envelope encoding and decoding.
//!
//! One command per line. Decoding is strict: the version must match exactly
//! and the command name must be known before the payload is looked at.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use super::types::*;

/// The only protocol version this build speaks.
pub const PROTOCOL_VERSION: &str = "v1";

/// Outer wrapper around every message on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub cmd: String,
    #[serde(default)]
    pub payload: Value,
}

/// Reasons a line could not be turned into a [`Command`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    #[error("Protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: &'static str, found: String },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed {command} payload: {source}")]
    MalformedPayload {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {command}: {source}")]
    Encode {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a command as a newline-terminated envelope.
pub fn encode(cmd: &Command) -> Result<Vec<u8>, ProtocolError> {
    let command = cmd.name();
    let payload = match cmd {
        Command::InitFilesystemMount(c) => serde_json::to_value(c),
        Command::InitObjectStoreMount(c) => serde_json::to_value(c),
        Command::RequestData(c) => serde_json::to_value(c),
        Command::ResponseData(c) => serde_json::to_value(c),
        Command::Terminate(c) => serde_json::to_value(c),
    }
    .map_err(|source| ProtocolError::Encode { command, source })?;

    let envelope = Envelope {
        version: PROTOCOL_VERSION.to_string(),
        cmd: command.to_string(),
        payload,
    };
    let mut line = serde_json::to_vec(&envelope)
        .map_err(|source| ProtocolError::Encode { command, source })?;
    line.push(b'\n');
    Ok(line)
}

/// Decode a single line into a command.
pub fn decode(line: &str) -> Result<Command, ProtocolError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let envelope: Envelope =
        serde_json::from_str(line).map_err(ProtocolError::MalformedEnvelope)?;
    decode_envelope(envelope)
}

/// Decode an already-parsed envelope.
pub fn decode_envelope(envelope: Envelope) -> Result<Command, ProtocolError> {
    if envelope.version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: envelope.version,
        });
    }

    let payload = envelope.payload;
    match envelope.cmd.as_str() {
        INIT_FILESYSTEM_MOUNT_CMD => {
            payload_as(INIT_FILESYSTEM_MOUNT_CMD, payload).map(Command::InitFilesystemMount)
        }
        INIT_OBJECT_STORE_MOUNT_CMD => {
            payload_as(INIT_OBJECT_STORE_MOUNT_CMD, payload).map(Command::InitObjectStoreMount)
        }
        REQUEST_DATA_CMD => payload_as(REQUEST_DATA_CMD, payload).map(Command::RequestData),
        RESPONSE_DATA_CMD => payload_as(RESPONSE_DATA_CMD, payload).map(Command::ResponseData),
        TERMINATE_CMD => payload_as(TERMINATE_CMD, payload).map(Command::Terminate),
        _ => Err(ProtocolError::UnknownCommand(envelope.cmd)),
    }
}

fn payload_as<T: DeserializeOwned>(
    command: &'static str,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::MalformedPayload { command, source })
}
