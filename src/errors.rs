//! Error types for the Marstek-MQTT bridge
//!
//! Transient transport failures are absorbed by the poll loop; everything
//! else reaches the caller. `main` wraps them in anyhow.

use std::time::Duration;

use crate::marstek::StorageMode;

/// UDP transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No reply from the device within the deadline. Transient.
    #[error("No reply from {peer} within {waited:?}")]
    Timeout { peer: String, waited: Duration },

    /// The device host answered with an ICMP refusal (port closed, host down). Transient.
    #[error("Device {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    /// Socket or OS level failure. The transport is unusable afterwards.
    #[error("UDP socket failure: {0}")]
    Fatal(#[source] std::io::Error),

    #[error("Failed to bind local UDP port {port}: {reason}")]
    BindFailed { port: u16, reason: String },
}

impl TransportError {
    /// Whether the normal poll cadence (or a command retry) may try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::Unreachable { .. }
        )
    }
}

/// Reply decoding errors
///
/// Messages only ever carry lengths, field names and offending scalar values,
/// never the raw payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty reply")]
    Empty,

    #[error("Malformed reply ({len} bytes): {reason}")]
    Malformed { len: usize, reason: String },

    #[error("Reply id {actual:?} does not match request id {expected}")]
    IdMismatch { expected: u32, actual: Option<u32> },

    #[error("Reply carries neither result nor error")]
    MissingResult,

    #[error("Device returned error {code} for {method}: {message}")]
    Device {
        method: &'static str,
        code: i64,
        message: String,
    },

    #[error("Unknown storage mode: {0:?}")]
    UnknownMode(String),

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Failures of a single poll cycle
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Mode command errors
///
/// A device that explicitly declines a mode change is not an error: it is
/// reported as `CommandResult { accepted: false, .. }`.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Transport busy, command for {0} not sent")]
    Busy(StorageMode),

    #[error("No acknowledgment for {mode} after {attempts} attempts")]
    Timeout { mode: StorageMode, attempts: u32 },

    #[error("Invalid acknowledgment: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Session not started")]
    NotRunning,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// MQTT connection and publishing errors
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Failed to publish message to topic '{topic}': {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    SubscribeFailed { topic: String, reason: String },

    #[error("Failed to serialize data: {error:?}")]
    SerializationError { error: serde_json::Error },

    #[error("MQTT client error: {0}")]
    ClientError(String),
}
