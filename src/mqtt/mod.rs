//! MQTT side of the bridge

pub mod context;
pub mod publisher;
pub mod types;

use crate::marstek::StorageMode;

pub use publisher::MqttPublisher;
pub use types::{device_id, CommandOutcome, Status, SystemInfo};

/// Something the broker told us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    /// Payload of `mode/set` named a mode
    ModeRequested(StorageMode),
    /// Payload of `mode/set` that is not a mode name
    InvalidRequest(String),
    ConnectionLost(String),
}
