//! Marstek to MQTT Bridge
//!
//! Polls a Marstek Venus battery over its local UDP JSON API and publishes the
//! state to MQTT. Storage mode changes can be requested back over MQTT.

pub mod config;
pub mod errors;
pub mod marstek;
pub mod mqtt;

pub use config::Config;
pub use marstek::{DeviceSession, SessionSettings, StateSnapshot, StorageMode};
pub use mqtt::publisher::MqttPublisher;
