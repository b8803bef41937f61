//! Data types for Marstek requests and replies
//!
//! Readings are already converted to SI units; wire scaling lives in the codec.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

/// Default UDP port of the Marstek local API
pub const DEFAULT_PORT: u16 = 30000;

/// Operating strategy of the energy storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
    Auto,
    #[serde(rename = "AI")]
    Ai,
    Manual,
    Passive,
}

impl StorageMode {
    /// Every mode, in the order a selector should offer them
    pub const ALL: [StorageMode; 4] = [
        StorageMode::Auto,
        StorageMode::Ai,
        StorageMode::Manual,
        StorageMode::Passive,
    ];

    /// Wire name as used in `ES.SetMode` / `ES.GetMode`
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Auto => "Auto",
            StorageMode::Ai => "AI",
            StorageMode::Manual => "Manual",
            StorageMode::Passive => "Passive",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = String;

    /// Exact wire names only; anything else is rejected rather than guessed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// One device endpoint, fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub host: IpAddr,
    pub port: u16,
    /// Local port to bind; `None` lets the OS choose
    pub local_port: Option<u16>,
}

impl DeviceAddress {
    pub fn new(host: IpAddr, port: u16, local_port: Option<u16>) -> Self {
        Self {
            host,
            port,
            local_port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Identity reported by `Marstek.GetDevice`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub ble_mac: Option<String>,
    pub wifi_name: Option<String>,
    pub wifi_mac: Option<String>,
}

/// Reply to `Bat.GetStatus`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatteryStatus {
    pub state_of_charge: Option<f64>, // %
    pub voltage: Option<f64>,         // V
    pub current: Option<f64>,         // A
    pub temperature: Option<f64>,     // °C
    pub capacity: Option<f64>,        // Wh
    pub rated_capacity: Option<f64>,  // Wh
    pub charging_allowed: Option<bool>,
    pub discharging_allowed: Option<bool>,
}

/// Reply to `ES.GetStatus`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergyStatus {
    pub battery_power: Option<f64>, // W (positive = discharging)
    pub pv_power: Option<f64>,      // W
    pub ongrid_power: Option<f64>,  // W (positive = import from grid)
    pub offgrid_power: Option<f64>, // W
    pub energy_today: Option<f64>,  // kWh
    pub energy_total: Option<f64>,  // kWh
}

/// Reply to `ES.GetMode`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModeStatus {
    pub mode: Option<StorageMode>,
    pub ongrid_power: Option<f64>,  // W (positive = import from grid)
    pub offgrid_power: Option<f64>, // W
    pub state_of_charge: Option<f64>,
    pub phase_a_power: Option<f64>,
    pub phase_b_power: Option<f64>,
    pub phase_c_power: Option<f64>,
    pub total_power: Option<f64>,
}

/// Reply to `ES.SetMode`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgment {
    pub accepted: bool,
}

/// Outcome of a mode change as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub accepted: bool,
    pub effective_mode: Option<StorageMode>,
}

impl CommandResult {
    pub fn accepted(mode: StorageMode) -> Self {
        Self {
            accepted: true,
            effective_mode: Some(mode),
        }
    }

    pub fn rejected() -> Self {
        Self {
            accepted: false,
            effective_mode: None,
        }
    }
}

fn bool_as_int<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*value))
}

/// Time window used by Manual mode (`manual_cfg`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualSchedule {
    pub time_num: u8,
    /// "HH:MM"
    pub start_time: String,
    /// "HH:MM"
    pub end_time: String,
    /// Weekday bitmask, bit 0 = Monday
    pub week_set: u8,
    /// W
    pub power: i32,
    #[serde(serialize_with = "bool_as_int")]
    pub enable: bool,
}

impl Default for ManualSchedule {
    fn default() -> Self {
        Self {
            time_num: 1,
            start_time: "08:30".to_string(),
            end_time: "20:30".to_string(),
            week_set: 127,
            power: 100,
            enable: true,
        }
    }
}

/// Setpoint used by Passive mode (`passive_cfg`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassiveSettings {
    /// W
    pub power: i32,
    /// Countdown in seconds before the device falls back
    pub cd_time: u32,
}

impl Default for PassiveSettings {
    fn default() -> Self {
        Self {
            power: 100,
            cd_time: 300,
        }
    }
}

/// A complete `ES.SetMode` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeCommand {
    pub mode: StorageMode,
    pub manual: ManualSchedule,
    pub passive: PassiveSettings,
}

impl ModeCommand {
    pub fn new(mode: StorageMode) -> Self {
        Self {
            mode,
            manual: ManualSchedule::default(),
            passive: PassiveSettings::default(),
        }
    }

    pub fn with_manual(mut self, manual: ManualSchedule) -> Self {
        self.manual = manual;
        self
    }

    pub fn with_passive(mut self, passive: PassiveSettings) -> Self {
        self.passive = passive;
        self
    }
}
