use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MarstekConfig;
use crate::errors::CommandError;
use crate::marstek::{CommandResult, DeviceInfo, StateSnapshot, StorageMode};

fn round(value: Option<f64>, decimals: i32) -> Option<f64> {
    let multiplier = 10_f64.powi(decimals);
    value.map(|v| (v * multiplier).round() / multiplier)
}

/// Topic segment identifying the device: `<model>-<ble_mac>`, or the host
/// address while the identity is unknown.
pub fn device_id(info: Option<&DeviceInfo>, host: IpAddr) -> String {
    match info.map(|i| (i.model.as_deref(), i.ble_mac.as_deref())) {
        Some((Some(model), Some(mac))) => format!("{}-{}", model, mac),
        _ => format!("marstek-{}", host).replace(['.', ':'], "_"),
    }
}

/// Flat view of a snapshot, one field per topic under `status/`
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub available: bool,
    pub sequence_number: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,

    pub state_of_charge: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub battery_current: Option<f64>,
    pub battery_power: Option<f64>,
    pub battery_temperature: Option<f64>,
    pub battery_capacity: Option<f64>,
    pub rated_capacity: Option<f64>,
    pub battery_charge: Option<f64>,
    pub battery_discharge: Option<f64>,

    pub grid_power: Option<f64>,
    pub consumption_from_grid: Option<f64>,
    pub export_to_grid: Option<f64>,

    pub mode: Option<StorageMode>,
    pub storage_power: Option<f64>,
    pub energy_today: Option<f64>,
    pub energy_total: Option<f64>,

    pub charging_allowed: Option<bool>,
    pub discharging_allowed: Option<bool>,

    pub pv_power: Option<f64>,
    pub offgrid_power: Option<f64>,
    pub phase_a_power: Option<f64>,
    pub phase_b_power: Option<f64>,
    pub phase_c_power: Option<f64>,
}

impl Status {
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        let battery = &snapshot.battery;
        Status {
            available: snapshot.available(),
            sequence_number: snapshot.meta.sequence_number,
            last_success: snapshot.meta.last_success,
            consecutive_failures: snapshot.meta.consecutive_failure_count,
            state_of_charge: battery.state_of_charge,
            battery_voltage: round(battery.voltage, 2),
            battery_current: round(battery.current, 2),
            battery_power: battery.power,
            battery_temperature: round(battery.temperature, 1),
            battery_capacity: battery.capacity,
            rated_capacity: battery.rated_capacity,
            battery_charge: snapshot.battery_flow.charging_power,
            battery_discharge: snapshot.battery_flow.discharging_power,
            grid_power: snapshot.grid.power,
            consumption_from_grid: snapshot.grid.consumption_power,
            export_to_grid: snapshot.grid.feed_in_power,
            mode: snapshot.storage.mode,
            storage_power: snapshot.storage.power,
            energy_today: round(snapshot.storage.energy_today, 3),
            energy_total: round(snapshot.storage.energy_total, 3),
            charging_allowed: snapshot.permissions.charging_allowed,
            discharging_allowed: snapshot.permissions.discharging_allowed,
            pv_power: snapshot.auxiliary.pv_power,
            offgrid_power: snapshot.auxiliary.offgrid_power,
            phase_a_power: snapshot.auxiliary.phase_a_power,
            phase_b_power: snapshot.auxiliary.phase_b_power,
            phase_c_power: snapshot.auxiliary.phase_c_power,
        }
    }
}

/// Device identity, published once as JSON under `info`
#[derive(Serialize)]
pub struct SystemInfo<'a> {
    pub time: DateTime<Utc>,
    pub model: Option<&'a str>,
    pub firmware: Option<&'a str>,
    pub ble_mac: Option<&'a str>,
    pub wifi_name: Option<&'a str>,
    pub wifi_mac: Option<&'a str>,
    pub ip_address: IpAddr,
    pub port: u16,
}

impl<'a> SystemInfo<'a> {
    pub fn new(info: &'a DeviceInfo, config: &MarstekConfig) -> Self {
        Self {
            time: Utc::now(),
            model: info.model.as_deref(),
            firmware: info.firmware.as_deref(),
            ble_mac: info.ble_mac.as_deref(),
            wifi_name: info.wifi_name.as_deref(),
            wifi_mac: info.wifi_mac.as_deref(),
            ip_address: config.host,
            port: config.port,
        }
    }
}

/// Reply to a `mode/set` request, published as JSON under `mode/result`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub requested: StorageMode,
    pub accepted: bool,
    pub effective_mode: Option<StorageMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn new(requested: StorageMode, result: &Result<CommandResult, CommandError>) -> Self {
        match result {
            Ok(result) => Self {
                requested,
                accepted: result.accepted,
                effective_mode: result.effective_mode,
                error: None,
            },
            Err(e) => Self {
                requested,
                accepted: false,
                effective_mode: None,
                error: Some(e.to_string()),
            },
        }
    }
}
