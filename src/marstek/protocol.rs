//! Marstek local API codec
//!
//! The device speaks JSON-RPC over UDP, one object per datagram:
//!
//! ```text
//! request: {"id":1,"method":"Bat.GetStatus","params":{"id":0}}
//! reply:   {"id":1,"src":"VenusE-…","result":{"id":0,"soc":87,…}}
//!          {"id":1,"error":{"code":-32601,"message":"Method not found"}}
//! ```
//!
//! The request id is constant; a reply that does not echo it is rejected.
//! Decoding is pure: the same bytes always give the same result.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::types::*;
use crate::errors::DecodeError;

/// Request id sent with every request. The device firmware expects it constant.
pub const REQUEST_ID: u32 = 1;

/// Component index addressed inside the device (there is only one).
const COMPONENT_ID: u32 = 0;

/// JSON-RPC methods used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GetDevice,
    BatteryStatus,
    EnergyStatus,
    GetMode,
    SetMode,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::GetDevice => "Marstek.GetDevice",
            Method::BatteryStatus => "Bat.GetStatus",
            Method::EnergyStatus => "ES.GetStatus",
            Method::GetMode => "ES.GetMode",
            Method::SetMode => "ES.SetMode",
        }
    }
}

/// Read-only queries issued by the poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Device,
    Battery,
    Energy,
    Mode,
}

impl Query {
    pub fn method(&self) -> Method {
        match self {
            Query::Device => Method::GetDevice,
            Query::Battery => Method::BatteryStatus,
            Query::Energy => Method::EnergyStatus,
            Query::Mode => Method::GetMode,
        }
    }
}

/// A decoded data reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Device(DeviceInfo),
    Battery(BatteryStatus),
    Energy(EnergyStatus),
    Mode(ModeStatus),
}

/// Any decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Reading(Reading),
    Ack(Acknowledgment),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    id: u32,
    method: &'a str,
    params: P,
}

#[derive(Serialize)]
struct ComponentParams {
    id: u32,
}

#[derive(Serialize)]
struct DeviceParams {
    ble_mac: &'static str,
}

#[derive(Serialize)]
struct EnableConfig {
    enable: u8,
}

#[derive(Serialize)]
struct ModeConfig<'a> {
    mode: StorageMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_cfg: Option<EnableConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ai_cfg: Option<EnableConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manual_cfg: Option<&'a ManualSchedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    passive_cfg: Option<&'a PassiveSettings>,
}

#[derive(Serialize)]
struct SetModeParams<'a> {
    id: u32,
    config: ModeConfig<'a>,
}

fn frame<P: Serialize>(method: Method, params: P) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&RpcRequest {
        id: REQUEST_ID,
        method: method.name(),
        params,
    })
}

/// Encode a data query
pub fn encode_query(query: Query) -> Result<Vec<u8>, serde_json::Error> {
    match query {
        Query::Device => frame(query.method(), DeviceParams { ble_mac: "0" }),
        _ => frame(query.method(), ComponentParams { id: COMPONENT_ID }),
    }
}

/// Encode an `ES.SetMode` command carrying only the config block of the requested mode
pub fn encode_mode_command(command: &ModeCommand) -> Result<Vec<u8>, serde_json::Error> {
    let mode = command.mode;
    let enabled = || EnableConfig { enable: 1 };
    let config = ModeConfig {
        mode,
        auto_cfg: (mode == StorageMode::Auto).then(enabled),
        ai_cfg: (mode == StorageMode::Ai).then(enabled),
        manual_cfg: (mode == StorageMode::Manual).then_some(&command.manual),
        passive_cfg: (mode == StorageMode::Passive).then_some(&command.passive),
    };
    frame(
        Method::SetMode,
        SetModeParams {
            id: COMPONENT_ID,
            config,
        },
    )
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RpcReply {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Firmware versions disagree on whether flags are booleans or 0/1.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        None => None,
        Some(Flag::Bool(b)) => Some(b),
        Some(Flag::Int(i)) => Some(i != 0),
    })
}

/// Text fields that some firmware sends as numbers (e.g. `"ver": 155`)
fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Deserialize)]
struct DeviceWire {
    #[serde(default, deserialize_with = "text")]
    device: Option<String>,
    #[serde(default, deserialize_with = "text")]
    ver: Option<String>,
    #[serde(default, deserialize_with = "text")]
    ble_mac: Option<String>,
    #[serde(default, deserialize_with = "text")]
    wifi_name: Option<String>,
    #[serde(default, deserialize_with = "text")]
    wifi_mac: Option<String>,
}

#[derive(Deserialize)]
struct BatteryWire {
    soc: Option<f64>,
    #[serde(default, deserialize_with = "flag")]
    charg_flag: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    dischrg_flag: Option<bool>,
    /// °C × 10
    bat_temp: Option<f64>,
    /// Wh / 10
    bat_capacity: Option<f64>,
    /// Wh
    rated_capacity: Option<f64>,
    /// 0.01 V
    bat_voltage: Option<f64>,
    /// 0.01 A
    bat_current: Option<f64>,
}

#[derive(Deserialize)]
struct EnergyWire {
    bat_power: Option<f64>,
    pv_power: Option<f64>,
    ongrid_power: Option<f64>,
    offgrid_power: Option<f64>,
    /// Wh
    today_energy: Option<f64>,
    /// Wh
    total_energy: Option<f64>,
}

#[derive(Deserialize)]
struct ModeWire {
    mode: Option<String>,
    ongrid_power: Option<f64>,
    offgrid_power: Option<f64>,
    bat_soc: Option<f64>,
    a_power: Option<f64>,
    b_power: Option<f64>,
    c_power: Option<f64>,
    total_power: Option<f64>,
}

#[derive(Deserialize)]
struct AckWire {
    #[serde(default, deserialize_with = "flag")]
    set_result: Option<bool>,
}

fn malformed(len: usize, reason: impl Into<String>) -> DecodeError {
    DecodeError::Malformed {
        len,
        reason: reason.into(),
    }
}

/// Validate framing and split the reply into result or device error.
fn envelope(bytes: &[u8]) -> Result<Result<Value, RpcError>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let reply: RpcReply =
        serde_json::from_slice(bytes).map_err(|e| malformed(bytes.len(), e.to_string()))?;

    if reply.id != Some(REQUEST_ID) {
        return Err(DecodeError::IdMismatch {
            expected: REQUEST_ID,
            actual: reply.id,
        });
    }

    match (reply.result, reply.error) {
        (Some(result), _) => Ok(Ok(result)),
        (None, Some(error)) => Ok(Err(error)),
        (None, None) => Err(DecodeError::MissingResult),
    }
}

fn expect_result<T: DeserializeOwned>(method: Method, bytes: &[u8]) -> Result<T, DecodeError> {
    match envelope(bytes)? {
        Ok(result) => {
            serde_json::from_value(result).map_err(|e| malformed(bytes.len(), e.to_string()))
        }
        Err(error) => Err(DecodeError::Device {
            method: method.name(),
            code: error.code,
            message: error.message,
        }),
    }
}

/// Replies carry no method name, so each reading must hold the field that
/// identifies its reply type. A reply to another query fails here.
fn require(len: usize, method: Method, present: bool, fields: &str) -> Result<(), DecodeError> {
    if present {
        Ok(())
    } else {
        Err(malformed(len, format!("{} reply without {}", method.name(), fields)))
    }
}

fn percentage(field: &'static str, value: Option<f64>) -> Result<Option<f64>, DecodeError> {
    match value {
        Some(v) if !(0.0..=100.0).contains(&v) => Err(DecodeError::OutOfRange { field, value: v }),
        _ => Ok(value),
    }
}

fn counter_kwh(field: &'static str, wh: Option<f64>) -> Result<Option<f64>, DecodeError> {
    match wh {
        Some(v) if v < 0.0 => Err(DecodeError::OutOfRange { field, value: v }),
        _ => Ok(wh.map(|v| v / 1000.0)),
    }
}

pub fn decode_device(bytes: &[u8]) -> Result<DeviceInfo, DecodeError> {
    let wire: DeviceWire = expect_result(Method::GetDevice, bytes)?;
    require(
        bytes.len(),
        Method::GetDevice,
        wire.device.is_some() || wire.ble_mac.is_some(),
        "`device` or `ble_mac`",
    )?;
    Ok(DeviceInfo {
        model: wire.device,
        firmware: wire.ver,
        ble_mac: wire.ble_mac,
        wifi_name: wire.wifi_name,
        wifi_mac: wire.wifi_mac,
    })
}

pub fn decode_battery(bytes: &[u8]) -> Result<BatteryStatus, DecodeError> {
    let wire: BatteryWire = expect_result(Method::BatteryStatus, bytes)?;
    require(bytes.len(), Method::BatteryStatus, wire.soc.is_some(), "`soc`")?;
    Ok(BatteryStatus {
        state_of_charge: percentage("soc", wire.soc)?,
        voltage: wire.bat_voltage.map(|v| v / 100.0),
        current: wire.bat_current.map(|a| a / 100.0),
        temperature: wire.bat_temp.map(|t| t / 10.0),
        capacity: wire.bat_capacity.map(|c| c * 10.0),
        rated_capacity: wire.rated_capacity,
        charging_allowed: wire.charg_flag,
        discharging_allowed: wire.dischrg_flag,
    })
}

pub fn decode_energy(bytes: &[u8]) -> Result<EnergyStatus, DecodeError> {
    let wire: EnergyWire = expect_result(Method::EnergyStatus, bytes)?;
    // ongrid/offgrid power also appear in ES.GetMode replies
    let own_fields = [
        wire.bat_power,
        wire.pv_power,
        wire.today_energy,
        wire.total_energy,
    ];
    require(
        bytes.len(),
        Method::EnergyStatus,
        own_fields.iter().any(Option::is_some),
        "battery, PV or energy counters",
    )?;
    Ok(EnergyStatus {
        battery_power: wire.bat_power,
        pv_power: wire.pv_power,
        ongrid_power: wire.ongrid_power,
        offgrid_power: wire.offgrid_power,
        energy_today: counter_kwh("today_energy", wire.today_energy)?,
        energy_total: counter_kwh("total_energy", wire.total_energy)?,
    })
}

pub fn decode_mode(bytes: &[u8]) -> Result<ModeStatus, DecodeError> {
    let wire: ModeWire = expect_result(Method::GetMode, bytes)?;
    require(bytes.len(), Method::GetMode, wire.mode.is_some(), "`mode`")?;
    let mode = wire
        .mode
        .map(|m| m.parse::<StorageMode>().map_err(DecodeError::UnknownMode))
        .transpose()?;
    Ok(ModeStatus {
        mode,
        ongrid_power: wire.ongrid_power,
        offgrid_power: wire.offgrid_power,
        state_of_charge: percentage("bat_soc", wire.bat_soc)?,
        phase_a_power: wire.a_power,
        phase_b_power: wire.b_power,
        phase_c_power: wire.c_power,
        total_power: wire.total_power,
    })
}

/// A device error object in reply to `ES.SetMode` is an explicit refusal.
pub fn decode_ack(bytes: &[u8]) -> Result<Acknowledgment, DecodeError> {
    match envelope(bytes)? {
        Ok(result) => {
            let wire: AckWire = serde_json::from_value(result)
                .map_err(|e| malformed(bytes.len(), e.to_string()))?;
            let accepted = wire
                .set_result
                .ok_or_else(|| malformed(bytes.len(), "missing field `set_result`"))?;
            Ok(Acknowledgment { accepted })
        }
        Err(_) => Ok(Acknowledgment { accepted: false }),
    }
}

/// Decode a reply to `method`
pub fn decode(method: Method, bytes: &[u8]) -> Result<Response, DecodeError> {
    Ok(match method {
        Method::GetDevice => Response::Reading(Reading::Device(decode_device(bytes)?)),
        Method::BatteryStatus => Response::Reading(Reading::Battery(decode_battery(bytes)?)),
        Method::EnergyStatus => Response::Reading(Reading::Energy(decode_energy(bytes)?)),
        Method::GetMode => Response::Reading(Reading::Mode(decode_mode(bytes)?)),
        Method::SetMode => Response::Ack(decode_ack(bytes)?),
    })
}
