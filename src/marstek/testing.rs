//! In-memory device used by unit tests

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;

use super::transport::Transport;
use super::types::StorageMode;
use crate::errors::TransportError;

/// What the fake device does with the next request
pub(crate) enum Step {
    /// Answer with these exact bytes
    Reply(Vec<u8>),
    Timeout,
    Unreachable,
    Fatal,
    /// Signal `entered`, block until `release`, then answer normally
    Hold {
        entered: Sender<()>,
        release: Receiver<()>,
    },
}

pub(crate) fn battery_reply(soc: u8, charging: bool) -> Vec<u8> {
    format!(
        r#"{{"id":1,"result":{{"id":0,"soc":{},"charg_flag":{},"dischrg_flag":true,"bat_temp":231,"bat_capacity":256,"rated_capacity":5120,"bat_voltage":5240,"bat_current":-310}}}}"#,
        soc, charging
    )
    .into_bytes()
}

pub(crate) fn mode_reply(mode: StorageMode) -> Vec<u8> {
    format!(
        r#"{{"id":1,"result":{{"id":0,"mode":"{}","ongrid_power":-120,"offgrid_power":0,"bat_soc":50,"a_power":-40,"b_power":-40,"c_power":-40,"total_power":-120}}}}"#,
        mode
    )
    .into_bytes()
}

pub(crate) fn energy_reply(total_wh: u64) -> Vec<u8> {
    format!(
        r#"{{"id":1,"result":{{"id":0,"bat_power":-300,"pv_power":0,"ongrid_power":-120,"offgrid_power":0,"today_energy":420,"total_energy":{}}}}}"#,
        total_wh
    )
    .into_bytes()
}

pub(crate) fn ack_reply(accepted: bool) -> Vec<u8> {
    format!(
        r#"{{"id":1,"result":{{"id":0,"set_result":{}}}}}"#,
        accepted
    )
    .into_bytes()
}

const DEVICE_REPLY: &[u8] = br#"{"id":1,"result":{"device":"VenusE","ver":155,"ble_mac":"acd9290d23d5","wifi_name":"home","wifi_mac":"acd9290d23d4"}}"#;

struct State {
    steps: VecDeque<Step>,
    replies: HashMap<String, Vec<u8>>,
    accept_modes: bool,
    sent: Vec<Value>,
    in_flight: usize,
    max_in_flight: usize,
}

impl State {
    fn answer(&mut self, request: &Value) -> Vec<u8> {
        let method = request["method"].as_str().unwrap_or_default();
        if method == "ES.SetMode" && !self.replies.contains_key(method) {
            if !self.accept_modes {
                return ack_reply(false);
            }
            if let Some(mode) = request["params"]["config"]["mode"]
                .as_str()
                .and_then(|m| m.parse::<StorageMode>().ok())
            {
                self.replies
                    .insert("ES.GetMode".to_string(), mode_reply(mode));
            }
            return ack_reply(true);
        }
        self.replies.get(method).cloned().unwrap_or_default()
    }
}

/// Scriptable device shared between a test and the transports it hands out
#[derive(Clone)]
pub(crate) struct FakeDevice {
    state: Arc<Mutex<State>>,
}

impl FakeDevice {
    pub(crate) fn new() -> Self {
        let mut replies = HashMap::new();
        replies.insert("Bat.GetStatus".to_string(), battery_reply(50, true));
        replies.insert("ES.GetMode".to_string(), mode_reply(StorageMode::Auto));
        replies.insert("ES.GetStatus".to_string(), energy_reply(1000));
        replies.insert("Marstek.GetDevice".to_string(), DEVICE_REPLY.to_vec());
        Self {
            state: Arc::new(Mutex::new(State {
                steps: VecDeque::new(),
                replies,
                accept_modes: true,
                sent: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
            })),
        }
    }

    pub(crate) fn transport(&self) -> FakeTransport {
        FakeTransport {
            device: self.clone(),
        }
    }

    pub(crate) fn push(&self, step: Step) {
        self.state.lock().steps.push_back(step);
    }

    pub(crate) fn set_reply(&self, method: &str, reply: Vec<u8>) {
        self.state.lock().replies.insert(method.to_string(), reply);
    }

    pub(crate) fn set_mode(&self, mode: StorageMode) {
        self.set_reply("ES.GetMode", mode_reply(mode));
    }

    pub(crate) fn set_energy_total(&self, total_wh: u64) {
        self.set_reply("ES.GetStatus", energy_reply(total_wh));
    }

    pub(crate) fn accept_modes(&self, accept: bool) {
        self.state.lock().accept_modes = accept;
    }

    /// Methods of every request received, in order
    pub(crate) fn sent_methods(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .map(|r| r["method"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub(crate) fn requests(&self) -> Vec<Value> {
        self.state.lock().sent.clone()
    }

    /// Highest number of exchanges ever in flight at once
    pub(crate) fn max_concurrent(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

pub(crate) struct FakeTransport {
    device: FakeDevice,
}

impl FakeTransport {
    fn exchange(&self, request: &Value, step: Option<Step>) -> Result<Vec<u8>, TransportError> {
        let timeout = || TransportError::Timeout {
            peer: self.peer(),
            waited: Duration::ZERO,
        };
        match step {
            Some(Step::Reply(bytes)) => Ok(bytes),
            Some(Step::Timeout) => Err(timeout()),
            Some(Step::Unreachable) => Err(TransportError::Unreachable {
                peer: self.peer(),
                reason: "connection refused".to_string(),
            }),
            Some(Step::Fatal) => Err(TransportError::Fatal(io::Error::new(
                io::ErrorKind::Other,
                "socket gone",
            ))),
            Some(Step::Hold { entered, release }) => {
                let _ = entered.send(());
                let _ = release.recv();
                Ok(self.device.state.lock().answer(request))
            }
            None => Ok(self.device.state.lock().answer(request)),
        }
    }
}

impl Transport for FakeTransport {
    fn peer(&self) -> String {
        "fake-device".to_string()
    }

    fn send_and_receive(
        &mut self,
        payload: &[u8],
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let request: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        let step = {
            let mut state = self.device.state.lock();
            state.sent.push(request.clone());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.steps.pop_front()
        };

        let result = self.exchange(&request, step);
        self.device.state.lock().in_flight -= 1;
        result
    }
}
