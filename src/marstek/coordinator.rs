//! Periodic poll cycle
//!
//! One worker thread ticks at a fixed interval. A tick that finds the
//! transport gate held (command in flight) is skipped, not queued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, trace, warn};

use super::protocol::{self, Query};
use super::session::Link;
use super::snapshot::{CycleReadings, StateSnapshot};
use super::transport::Transport;
use super::types::DeviceInfo;
use crate::errors::{DecodeError, PollError, TransportError};

/// Where the poll state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Polling,
    Updated,
    FailedTransient,
    FailedFatal,
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    /// Per-exchange reply deadline
    pub timeout: Duration,
    /// `ES.GetStatus` is missing on some firmware
    pub query_energy_status: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(3),
            query_energy_status: true,
        }
    }
}

/// Result of a single tick
#[derive(Debug)]
pub enum PollOutcome {
    Updated(Arc<StateSnapshot>),
    Failed(Arc<StateSnapshot>),
    Fatal(TransportError),
    /// Gate was held by a command
    Skipped,
}

pub struct Coordinator {
    link: Arc<Link>,
    settings: PollSettings,
}

impl Coordinator {
    pub(crate) fn new(link: Arc<Link>, settings: PollSettings) -> Self {
        Self { link, settings }
    }

    fn exchange<T>(
        &self,
        transport: &mut dyn Transport,
        query: Query,
        decode: fn(&[u8]) -> Result<T, DecodeError>,
    ) -> Result<T, PollError> {
        let method = query.method().name();
        let request = protocol::encode_query(query)?;
        let reply = transport.send_and_receive(&request, self.settings.timeout)?;
        trace!("{} reply: {} bytes", method, reply.len());

        decode(&reply).map_err(|e| {
            debug!("{} reply rejected ({} bytes): {}", method, reply.len(), e);
            PollError::from(e)
        })
    }

    /// Ask the device who it is. Only fatal errors are propagated.
    pub(crate) fn identify(
        &self,
        transport: &mut dyn Transport,
    ) -> Result<Option<DeviceInfo>, TransportError> {
        match self.exchange(transport, Query::Device, protocol::decode_device) {
            Ok(info) => {
                info!(
                    "Device: {} firmware {} (BLE {})",
                    info.model.as_deref().unwrap_or("unknown"),
                    info.firmware.as_deref().unwrap_or("?"),
                    info.ble_mac.as_deref().unwrap_or("?")
                );
                Ok(Some(info))
            }
            Err(PollError::Transport(e)) if !e.is_transient() => Err(e),
            Err(e) => {
                warn!("Device identity not available yet: {}", e);
                Ok(None)
            }
        }
    }

    fn fetch(
        &self,
        transport: &mut dyn Transport,
        previous: &StateSnapshot,
    ) -> Result<CycleReadings, PollError> {
        let battery = self.exchange(transport, Query::Battery, protocol::decode_battery)?;
        let mode = self.exchange(transport, Query::Mode, protocol::decode_mode)?;

        let energy = if self.settings.query_energy_status {
            match self.exchange(transport, Query::Energy, protocol::decode_energy) {
                Ok(energy) => Some(energy),
                Err(PollError::Decode(e @ DecodeError::Device { .. })) => {
                    debug!("Energy status not supported: {}", e);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let device = match previous.device {
            Some(_) => None,
            None => self.identify(transport)?,
        };

        Ok(CycleReadings {
            battery,
            mode,
            energy,
            device,
        })
    }

    /// Run one poll cycle unless the transport is busy.
    pub fn poll_once(&self) -> PollOutcome {
        let Some(mut transport) = self.link.gate.try_lock() else {
            debug!("Transport busy, skipping poll tick");
            return PollOutcome::Skipped;
        };
        self.link.set_phase(PollPhase::Polling);
        let previous = self.link.store.current();

        match self.fetch(&mut **transport, &previous) {
            Ok(readings) => {
                self.link.set_phase(PollPhase::Updated);
                let snapshot = self
                    .link
                    .store
                    .publish(previous.updated(readings, Utc::now()));
                debug!(
                    "Poll #{}: SOC={:?}% Mode={:?} Grid={:?}W Battery={:?}W",
                    snapshot.meta.sequence_number,
                    snapshot.battery.state_of_charge,
                    snapshot.storage.mode,
                    snapshot.grid.power,
                    snapshot.battery.power
                );
                if previous.meta.consecutive_failure_count >= previous.meta.failure_threshold {
                    info!("Device available again");
                }
                PollOutcome::Updated(snapshot)
            }
            Err(PollError::Transport(e)) if !e.is_transient() => {
                error!("Polling stopped: {}", e);
                self.link.set_phase(PollPhase::FailedFatal);
                self.link.store.notify_fatal(&e);
                PollOutcome::Fatal(e)
            }
            Err(e) => {
                let next = previous.failed();
                let failures = next.meta.consecutive_failure_count;
                if failures == next.meta.failure_threshold {
                    warn!(
                        "Device unavailable after {} consecutive failures: {}",
                        failures, e
                    );
                } else {
                    warn!("Poll failed ({} in a row): {}", failures, e);
                }
                self.link.set_phase(PollPhase::FailedTransient);
                PollOutcome::Failed(self.link.store.publish(next))
            }
        }
    }

    /// Tick until `stop` fires or the transport fails for good.
    ///
    /// The first tick runs immediately. Ticks missed while a cycle overran
    /// are dropped.
    pub fn run(self, stop: Receiver<()>) -> Result<(), TransportError> {
        let interval = self.settings.interval;
        let mut next_tick = Instant::now();
        info!("Polling every {:?}", interval);

        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match stop.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("Poll loop stopping");
                    self.link.set_phase(PollPhase::Idle);
                    return Ok(());
                }
            }

            if let PollOutcome::Fatal(e) = self.poll_once() {
                return Err(e);
            }

            next_tick += interval;
            let now = Instant::now();
            if next_tick <= now {
                debug!("Poll cycle overran the interval, dropping missed ticks");
                next_tick = now + interval;
            }
        }
    }
}
