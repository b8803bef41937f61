//! Published device state
//!
//! A `StateSnapshot` is never mutated after publication. The store swaps in a
//! new `Arc` per cycle; readers keep whatever version they cloned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::warn;

use super::types::*;
use crate::errors::TransportError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Battery {
    pub state_of_charge: Option<f64>, // %
    pub voltage: Option<f64>,         // V
    pub current: Option<f64>,         // A
    pub power: Option<f64>,           // W (positive = discharge)
    pub temperature: Option<f64>,     // °C
    pub capacity: Option<f64>,        // Wh
    pub rated_capacity: Option<f64>,  // Wh
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grid {
    pub power: Option<f64>,             // W (positive = import)
    pub feed_in_power: Option<f64>,     // W
    pub consumption_power: Option<f64>, // W
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatteryFlow {
    pub charging_power: Option<f64>,    // W
    pub discharging_power: Option<f64>, // W
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Storage {
    pub mode: Option<StorageMode>,
    pub power: Option<f64>,        // W
    pub energy_today: Option<f64>, // kWh
    pub energy_total: Option<f64>, // kWh
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Permissions {
    pub charging_allowed: Option<bool>,
    pub discharging_allowed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Auxiliary {
    pub pv_power: Option<f64>,
    pub offgrid_power: Option<f64>,
    pub phase_a_power: Option<f64>,
    pub phase_b_power: Option<f64>,
    pub phase_c_power: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    pub sequence_number: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failure_count: u32,
    pub failure_threshold: u32,
}

/// Everything a poll cycle learned about the device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReadings {
    pub battery: BatteryStatus,
    pub mode: ModeStatus,
    pub energy: Option<EnergyStatus>,
    pub device: Option<DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub battery: Battery,
    pub grid: Grid,
    pub battery_flow: BatteryFlow,
    pub storage: Storage,
    pub permissions: Permissions,
    pub auxiliary: Auxiliary,
    pub device: Option<DeviceInfo>,
    pub meta: Meta,
}

/// Splits a signed value into positive and negative parts.
///
/// Returns `(value, 0)` if positive, `(0, abs(value))` if negative.
fn split_val(value: f64) -> (f64, f64) {
    if value >= 0.0 {
        (value, 0.0)
    } else {
        (0.0, value.abs())
    }
}

impl StateSnapshot {
    /// Snapshot before anything is known about the device
    pub fn initial(failure_threshold: u32) -> Self {
        Self {
            battery: Battery::default(),
            grid: Grid::default(),
            battery_flow: BatteryFlow::default(),
            storage: Storage::default(),
            permissions: Permissions::default(),
            auxiliary: Auxiliary::default(),
            device: None,
            meta: Meta {
                sequence_number: 0,
                last_success: None,
                consecutive_failure_count: 0,
                failure_threshold: failure_threshold.max(1),
            },
        }
    }

    /// False once consecutive failures reach the threshold
    pub fn available(&self) -> bool {
        self.meta.consecutive_failure_count < self.meta.failure_threshold
    }

    /// Successor after a successful poll
    pub fn updated(&self, readings: CycleReadings, now: DateTime<Utc>) -> Self {
        let CycleReadings {
            battery,
            mode,
            energy,
            device,
        } = readings;
        let energy = energy.unwrap_or_default();

        let grid_power = mode.ongrid_power.or(energy.ongrid_power);
        let battery_power = energy.battery_power;

        // Without a battery power reading, the grid exchange is the only
        // indication of direction.
        let (discharging, charging) = match battery_power.or(grid_power) {
            Some(p) => {
                let (discharge, charge) = split_val(p);
                (Some(discharge), Some(charge))
            }
            None => (None, None),
        };
        let (consumption, feed_in) = match grid_power {
            Some(p) => {
                let (import, export) = split_val(p);
                (Some(import), Some(export))
            }
            None => (None, None),
        };

        let previous_total = self.storage.energy_total;
        let energy_total = match (previous_total, energy.energy_total) {
            (Some(prev), Some(new)) if new < prev => {
                warn!(
                    "Device reported energy_total {:.3} kWh below previous {:.3} kWh, keeping previous",
                    new, prev
                );
                Some(prev)
            }
            (prev, new) => new.or(prev),
        };

        Self {
            battery: Battery {
                state_of_charge: battery.state_of_charge.or(mode.state_of_charge),
                voltage: battery.voltage,
                current: battery.current,
                power: battery_power,
                temperature: battery.temperature,
                capacity: battery.capacity,
                rated_capacity: battery.rated_capacity,
            },
            grid: Grid {
                power: grid_power,
                feed_in_power: feed_in,
                consumption_power: consumption,
            },
            battery_flow: BatteryFlow {
                charging_power: charging,
                discharging_power: discharging,
            },
            storage: Storage {
                mode: mode.mode,
                power: mode.total_power,
                energy_today: energy.energy_today,
                energy_total,
            },
            permissions: Permissions {
                charging_allowed: battery.charging_allowed,
                discharging_allowed: battery.discharging_allowed,
            },
            auxiliary: Auxiliary {
                pv_power: energy.pv_power,
                offgrid_power: mode.offgrid_power.or(energy.offgrid_power),
                phase_a_power: mode.phase_a_power,
                phase_b_power: mode.phase_b_power,
                phase_c_power: mode.phase_c_power,
            },
            device: device.or_else(|| self.device.clone()),
            meta: Meta {
                sequence_number: self.meta.sequence_number + 1,
                last_success: Some(now),
                consecutive_failure_count: 0,
                failure_threshold: self.meta.failure_threshold,
            },
        }
    }

    /// Successor after a failed poll: values are kept, only meta moves.
    pub fn failed(&self) -> Self {
        let mut next = self.clone();
        next.meta.consecutive_failure_count = self.meta.consecutive_failure_count.saturating_add(1);
        next
    }

    /// Successor after the device confirmed a mode change
    pub fn with_mode(&self, mode: StorageMode) -> Self {
        let mut next = self.clone();
        next.storage.mode = Some(mode);
        next
    }

    /// Successor carrying the device identity
    pub fn with_device(&self, device: DeviceInfo) -> Self {
        let mut next = self.clone();
        next.device = Some(device);
        next
    }
}

/// Receives every published snapshot
///
/// Called on the thread that produced the snapshot, while it still holds the
/// transport. Calling `set_mode` from here returns `Busy`.
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot(&self, snapshot: &Arc<StateSnapshot>);

    /// The poll loop stopped for good.
    fn on_fatal(&self, _error: &TransportError) {}
}

impl<F> SnapshotListener for F
where
    F: Fn(&Arc<StateSnapshot>) + Send + Sync,
{
    fn on_snapshot(&self, snapshot: &Arc<StateSnapshot>) {
        self(snapshot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Current snapshot plus the listeners interested in it
pub struct SnapshotStore {
    current: RwLock<Arc<StateSnapshot>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn SnapshotListener>)>>,
    next_id: AtomicU64,
}

impl SnapshotStore {
    pub fn new(initial: StateSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Arc<StateSnapshot> {
        self.current.read().clone()
    }

    /// Replace the current snapshot and notify every listener.
    pub fn publish(&self, snapshot: StateSnapshot) -> Arc<StateSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write() = snapshot.clone();
        for listener in self.listeners() {
            listener.on_snapshot(&snapshot);
        }
        snapshot
    }

    /// Replace the current snapshot without notifying anyone.
    pub(crate) fn replace(&self, snapshot: StateSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    pub fn notify_fatal(&self, error: &TransportError) {
        for listener in self.listeners() {
            listener.on_fatal(error);
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn SnapshotListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    /// Copy of the listener list so callbacks can (un)subscribe.
    fn listeners(&self) -> Vec<Arc<dyn SnapshotListener>> {
        self.listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}
