//! Session lifecycle
//!
//! Owns the transport gate, the snapshot store and the poll worker for one
//! device.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::coordinator::{Coordinator, PollPhase, PollSettings};
use super::dispatcher::{CommandSettings, Dispatcher};
use super::snapshot::{ListenerId, SnapshotListener, SnapshotStore, StateSnapshot};
use super::transport::{Transport, UdpTransport};
use super::types::{CommandResult, DeviceAddress, ModeCommand, StorageMode};
use crate::config::MarstekConfig;
use crate::errors::{CommandError, TransportError};

/// Transport gate shared by the poll worker and the dispatcher
pub(crate) struct Link {
    pub(crate) gate: Mutex<Box<dyn Transport>>,
    pub(crate) store: Arc<SnapshotStore>,
    phase: Mutex<PollPhase>,
}

impl Link {
    pub(crate) fn new(transport: Box<dyn Transport>, store: Arc<SnapshotStore>) -> Self {
        Self {
            gate: Mutex::new(transport),
            store,
            phase: Mutex::new(PollPhase::Idle),
        }
    }

    pub(crate) fn phase(&self) -> PollPhase {
        *self.phase.lock()
    }

    pub(crate) fn set_phase(&self, phase: PollPhase) {
        *self.phase.lock() = phase;
    }

    fn into_transport(self) -> Box<dyn Transport> {
        self.gate.into_inner()
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub address: DeviceAddress,
    pub poll: PollSettings,
    pub command: CommandSettings,
    /// Consecutive failed polls before the device counts as unavailable
    pub failure_threshold: u32,
}

impl SessionSettings {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            poll: PollSettings::default(),
            command: CommandSettings::default(),
            failure_threshold: 3,
        }
    }
}

impl From<&MarstekConfig> for SessionSettings {
    fn from(config: &MarstekConfig) -> Self {
        Self {
            address: DeviceAddress::new(config.host, config.port, config.local_port),
            poll: PollSettings {
                interval: config.interval,
                timeout: config.timeout,
                query_energy_status: config.query_energy_status,
            },
            command: CommandSettings {
                timeout: config.command_timeout,
                retries: config.command_retries,
                manual: config.manual.clone(),
                passive: config.passive.clone(),
            },
            failure_threshold: config.failure_threshold,
        }
    }
}

struct Running {
    link: Arc<Link>,
    dispatcher: Dispatcher,
    stop: Sender<()>,
    worker: JoinHandle<Result<(), TransportError>>,
}

/// Connection to one Marstek device
///
/// The snapshot store exists from construction on, so listeners can be
/// registered before `start`.
pub struct DeviceSession {
    settings: SessionSettings,
    store: Arc<SnapshotStore>,
    transport: Option<Box<dyn Transport>>,
    /// Set for `with_transport`: the injected transport is kept across restarts
    injected: bool,
    running: Option<Running>,
}

impl DeviceSession {
    pub fn new(settings: SessionSettings) -> Self {
        let store = Arc::new(SnapshotStore::new(StateSnapshot::initial(
            settings.failure_threshold,
        )));
        Self {
            settings,
            store,
            transport: None,
            injected: false,
            running: None,
        }
    }

    /// Session over a caller-provided transport instead of a UDP socket
    pub fn with_transport<T: Transport + 'static>(transport: T, settings: SessionSettings) -> Self {
        let mut session = Self::new(settings);
        session.transport = Some(Box::new(transport));
        session.injected = true;
        session
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Bind the socket, probe the device identity and start polling.
    ///
    /// A failed probe is only logged; the first poll tries again.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.running.is_some() {
            debug!("Session already started");
            return Ok(());
        }

        let transport: Box<dyn Transport> = match (self.transport.take(), self.injected) {
            (Some(transport), _) => transport,
            (None, false) => Box::new(UdpTransport::bind(&self.settings.address)?),
            (None, true) => {
                return Err(TransportError::Fatal(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "injected transport was lost when the session failed",
                )));
            }
        };
        info!("Connecting to Marstek device at {}", transport.peer());

        let link = Arc::new(Link::new(transport, self.store.clone()));
        let coordinator = Coordinator::new(link.clone(), self.settings.poll.clone());

        {
            let mut transport = link.gate.lock();
            if let Some(info) = coordinator.identify(&mut **transport)? {
                self.store.replace(self.store.current().with_device(info));
            }
        }

        let (stop, stop_rx) = crossbeam_channel::bounded(1);
        let worker = thread::Builder::new()
            .name("marstek-poll".to_string())
            .spawn(move || coordinator.run(stop_rx))
            .map_err(TransportError::Fatal)?;

        self.running = Some(Running {
            dispatcher: Dispatcher::new(link.clone(), self.settings.command.clone()),
            link,
            stop,
            worker,
        });
        Ok(())
    }

    /// Stop polling and release the socket.
    ///
    /// A UDP socket is rebound by the next `start`. An injected transport is
    /// kept and reused.
    ///
    /// Returns the fatal transport error that ended the poll loop, if any.
    pub fn stop(&mut self) -> Result<(), TransportError> {
        let Some(Running {
            link,
            dispatcher,
            stop,
            worker,
        }) = self.running.take()
        else {
            return Ok(());
        };

        let _ = stop.try_send(());
        let result = worker.join().unwrap_or_else(|_| {
            error!("Poll worker panicked");
            Err(TransportError::Fatal(io::Error::new(
                io::ErrorKind::Other,
                "poll worker panicked",
            )))
        });

        link.set_phase(PollPhase::Idle);
        drop(dispatcher);
        if self.injected {
            match Arc::try_unwrap(link) {
                Ok(link) => self.transport = Some(link.into_transport()),
                Err(_) => warn!("Transport still in use, it cannot be restarted"),
            }
        }
        debug!("Marstek session stopped");
        result
    }

    /// True while the poll worker is alive
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.worker.is_finished())
    }

    pub fn phase(&self) -> PollPhase {
        self.running
            .as_ref()
            .map_or(PollPhase::Idle, |running| running.link.phase())
    }

    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.store.current()
    }

    pub fn subscribe(&self, listener: Arc<dyn SnapshotListener>) -> ListenerId {
        self.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Switch the storage mode using the configured mode settings.
    pub fn set_mode(&self, mode: StorageMode) -> Result<CommandResult, CommandError> {
        self.dispatcher()?.set_mode(mode)
    }

    /// Send a fully specified mode command.
    pub fn set_mode_with(&self, command: &ModeCommand) -> Result<CommandResult, CommandError> {
        self.dispatcher()?.send(command)
    }

    fn dispatcher(&self) -> Result<&Dispatcher, CommandError> {
        self.running
            .as_ref()
            .map(|running| &running.dispatcher)
            .ok_or(CommandError::NotRunning)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Marstek session ended with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marstek::testing::{FakeDevice, Step};
    use std::time::Duration;

    fn settings() -> SessionSettings {
        let mut settings = SessionSettings::new(DeviceAddress::new(
            std::net::Ipv4Addr::LOCALHOST.into(),
            30000,
            None,
        ));
        settings.poll.interval = Duration::from_millis(20);
        settings.poll.timeout = Duration::from_millis(50);
        settings
    }

    fn wait_for_poll(session: &DeviceSession) -> Arc<StateSnapshot> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = session.subscribe(Arc::new(move |s: &Arc<StateSnapshot>| {
            let _ = tx.send(s.clone());
        }));
        let snapshot = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        session.unsubscribe(id);
        snapshot
    }

    #[test]
    fn test_start_probes_identity_first() {
        let device = FakeDevice::new();
        let mut session = DeviceSession::with_transport(device.transport(), settings());

        session.start().unwrap();
        let snapshot = wait_for_poll(&session);
        session.stop().unwrap();

        assert_eq!(device.sent_methods()[0], "Marstek.GetDevice");
        assert_eq!(
            snapshot.device.as_ref().and_then(|d| d.ble_mac.as_deref()),
            Some("acd9290d23d5")
        );
        // Identity known from the probe, so polls skip it.
        assert_eq!(
            device
                .sent_methods()
                .iter()
                .filter(|m| *m == "Marstek.GetDevice")
                .count(),
            1
        );
        assert!(!session.is_running());
        assert_eq!(session.phase(), PollPhase::Idle);
    }

    #[test]
    fn test_restart_reuses_injected_transport() {
        let device = FakeDevice::new();
        let mut session = DeviceSession::with_transport(device.transport(), settings());

        session.start().unwrap();
        let first = wait_for_poll(&session);
        session.stop().unwrap();
        let sent = device.sent_methods().len();

        session.start().unwrap();
        let second = wait_for_poll(&session);
        session.stop().unwrap();

        assert!(second.meta.sequence_number > first.meta.sequence_number);
        assert!(device.sent_methods().len() > sent);
        assert!(!session.is_running());
    }

    #[test]
    fn test_set_mode_requires_start() {
        let device = FakeDevice::new();
        let session = DeviceSession::with_transport(device.transport(), settings());
        assert!(matches!(
            session.set_mode(StorageMode::Auto),
            Err(CommandError::NotRunning)
        ));
        assert!(device.sent_methods().is_empty());
    }

    #[test]
    fn test_set_mode_through_session() {
        let device = FakeDevice::new();
        let mut settings = settings();
        settings.poll.interval = Duration::from_secs(60);
        let mut session = DeviceSession::with_transport(device.transport(), settings);
        session.start().unwrap();
        wait_for_poll(&session);

        let result = session.set_mode(StorageMode::Ai).unwrap();

        assert!(result.accepted);
        assert_eq!(session.snapshot().storage.mode, Some(StorageMode::Ai));
        session.stop().unwrap();
    }

    #[test]
    fn test_failed_probe_does_not_prevent_start() {
        let device = FakeDevice::new();
        device.push(Step::Timeout);
        let mut session = DeviceSession::with_transport(device.transport(), settings());

        session.start().unwrap();
        let snapshot = wait_for_poll(&session);
        session.stop().unwrap();

        assert!(snapshot.device.is_some());
    }

    #[test]
    fn test_fatal_error_is_returned_by_stop() {
        let device = FakeDevice::new();
        let mut session = DeviceSession::with_transport(device.transport(), settings());
        let (tx, rx) = crossbeam_channel::bounded(1);

        struct FatalSignal(Sender<String>);
        impl SnapshotListener for FatalSignal {
            fn on_snapshot(&self, _snapshot: &Arc<StateSnapshot>) {}
            fn on_fatal(&self, error: &TransportError) {
                let _ = self.0.send(error.to_string());
            }
        }
        session.subscribe(Arc::new(FatalSignal(tx)));

        session.start().unwrap();
        device.push(Step::Fatal);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(session.phase(), PollPhase::FailedFatal);
        assert!(matches!(session.stop(), Err(TransportError::Fatal(_))));
    }

    #[test]
    fn test_drop_stops_worker() {
        let device = FakeDevice::new();
        let mut session = DeviceSession::with_transport(device.transport(), settings());
        session.start().unwrap();
        wait_for_poll(&session);
        drop(session);

        let sent = device.sent_methods().len();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(device.sent_methods().len(), sent);
    }
}
