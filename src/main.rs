use std::sync::Arc;

use anyhow::{anyhow, bail};
use clap::Parser;
use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use marstek_mqtt_rs::config::Config;
use marstek_mqtt_rs::errors::TransportError;
use marstek_mqtt_rs::marstek::{DeviceSession, SessionSettings, SnapshotListener, StateSnapshot};
use marstek_mqtt_rs::mqtt::{self, CommandOutcome, MqttEvent, MqttPublisher};

/// Marstek MQTT Bridge - Publishes Marstek battery data to MQTT
#[derive(Parser)]
#[command(name = "marstek-mqtt-rs")]
#[command(version)]
#[command(about = "Marstek MQTT Bridge - Publishes Marstek battery data to MQTT", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

/// Hands snapshots from the poll thread to the main loop
struct ChannelListener {
    snapshots: Sender<Arc<StateSnapshot>>,
    fatal: Sender<String>,
}

impl SnapshotListener for ChannelListener {
    fn on_snapshot(&self, snapshot: &Arc<StateSnapshot>) {
        let _ = self.snapshots.send(snapshot.clone());
    }

    fn on_fatal(&self, error: &TransportError) {
        let _ = self.fatal.try_send(error.to_string());
    }
}

struct Bridge<'a> {
    config: &'a Config,
    session: &'a DeviceSession,
    publisher: &'a MqttPublisher,
    info_published: bool,
    last_status: Option<mqtt::Status>,
}

impl Bridge<'_> {
    fn publish_info(&mut self, snapshot: &StateSnapshot) -> anyhow::Result<()> {
        if let (false, Some(info)) = (self.info_published, snapshot.device.as_ref()) {
            self.publisher
                .publish_system_info(&mqtt::SystemInfo::new(info, &self.config.marstek))?;
            info!("✓ Published device info");
            self.info_published = true;
        }
        Ok(())
    }

    fn on_snapshot(&mut self, snapshot: &StateSnapshot) -> anyhow::Result<()> {
        self.publish_info(snapshot)?;

        let status = mqtt::Status::from_snapshot(snapshot);
        if let Err(e) = self.publisher.publish_status(&status, self.last_status.as_ref()) {
            error!("Failed to publish status: {:?}", e);
            // Let it crash on MQTT errors
            return Err(e.into());
        }

        if !status.available && self.last_status.as_ref().map_or(true, |s| s.available) {
            warn!("Device marked unavailable");
        }
        debug!(
            "Status: SOC={:?}% Mode={:?} Grid={:?}W Battery={:?}W",
            status.state_of_charge, status.mode, status.grid_power, status.battery_power
        );
        self.last_status = Some(status);
        Ok(())
    }

    fn on_mqtt_event(&mut self, event: MqttEvent) -> anyhow::Result<()> {
        match event {
            MqttEvent::ModeRequested(mode) => {
                info!("Mode change to {} requested", mode);
                let result = self.session.set_mode(mode);
                if let Err(e) = &result {
                    warn!("Mode change to {} failed: {}", mode, e);
                }
                self.publisher
                    .publish_command_outcome(&CommandOutcome::new(mode, &result))?;
            }
            MqttEvent::InvalidRequest(payload) => {
                warn!("Ignoring unknown mode {:?}", payload);
            }
            MqttEvent::ConnectionLost(reason) => bail!("MQTT connection lost: {}", reason),
        }
        Ok(())
    }

    fn run(
        &mut self,
        snapshots: Receiver<Arc<StateSnapshot>>,
        fatal: Receiver<String>,
        mqtt_events: Receiver<MqttEvent>,
        shutdown: Receiver<()>,
    ) -> anyhow::Result<()> {
        loop {
            select! {
                recv(snapshots) -> snapshot => self.on_snapshot(&*snapshot?)?,
                recv(mqtt_events) -> event => self.on_mqtt_event(event?)?,
                recv(fatal) -> error => {
                    return Err(anyhow!("Device communication failed: {}", error?));
                }
                recv(shutdown) -> _ => {
                    info!("Shutdown requested");
                    return Ok(());
                }
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration first (to get log level)
    let config_path = cli.config;
    let config = Config::from_file(&config_path)?;

    // Initialize tracing with log level from config
    let app_log_level = config.default.log_level.as_str();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("marstek_mqtt_rs={}", app_log_level).parse()?)
                .add_directive("rumqttc=warn".parse()?),
        )
        .init();

    info!("Configuration loaded from: {}", config_path);
    info!("Log level: {}", config.default.log_level);
    debug!("Debug logging is enabled");

    info!("  Marstek Host: {}:{}", config.marstek.host, config.marstek.port);
    info!("  MQTT Root: {}", config.mqtt.root);
    info!("  Interval: {:?}", config.marstek.interval);

    let (snapshot_tx, snapshot_rx) = crossbeam_channel::unbounded();
    let (fatal_tx, fatal_rx) = crossbeam_channel::bounded(1);

    let mut session = DeviceSession::new(SessionSettings::from(&config.marstek));
    session.subscribe(Arc::new(ChannelListener {
        snapshots: snapshot_tx,
        fatal: fatal_tx,
    }));
    session.start()?;

    let device_id = mqtt::device_id(session.snapshot().device.as_ref(), config.marstek.host);
    info!("Device ID: {}", device_id);

    let (mqtt_tx, mqtt_rx) = crossbeam_channel::unbounded();
    let publisher = MqttPublisher::new(&config, device_id, mqtt_tx)?;
    info!("✓ MQTT publisher created successfully!");

    // Give MQTT a moment to connect
    std::thread::sleep(std::time::Duration::from_millis(500));

    publisher.publish_online_status(true)?;
    publisher.publish_mode_options()?;
    info!("✓ Published online status");

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })?;

    let mut bridge = Bridge {
        config: &config,
        session: &session,
        publisher: &publisher,
        info_published: false,
        last_status: None,
    };
    let result = bridge.run(snapshot_rx, fatal_rx, mqtt_rx, shutdown_rx);

    if let Err(e) = publisher.publish_online_status(false) {
        error!("Failed to publish offline status: {}", e);
    }
    let stopped = session.stop();
    if let Err(e) = publisher.disconnect() {
        debug!("MQTT disconnect failed: {}", e);
    }

    result?;
    stopped?;
    info!("Bye");
    Ok(())
}
