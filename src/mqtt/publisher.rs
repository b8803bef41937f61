use crate::config::Config;
use crate::errors::MqttError;
use crate::marstek::StorageMode;
use crate::mqtt::context::PublishContext;
use crate::mqtt::{CommandOutcome, MqttEvent, Status, SystemInfo};
use crossbeam_channel::Sender;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use std::thread;
use std::time::Duration;

pub struct MqttPublisher {
    client: Client,
    root_topic: String,
}

macro_rules! publish_if_changed {
    ($context:expr, $src:ident , $old:ident, $field:ident) => {
        if $old.map_or(true, |o| o.$field != $src.$field) {
            $context.publish(stringify!($field), &$src.$field)?;
        }
    };
}

/// Turn a `mode/set` payload into an event for the main loop.
pub fn parse_mode_request(payload: &[u8]) -> MqttEvent {
    let text = String::from_utf8_lossy(payload);
    match text.trim().parse::<StorageMode>() {
        Ok(mode) => MqttEvent::ModeRequested(mode),
        Err(other) => MqttEvent::InvalidRequest(other),
    }
}

impl MqttPublisher {
    /// Connect to the broker. Mode requests and connection loss are
    /// reported through `events`.
    pub fn new(
        config: &Config,
        device_id: String,
        events: Sender<MqttEvent>,
    ) -> Result<Self, MqttError> {
        let client_id = format!("marstek-mqtt-rs-{}", device_id);

        tracing::info!(
            "Using MQTT TCP connection: {}:{}",
            config.mqtt.host,
            config.mqtt.port
        );
        let mut mqtt_options = MqttOptions::new(client_id, &config.mqtt.host, config.mqtt.port);

        if !config.mqtt.username.is_empty() {
            mqtt_options.set_credentials(&config.mqtt.username, &config.mqtt.password);
        }

        mqtt_options.set_keep_alive(Duration::from_secs(60));

        // Set Last Will and Testament - publish "false" to online topic when connection is lost
        let root_topic = format!("{}/{}", config.mqtt.root, device_id);
        mqtt_options.set_last_will(rumqttc::LastWill {
            topic: format!("{}/online", root_topic),
            message: b"false".to_vec().into(),
            qos: QoS::AtLeastOnce,
            retain: true,
        });

        let (client, mut connection) = Client::new(mqtt_options, 10);

        let set_topic = format!("{}/mode/set", root_topic);
        let subscriber = client.clone();
        thread::Builder::new()
            .name("mqtt-events".to_string())
            .spawn(move || {
                for notification in connection.iter() {
                    let event = match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("MQTT connected");
                            // Subscriptions do not survive a reconnect with a clean session
                            if let Err(e) = subscriber.subscribe(&set_topic, QoS::AtLeastOnce) {
                                tracing::error!("Failed to subscribe to {}: {}", set_topic, e);
                            }
                            continue;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish)))
                            if publish.topic == set_topic =>
                        {
                            parse_mode_request(&publish.payload)
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::error!("MQTT connection error: {:?}", e);
                            let _ = events.send(MqttEvent::ConnectionLost(e.to_string()));
                            break;
                        }
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| MqttError::ClientError(e.to_string()))?;

        Ok(Self { client, root_topic })
    }

    pub fn context(&'_ self, topic: &str) -> PublishContext<'_> {
        let full_topic = if topic.is_empty() {
            self.root_topic.clone()
        } else {
            format!("{}/{}", self.root_topic, topic)
        };
        PublishContext::new(&self.client, full_topic)
    }

    pub fn publish_online_status(&self, online: bool) -> Result<(), MqttError> {
        let context = self.context("");
        context.publish("online", &online)
    }

    /// Publish device identity as JSON
    pub fn publish_system_info(&self, info: &SystemInfo) -> Result<(), MqttError> {
        let context = self.context("");
        let json =
            serde_json::to_string(info).map_err(|error| MqttError::SerializationError { error })?;
        context.publish("info", &json)
    }

    /// Publish the list of selectable modes as JSON
    pub fn publish_mode_options(&self) -> Result<(), MqttError> {
        let context = self.context("mode");
        let json = serde_json::to_string(&StorageMode::ALL)
            .map_err(|error| MqttError::SerializationError { error })?;
        context.publish("options", &json)
    }

    pub fn publish_command_outcome(&self, outcome: &CommandOutcome) -> Result<(), MqttError> {
        let context = self.context("mode").transient();
        let json = serde_json::to_string(outcome)
            .map_err(|error| MqttError::SerializationError { error })?;
        context.publish("result", &json)
    }

    /// Publish real-time status data
    /// Only publishes fields that have changed compared to `old`
    pub fn publish_status(&self, status: &Status, old: Option<&Status>) -> Result<(), MqttError> {
        let context = self.context("status");
        publish_if_changed!(context, status, old, available);
        publish_if_changed!(context, status, old, sequence_number);
        publish_if_changed!(context, status, old, last_success);
        publish_if_changed!(context, status, old, consecutive_failures);
        publish_if_changed!(context, status, old, state_of_charge);
        publish_if_changed!(context, status, old, battery_voltage);
        publish_if_changed!(context, status, old, battery_current);
        publish_if_changed!(context, status, old, battery_power);
        publish_if_changed!(context, status, old, battery_temperature);
        publish_if_changed!(context, status, old, battery_capacity);
        publish_if_changed!(context, status, old, rated_capacity);
        publish_if_changed!(context, status, old, battery_charge);
        publish_if_changed!(context, status, old, battery_discharge);
        publish_if_changed!(context, status, old, grid_power);
        publish_if_changed!(context, status, old, consumption_from_grid);
        publish_if_changed!(context, status, old, export_to_grid);
        publish_if_changed!(context, status, old, mode);
        publish_if_changed!(context, status, old, storage_power);
        publish_if_changed!(context, status, old, energy_today);
        publish_if_changed!(context, status, old, energy_total);
        publish_if_changed!(context, status, old, charging_allowed);
        publish_if_changed!(context, status, old, discharging_allowed);
        publish_if_changed!(context, status, old, pv_power);
        publish_if_changed!(context, status, old, offgrid_power);
        publish_if_changed!(context, status, old, phase_a_power);
        publish_if_changed!(context, status, old, phase_b_power);
        publish_if_changed!(context, status, old, phase_c_power);

        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), MqttError> {
        self.client
            .disconnect()
            .map_err(|e| MqttError::ClientError(e.to_string()))
    }
}
