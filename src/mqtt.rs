//! MQTT side of the bridge.
//!
//! [`MqttAdapter`] is the pure half: topic grammar, state payloads,
//! Home-Assistant discovery documents and inbound command parsing.
//! [`MqttBus`] wraps the `rumqttc` client and forwards inbound publishes
//! onto the controller event channel.

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::catalog::Capabilities;
use crate::config::MqttConfig;
use crate::controller::Event;
use crate::device::{Attributes, Device, Group};
use crate::protocol::{convert_range, Dest};

/// Narrow bus seam the effect executor talks to.
#[async_trait]
pub trait Bus {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}

/// Inbound topic classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// A retained per-entity availability value (startup flush window).
    Availability,
    /// A command for a device or group.
    Command(Dest),
}

/// On/off/toggle grammar shared by JSON state values and plug payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAction {
    On,
    Off,
    Toggle,
}

pub fn parse_on_off(value: &str) -> Option<SwitchAction> {
    match value.trim().to_ascii_uppercase().as_str() {
        "ON" => Some(SwitchAction::On),
        "OFF" => Some(SwitchAction::Off),
        "TOGGLE" => Some(SwitchAction::Toggle),
        _ => None,
    }
}

/// Inbound JSON command for a light entity. Absent keys mean "no change".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LightCommand {
    pub state: Option<String>,
    pub color: Option<ColorRgb>,
    pub brightness: Option<i32>,
    pub color_temp: Option<i32>,
    pub effect: Option<String>,
    pub fade_duration: Option<u32>,
    pub color_duration: Option<u32>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ColorRgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl LightCommand {
    /// Parses a command payload: JSON for lights, bare ON/OFF/TOGGLE for
    /// plugs.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        if text.trim_start().starts_with('{') {
            match serde_json::from_str(text) {
                Ok(command) => Some(command),
                Err(err) => {
                    tracing::warn!("unparseable command payload: {}", err);
                    None
                }
            }
        } else {
            parse_on_off(text).map(|_| LightCommand {
                state: Some(text.trim().to_string()),
                ..LightCommand::default()
            })
        }
    }
}

/// Summary of one connection slot for the status document.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub connected: bool,
    pub mac: String,
    pub mesh_id: String,
    pub devices: usize,
    pub mesh_ids: String,
}

/// Topic and payload builder. Holds no connection state.
#[derive(Debug, Clone)]
pub struct MqttAdapter {
    topic_prefix: String,
    discovery_prefix: String,
    host_id: String,
}

impl MqttAdapter {
    pub fn new(config: &MqttConfig) -> Self {
        Self {
            topic_prefix: config.topic_prefix.clone(),
            discovery_prefix: config.discovery_prefix.clone(),
            host_id: config.client_id.clone(),
        }
    }

    fn entity_id(dest: Dest) -> String {
        match dest {
            Dest::Device(mesh_id) => mesh_id.to_string(),
            Dest::Group(group_id) => format!("group-{}", group_id),
            Dest::Broadcast => "broadcast".to_string(),
        }
    }

    pub fn entity_topic(&self, dest: Dest, suffix: &str) -> String {
        format!("{}/{}/{}", self.topic_prefix, Self::entity_id(dest), suffix)
    }

    pub fn connected_topic(&self) -> String {
        format!("{}/connected", self.topic_prefix)
    }

    pub fn connection_status_topic(&self) -> String {
        format!("{}/connection_status", self.topic_prefix)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }

    pub fn availability_wildcard(&self) -> String {
        format!("{}/+/availability", self.topic_prefix)
    }

    /// Classifies an inbound topic.
    pub fn parse_topic(&self, topic: &str) -> Option<TopicKind> {
        let rest = topic.strip_prefix(&self.topic_prefix)?.strip_prefix('/')?;
        let mut parts = rest.splitn(2, '/');
        let entity = parts.next()?;
        let suffix = parts.next()?;

        let dest = if let Some(group) = entity.strip_prefix("group-") {
            Dest::Group(group.parse().ok()?)
        } else {
            Dest::Device(entity.parse().ok()?)
        };

        match suffix {
            "availability" => Some(TopicKind::Availability),
            "command" => Some(TopicKind::Command(dest)),
            _ => None,
        }
    }

    /// State payload: JSON for lights, bare ON/OFF for plugs.
    pub fn state_payload(&self, attrs: &Attributes, caps: &Capabilities) -> String {
        if !caps.light {
            return if attrs.state { "ON" } else { "OFF" }.to_string();
        }

        let mut doc = json!({
            "state": if attrs.state { "ON" } else { "OFF" },
            "color": { "r": attrs.r, "g": attrs.g, "b": attrs.b },
        });

        if attrs.color_mode {
            doc["color_mode"] = json!("rgb");
            doc["brightness"] =
                json!(convert_range(attrs.color_brightness as i32, 0x0A, 0x64, 0, 255));
        } else {
            if caps.white_temperature {
                doc["color_mode"] = json!("color_temp");
                doc["color_temp"] =
                    json!(convert_range(attrs.temperature as i32, 0, 0x7F, 153, 370));
            } else {
                doc["color_mode"] = json!("brightness");
            }
            doc["brightness"] =
                json!(convert_range(attrs.white_brightness as i32, 1, 0x7F, 0, 255));
        }

        // Effects render through the brightness mode.
        if attrs.candle_mode || attrs.sequence_mode {
            doc["color_mode"] = json!("brightness");
        }

        doc.to_string()
    }

    pub fn connection_status_payload(
        &self,
        now: u64,
        active: bool,
        online_devices: usize,
        connections: &[ConnectionSummary],
    ) -> String {
        let mut doc = json!({
            "now": now,
            "active_connections": active,
            "online_devices": online_devices,
        });
        for (i, connection) in connections.iter().enumerate() {
            doc[format!("connection_{}", i)] = json!({
                "connected": connection.connected,
                "mac": connection.mac,
                "mesh_id": connection.mesh_id,
                "devices": connection.devices,
                "mesh_ids": connection.mesh_ids,
            });
        }
        doc.to_string()
    }

    fn availability_topics(&self, dest: Dest) -> serde_json::Value {
        json!([
            { "topic": self.entity_topic(dest, "availability") },
            { "topic": self.status_topic() },
            { "topic": self.connected_topic() },
        ])
    }

    fn capability_fields(&self, doc: &mut serde_json::Value, caps: &Capabilities) {
        doc["color_mode"] = json!(true);
        if caps.white_brightness || caps.color_brightness {
            doc["brightness"] = json!(true);
            doc["brightness_scale"] = json!(255);
        }

        let mut color_modes = Vec::new();
        if caps.color {
            color_modes.push("rgb");
            doc["effect"] = json!(true);
            doc["effect_list"] = json!(["candle", "color loop", "stop"]);
        }
        if caps.white_temperature {
            color_modes.push("color_temp");
            doc["min_mireds"] = json!(153);
            doc["max_mireds"] = json!(370);
        }
        // Brightness must stand alone in the supported mode list.
        if color_modes.is_empty() && caps.white_brightness {
            color_modes.push("brightness");
        }
        if color_modes.is_empty() {
            color_modes.push("onoff");
        }
        doc["supported_color_modes"] = json!(color_modes);
    }

    /// Discovery document for a device; `None` until MAC and product id
    /// are known.
    pub fn device_discovery(&self, device: &Device) -> Option<(String, String)> {
        let info = device.info.as_ref()?;
        if device.mac.is_none() {
            return None;
        }

        let dest = device.dest();
        let mut doc = json!({
            "schema": "json",
            "name": null,
            "unique_id": format!("awox-{}-{}", device.address_str(), info.capabilities.component_type()),
            "state_topic": self.entity_topic(dest, "state"),
            "command_topic": self.entity_topic(dest, "command"),
            "availability": self.availability_topics(dest),
            "availability_mode": "all",
            "device": {
                "identifiers": [format!("awox-mesh-{}", device.mesh_id), device.address_str()],
                "name": info.name,
                "model": format!("{} ({})", info.model_or_product_code(), device.mesh_id),
                "manufacturer": info.manufacturer,
                "via_device": self.host_id,
            },
        });
        if !info.icon.is_empty() {
            doc["icon"] = json!(info.icon);
        }
        self.capability_fields(&mut doc, &info.capabilities);

        let topic = format!(
            "{}/{}/awox-{}/config",
            self.discovery_prefix,
            info.capabilities.component_type(),
            device.address_hex()
        );
        Some((topic, doc.to_string()))
    }

    /// Discovery document for a group; `None` until a member contributed
    /// a capability set.
    pub fn group_discovery(&self, group: &Group) -> Option<(String, String)> {
        let info = group.info.as_ref()?;
        let dest = group.dest();

        let mut doc = json!({
            "schema": "json",
            "name": null,
            "unique_id": format!("group-{}", group.group_id),
            "icon": "mdi:lightbulb-group",
            "state_topic": self.entity_topic(dest, "state"),
            "command_topic": self.entity_topic(dest, "command"),
            "availability": self.availability_topics(dest),
            "availability_mode": "all",
            "device": {
                "identifiers": [format!("awox-mesh-group-{}", group.group_id)],
                "name": format!("Group {}", group.group_id),
                "model": format!("Group - {}", group.group_id),
                "manufacturer": "AwoX BLE mesh bridge",
                "via_device": self.host_id,
            },
        });
        self.capability_fields(&mut doc, &info.capabilities);

        let topic = format!(
            "{}/{}/group-{}/config",
            self.discovery_prefix,
            info.capabilities.component_type(),
            group.group_id
        );
        Some((topic, doc.to_string()))
    }

    /// Diagnostic sensor discovery for each connection slot, templated
    /// over the connection status document.
    pub fn connection_sensor_discovery(&self, slots: usize) -> Vec<(String, String)> {
        let mut docs = Vec::new();
        let device = json!({ "identifiers": [self.host_id] });

        for i in 0..slots {
            let sensors = [
                ("devices", "Devices", "mdi:counter", "sensor"),
                ("mesh_ids", "Mesh IDs", "mdi:vector-polyline", "sensor"),
                ("mesh_id", "Mesh ID", "mdi:vector-point-select", "sensor"),
                ("mac", "MAC address", "mdi:information", "sensor"),
                ("connected", "Connected", "mdi:connection", "binary_sensor"),
            ];
            for (field, label, icon, component) in sensors {
                let mut doc = json!({
                    "name": format!("Connection {} {}", i, label),
                    "unique_id": format!("awox-connection-{}-{}", i, field),
                    "entity_category": "diagnostic",
                    "icon": icon,
                    "enabled_by_default": false,
                    "state_topic": self.connection_status_topic(),
                    "availability_topic": self.status_topic(),
                    "value_template": format!("{{{{ value_json.connection_{}.{} }}}}", i, field),
                    "device": device,
                });
                if component == "binary_sensor" {
                    doc["payload_on"] = json!(true);
                    doc["payload_off"] = json!(false);
                }
                let topic = format!(
                    "{}/{}/{}/connection-{}-{}/config",
                    self.discovery_prefix,
                    component,
                    self.host_id,
                    i,
                    field.replace('_', "-")
                );
                docs.push((topic, doc.to_string()));
            }
        }
        docs
    }
}

/// `rumqttc`-backed bus.
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Connects to the broker with a last will that flips the bridge
    /// offline if the process dies.
    pub fn connect(config: &MqttConfig, adapter: &MqttAdapter) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        options.set_last_will(LastWill::new(
            adapter.connected_topic(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, 64);
        (Self { client }, event_loop)
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }
}

/// Drives the MQTT event loop, forwarding inbound publishes onto the
/// controller channel.
pub async fn event_pump(mut event_loop: EventLoop, events: mpsc::Sender<Event>) {
    loop {
        match event_loop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                let event = Event::BusMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("connected to MQTT broker");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!("MQTT connection error: {}; reconnecting", err);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}
