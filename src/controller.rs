//! Mesh controller.
//!
//! Owns the device and group tables, the connection slots and the
//! candidate pool. Every BLE and bus callback is funnelled here as an
//! [`Event`]; everything the bridge wants done in the outside world
//! leaves as an [`Effect`]. All state lives on one task, so none of this
//! needs locking.

use std::collections::VecDeque;

use crate::catalog::CatalogResolver;
use crate::config::Config;
use crate::crypto;
use crate::device::{Device, Group};
use crate::mqtt::{
    parse_on_off, ConnectionSummary, LightCommand, MqttAdapter, SwitchAction, TopicKind,
};
use crate::protocol::{self, Dest, Report};
use crate::scanner::CandidatePool;
use crate::scheduler::ConnectionScheduler;
use crate::session::{MeshSession, PairOutcome};

/// Wait before an availability flip is published, so a device bouncing
/// between reports does not flap on the bus.
const AVAILABILITY_DEBOUNCE_MS: u64 = 3_000;
/// Re-ask for device info when discovery has not happened yet.
const DEVICE_INFO_REISSUE_MS: u64 = 5_000;
/// How long the retained-availability flush subscription stays up.
const AVAILABILITY_FLUSH_WINDOW_MS: u64 = 3_000;

/// Inputs posted onto the controller task by the transport and bus
/// shells.
#[derive(Debug, Clone)]
pub enum Event {
    Advertisement {
        address: u64,
        address_str: String,
        rssi: i16,
    },
    SlotConnected {
        slot: usize,
    },
    SlotDisconnected {
        slot: usize,
    },
    PairResponse {
        slot: usize,
        value: Vec<u8>,
    },
    Notification {
        slot: usize,
        data: Vec<u8>,
    },
    BusMessage {
        topic: String,
        payload: Vec<u8>,
    },
}

/// Outputs executed by the async shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Connect { slot: usize, address: u64 },
    Disconnect { slot: usize },
    WritePair { slot: usize, payload: Vec<u8> },
    ReadPair { slot: usize },
    EnableNotifications { slot: usize },
    WriteFrame { slot: usize, payload: Vec<u8> },
    Publish { topic: String, payload: String, retain: bool },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

#[derive(Debug, Clone)]
struct PendingAvailability {
    mesh_id: u16,
    online: bool,
    time: u64,
}

pub struct MeshController {
    adapter: MqttAdapter,
    catalog: CatalogResolver,
    address_prefix: [u8; 2],
    allowed_mesh_ids: Vec<u16>,

    devices: Vec<Device>,
    groups: Vec<Group>,
    sessions: Vec<MeshSession>,
    pool: CandidatePool,
    scheduler: ConnectionScheduler,

    pending_availability: VecDeque<PendingAvailability>,
    availability_flush_done: bool,
    effects: Vec<Effect>,
}

impl MeshController {
    pub fn new(config: &Config) -> Self {
        let combined = crypto::combine_credentials(&config.mesh_name, &config.mesh_password);
        let sessions = (0..config.connection_slots)
            .map(|slot| MeshSession::new(slot, combined, config.pacing_interval_ms))
            .collect();

        Self {
            adapter: MqttAdapter::new(&config.mqtt),
            catalog: config.catalog(),
            address_prefix: config.prefix_bytes().unwrap_or([0xA4, 0xC1]),
            allowed_mesh_ids: config.allowed_mesh_ids.clone(),
            devices: Vec::new(),
            groups: Vec::new(),
            sessions,
            pool: CandidatePool::new(&config.address_prefix, &config.allowed_macs),
            scheduler: ConnectionScheduler::new(config.min_rssi),
            pending_availability: VecDeque::new(),
            availability_flush_done: false,
            effects: Vec::new(),
        }
    }

    /// Startup: flush stale retained availability and announce the
    /// diagnostic sensors.
    pub fn start(&mut self) {
        self.effects.push(Effect::Subscribe {
            topic: self.adapter.availability_wildcard(),
        });
        for (topic, payload) in self.adapter.connection_sensor_discovery(self.sessions.len()) {
            self.effects.push(Effect::Publish {
                topic,
                payload,
                retain: true,
            });
        }
        self.publish_connected(0);
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn handle_event(&mut self, event: Event, now: u64) {
        match event {
            Event::Advertisement {
                address,
                address_str,
                rssi,
            } => {
                self.pool.observe(address, &address_str, rssi, now);
            }
            Event::SlotConnected { slot } => self.handle_slot_connected(slot, now),
            Event::SlotDisconnected { slot } => self.handle_slot_disconnected(slot, now),
            Event::PairResponse { slot, value } => self.handle_pair_response(slot, &value, now),
            Event::Notification { slot, data } => self.handle_notification(slot, &data, now),
            Event::BusMessage { topic, payload } => self.handle_bus_message(&topic, &payload, now),
        }
    }

    /// One pass of the cooperative main loop.
    pub fn tick(&mut self, now: u64) {
        if !self.availability_flush_done && now >= AVAILABILITY_FLUSH_WINDOW_MS {
            self.availability_flush_done = true;
            self.effects.push(Effect::Unsubscribe {
                topic: self.adapter.availability_wildcard(),
            });
        }

        self.pool.refresh(now);
        self.link_mesh_ids_into_pool();

        let outcome = self.scheduler.tick(now, &mut self.sessions, &mut self.pool);
        self.effects.extend(outcome.effects);
        self.mark_offline(&outcome.offline_ids, now);
        if !outcome.dropped_slots.is_empty() {
            self.publish_connected(now);
        }

        for slot in 0..self.sessions.len() {
            if let Some(effect) = self.sessions[slot].tick(now) {
                self.effects.push(effect);
            }
        }

        self.flush_pending_availability(now);
        self.reissue_device_info(now);
    }

    // ---- controller operations ---------------------------------------

    pub fn set_power(&mut self, dest: Dest, state: bool) {
        self.route_command(protocol::CMD_POWER, &[state as u8, 0, 0], dest);
    }

    pub fn set_color(&mut self, dest: Dest, r: u8, g: u8, b: u8) {
        self.route_command(protocol::CMD_COLOR, &[0x04, r, g, b], dest);
    }

    pub fn set_color_brightness(&mut self, dest: Dest, value: u8) {
        self.route_command(protocol::CMD_COLOR_BRIGHTNESS, &[value], dest);
    }

    pub fn set_white_brightness(&mut self, dest: Dest, value: u8) {
        self.route_command(protocol::CMD_WHITE_BRIGHTNESS, &[value], dest);
    }

    pub fn set_white_temperature(&mut self, dest: Dest, value: u8) {
        self.route_command(protocol::CMD_WHITE_TEMPERATURE, &[value], dest);
    }

    pub fn set_sequence(&mut self, dest: Dest, preset: u8) {
        self.route_command(protocol::CMD_SEQUENCE, &[preset], dest);
    }

    pub fn set_candle_mode(&mut self, dest: Dest) {
        self.route_command(protocol::CMD_CANDLE_MODE, &[], dest);
    }

    /// Only the low byte goes on the wire, capping the duration at
    /// 255 ms. Vendor firmware accepts nothing wider.
    pub fn set_sequence_fade_duration(&mut self, dest: Dest, millis: u32) {
        self.route_command(
            protocol::CMD_SEQUENCE_FADE_DURATION,
            &[(millis & 0xFF) as u8],
            dest,
        );
    }

    pub fn set_sequence_color_duration(&mut self, dest: Dest, millis: u32) {
        self.route_command(
            protocol::CMD_SEQUENCE_COLOR_DURATION,
            &[(millis & 0xFF) as u8],
            dest,
        );
    }

    pub fn request_status(&mut self, dest: Dest) {
        self.route_command(protocol::CMD_REQUEST_STATUS, &[0x10], dest);
    }

    pub fn request_device_version(&mut self, dest: Dest) {
        self.route_command(protocol::CMD_DEVICE_INFO_QUERY, &[0x10, 0x02], dest);
    }

    /// Marks every entity offline and says goodbye on the bus.
    pub fn shutdown(&mut self) {
        for index in 0..self.devices.len() {
            self.devices[index].online = false;
            let topic = self
                .adapter
                .entity_topic(self.devices[index].dest(), "availability");
            self.effects.push(Effect::Publish {
                topic,
                payload: "offline".to_string(),
                retain: true,
            });
        }
        for index in 0..self.groups.len() {
            self.groups[index].online = false;
            let topic = self
                .adapter
                .entity_topic(self.groups[index].dest(), "availability");
            self.effects.push(Effect::Publish {
                topic,
                payload: "offline".to_string(),
                retain: true,
            });
        }
        self.effects.push(Effect::Publish {
            topic: self.adapter.connected_topic(),
            payload: "offline".to_string(),
            retain: true,
        });
    }

    // ---- BLE event handling ------------------------------------------

    fn handle_slot_connected(&mut self, slot: usize, now: u64) {
        let Some(session) = self.sessions.get_mut(slot) else {
            return;
        };
        let effects = session.on_connected(now);
        self.effects.extend(effects);
        self.publish_connected(now);
    }

    fn handle_slot_disconnected(&mut self, slot: usize, now: u64) {
        let Some(session) = self.sessions.get_mut(slot) else {
            return;
        };
        if session.is_free() {
            return;
        }
        let address = session.address();
        let former = session.on_disconnected();
        self.pool.set_connected(address, false);
        self.mark_offline(&former, now);
        self.publish_connected(now);
    }

    fn handle_pair_response(&mut self, slot: usize, value: &[u8], now: u64) {
        let Some(session) = self.sessions.get_mut(slot) else {
            return;
        };
        match session.on_pair_response(value) {
            PairOutcome::Established => {
                self.publish_connected(now);
            }
            PairOutcome::Rejected | PairOutcome::Violation => {
                let address = session.address();
                let former = session.on_disconnected();
                self.effects.push(Effect::Disconnect { slot });
                self.pool.set_connected(address, false);
                self.mark_offline(&former, now);
                self.publish_connected(now);
            }
        }
    }

    fn handle_notification(&mut self, slot: usize, data: &[u8], now: u64) {
        let Some(session) = self.sessions.get_mut(slot) else {
            return;
        };
        let report = match session.handle_notification(data) {
            Ok(Some(report)) => report,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("[{}] dropping notification: {}", slot, err);
                return;
            }
        };

        match report {
            Report::Status {
                mesh_id,
                online,
                state,
                color_mode,
                transition_mode,
                white_brightness,
                temperature,
                color_brightness,
                r,
                g,
                b,
            } => {
                let Some(index) = self.ensure_device(mesh_id, now) else {
                    self.sessions[slot].forget(mesh_id);
                    return;
                };
                let online_changed;
                {
                    let device = &mut self.devices[index];
                    online_changed = device.online != online;
                    device.online = online;
                    device.attrs.state = state;
                    device.attrs.color_mode = color_mode;
                    device.attrs.transition_mode = transition_mode;
                    device.attrs.white_brightness = white_brightness;
                    device.attrs.temperature = temperature;
                    device.attrs.color_brightness = color_brightness;
                    device.attrs.r = r;
                    device.attrs.g = g;
                    device.attrs.b = b;
                    device.last_online = now;
                    tracing::info!("{}", device.state_line());
                }

                self.publish_entity_state(Dest::Device(mesh_id));
                if online_changed {
                    self.push_availability(mesh_id, online, now);
                }
                self.refresh_groups_of(mesh_id);
            }
            Report::Address {
                mesh_id,
                mac_low,
                product_id,
            } => {
                let Some(index) = self.ensure_device(mesh_id, now) else {
                    tracing::debug!("MAC report for {} ignored: not allow-listed", mesh_id);
                    return;
                };
                {
                    let prefix = self.address_prefix;
                    let info = self.catalog.resolve(product_id);
                    let device = &mut self.devices[index];
                    device.set_address(prefix, mac_low);
                    device.product_id = Some(product_id);
                    device.info = Some(info);
                    tracing::debug!(
                        "MAC report for {}: product 0x{:02X} mac {}",
                        mesh_id,
                        product_id,
                        device.address_str()
                    );
                }
                self.send_discovery(index, now);
            }
            Report::GroupMembership { mesh_id, groups } => {
                let Some(index) = self.ensure_device(mesh_id, now) else {
                    tracing::debug!("group report for {} ignored: not allow-listed", mesh_id);
                    return;
                };
                for group_id in groups {
                    self.join_group(u16::from(group_id), index);
                }
                self.refresh_groups_of(mesh_id);
            }
            Report::Unknown { mesh_id, command } => {
                tracing::warn!(
                    "unknown report for device {}: command 0x{:02X}",
                    mesh_id,
                    command
                );
            }
        }
    }

    // ---- bus event handling ------------------------------------------

    fn handle_bus_message(&mut self, topic: &str, payload: &[u8], _now: u64) {
        match self.adapter.parse_topic(topic) {
            Some(TopicKind::Availability) => {
                if !self.availability_flush_done && payload == b"online" {
                    tracing::debug!("flushing stale retained availability on {}", topic);
                    self.effects.push(Effect::Publish {
                        topic: topic.to_string(),
                        payload: "offline".to_string(),
                        retain: true,
                    });
                }
            }
            Some(TopicKind::Command(dest)) => {
                if let Some(command) = LightCommand::parse(payload) {
                    self.apply_command(dest, command);
                }
            }
            None => {}
        }
    }

    /// Applies one inbound command document. Durations first, then
    /// colour, brightness, temperature, effect and finally power.
    fn apply_command(&mut self, dest: Dest, command: LightCommand) {
        tracing::debug!("processing command for {}", dest);
        let mut sends: Vec<(u8, Vec<u8>)> = Vec::new();

        if let Some(millis) = command.fade_duration {
            sends.push((
                protocol::CMD_SEQUENCE_FADE_DURATION,
                vec![(millis & 0xFF) as u8],
            ));
        }
        if let Some(millis) = command.color_duration {
            sends.push((
                protocol::CMD_SEQUENCE_COLOR_DURATION,
                vec![(millis & 0xFF) as u8],
            ));
        }

        {
            let Some(attrs) = self.attrs_mut(dest) else {
                tracing::warn!("command for unknown entity {}", dest);
                return;
            };
            // Colour/brightness/effect frames switch the light on by
            // themselves; an accompanying "ON" must not send a second
            // power frame.
            let mut state_set = false;

            if let Some(color) = &command.color {
                state_set = true;
                attrs.state = true;
                attrs.color_mode = true;
                attrs.r = color.r;
                attrs.g = color.g;
                attrs.b = color.b;
                sends.push((protocol::CMD_COLOR, vec![0x04, color.r, color.g, color.b]));
            }

            if let Some(brightness) = command.brightness {
                if command.color_temp.is_none() && (command.color.is_some() || attrs.color_mode) {
                    let value = protocol::convert_range(brightness, 0, 255, 0x0A, 0x64) as u8;
                    state_set = true;
                    attrs.state = true;
                    attrs.color_brightness = value;
                    sends.push((protocol::CMD_COLOR_BRIGHTNESS, vec![value]));
                } else {
                    let value = protocol::convert_range(brightness, 0, 255, 1, 0x7F) as u8;
                    state_set = true;
                    attrs.state = true;
                    attrs.white_brightness = value;
                    sends.push((protocol::CMD_WHITE_BRIGHTNESS, vec![value]));
                }
            }

            if let Some(mireds) = command.color_temp {
                let value = protocol::convert_range(mireds, 153, 370, 0, 0x7F) as u8;
                state_set = true;
                attrs.state = true;
                attrs.color_mode = false;
                attrs.temperature = value;
                sends.push((protocol::CMD_WHITE_TEMPERATURE, vec![value]));
            }

            if let Some(effect) = &command.effect {
                state_set = true;
                attrs.state = true;
                attrs.sequence_mode = false;
                attrs.candle_mode = false;
                match effect.as_str() {
                    "color loop" => {
                        attrs.sequence_mode = true;
                        sends.push((protocol::CMD_SEQUENCE, vec![0]));
                    }
                    "candle" => {
                        attrs.candle_mode = true;
                        sends.push((protocol::CMD_CANDLE_MODE, vec![]));
                    }
                    // Anything else stops the running effect by restating
                    // the stationary colour or temperature.
                    _ => {
                        if attrs.color_mode {
                            sends.push((
                                protocol::CMD_COLOR,
                                vec![0x04, attrs.r, attrs.g, attrs.b],
                            ));
                        } else {
                            sends.push((
                                protocol::CMD_WHITE_TEMPERATURE,
                                vec![attrs.temperature],
                            ));
                        }
                    }
                }
            }

            if let Some(state) = &command.state {
                match parse_on_off(state) {
                    Some(SwitchAction::On) => {
                        attrs.state = true;
                        if !state_set {
                            sends.push((protocol::CMD_POWER, vec![1, 0, 0]));
                        }
                    }
                    Some(SwitchAction::Off) => {
                        attrs.state = false;
                        sends.push((protocol::CMD_POWER, vec![0, 0, 0]));
                    }
                    Some(SwitchAction::Toggle) => {
                        attrs.state = !attrs.state;
                        sends.push((protocol::CMD_POWER, vec![attrs.state as u8, 0, 0]));
                    }
                    None => {}
                }
            }
        }

        for (code, payload) in sends {
            self.route_command(code, &payload, dest);
        }
        self.publish_entity_state(dest);
    }

    // ---- internals ---------------------------------------------------

    /// Sends a frame toward `dest` through the slot known to reach it,
    /// falling back to every live session (group and broadcast traffic
    /// is not reflected in reachability sets).
    fn route_command(&mut self, code: u8, payload: &[u8], dest: Dest) {
        let wire = dest.to_wire();
        if let Some(session) = self
            .sessions
            .iter_mut()
            .find(|s| s.address() != 0 && s.reachable().contains(&wire))
        {
            session.queue_command(code, payload.to_vec(), wire);
            return;
        }

        let mut routed = false;
        for session in self.sessions.iter_mut().filter(|s| s.is_established()) {
            session.queue_command(code, payload.to_vec(), wire);
            routed = true;
        }
        if !routed {
            tracing::warn!("no mesh connection available for {}", dest);
        }
    }

    fn allowed(&self, mesh_id: u16) -> bool {
        self.allowed_mesh_ids.is_empty() || self.allowed_mesh_ids.contains(&mesh_id)
    }

    /// Upserts a device, requesting its info and group list on first
    /// sight. Returns `None` for ids outside the allow-list.
    fn ensure_device(&mut self, mesh_id: u16, now: u64) -> Option<usize> {
        if mesh_id == 0 || !self.allowed(mesh_id) {
            return None;
        }
        if let Some(index) = self.devices.iter().position(|d| d.mesh_id == mesh_id) {
            return Some(index);
        }

        let mut device = Device::new(mesh_id);
        device.device_info_requested = now;
        self.devices.push(device);
        tracing::info!(
            "added mesh device {} (total {})",
            mesh_id,
            self.devices.len()
        );
        self.request_device_info(mesh_id);
        Some(self.devices.len() - 1)
    }

    fn request_device_info(&mut self, mesh_id: u16) {
        let dest = Dest::Device(mesh_id);
        self.route_command(protocol::CMD_DEVICE_INFO_QUERY, &[0x10, 0x00], dest);
        self.route_command(protocol::CMD_GROUP_ID_QUERY, &[0x0A, 0x01], dest);
    }

    fn device_by_mac(&self, address: u64) -> Option<&Device> {
        self.devices.iter().find(|d| d.address_u64() == address)
    }

    /// Cross-links mesh ids learned from MAC reports onto scan entries,
    /// so candidate selection can skip already reachable peripherals.
    fn link_mesh_ids_into_pool(&mut self) {
        let links: Vec<(u64, u16)> = self
            .pool
            .entries()
            .iter()
            .filter(|entry| entry.mesh_id == 0)
            .filter_map(|entry| {
                self.device_by_mac(entry.address)
                    .map(|device| (entry.address, device.mesh_id))
            })
            .collect();
        for (address, mesh_id) in links {
            self.pool.set_mesh_id(address, mesh_id);
        }
    }

    fn join_group(&mut self, group_id: u16, device_index: usize) {
        let mesh_id = self.devices[device_index].mesh_id;
        tracing::debug!("device {} is in group {}", mesh_id, group_id);

        let group_index = match self.groups.iter().position(|g| g.group_id == group_id) {
            Some(index) => index,
            None => {
                self.groups.push(Group::new(group_id));
                self.groups.len() - 1
            }
        };

        self.devices[device_index].add_group(group_id);
        let group = &mut self.groups[group_index];
        group.add_member(mesh_id);
        if group.info.is_none() {
            group.info = self.devices[device_index].info.clone();
        }

        if self.groups[group_index].info.is_some() && !self.groups[group_index].send_discovery {
            self.send_group_discovery(group_index);
        }
    }

    fn send_discovery(&mut self, index: usize, now: u64) {
        let Some((topic, payload)) = self.adapter.device_discovery(&self.devices[index]) else {
            tracing::warn!(
                "'{}': can not yet send discovery, mac address not known...",
                self.devices[index].mesh_id
            );
            return;
        };
        let device = &mut self.devices[index];
        device.send_discovery = true;
        tracing::debug!("'{}': sending discovery...", device.mesh_id);

        let mesh_id = device.mesh_id;
        let online = device.online;
        let command_topic = self.adapter.entity_topic(Dest::Device(mesh_id), "command");
        self.effects.push(Effect::Publish {
            topic,
            payload,
            retain: true,
        });
        self.effects.push(Effect::Subscribe {
            topic: command_topic,
        });
        self.push_availability(mesh_id, online, now);

        // The capability set may have been the missing piece for groups
        // this device already joined.
        let groups = self.devices[index].groups.clone();
        for group_id in groups {
            if let Some(group_index) = self.groups.iter().position(|g| g.group_id == group_id) {
                if self.groups[group_index].info.is_none() {
                    self.groups[group_index].info = self.devices[index].info.clone();
                }
                if self.groups[group_index].info.is_some()
                    && !self.groups[group_index].send_discovery
                {
                    self.send_group_discovery(group_index);
                }
            }
        }
    }

    fn send_group_discovery(&mut self, group_index: usize) {
        let Some((topic, payload)) = self.adapter.group_discovery(&self.groups[group_index])
        else {
            return;
        };
        let group = &mut self.groups[group_index];
        group.send_discovery = true;

        let dest = group.dest();
        let online = group.online;
        self.effects.push(Effect::Publish {
            topic,
            payload,
            retain: true,
        });
        self.effects.push(Effect::Subscribe {
            topic: self.adapter.entity_topic(dest, "command"),
        });
        self.effects.push(Effect::Publish {
            topic: self.adapter.entity_topic(dest, "availability"),
            payload: if online { "online" } else { "offline" }.to_string(),
            retain: true,
        });
    }

    /// Recomputes a member's groups after its online or power state
    /// moved; aggregates are ORs over the membership.
    fn refresh_groups_of(&mut self, mesh_id: u16) {
        let indices: Vec<usize> = (0..self.groups.len())
            .filter(|&i| self.groups[i].members.contains(&mesh_id))
            .collect();

        for index in indices {
            let group_id = self.groups[index].group_id;
            let online = self.groups[index].members.iter().any(|m| {
                self.devices
                    .iter()
                    .any(|d| d.mesh_id == *m && d.online)
            });
            let state = self.groups[index].members.iter().any(|m| {
                self.devices
                    .iter()
                    .any(|d| d.mesh_id == *m && d.attrs.state)
            });

            let group = &mut self.groups[index];
            let changed = group.online != online || group.attrs.state != state;
            group.online = online;
            group.attrs.state = state;
            if !changed {
                continue;
            }

            tracing::info!("{}", self.groups[index].state_line());
            let dest = Dest::Group(group_id);
            self.effects.push(Effect::Publish {
                topic: self.adapter.entity_topic(dest, "availability"),
                payload: if online { "online" } else { "offline" }.to_string(),
                retain: true,
            });
            self.publish_entity_state(dest);
        }
    }

    fn attrs_mut(&mut self, dest: Dest) -> Option<&mut crate::device::Attributes> {
        match dest {
            Dest::Device(mesh_id) => self
                .devices
                .iter_mut()
                .find(|d| d.mesh_id == mesh_id)
                .map(|d| &mut d.attrs),
            Dest::Group(group_id) => self
                .groups
                .iter_mut()
                .find(|g| g.group_id == group_id)
                .map(|g| &mut g.attrs),
            Dest::Broadcast => None,
        }
    }

    fn publish_entity_state(&mut self, dest: Dest) {
        let payload = match dest {
            Dest::Device(mesh_id) => {
                let Some(device) = self.devices.iter().find(|d| d.mesh_id == mesh_id) else {
                    return;
                };
                let Some(info) = &device.info else {
                    tracing::warn!(
                        "'{}': can not yet publish state, device info not known...",
                        mesh_id
                    );
                    return;
                };
                if device.mac.is_none() {
                    tracing::warn!(
                        "'{}': can not yet publish state, mac address not known...",
                        mesh_id
                    );
                    return;
                }
                self.adapter.state_payload(&device.attrs, &info.capabilities)
            }
            Dest::Group(group_id) => {
                let Some(group) = self.groups.iter().find(|g| g.group_id == group_id) else {
                    return;
                };
                let Some(info) = &group.info else {
                    tracing::warn!("group {}: can not yet publish state", group_id);
                    return;
                };
                self.adapter.state_payload(&group.attrs, &info.capabilities)
            }
            Dest::Broadcast => return,
        };

        self.effects.push(Effect::Publish {
            topic: self.adapter.entity_topic(dest, "state"),
            payload,
            retain: true,
        });
    }

    /// Queues a deferred availability publish and eagerly asks the
    /// device to confirm its state.
    fn push_availability(&mut self, mesh_id: u16, online: bool, now: u64) {
        tracing::debug!(
            "delayed publish online/offline for {} - {}",
            mesh_id,
            if online { "online" } else { "offline" }
        );
        self.pending_availability.push_back(PendingAvailability {
            mesh_id,
            online,
            time: now,
        });
        self.request_status(Dest::Device(mesh_id));
    }

    fn flush_pending_availability(&mut self, now: u64) {
        while self
            .pending_availability
            .front()
            .is_some_and(|p| p.time + AVAILABILITY_DEBOUNCE_MS <= now)
        {
            let Some(pending) = self.pending_availability.pop_front() else {
                break;
            };
            let Some(device) = self
                .devices
                .iter()
                .find(|d| d.mesh_id == pending.mesh_id)
            else {
                continue;
            };
            if device.online != pending.online {
                tracing::debug!(
                    "skipped availability for {} - {} (now {})",
                    pending.mesh_id,
                    pending.online,
                    device.online
                );
                continue;
            }
            tracing::info!(
                "publish online/offline for {} - {}",
                pending.mesh_id,
                if pending.online { "online" } else { "offline" }
            );
            self.effects.push(Effect::Publish {
                topic: self
                    .adapter
                    .entity_topic(Dest::Device(pending.mesh_id), "availability"),
                payload: if pending.online { "online" } else { "offline" }.to_string(),
                retain: true,
            });
        }
    }

    fn reissue_device_info(&mut self, now: u64) {
        let due: Vec<u16> = self
            .devices
            .iter_mut()
            .filter(|d| {
                !d.send_discovery
                    && d.device_info_requested > 0
                    && now.saturating_sub(d.device_info_requested) > DEVICE_INFO_REISSUE_MS
            })
            .map(|d| {
                d.device_info_requested = now;
                d.mesh_id
            })
            .collect();
        for mesh_id in due {
            tracing::debug!("requesting info again for {}", mesh_id);
            self.request_device_info(mesh_id);
        }
    }

    fn mark_offline(&mut self, mesh_ids: &[u16], now: u64) {
        for &mesh_id in mesh_ids {
            let Some(device) = self.devices.iter_mut().find(|d| d.mesh_id == mesh_id) else {
                continue;
            };
            if !device.online {
                continue;
            }
            device.online = false;
            self.push_availability(mesh_id, false, now);
            self.refresh_groups_of(mesh_id);
        }
    }

    fn publish_connected(&mut self, now: u64) {
        let active = self.sessions.iter().any(|s| s.is_established());
        let online_devices = self.devices.iter().filter(|d| d.online).count();

        let connections: Vec<ConnectionSummary> = self
            .sessions
            .iter()
            .map(|s| ConnectionSummary {
                connected: s.is_established(),
                mac: if s.is_established() {
                    s.address_str().to_string()
                } else {
                    String::new()
                },
                mesh_id: if s.is_established() {
                    s.peripheral_mesh_id().to_string()
                } else {
                    String::new()
                },
                devices: s.reachable().len(),
                mesh_ids: s
                    .reachable()
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
            .collect();

        self.effects.push(Effect::Publish {
            topic: self.adapter.connected_topic(),
            payload: if active { "online" } else { "offline" }.to_string(),
            retain: true,
        });
        self.effects.push(Effect::Publish {
            topic: self.adapter.connection_status_topic(),
            payload: self
                .adapter
                .connection_status_payload(now, active, online_devices, &connections),
            retain: false,
        });
    }

    #[cfg(test)]
    pub fn session_mut(&mut self, slot: usize) -> &mut MeshSession {
        &mut self.sessions[slot]
    }

    #[cfg(test)]
    pub fn device(&self, mesh_id: u16) -> Option<&Device> {
        self.devices.iter().find(|d| d.mesh_id == mesh_id)
    }

    #[cfg(test)]
    pub fn group(&self, group_id: u16) -> Option<&Group> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }
}
