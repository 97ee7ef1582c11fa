//! In-memory mesh entities: devices and groups.

use crate::catalog::ProductInfo;
use crate::protocol::{Dest, GROUP_DEST_OFFSET};

/// Mutable light/plug attributes shared by devices and groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attributes {
    /// Power state.
    pub state: bool,
    /// true = RGB path, false = white path.
    pub color_mode: bool,
    pub transition_mode: bool,
    pub sequence_mode: bool,
    pub candle_mode: bool,
    pub white_brightness: u8,
    pub temperature: u8,
    pub color_brightness: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Attributes {
    /// One-line human readable rendering used for info-level logs.
    pub fn state_line(&self, online: bool) -> String {
        let mut line = if self.state { "ON " } else { "OFF " }.to_string();

        if self.color_mode {
            line += &format!(
                "#{:02X}{:02X}{:02X} ({} %)",
                self.r, self.g, self.b, self.color_brightness
            );
        } else {
            line += &format!("temp: {} ({} %)", self.temperature, self.white_brightness);
        }
        line += if online { " ONLINE" } else { " OFFLINE!!" };
        line
    }
}

/// One mesh peripheral, created on the first status frame that mentions
/// its mesh id and kept for the rest of the run.
#[derive(Debug, Clone)]
pub struct Device {
    pub mesh_id: u16,
    /// Full 6-byte MAC; learned from the address report, immutable once set.
    pub mac: Option<[u8; 6]>,
    pub product_id: Option<u8>,
    pub info: Option<ProductInfo>,
    pub online: bool,
    pub attrs: Attributes,
    pub last_online: u64,
    /// Timestamp of the last device-info query, 0 = never asked.
    pub device_info_requested: u64,
    /// Whether the discovery document has been published.
    pub send_discovery: bool,
    /// Group ids this device reported membership of.
    pub groups: Vec<u16>,
}

impl Device {
    pub fn new(mesh_id: u16) -> Self {
        Self {
            mesh_id,
            mac: None,
            product_id: None,
            info: None,
            online: false,
            attrs: Attributes::default(),
            last_online: 0,
            device_info_requested: 0,
            send_discovery: false,
            groups: Vec::new(),
        }
    }

    /// Stores the MAC from an address report. The first two bytes are the
    /// vendor prefix; the report only carries the low four.
    pub fn set_address(&mut self, prefix: [u8; 2], low: [u8; 4]) {
        if self.mac.is_some() {
            return;
        }
        self.mac = Some([prefix[0], prefix[1], low[0], low[1], low[2], low[3]]);
    }

    pub fn address_str(&self) -> String {
        match self.mac {
            Some(mac) => mac
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(":"),
            None => String::new(),
        }
    }

    /// MAC without separators, used in discovery object ids.
    pub fn address_hex(&self) -> String {
        match self.mac {
            Some(mac) => mac.iter().map(|b| format!("{:02X}", b)).collect(),
            None => String::new(),
        }
    }

    pub fn address_u64(&self) -> u64 {
        match self.mac {
            Some(mac) => mac.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
            None => 0,
        }
    }

    pub fn dest(&self) -> Dest {
        Dest::Device(self.mesh_id)
    }

    pub fn state_line(&self) -> String {
        format!("device {}: {}", self.mesh_id, self.attrs.state_line(self.online))
    }

    pub fn add_group(&mut self, group_id: u16) {
        if !self.groups.contains(&group_id) {
            self.groups.push(group_id);
        }
    }
}

/// A multicast group, created when the first member reports it.
#[derive(Debug, Clone)]
pub struct Group {
    pub group_id: u16,
    pub online: bool,
    pub attrs: Attributes,
    /// Capability set taken from the first joining device.
    pub info: Option<ProductInfo>,
    pub send_discovery: bool,
    /// Mesh ids of member devices.
    pub members: Vec<u16>,
}

impl Group {
    pub fn new(group_id: u16) -> Self {
        Self {
            group_id,
            online: false,
            attrs: Attributes::default(),
            info: None,
            send_discovery: false,
            members: Vec::new(),
        }
    }

    pub fn dest(&self) -> Dest {
        Dest::Group(self.group_id)
    }

    pub fn wire_dest(&self) -> u16 {
        self.group_id + GROUP_DEST_OFFSET
    }

    pub fn add_member(&mut self, mesh_id: u16) {
        if !self.members.contains(&mesh_id) {
            self.members.push(mesh_id);
        }
    }

    pub fn state_line(&self) -> String {
        format!(
            "group {}: ({}) {}",
            self.group_id,
            self.wire_dest(),
            self.attrs.state_line(self.online)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_address_formats() {
        let mut device = Device::new(7);
        assert_eq!(device.address_str(), "");

        device.set_address([0xA4, 0xC1], [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(device.address_str(), "A4:C1:11:22:33:44");
        assert_eq!(device.address_hex(), "A4C111223344");
        assert_eq!(device.address_u64(), 0xA4_C1_11_22_33_44);
    }

    #[test]
    fn device_mac_is_immutable_once_set() {
        let mut device = Device::new(7);
        device.set_address([0xA4, 0xC1], [1, 2, 3, 4]);
        device.set_address([0xA4, 0xC1], [9, 9, 9, 9]);
        assert_eq!(device.mac, Some([0xA4, 0xC1, 1, 2, 3, 4]));
    }

    #[test]
    fn group_wire_destination_is_offset() {
        let group = Group::new(2);
        assert_eq!(group.wire_dest(), 0x8002);
        assert_eq!(group.dest().to_wire(), 0x8002);
    }

    #[test]
    fn membership_is_additive_and_deduplicated() {
        let mut group = Group::new(1);
        group.add_member(5);
        group.add_member(5);
        group.add_member(9);
        assert_eq!(group.members, vec![5, 9]);

        let mut device = Device::new(5);
        device.add_group(1);
        device.add_group(1);
        assert_eq!(device.groups, vec![1]);
    }

    #[test]
    fn state_line_renders_both_paths() {
        let mut device = Device::new(3);
        device.online = true;
        device.attrs.state = true;
        device.attrs.color_mode = true;
        device.attrs.r = 0xFF;
        device.attrs.color_brightness = 0x64;
        assert!(device.state_line().contains("#FF0000"));

        device.attrs.color_mode = false;
        device.online = false;
        assert!(device.state_line().contains("temp:"));
        assert!(device.state_line().contains("OFFLINE"));
    }
}
