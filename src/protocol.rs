//! Telink-style mesh packet protocol.
//!
//! This module implements the 20-byte command frames and the status
//! report formats relayed by AwoX/EGLO mesh peripherals.
//!
//! ## Frame Format
//!
//! ```text
//! bytes 0-1   : packet counter (little-endian, 1..=0xFFFF)
//! bytes 2-4   : unused (=0); overwritten with an auth tag on encrypt
//! bytes 5-6   : destination (little-endian)
//! byte  7     : command code
//! bytes 8-9   : vendor code (0x0160, little-endian)
//! bytes 10-19 : command payload, zero padded
//! ```
//!
//! Destinations address a single device by mesh id, a group by
//! `group_id + 0x8000`, or every device via `0xFFFF`.

use thiserror::Error;
use uuid::{uuid, Uuid};

/// GATT service exposed by mesh peripherals.
pub const SERVICE_UUID: Uuid = uuid!("00010203-0405-0607-0809-0a0b0c0d1910");
/// Characteristic delivering encrypted status notifications.
pub const NOTIFY_CHAR_UUID: Uuid = uuid!("00010203-0405-0607-0809-0a0b0c0d1911");
/// Characteristic accepting encrypted command frames.
pub const COMMAND_CHAR_UUID: Uuid = uuid!("00010203-0405-0607-0809-0a0b0c0d1912");
/// Characteristic used for the pairing handshake.
pub const PAIR_CHAR_UUID: Uuid = uuid!("00010203-0405-0607-0809-0a0b0c0d1914");

pub const FRAME_LEN: usize = 20;
/// Fixed vendor code, little-endian on the wire.
pub const VENDOR_CODE: [u8; 2] = [0x60, 0x01];
/// Wire destination addressing every device in the mesh.
pub const BROADCAST_DEST: u16 = 0xFFFF;
/// Offset added to a group id to form its wire destination.
pub const GROUP_DEST_OFFSET: u16 = 0x8000;

// Outbound command codes.
pub const CMD_POWER: u8 = 0xD0;
pub const CMD_COLOR: u8 = 0xE2;
pub const CMD_COLOR_BRIGHTNESS: u8 = 0xF2;
pub const CMD_WHITE_BRIGHTNESS: u8 = 0xF1;
pub const CMD_WHITE_TEMPERATURE: u8 = 0xF0;
pub const CMD_SEQUENCE: u8 = 0xC8;
pub const CMD_CANDLE_MODE: u8 = 0xC9;
pub const CMD_SEQUENCE_COLOR_DURATION: u8 = 0xF5;
pub const CMD_SEQUENCE_FADE_DURATION: u8 = 0xF6;
pub const CMD_REQUEST_STATUS: u8 = 0xDA;
pub const CMD_DEVICE_INFO_QUERY: u8 = 0xEA;
pub const CMD_GROUP_ID_QUERY: u8 = 0xDD;

// Inbound report codes.
pub const REPORT_ONLINE_STATUS: u8 = 0xDC;
pub const REPORT_STATUS: u8 = 0xDB;
pub const REPORT_ADDRESS: u8 = 0xE1;
pub const REPORT_GROUP_IDS: u8 = 0xD4;

/// Mesh command destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dest {
    /// A single device, addressed by mesh id.
    Device(u16),
    /// A multicast group.
    Group(u16),
    /// Every device in the mesh.
    Broadcast,
}

impl Dest {
    pub fn to_wire(self) -> u16 {
        match self {
            Dest::Device(mesh_id) => mesh_id,
            Dest::Group(group_id) => group_id + GROUP_DEST_OFFSET,
            Dest::Broadcast => BROADCAST_DEST,
        }
    }
}

impl std::fmt::Display for Dest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dest::Device(mesh_id) => write!(f, "device {}", mesh_id),
            Dest::Group(group_id) => write!(f, "group {}", group_id),
            Dest::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Builds a plaintext command frame. The payload is truncated to the 10
/// bytes the frame can carry.
pub fn build_frame(counter: u16, dest: u16, command: u8, payload: &[u8]) -> [u8; FRAME_LEN] {
    let mut packet = [0u8; FRAME_LEN];
    packet[0] = (counter & 0xFF) as u8;
    packet[1] = (counter >> 8) as u8;
    packet[5] = (dest & 0xFF) as u8;
    packet[6] = (dest >> 8) as u8;
    packet[7] = command;
    packet[8] = VENDOR_CODE[0];
    packet[9] = VENDOR_CODE[1];
    for (dst, src) in packet[10..].iter_mut().zip(payload.iter()) {
        *dst = *src;
    }
    packet
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("notification too short: {0} bytes")]
    TooShort(usize),
}

/// A decoded status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Power/colour state for a device, either relayed (`0xDC`) from
    /// elsewhere in the mesh or reported directly (`0xDB`).
    Status {
        mesh_id: u16,
        online: bool,
        state: bool,
        color_mode: bool,
        transition_mode: bool,
        white_brightness: u8,
        temperature: u8,
        color_brightness: u8,
        r: u8,
        g: u8,
        b: u8,
    },
    /// A device announcing the low bytes of its MAC and its product id.
    Address {
        mesh_id: u16,
        mac_low: [u8; 4],
        product_id: u8,
    },
    /// A device listing the groups it belongs to.
    GroupMembership { mesh_id: u16, groups: Vec<u8> },
    /// Anything this bridge does not understand.
    Unknown { mesh_id: u16, command: u8 },
}

/// Parses a decrypted notification into a [`Report`].
pub fn parse_report(packet: &[u8]) -> Result<Report, PacketError> {
    if packet.len() < FRAME_LEN {
        return Err(PacketError::TooShort(packet.len()));
    }

    // Inbound frames carry the source mesh id where outbound frames
    // carry the auth tag.
    let header_mesh_id = u16::from(packet[4]) * 256 + u16::from(packet[3]);

    match packet[7] {
        REPORT_ONLINE_STATUS => {
            let mode = packet[12];
            Ok(Report::Status {
                mesh_id: u16::from(packet[19]) * 256 + u16::from(packet[10]),
                online: packet[11] > 0,
                state: mode & 1 == 1,
                color_mode: (mode >> 1) & 1 == 1,
                transition_mode: (mode >> 2) & 1 == 1,
                white_brightness: packet[13],
                temperature: packet[14],
                color_brightness: packet[15],
                r: packet[16],
                g: packet[17],
                b: packet[18],
            })
        }
        REPORT_STATUS => {
            let mode = packet[10];
            Ok(Report::Status {
                mesh_id: header_mesh_id,
                online: true,
                state: mode & 1 == 1,
                color_mode: (mode >> 1) & 1 == 1,
                transition_mode: (mode >> 2) & 1 == 1,
                white_brightness: packet[11],
                temperature: packet[12],
                color_brightness: packet[13],
                r: packet[14],
                g: packet[15],
                b: packet[16],
            })
        }
        REPORT_ADDRESS if packet[10] == 0 => Ok(Report::Address {
            mesh_id: header_mesh_id,
            mac_low: [packet[16], packet[15], packet[14], packet[13]],
            product_id: packet[12],
        }),
        REPORT_GROUP_IDS => {
            let groups = packet[10..20]
                .iter()
                .take_while(|&&b| b != 0xFF)
                .copied()
                .collect();
            Ok(Report::GroupMembership {
                mesh_id: header_mesh_id,
                groups,
            })
        }
        command => Ok(Report::Unknown {
            mesh_id: header_mesh_id,
            command,
        }),
    }
}

/// Rescales a value from one inclusive range onto another, clamping to
/// the target bounds.
pub fn convert_range(value: i32, min_from: i32, max_from: i32, min_to: i32, max_to: i32) -> i32 {
    let normalized = (value - min_from) as f32 / (max_from - min_from) as f32;
    let scaled = (normalized * (max_to - min_to) as f32).round() as i32 + min_to;
    scaled.min(max_to).max(min_to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let packet = build_frame(1, BROADCAST_DEST, CMD_REQUEST_STATUS, &[0x10]);

        assert_eq!(packet[0..2], [0x01, 0x00]);
        assert_eq!(packet[2..5], [0, 0, 0]);
        assert_eq!(packet[5..7], [0xFF, 0xFF]);
        assert_eq!(packet[7], 0xDA);
        assert_eq!(packet[8..10], [0x60, 0x01]);
        assert_eq!(packet[10], 0x10);
        assert_eq!(packet[11..], [0u8; 9]);
    }

    #[test]
    fn frame_counter_and_dest_are_little_endian() {
        let packet = build_frame(0x1234, 0x8002, CMD_POWER, &[1, 0, 0]);
        assert_eq!(packet[0..2], [0x34, 0x12]);
        assert_eq!(packet[5..7], [0x02, 0x80]);
    }

    #[test]
    fn dest_wire_encoding() {
        assert_eq!(Dest::Device(7).to_wire(), 7);
        assert_eq!(Dest::Group(2).to_wire(), 0x8002);
        assert_eq!(Dest::Broadcast.to_wire(), 0xFFFF);
    }

    #[test]
    fn parse_direct_status_report() {
        let packet: [u8; 20] = [
            0x2C, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0xDB, 0x60, 0x01, 0x01, 0x5F, 0x30, 0x64,
            0xFF, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let report = parse_report(&packet).unwrap();

        assert_eq!(
            report,
            Report::Status {
                mesh_id: 5,
                online: true,
                state: true,
                color_mode: false,
                transition_mode: false,
                white_brightness: 0x5F,
                temperature: 0x30,
                color_brightness: 0x64,
                r: 0xFF,
                g: 0,
                b: 0,
            }
        );
    }

    #[test]
    fn parse_relayed_status_report_offline() {
        let mut packet = [0u8; 20];
        packet[7] = REPORT_ONLINE_STATUS;
        packet[10] = 12; // low byte of mesh id
        packet[11] = 0; // offline
        packet[12] = 0b011; // on, colour mode
        packet[13] = 0x40;
        packet[14] = 0x20;
        packet[15] = 0x50;
        packet[16] = 10;
        packet[17] = 20;
        packet[18] = 30;
        packet[19] = 1; // high byte of mesh id

        match parse_report(&packet).unwrap() {
            Report::Status {
                mesh_id,
                online,
                state,
                color_mode,
                r,
                g,
                b,
                ..
            } => {
                assert_eq!(mesh_id, 256 + 12);
                assert!(!online);
                assert!(state);
                assert!(color_mode);
                assert_eq!((r, g, b), (10, 20, 30));
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn parse_address_report() {
        let mut packet = [0u8; 20];
        packet[3] = 9;
        packet[7] = REPORT_ADDRESS;
        packet[11] = 0x00;
        packet[12] = 0x32;
        packet[13] = 0x44;
        packet[14] = 0x33;
        packet[15] = 0x22;
        packet[16] = 0x11;

        assert_eq!(
            parse_report(&packet).unwrap(),
            Report::Address {
                mesh_id: 9,
                mac_low: [0x11, 0x22, 0x33, 0x44],
                product_id: 0x32,
            }
        );
    }

    #[test]
    fn address_report_with_nonzero_flag_is_unknown() {
        let mut packet = [0u8; 20];
        packet[7] = REPORT_ADDRESS;
        packet[10] = 0x02;

        assert!(matches!(
            parse_report(&packet).unwrap(),
            Report::Unknown { command: 0xE1, .. }
        ));
    }

    #[test]
    fn parse_group_membership_terminates_at_sentinel() {
        let mut packet = [0u8; 20];
        packet[3] = 5;
        packet[7] = REPORT_GROUP_IDS;
        packet[10] = 1;
        packet[11] = 3;
        packet[12] = 0xFF;
        packet[13] = 9;

        assert_eq!(
            parse_report(&packet).unwrap(),
            Report::GroupMembership {
                mesh_id: 5,
                groups: vec![1, 3],
            }
        );
    }

    #[test]
    fn short_packet_is_rejected() {
        assert!(parse_report(&[0u8; 10]).is_err());
    }

    #[test]
    fn range_conversion_round_trip() {
        for v in [0, 1, 100, 200, 255] {
            let internal = convert_range(v, 0, 255, 1, 0x7F);
            let back = convert_range(internal, 1, 0x7F, 0, 255);
            assert!((back - v).abs() <= 1, "{} -> {} -> {}", v, internal, back);
        }
    }

    #[test]
    fn range_conversion_clamps() {
        assert_eq!(convert_range(0, 0, 255, 1, 0x7F), 1);
        assert_eq!(convert_range(255, 0, 255, 1, 0x7F), 0x7F);
        assert_eq!(convert_range(153, 153, 370, 0, 0x7F), 0);
        assert_eq!(convert_range(370, 153, 370, 0, 0x7F), 0x7F);
        assert_eq!(convert_range(0, 0, 255, 0x0A, 0x64), 0x0A);
    }
}
