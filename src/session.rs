//! Per-slot mesh session.
//!
//! One authenticated, encrypted GATT connection to a chosen peripheral.
//! The session owns the handshake, the session key, the packet counter
//! and a paced command queue. It never talks to the transport directly;
//! every externally visible action is returned as an [`Effect`] executed
//! by the async shell.

use std::collections::{BTreeSet, VecDeque};

use crate::controller::Effect;
use crate::crypto;
use crate::protocol::{self, PacketError, Report};
use crate::scanner::FoundDevice;

/// Time a slot may spend connecting before the scheduler frees it.
pub const CONNECT_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Idle,
    Connecting,
    Connected,
    Authenticating,
    Established,
    Disconnecting,
}

/// Result of the pairing characteristic read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    /// Session key derived, commands may flow.
    Established,
    /// The peripheral rejected the mesh credentials.
    Rejected,
    /// Unexpected response byte.
    Violation,
}

#[derive(Debug, Clone)]
struct QueuedCommand {
    command: u8,
    payload: Vec<u8>,
    dest: u16,
}

pub struct MeshSession {
    slot: usize,
    state: SessionState,
    address: u64,
    address_str: String,
    reversed_address: [u8; 6],
    combined_key: [u8; 16],
    client_nonce: [u8; 8],
    session_key: Option<[u8; 16]>,
    packet_counter: u16,
    last_send: u64,
    pacing_interval_ms: u64,
    queue: VecDeque<QueuedCommand>,
    reachable: BTreeSet<u16>,
    /// Mesh id of the directly connected peripheral, 0 if unknown.
    peripheral_mesh_id: u16,
    connect_deadline: Option<u64>,
}

impl MeshSession {
    pub fn new(slot: usize, combined_key: [u8; 16], pacing_interval_ms: u64) -> Self {
        Self {
            slot,
            state: SessionState::Init,
            address: 0,
            address_str: String::new(),
            reversed_address: [0; 6],
            combined_key,
            client_nonce: [0; 8],
            session_key: None,
            packet_counter: 1,
            last_send: 0,
            pacing_interval_ms,
            queue: VecDeque::new(),
            reachable: BTreeSet::new(),
            peripheral_mesh_id: 0,
            connect_deadline: None,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn address_str(&self) -> &str {
        &self.address_str
    }

    pub fn is_free(&self) -> bool {
        self.address == 0
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn reachable(&self) -> &BTreeSet<u16> {
        &self.reachable
    }

    pub fn peripheral_mesh_id(&self) -> u16 {
        self.peripheral_mesh_id
    }

    /// Binds a scanned peripheral to this slot and starts the connect
    /// watchdog. The GATT open itself happens in the transport shell.
    pub fn connect_to(&mut self, found: &FoundDevice, now: u64) {
        self.address = found.address;
        self.address_str = found.address_str.clone();
        self.reversed_address = crypto::reverse_address(found.address);
        self.peripheral_mesh_id = found.mesh_id;
        self.state = SessionState::Connecting;
        self.connect_deadline = Some(now + CONNECT_TIMEOUT_MS);
        if found.mesh_id != 0 {
            self.reachable.insert(found.mesh_id);
        }
        tracing::info!(
            "[{}] [{}] connecting (rssi {})",
            self.slot,
            self.address_str,
            found.rssi
        );
    }

    /// Called when the GATT connection is up and services are resolved.
    /// Kicks off the pairing handshake.
    pub fn on_connected(&mut self, now: u64) -> Vec<Effect> {
        self.state = SessionState::Connected;
        self.client_nonce = rand::random();
        self.last_send = now;
        self.state = SessionState::Authenticating;

        vec![
            Effect::WritePair {
                slot: self.slot,
                payload: crypto::pairing_request(&self.combined_key, &self.client_nonce),
            },
            Effect::ReadPair { slot: self.slot },
            Effect::EnableNotifications { slot: self.slot },
        ]
    }

    /// Handles the pairing characteristic read.
    pub fn on_pair_response(&mut self, value: &[u8]) -> PairOutcome {
        match value.first() {
            Some(&crypto::PAIR_GRANTED) if value.len() >= 9 => {
                let key =
                    crypto::session_key(&self.combined_key, &self.client_nonce, &value[1..9]);
                tracing::info!(
                    "[{}] [{}] session key {}",
                    self.slot,
                    self.address_str,
                    hex::encode(key)
                );
                self.session_key = Some(key);
                self.state = SessionState::Established;
                self.connect_deadline = None;

                // Ask the whole mesh to report in through this peripheral.
                self.queue_command(protocol::CMD_REQUEST_STATUS, vec![0x10], protocol::BROADCAST_DEST);
                PairOutcome::Established
            }
            Some(&crypto::PAIR_REJECTED) => {
                tracing::error!(
                    "[{}] [{}] mesh credentials rejected; were the devices re-paired \
                     with a different account?",
                    self.slot,
                    self.address_str
                );
                PairOutcome::Rejected
            }
            other => {
                tracing::error!(
                    "[{}] [{}] unexpected pair response {:?}",
                    self.slot,
                    self.address_str,
                    other
                );
                PairOutcome::Violation
            }
        }
    }

    pub fn queue_command(&mut self, command: u8, payload: Vec<u8>, dest: u16) {
        self.queue.push_back(QueuedCommand {
            command,
            payload,
            dest,
        });
    }

    /// Drains at most one queued frame, respecting the pacing interval.
    pub fn tick(&mut self, now: u64) -> Option<Effect> {
        if self.state != SessionState::Established || self.queue.is_empty() {
            return None;
        }
        if now.saturating_sub(self.last_send) < self.pacing_interval_ms {
            return None;
        }

        let item = self.queue.pop_front()?;
        self.last_send = now;
        tracing::trace!(
            "[{}] [{}] send command 0x{:02X} dest {}",
            self.slot,
            self.address_str,
            item.command,
            item.dest
        );
        let payload = self.build_encrypted(item.dest, item.command, &item.payload)?;
        Some(Effect::WriteFrame {
            slot: self.slot,
            payload,
        })
    }

    fn build_encrypted(&mut self, dest: u16, command: u8, payload: &[u8]) -> Option<Vec<u8>> {
        let key = self.session_key?;
        let counter = self.next_counter();
        let mut packet = protocol::build_frame(counter, dest, command, payload);
        crypto::encrypt_packet(&key, &self.reversed_address, &mut packet);
        Some(packet.to_vec())
    }

    fn next_counter(&mut self) -> u16 {
        let counter = self.packet_counter;
        self.packet_counter = if counter == 0xFFFF { 1 } else { counter + 1 };
        counter
    }

    /// Decrypts and parses one notification, updating the reachability
    /// set as a side effect.
    pub fn handle_notification(&mut self, data: &[u8]) -> Result<Option<Report>, PacketError> {
        let key = match self.session_key {
            Some(key) => key,
            None => return Ok(None),
        };
        if data.len() < 7 {
            return Err(PacketError::TooShort(data.len()));
        }

        let mut packet = data.to_vec();
        crypto::decrypt_packet(&key, &self.reversed_address, &mut packet);
        tracing::trace!(
            "[{}] [{}] notification {}",
            self.slot,
            self.address_str,
            hex::encode(&packet)
        );

        let report = protocol::parse_report(&packet)?;
        match &report {
            Report::Status {
                mesh_id, online, ..
            } => {
                if *online {
                    self.add_reachable(*mesh_id);
                } else {
                    self.reachable.remove(mesh_id);
                }
            }
            Report::Address { mesh_id, .. } | Report::GroupMembership { mesh_id, .. } => {
                self.add_reachable(*mesh_id);
            }
            Report::Unknown { .. } => {}
        }
        Ok(Some(report))
    }

    fn add_reachable(&mut self, mesh_id: u16) {
        if mesh_id != 0 {
            self.reachable.insert(mesh_id);
        }
    }

    /// Drops one id from the reachability set (allow-list rejections).
    pub fn forget(&mut self, mesh_id: u16) {
        self.reachable.remove(&mesh_id);
    }

    /// Clears the reachability set, returning the ids it held. Used by
    /// the overlap resolver before initiating a disconnect.
    pub fn take_reachable(&mut self) -> Vec<u16> {
        let ids: Vec<u16> = self.reachable.iter().copied().collect();
        self.reachable.clear();
        ids
    }

    pub fn begin_disconnect(&mut self) {
        self.state = SessionState::Disconnecting;
    }

    /// Resets the slot after the peripheral went away. Returns the mesh
    /// ids that were reachable here so the controller can mark them
    /// offline.
    pub fn on_disconnected(&mut self) -> Vec<u16> {
        let former = self.take_reachable();
        if self.address != 0 {
            tracing::info!("[{}] [{}] disconnected", self.slot, self.address_str);
        }
        self.address = 0;
        self.address_str.clear();
        self.reversed_address = [0; 6];
        self.session_key = None;
        self.peripheral_mesh_id = 0;
        self.connect_deadline = None;
        self.queue.clear();
        self.state = SessionState::Idle;
        former
    }

    /// Whether the connect watchdog fired without the session coming up.
    pub fn watchdog_expired(&self, now: u64) -> bool {
        matches!(self.connect_deadline, Some(deadline) if now >= deadline)
            && !self.is_established()
    }

    #[cfg(test)]
    pub fn set_client_nonce(&mut self, nonce: [u8; 8]) {
        self.client_nonce = nonce;
    }

    #[cfg(test)]
    pub fn insert_reachable(&mut self, mesh_id: u16) {
        self.add_reachable(mesh_id);
    }

    #[cfg(test)]
    pub fn session_key_bytes(&self) -> Option<[u8; 16]> {
        self.session_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{block_encrypt, combine_credentials, decrypt_packet};

    fn found(address: u64, mesh_id: u16) -> FoundDevice {
        FoundDevice {
            address,
            address_str: "A4:C1:11:22:33:44".to_string(),
            rssi: -60,
            last_detected: 0,
            connected: false,
            mesh_id,
        }
    }

    fn established_session() -> MeshSession {
        let combined = combine_credentials("meshA", "p");
        let mut session = MeshSession::new(0, combined, 180);
        session.connect_to(&found(0xA4_C1_11_22_33_44, 0), 0);
        session.on_connected(0);
        session.set_client_nonce([0, 1, 2, 3, 4, 5, 6, 7]);

        let mut reply = vec![crypto::PAIR_GRANTED];
        reply.extend_from_slice(&[0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17]);
        assert_eq!(session.on_pair_response(&reply), PairOutcome::Established);
        session
    }

    #[test]
    fn handshake_derives_expected_session_key() {
        let session = established_session();
        let combined = combine_credentials("meshA", "p");
        let mut data = [0u8; 16];
        data[0..8].copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);
        data[8..16].copy_from_slice(&[0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17]);
        assert_eq!(
            session.session_key_bytes().unwrap(),
            block_encrypt(&combined, &data)
        );
    }

    #[test]
    fn first_frame_is_broadcast_status_request_with_counter_one() {
        let mut session = established_session();
        let effect = session.tick(200).expect("frame due");

        let mut payload = match effect {
            Effect::WriteFrame { slot: 0, payload } => payload,
            other => panic!("unexpected effect {:?}", other),
        };
        let key = session.session_key_bytes().unwrap();
        let addr = crypto::reverse_address(0xA4_C1_11_22_33_44);
        // The payload stream is a plain XOR; re-applying it exposes the
        // plaintext command bytes.
        let mut iv = [0u8; 16];
        iv[1..5].copy_from_slice(&addr[0..4]);
        iv[5] = 0x01;
        iv[6..9].copy_from_slice(&payload[0..3]);
        let stream = block_encrypt(&key, &iv);
        for i in 0..15 {
            payload[i + 5] ^= stream[i];
        }

        assert_eq!(payload[0..2], [0x01, 0x00]);
        assert_eq!(payload[5..7], [0xFF, 0xFF]);
        assert_eq!(payload[7], protocol::CMD_REQUEST_STATUS);
        assert_eq!(payload[8..10], [0x60, 0x01]);
        assert_eq!(payload[10], 0x10);
    }

    #[test]
    fn pacing_limits_to_one_frame_per_interval() {
        let mut session = established_session();
        session.queue_command(protocol::CMD_POWER, vec![1, 0, 0], 7);

        assert!(session.tick(200).is_some());
        assert!(session.tick(300).is_none(), "second frame sent too early");
        assert!(session.tick(380).is_some());
        assert!(session.tick(381).is_none(), "queue should be drained");
    }

    #[test]
    fn counter_wraps_back_to_one() {
        let mut session = established_session();
        session.packet_counter = 0xFFFF;

        session.queue_command(protocol::CMD_POWER, vec![1, 0, 0], 7);
        let Some(Effect::WriteFrame { payload, .. }) = session.tick(500) else {
            panic!("frame due");
        };
        assert_eq!(payload[0..2], [0xFF, 0xFF]);
        assert_eq!(session.packet_counter, 1);
    }

    #[test]
    fn rejected_credentials_reported() {
        let combined = combine_credentials("meshA", "wrong");
        let mut session = MeshSession::new(0, combined, 180);
        session.connect_to(&found(1, 0), 0);
        session.on_connected(0);

        assert_eq!(
            session.on_pair_response(&[crypto::PAIR_REJECTED]),
            PairOutcome::Rejected
        );
        assert_eq!(session.on_pair_response(&[0x42]), PairOutcome::Violation);
    }

    #[test]
    fn notifications_update_reachability() {
        let mut session = established_session();
        let key = session.session_key_bytes().unwrap();
        let addr = crypto::reverse_address(0xA4_C1_11_22_33_44);

        let mut plain = [0u8; 20];
        plain[3] = 5;
        plain[7] = protocol::REPORT_STATUS;
        plain[10] = 0x01;
        // The stream XOR is its own inverse, so "decrypting" plaintext
        // produces a wire frame the session will decrypt back.
        let mut wire = plain.to_vec();
        decrypt_packet(&key, &addr, &mut wire);

        let report = session.handle_notification(&wire).unwrap().unwrap();
        assert!(matches!(report, Report::Status { mesh_id: 5, .. }));
        assert!(session.reachable().contains(&5));

        // A relayed offline report removes the id again.
        let mut plain = [0u8; 20];
        plain[7] = protocol::REPORT_ONLINE_STATUS;
        plain[10] = 5;
        plain[11] = 0;
        plain[19] = 0;
        let mut wire = plain.to_vec();
        decrypt_packet(&key, &addr, &mut wire);
        session.handle_notification(&wire).unwrap();
        assert!(!session.reachable().contains(&5));
    }

    #[test]
    fn short_notification_is_an_error() {
        let mut session = established_session();
        assert!(session.handle_notification(&[0u8; 5]).is_err());
    }

    #[test]
    fn disconnect_resets_slot_and_returns_former_ids() {
        let mut session = established_session();
        session.add_reachable(5);
        session.add_reachable(9);

        let former = session.on_disconnected();
        assert_eq!(former, vec![5, 9]);
        assert!(session.is_free());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.session_key_bytes().is_none());

        // The counter survives; it is per slot, not per connection.
        assert!(session.packet_counter >= 1);
    }

    #[test]
    fn watchdog_expires_only_while_pending() {
        let combined = combine_credentials("meshA", "p");
        let mut session = MeshSession::new(1, combined, 180);
        session.connect_to(&found(2, 0), 1_000);

        assert!(!session.watchdog_expired(20_999));
        assert!(session.watchdog_expired(21_000));

        session.on_connected(2_000);
        let mut reply = vec![crypto::PAIR_GRANTED];
        reply.extend_from_slice(&[0; 8]);
        session.on_pair_response(&reply);
        assert!(!session.watchdog_expired(50_000));
    }

    #[test]
    fn known_peripheral_mesh_id_is_reachable_from_connect() {
        let combined = combine_credentials("meshA", "p");
        let mut session = MeshSession::new(0, combined, 180);
        session.connect_to(&found(2, 42), 0);
        assert!(session.reachable().contains(&42));
        assert_eq!(session.peripheral_mesh_id(), 42);
    }
}
