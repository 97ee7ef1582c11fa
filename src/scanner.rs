//! Scan result pool.
//!
//! Collects BLE advertisements that match the vendor MAC prefix and keeps
//! them as a ranked list of connection candidates. Entries are never
//! removed; when a peripheral stops advertising its RSSI decays to a
//! sentinel so the scheduler skips it.

use std::collections::BTreeSet;

/// RSSI assigned to entries that have not advertised recently.
pub const RSSI_UNAVAILABLE: i16 = -9999;
/// Advertisement age after which an entry counts as unavailable.
pub const STALE_AFTER_MS: u64 = 20_000;

/// One peripheral seen during scanning.
#[derive(Debug, Clone)]
pub struct FoundDevice {
    pub address: u64,
    pub address_str: String,
    pub rssi: i16,
    pub last_detected: u64,
    /// Set while a connection slot holds this peripheral.
    pub connected: bool,
    /// Mesh id once learned from a live session, 0 = unknown.
    pub mesh_id: u16,
}

/// Ranked pool of connectable peripherals.
#[derive(Debug)]
pub struct CandidatePool {
    address_prefix: String,
    allowed_macs: Vec<String>,
    entries: Vec<FoundDevice>,
}

impl CandidatePool {
    pub fn new(address_prefix: &str, allowed_macs: &[String]) -> Self {
        Self {
            address_prefix: address_prefix.to_uppercase(),
            allowed_macs: allowed_macs.iter().map(|m| m.to_uppercase()).collect(),
            entries: Vec::new(),
        }
    }

    /// Feeds one advertisement into the pool. Returns whether the
    /// address passed the filters.
    pub fn observe(&mut self, address: u64, address_str: &str, rssi: i16, now: u64) -> bool {
        let address_str = address_str.to_uppercase();
        if !address_str.starts_with(&self.address_prefix) {
            return false;
        }
        if !self.allowed_macs.is_empty() && !self.allowed_macs.contains(&address_str) {
            tracing::debug!("ignoring {}: not in allowed_macs", address_str);
            return false;
        }

        match self.entries.iter_mut().find(|e| e.address == address) {
            Some(entry) => {
                entry.rssi = rssi;
                entry.last_detected = now;
            }
            None => {
                tracing::debug!("found mesh device {} rssi {}", address_str, rssi);
                self.entries.push(FoundDevice {
                    address,
                    address_str,
                    rssi,
                    last_detected: now,
                    connected: false,
                    mesh_id: 0,
                });
            }
        }

        self.sweep(now);
        self.entries.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        true
    }

    /// Downgrades entries that have not advertised within the staleness
    /// window.
    fn sweep(&mut self, now: u64) {
        for entry in &mut self.entries {
            if now.saturating_sub(entry.last_detected) > STALE_AFTER_MS {
                entry.rssi = RSSI_UNAVAILABLE;
            }
        }
    }

    /// Runs the staleness sweep without a new advertisement.
    pub fn refresh(&mut self, now: u64) {
        self.sweep(now);
        self.entries.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FoundDevice] {
        &self.entries
    }

    pub fn get(&self, address: u64) -> Option<&FoundDevice> {
        self.entries.iter().find(|e| e.address == address)
    }

    pub fn set_connected(&mut self, address: u64, connected: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            entry.connected = connected;
        }
    }

    /// Cross-links a mesh id learned elsewhere onto its scan entry.
    pub fn set_mesh_id(&mut self, address: u64, mesh_id: u16) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            entry.mesh_id = mesh_id;
        }
    }

    /// Picks the strongest candidate that is not connected, not below the
    /// RSSI floor, and not already reachable through a live session.
    pub fn best_candidate(
        &self,
        min_rssi: i16,
        union_reachable: &BTreeSet<u16>,
    ) -> Option<&FoundDevice> {
        self.entries.iter().find(|e| {
            !e.connected
                && e.rssi >= min_rssi
                && (e.mesh_id == 0 || !union_reachable.contains(&e.mesh_id))
        })
    }
}
