//! BLE side of the bridge.
//!
//! Wraps a `btleplug` central adapter behind the narrow [`BleTransport`]
//! seam the effect executor talks to, and pumps scan results and
//! disconnects onto the controller event channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::controller::Event;
use crate::protocol::{COMMAND_CHAR_UUID, NOTIFY_CHAR_UUID, PAIR_CHAR_UUID, SERVICE_UUID};

/// Narrow GATT seam. One implementation per platform BLE stack.
#[async_trait]
pub trait BleTransport {
    async fn connect(&mut self, slot: usize, address: u64) -> Result<()>;
    async fn disconnect(&mut self, slot: usize) -> Result<()>;
    async fn write_frame(&mut self, slot: usize, payload: &[u8]) -> Result<()>;
    async fn write_pair(&mut self, slot: usize, payload: &[u8]) -> Result<()>;
    /// Reads the pairing characteristic; the reply arrives as a
    /// [`Event::PairResponse`] on the controller channel.
    async fn read_pair(&mut self, slot: usize) -> Result<()>;
    async fn enable_notifications(&mut self, slot: usize) -> Result<()>;
}

/// Peripheral-to-slot mapping shared with the central event pump so
/// disconnect events can be routed back to their slot.
pub type SlotMap = Arc<Mutex<HashMap<PeripheralId, usize>>>;

pub fn addr_to_u64(address: BDAddr) -> u64 {
    address
        .into_inner()
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

struct SlotLink {
    peripheral: Peripheral,
    command_char: Characteristic,
    pair_char: Characteristic,
    notify_char: Characteristic,
    notify_task: tokio::task::JoinHandle<()>,
}

pub struct BtleplugTransport {
    adapter: Adapter,
    events: mpsc::Sender<Event>,
    slots: Vec<Option<SlotLink>>,
    slot_map: SlotMap,
}

impl BtleplugTransport {
    pub fn new(
        adapter: Adapter,
        events: mpsc::Sender<Event>,
        slot_count: usize,
        slot_map: SlotMap,
    ) -> Self {
        Self {
            adapter,
            events,
            slots: (0..slot_count).map(|_| None).collect(),
            slot_map,
        }
    }

    fn link(&self, slot: usize) -> Result<&SlotLink> {
        self.slots
            .get(slot)
            .and_then(|link| link.as_ref())
            .ok_or_else(|| anyhow!("slot {} is not connected", slot))
    }

    async fn find_peripheral(&self, address: u64) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(props)) = peripheral.properties().await {
                if addr_to_u64(props.address) == address {
                    return Ok(peripheral);
                }
            }
        }
        Err(anyhow!("peripheral {:012X} not in scan cache", address))
    }

    fn find_char(peripheral: &Peripheral, uuid: uuid::Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == SERVICE_UUID && c.uuid == uuid)
            .ok_or_else(|| anyhow!("characteristic {} not found", uuid))
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn connect(&mut self, slot: usize, address: u64) -> Result<()> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral.connect().await.context("GATT connect failed")?;
        peripheral
            .discover_services()
            .await
            .context("service discovery failed")?;

        let command_char = Self::find_char(&peripheral, COMMAND_CHAR_UUID)?;
        let pair_char = Self::find_char(&peripheral, PAIR_CHAR_UUID)?;
        let notify_char = Self::find_char(&peripheral, NOTIFY_CHAR_UUID)?;

        let mut notifications = peripheral.notifications().await?;
        let events = self.events.clone();
        let notify_task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != NOTIFY_CHAR_UUID {
                    tracing::warn!(
                        "notification from unexpected characteristic {}",
                        notification.uuid
                    );
                    continue;
                }
                let event = Event::Notification {
                    slot,
                    data: notification.value,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        });

        self.slot_map
            .lock()
            .unwrap()
            .insert(peripheral.id(), slot);
        self.slots[slot] = Some(SlotLink {
            peripheral,
            command_char,
            pair_char,
            notify_char,
            notify_task,
        });

        self.events.send(Event::SlotConnected { slot }).await.ok();
        Ok(())
    }

    async fn disconnect(&mut self, slot: usize) -> Result<()> {
        let Some(link) = self.slots.get_mut(slot).and_then(|l| l.take()) else {
            return Ok(());
        };
        link.notify_task.abort();
        self.slot_map.lock().unwrap().remove(&link.peripheral.id());
        if let Err(err) = link.peripheral.disconnect().await {
            tracing::warn!("[{}] disconnect failed: {}", slot, err);
        }
        Ok(())
    }

    async fn write_frame(&mut self, slot: usize, payload: &[u8]) -> Result<()> {
        let link = self.link(slot)?;
        link.peripheral
            .write(&link.command_char, payload, WriteType::WithoutResponse)
            .await
            .context("command write failed")
    }

    async fn write_pair(&mut self, slot: usize, payload: &[u8]) -> Result<()> {
        let link = self.link(slot)?;
        link.peripheral
            .write(&link.pair_char, payload, WriteType::WithResponse)
            .await
            .context("pair write failed")
    }

    async fn read_pair(&mut self, slot: usize) -> Result<()> {
        let link = self.link(slot)?;
        let value = link
            .peripheral
            .read(&link.pair_char)
            .await
            .context("pair read failed")?;
        self.events
            .send(Event::PairResponse { slot, value })
            .await
            .ok();
        Ok(())
    }

    async fn enable_notifications(&mut self, slot: usize) -> Result<()> {
        let link = self.link(slot)?;
        link.peripheral
            .subscribe(&link.notify_char)
            .await
            .context("notification subscribe failed")
    }
}

/// Forwards advertisements and disconnects from the central onto the
/// controller channel.
pub async fn event_pump(
    adapter: Adapter,
    events: mpsc::Sender<Event>,
    slot_map: SlotMap,
) -> Result<()> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .context("failed to start BLE scan")?;

    let mut stream = adapter.events().await?;
    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let Some(rssi) = props.rssi else {
                    continue;
                };
                let event = Event::Advertisement {
                    address: addr_to_u64(props.address),
                    address_str: props.address.to_string(),
                    rssi,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let slot = slot_map.lock().unwrap().get(&id).copied();
                if let Some(slot) = slot {
                    if events
                        .send(Event::SlotDisconnected { slot })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_conversion_matches_display_order() {
        let addr = BDAddr::from([0xA4, 0xC1, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(addr_to_u64(addr), 0xA4_C1_11_22_33_44);
        assert_eq!(addr.to_string(), "A4:C1:11:22:33:44");
    }
}
