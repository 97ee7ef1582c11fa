//! awox-bridge - AwoX/EGLO BLE mesh to MQTT bridge.
//!
//! Scans for mesh peripherals, keeps a small number of authenticated
//! GATT sessions open and relays commands and status reports between the
//! whole mesh and an MQTT broker, Home-Assistant discovery included.

mod catalog;
mod cli;
mod config;
mod controller;
mod crypto;
mod device;
mod mqtt;
mod protocol;
mod scanner;
mod scheduler;
mod session;
mod transport;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;
use config::Config;
use controller::{Effect, Event, MeshController};
use mqtt::{Bus, MqttAdapter, MqttBus};
use transport::{BleTransport, BtleplugTransport, SlotMap};

/// Main loop cadence. Well under the 180 ms pacing interval so queued
/// frames leave without noticeable jitter.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let config = Config::load(&cli.config)?;

    let manager = Manager::new().await.context("BLE manager unavailable")?;
    let ble_adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .context("no BLE adapter found")?;

    let topics = MqttAdapter::new(&config.mqtt);
    let (bus, event_loop) = MqttBus::connect(&config.mqtt, &topics);

    let (tx, mut rx) = mpsc::channel::<Event>(64);
    tokio::spawn(mqtt::event_pump(event_loop, tx.clone()));

    let slot_map = SlotMap::default();
    let mut transport = BtleplugTransport::new(
        ble_adapter.clone(),
        tx.clone(),
        config.connection_slots,
        slot_map.clone(),
    );
    tokio::spawn(transport::event_pump(ble_adapter, tx.clone(), slot_map));

    let mut controller = MeshController::new(&config);
    controller.start();

    let start = Instant::now();
    apply_effects(controller.drain_effects(), &mut transport, &bus, &tx).await;

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.tick(now_ms(start));
            }
            Some(event) = rx.recv() => {
                controller.handle_event(event, now_ms(start));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                controller.shutdown();
                apply_effects(controller.drain_effects(), &mut transport, &bus, &tx).await;
                return Ok(());
            }
        }
        apply_effects(controller.drain_effects(), &mut transport, &bus, &tx).await;
    }
}

fn now_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Executes the controller's outbox against the transport and the bus.
async fn apply_effects<T: BleTransport, B: Bus>(
    effects: Vec<Effect>,
    transport: &mut T,
    bus: &B,
    events: &mpsc::Sender<Event>,
) {
    for effect in effects {
        let result = match &effect {
            Effect::Connect { slot, address } => transport.connect(*slot, *address).await,
            Effect::Disconnect { slot } => transport.disconnect(*slot).await,
            Effect::WritePair { slot, payload } => transport.write_pair(*slot, payload).await,
            Effect::ReadPair { slot } => transport.read_pair(*slot).await,
            Effect::EnableNotifications { slot } => transport.enable_notifications(*slot).await,
            Effect::WriteFrame { slot, payload } => transport.write_frame(*slot, payload).await,
            Effect::Publish {
                topic,
                payload,
                retain,
            } => bus.publish(topic, payload, *retain).await,
            Effect::Subscribe { topic } => bus.subscribe(topic).await,
            Effect::Unsubscribe { topic } => bus.unsubscribe(topic).await,
        };

        if let Err(err) = result {
            tracing::warn!("{:?} failed: {}", effect, err);
            // A failed GATT operation means the peripheral is gone; tell
            // the controller so the slot is freed and retried.
            match effect {
                Effect::Connect { slot, .. }
                | Effect::WritePair { slot, .. }
                | Effect::ReadPair { slot }
                | Effect::EnableNotifications { slot }
                | Effect::WriteFrame { slot, .. } => {
                    let _ = events.send(Event::SlotDisconnected { slot }).await;
                }
                _ => {}
            }
        }
    }
}
