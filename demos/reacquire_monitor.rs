//! Heart rate monitor that remembers its sensors
//!
//! Connects to every heart rate sensor it finds, prints measurements and
//! remembers each sensor so that the next run reconnects it straight away.
//!
//! Run with: cargo run --example reacquire_monitor [devices.json]

use ble_central_hub::ble::uuids::{
    BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID,
};
use ble_central_hub::{
    BtleplugRadio, CentralManager, ConnectOptions, CoordinatorConfig, JsonFileDeviceStore,
    Observer, Result, ScanOptions, SubscriptionSpec,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "devices.json".to_string());

    println!("Heart Rate Monitor");
    println!("==================\n");
    println!("Remembered sensors: {}\n", path);

    let (radio, events) = BtleplugRadio::new().await?;
    let config = CoordinatorConfig::default().with_connect_timeout(Duration::from_secs(15));
    let manager = CentralManager::spawn(radio, events, JsonFileDeviceStore::new(&path), config);

    // Callbacks run on the manager task; hand discoveries and drops back to main.
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
    let _observer = manager
        .add_observer(
            "console",
            Observer::new()
                .on_power_usable(|usable| println!("Bluetooth usable: {}", usable))
                .on_discovered(move |discovered| {
                    let _ = found_tx.send(discovered.peripheral.clone());
                })
                .on_connection_changed(move |peripheral, connected, error| {
                    match (connected, error) {
                        (true, _) => println!("{} connected", peripheral),
                        (false, Some(e)) => println!("{} disconnected: {}", peripheral, e),
                        (false, None) => println!("{} disconnected", peripheral),
                    }
                    if !connected {
                        let _ = lost_tx.send(peripheral.clone());
                    }
                })
                .on_value_updated(|peripheral, characteristic, error| {
                    if let Some(e) = error {
                        println!("{}: {} failed: {}", peripheral, characteristic.uuid, e);
                        return;
                    }
                    let Some(value) = &characteristic.value else {
                        return;
                    };
                    if characteristic.uuid == HEART_RATE_MEASUREMENT_UUID {
                        if let Some(bpm) = heart_rate(value) {
                            println!("{}: {} bpm", peripheral, bpm);
                        }
                    } else if characteristic.uuid == BATTERY_LEVEL_UUID {
                        if let Some(level) = value.first() {
                            println!("{}: battery {}%", peripheral, level);
                        }
                    }
                }),
        )
        .await?;

    let spec = SubscriptionSpec::new()
        .with_service(HEART_RATE_SERVICE_UUID, [HEART_RATE_MEASUREMENT_UUID])
        .with_service(BATTERY_SERVICE_UUID, [BATTERY_LEVEL_UUID]);

    manager
        .start_scan(ScanOptions::with_services([HEART_RATE_SERVICE_UUID]))
        .await?;

    println!("Scanning... Press Ctrl+C to exit.\n");

    let mut seen = HashSet::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting...");
                break;
            }
            Some(peripheral) = found_rx.recv() => {
                if !seen.insert(peripheral.clone()) {
                    continue;
                }
                println!("Found {}, connecting...", peripheral);
                if manager
                    .connect(peripheral.clone(), ConnectOptions::default(), spec.clone())
                    .await?
                {
                    manager.remember_for_reacquisition(&peripheral, spec.clone()).await?;
                } else {
                    seen.remove(&peripheral);
                }
            }
            Some(peripheral) = lost_rx.recv() => {
                // Reconnect on its next advertisement.
                seen.remove(&peripheral);
            }
        }
    }

    manager.shutdown().await?;

    Ok(())
}

/// Beats per minute from a Heart Rate Measurement value.
fn heart_rate(value: &[u8]) -> Option<u16> {
    let flags = *value.first()?;
    if flags & 0x01 == 0 {
        value.get(1).map(|b| u16::from(*b))
    } else {
        Some(u16::from_le_bytes([*value.get(1)?, *value.get(2)?]))
    }
}
