//! Basic example: find the nearest tracker, connect and print what it sends
//!
//! Run with: cargo run --example scan_and_connect

use std::time::Duration;
use wearable_ble::{to_hex_string, BleEvent, DeviceManager, EventKind, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wearable_ble=debug".parse().unwrap()),
        )
        .init();

    let manager = DeviceManager::new().await?;

    if !manager.initialize().await {
        println!("Bluetooth is not ready. Check that it is switched on.");
        return Ok(());
    }

    manager
        .start_scan(|device| {
            println!(
                "Found {} ({}) RSSI: {:?} dBm",
                device.display_name().unwrap_or("?"),
                device.id,
                device.rssi
            );
        })
        .await?;

    println!("Scanning for 10 seconds...\n");
    tokio::time::sleep(Duration::from_secs(10)).await;
    manager.stop_scan().await?;

    let Some(device) = manager
        .discovered_devices()
        .into_values()
        .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
    else {
        println!("No trackers found. Make sure yours is awake and nearby.");
        return Ok(());
    };

    println!(
        "\nConnecting to {} ({})...",
        device.display_name().unwrap_or("?"),
        device.id
    );

    let _connection = manager.on(EventKind::ConnectionState, |event| {
        if let BleEvent::ConnectionState(connected) = event {
            println!("Connected: {}", connected);
        }
    });
    let _data = manager.on(EventKind::DataReceived, |event| {
        if let BleEvent::DataReceived(message) = event {
            println!("{}: {}", message.data_type, message.payload);
        }
    });
    let _raw = manager.on(EventKind::RawDataReceived, |event| {
        if let BleEvent::RawDataReceived(bytes) = event {
            println!("  raw: {}", to_hex_string(bytes));
        }
    });

    manager.connect(&device).await?;

    println!("Listening for 60 seconds. Press Ctrl+C to exit early.\n");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
