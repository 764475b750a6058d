//! Debug example: connect to a tracker by identifier, send one raw command
//! and dump every frame that comes back
//!
//! Run with: cargo run --example packet_capture -- <identifier> [command] [args]
//!
//! For example:
//!   cargo run --example packet_capture -- AA:BB:CC:DD:EE:FF 0x10 "01 02"

use std::time::Duration;
use wearable_ble::{
    parse_hex_bytes, to_hex_string, BleEvent, DeviceManager, Error, EventKind, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Trace level shows every notification and write
    tracing_subscriber::fmt()
        .with_env_filter("wearable_ble=trace,btleplug=warn")
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(identifier) = args.first() else {
        println!("Usage: packet_capture <identifier> [command] [args]");
        return Ok(());
    };
    let command = args.get(1).cloned();
    let command_args = match args.get(2) {
        Some(hex) => parse_hex_bytes(hex).ok_or_else(|| Error::ConnectionFailed {
            reason: format!("invalid hex arguments: {}", hex),
        })?,
        None => Vec::new(),
    };

    let manager = DeviceManager::new().await?;
    if !manager.initialize().await {
        println!("[WARN] Bluetooth is not ready");
        return Ok(());
    }

    let _raw = manager.on(EventKind::RawDataReceived, |event| {
        if let BleEvent::RawDataReceived(bytes) = event {
            println!("[RX] {:>3} bytes: {}", bytes.len(), to_hex_string(bytes));
        }
    });

    let mut states = manager.subscribe_state();
    tokio::spawn(async move {
        while let Ok(event) = states.recv().await {
            println!("[STATE] {}", event.state);
        }
    });

    println!("[INFO] Connecting to {}...", identifier);
    manager.connect_by_id(identifier).await?;

    if let Some(command) = command {
        let frames = manager.send_command(&command, &command_args)?;
        println!(
            "[TX] {} {} ({} frame(s))",
            command,
            to_hex_string(&command_args),
            frames
        );
    }

    println!("[INFO] Capturing for 30 seconds, Ctrl+C to stop\n");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    manager.shutdown().await?;
    Ok(())
}
