//! Drive a virtual sensor interface end to end.
//!
//! ```text
//! RUST_LOG=sensorlink_core=debug cargo run --example virtual_device
//! ```
//!
//! Set `SENSORLINK_LOG_JSON=1` for JSON log lines.

use anyhow::Context;
use sensorlink_core::{
    Device, DeviceEvent, EngineConfig, SensorEvent, VirtualDevice, VirtualDeviceProfile,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var_os("SENSORLINK_LOG_JSON").is_some() {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = EngineConfig::load().unwrap_or_else(|e| {
        tracing::warn!("using default config: {}", e);
        EngineConfig::default()
    });

    let virtual_device = VirtualDevice::new(VirtualDeviceProfile::default());
    let handle = virtual_device.handle();
    let device = Device::new(virtual_device, config);

    device.on_event(|event| tracing::info!("device event: {:?}", event));
    device.open(false).await.context("open failed")?;

    if let Some(identity) = device.identity() {
        println!("Connected to {} ({})", identity.name, identity.order_code);
    }
    if let Some(status) = device.status() {
        println!(
            "Firmware {} / radio {}, battery {}% ({})",
            status.master_firmware, status.radio_firmware, status.battery_percent, status.charging_state
        );
    }

    for sensor in device.sensors() {
        println!("  [{}] {} ({})", sensor.channel, sensor.name, sensor.unit);
    }

    device.set_sensor_enabled(0, true).await?;
    device.on_sensor_event(0, |event| {
        if let SensorEvent::ValueChanged { channel, value } = event {
            println!("channel {channel}: {value:.2}");
        }
    })?;

    let mut events = device.subscribe();
    device.start(Some(200.0)).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Force excludes Position; enabling one turns the other off and restarts collection
    device.set_sensor_enabled(2, true).await?;
    let transition = device.set_sensor_enabled(1, true).await?;
    println!(
        "enabled Force, disabled {:?}, period now {} ms",
        transition.disabled, transition.period_ms
    );
    tokio::time::sleep(Duration::from_millis(500)).await;

    device.stop().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&device.sensor(0)).context("snapshot")?
    );

    device.close().await?;
    while let Ok(event) = events.try_recv() {
        if event == DeviceEvent::Closed {
            println!("closed");
        }
    }
    println!("virtual device stats: {:?}", handle.stats());
    Ok(())
}
