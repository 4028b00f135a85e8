//! Sensor routing and constraint tests against the virtual device

use parking_lot::Mutex;
use sensorlink_core::core::protocol::command::CommandCode;
use sensorlink_core::core::protocol::framing;
use sensorlink_core::core::protocol::measurement::MeasurementType;
use sensorlink_core::core::simulator::info_notification;
use sensorlink_core::{
    Device, DeviceError, EngineConfig, MemorySink, SensorEvent, Severity, VirtualDevice,
    VirtualDeviceHandle,
};
use std::sync::Arc;
use std::time::Duration;

async fn open_device() -> (Device, VirtualDeviceHandle, Arc<MemorySink>) {
    let virtual_device = VirtualDevice::default();
    let handle = virtual_device.handle();
    let sink = Arc::new(MemorySink::default());
    let device = Device::with_diagnostics(virtual_device, EngineConfig::default(), sink.clone());
    device.open(false).await.unwrap();
    (device, handle, sink)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn test_interleaved_values_reach_sensors() {
    let (device, handle, _sink) = open_device().await;

    handle.emit_samples(0b011, 2, &[1.0, 2.0, 3.0, 4.0]);
    settle().await;

    assert_eq!(device.sensor(0).unwrap().history, vec![1.0, 3.0]);
    assert_eq!(device.sensor(1).unwrap().history, vec![2.0, 4.0]);
    assert_eq!(device.sensor(1).unwrap().value, Some(4.0));
    assert!(device.sensor(2).unwrap().history.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_channels_take_no_slot() {
    let (device, handle, _sink) = open_device().await;

    // Channel 3 is not registered, so the only slot per sample belongs to channel 0
    handle.emit_samples(0b1001, 2, &[5.0, 6.0]);
    settle().await;

    assert_eq!(device.sensor(0).unwrap().history, vec![5.0, 6.0]);
}

#[tokio::test(start_paused = true)]
async fn test_keep_values_off() {
    let (device, handle, _sink) = open_device().await;
    device.set_keep_values(false);

    handle.emit_samples(0b001, 2, &[7.0, 8.0]);
    settle().await;

    let sensor = device.sensor(0).unwrap();
    assert_eq!(sensor.value, Some(8.0));
    assert!(sensor.history.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_truncated_notification_decodes_prefix() {
    let (device, handle, sink) = open_device().await;

    handle.emit_samples(0b011, 2, &[1.0, 2.0, 3.0]);
    settle().await;

    assert_eq!(device.sensor(0).unwrap().history, vec![1.0, 3.0]);
    assert_eq!(device.sensor(1).unwrap().history, vec![2.0]);
    assert!(sink.contains(Severity::Warn, "truncated"));
}

#[tokio::test(start_paused = true)]
async fn test_informational_and_unknown_notifications_logged() {
    let (device, handle, sink) = open_device().await;

    handle.emit_raw(&info_notification(MeasurementType::Dropped));
    let mut unknown = info_notification(MeasurementType::Period);
    unknown[4] = 0x42;
    unknown[3] = sensorlink_core::core::protocol::checksum::calculate(&unknown);
    handle.emit_raw(&unknown);
    settle().await;

    assert!(sink.contains(Severity::Debug, "Dropped notification"));
    assert!(sink.contains(Severity::Debug, "unrecognized measurement type 0x42"));
    assert!(device.sensors().iter().all(|s| s.value.is_none()));
}

#[tokio::test(start_paused = true)]
async fn test_listeners_called_in_order() {
    let (device, handle, _sink) = open_device().await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    for tag in ["chart", "table"] {
        let seen = seen.clone();
        device
            .on_sensor_event(0, move |event| {
                if let SensorEvent::ValueChanged { value, .. } = event {
                    seen.lock().push(format!("{}={}", tag, value));
                }
            })
            .unwrap();
    }

    handle.emit_samples(0b001, 1, &[2.5]);
    settle().await;

    assert_eq!(*seen.lock(), vec!["chart=2.5", "table=2.5"]);
}

#[tokio::test(start_paused = true)]
async fn test_enable_is_idempotent() {
    let (device, handle, _sink) = open_device().await;
    let mut rx = device.subscribe_sensor(0).unwrap();

    assert!(device.set_sensor_enabled(0, true).await.unwrap().changed);
    let again = device.set_sensor_enabled(0, true).await.unwrap();
    assert!(!again.changed);

    assert_eq!(
        rx.try_recv().unwrap(),
        SensorEvent::StateChanged { channel: 0, enabled: true }
    );
    assert!(rx.try_recv().is_err());
    // Not collecting, so nothing was sent
    assert_eq!(handle.received_codes().len(), 9);
}

#[tokio::test(start_paused = true)]
async fn test_mutual_exclusion_restarts_collection() {
    let (device, handle, _sink) = open_device().await;

    device.set_sensor_enabled(2, true).await.unwrap();
    device.start(None).await.unwrap();
    assert_eq!(handle.period_ms(), 50.0);

    let transition = device.set_sensor_enabled(1, true).await.unwrap();
    assert_eq!(transition.disabled, vec![2]);
    assert_eq!(transition.period_ms, 20.0);

    assert!(device.is_collecting());
    assert!(!device.sensor(2).unwrap().enabled);
    assert_eq!(handle.period_ms(), 20.0);

    let last_start = handle
        .received_commands()
        .into_iter()
        .filter(|c| c.code == CommandCode::Measurements as u8 && c.payload[1] == 0x01)
        .last()
        .unwrap();
    assert_eq!(&last_start.payload[2..6], &0b010u32.to_le_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_disabling_last_sensor_stops_collection() {
    let (device, handle, _sink) = open_device().await;
    device.start(None).await.unwrap();
    assert!(handle.is_streaming());

    device.set_sensor_enabled(0, false).await.unwrap();
    assert!(!device.is_collecting());
    assert!(!handle.is_streaming());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_channel() {
    let (device, _handle, _sink) = open_device().await;

    assert!(matches!(
        device.set_sensor_enabled(5, true).await,
        Err(DeviceError::UnknownChannel(5))
    ));
    assert!(matches!(
        device.on_sensor_event(9, |_| {}),
        Err(DeviceError::UnknownChannel(9))
    ));
    assert!(device.sensor(5).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_partial_response_discarded() {
    let (device, handle, sink) = open_device().await;

    // Announces 40 bytes but only 10 arrive
    let mut partial = vec![framing::COMMAND_RESPONSE, 40];
    partial.extend_from_slice(&[0u8; 8]);
    handle.emit_raw(&partial);
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(sink.contains(Severity::Warn, "discarded stalled partial response (10 bytes)"));
    let status = device.refresh_status().await.unwrap();
    assert_eq!(status.battery_percent, 87);
}

#[tokio::test(start_paused = true)]
async fn test_value_listener_can_read_device() {
    let (device, handle, _sink) = open_device().await;
    let device = Arc::new(device);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&device);
    let s = seen.clone();
    device
        .on_sensor_event(0, move |event| {
            if let (SensorEvent::ValueChanged { value, .. }, Some(device)) = (event, weak.upgrade()) {
                let stored = device.sensor(0).map(|sensor| sensor.history.len()).unwrap_or(0);
                s.lock().push((*value, stored));
            }
        })
        .unwrap();

    handle.emit_samples(0b001, 2, &[1.0, 2.0]);
    settle().await;

    // Both values are stored before listeners run
    assert_eq!(*seen.lock(), vec![(1.0, 2), (2.0, 2)]);
    let status = tokio::time::timeout(Duration::from_secs(30), device.refresh_status())
        .await
        .expect("device still responsive")
        .unwrap();
    assert_eq!(status.battery_percent, 87);
}

#[tokio::test(start_paused = true)]
async fn test_state_listener_can_read_device() {
    let (device, _handle, _sink) = open_device().await;
    let device = Arc::new(device);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&device);
    let s = seen.clone();
    device
        .on_sensor_event(2, move |event| {
            if let (SensorEvent::StateChanged { enabled, .. }, Some(device)) = (event, weak.upgrade()) {
                s.lock().push((*enabled, device.measurement_period()));
            }
        })
        .unwrap();

    device.set_sensor_enabled(2, true).await.unwrap();
    device.set_sensor_enabled(1, true).await.unwrap();

    assert_eq!(*seen.lock(), vec![(true, 50.0), (false, 20.0)]);
}
