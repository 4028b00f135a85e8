//! Virtual Device Simulator
//!
//! An in-memory sensor interface that speaks the device protocol. It
//! implements [`TransportTrait`], so a [`Device`](crate::core::device::Device)
//! can be driven end to end without hardware. Behaviour is described by a
//! [`VirtualDeviceProfile`] and can be steered at runtime through a
//! [`VirtualDeviceHandle`]: suppress responses, refuse collection, inject
//! notifications or drop the link.

use crate::core::protocol::checksum;
use crate::core::protocol::command::{Command, CommandCode};
use crate::core::protocol::framing::{self, COMMAND_RESPONSE, LENGTH_OFFSET, MEASUREMENT_RESPONSE};
use crate::core::protocol::measurement::{channels_in_mask, MeasurementType};
use crate::core::protocol::response::{
    mask_payload, sensor_info_payload, ChargingState, DeviceIdentity, DeviceStatus, FirmwareVersion,
};
use crate::core::sensor::SensorSpec;
use crate::core::transport::{
    TransportError, TransportEvent, TransportStats, TransportTrait, TransportType,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Status byte of an accepted request
const ACCEPTED: u8 = 0x00;
/// Status byte returned for commands the virtual device does not know
const UNSUPPORTED: u8 = 0xFF;

/// Static description of a virtual device
#[derive(Debug, Clone)]
pub struct VirtualDeviceProfile {
    /// Identity strings
    pub identity: DeviceIdentity,
    /// Status reported by GET_STATUS
    pub status: DeviceStatus,
    /// Sensors, by channel
    pub sensors: Vec<SensorSpec>,
    /// Sensors enabled by default
    pub default_mask: u32,
    /// Channels reported as present whose descriptor has id 0
    pub empty_slots: u32,
    /// Link kind reported to the engine
    pub transport_type: TransportType,
    /// Largest chunk in either direction
    pub max_packet_len: usize,
    /// Fail `connect` with no compatible service
    pub fail_connect: bool,
}

impl Default for VirtualDeviceProfile {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity {
                order_code: "GDX-VIRT".to_string(),
                serial_number: "0V1000A1".to_string(),
                name: "GDX-VIRT 0V1000A1".to_string(),
            },
            status: DeviceStatus {
                status: 0,
                master_firmware: FirmwareVersion {
                    major: 1,
                    minor: 4,
                    build: 120,
                },
                radio_firmware: FirmwareVersion {
                    major: 2,
                    minor: 1,
                    build: 0,
                },
                battery_percent: 87,
                charging_state: ChargingState::Idle,
            },
            sensors: vec![
                SensorSpec::new(0, "Temperature", "°C").typical_period(500.0),
                SensorSpec::new(1, "Force", "N")
                    .typical_period(20.0)
                    .excludes(0b100),
                SensorSpec::new(2, "Position", "m")
                    .typical_period(50.0)
                    .excludes(0b010),
            ],
            default_mask: 0b001,
            empty_slots: 1 << 5,
            transport_type: TransportType::Virtual,
            max_packet_len: crate::core::transport::BLE_MAX_PACKET_LEN,
            fail_connect: false,
        }
    }
}

impl VirtualDeviceProfile {
    /// Mask of channels carrying a sensor
    pub fn sensor_mask(&self) -> u32 {
        self.sensors.iter().fold(0, |mask, s| mask | s.channel_bit())
    }

    fn sensor(&self, channel: u8) -> Option<&SensorSpec> {
        self.sensors.iter().find(|s| s.channel == channel)
    }
}

/// Build a sample notification.
///
/// `values` are sample-major, one value per selected channel in ascending
/// order. Masks above 16 bits use the wide layout.
pub fn sample_notification(mask: u32, count: u8, values: &[f32]) -> Vec<u8> {
    let mut packet = vec![MEASUREMENT_RESPONSE, 0x00, 0x00, 0x00];
    if mask <= u32::from(u16::MAX) {
        packet.push(MeasurementType::NormalReal32 as u8);
        packet.extend_from_slice(&(mask as u16).to_le_bytes());
    } else {
        packet.push(MeasurementType::WideReal32 as u8);
        packet.extend_from_slice(&mask.to_le_bytes());
    }
    packet.push(count);
    packet.push(0x00);
    for value in values {
        packet.extend_from_slice(&value.to_le_bytes());
    }
    finish_notification(packet)
}

/// Build an informational notification (start time, dropped samples, period)
pub fn info_notification(kind: MeasurementType) -> Vec<u8> {
    finish_notification(vec![MEASUREMENT_RESPONSE, 0x00, 0x00, 0x00, kind as u8, 0x00])
}

fn finish_notification(mut packet: Vec<u8>) -> Vec<u8> {
    packet[LENGTH_OFFSET] = packet.len().min(framing::MAX_PACKET_LEN) as u8;
    packet[checksum::CHECKSUM_OFFSET] = checksum::calculate(&packet);
    packet
}

struct SimState {
    profile: VirtualDeviceProfile,
    connected: bool,
    silenced: HashSet<u8>,
    refuse_start: Option<u8>,
    received: Vec<Command>,
    period_ms: f64,
    stream: Option<CancellationToken>,
    stats: TransportStats,
}

impl SimState {
    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.cancel();
        }
    }
}

/// Shared link between the device side and the host side
#[derive(Clone)]
struct Link {
    state: Arc<Mutex<SimState>>,
    tx: broadcast::Sender<TransportEvent>,
}

impl Link {
    /// Send a complete packet to the host, split into notification chunks
    fn deliver(&self, packet: &[u8]) {
        let max_len = {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.stats.bytes_received += packet.len() as u64;
            state.profile.max_packet_len
        };
        for chunk in framing::chunks(packet, max_len) {
            self.state.lock().stats.packets_received += 1;
            // Nobody listening is not an error for a simulated link
            let _ = self.tx.send(TransportEvent::Data(Bytes::copy_from_slice(chunk)));
        }
    }

    fn drop_link(&self) {
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.stop_stream();
        }
        let _ = self.tx.send(TransportEvent::Disconnected);
    }

    /// Handle one complete host packet
    fn handle_packet(&self, packet: &[u8]) {
        if !checksum::verify(packet) || packet.len() < 5 {
            tracing::debug!("virtual device dropped invalid packet {}", hex::encode(packet));
            self.state.lock().stats.errors += 1;
            return;
        }

        let sequence = packet[framing::SEQUENCE_OFFSET];
        let command = Command::raw(packet[4], &packet[5..]);
        let payload = {
            let mut state = self.state.lock();
            state.received.push(command.clone());
            if state.silenced.contains(&command.code) {
                tracing::debug!("virtual device ignoring {}", command.name());
                return;
            }
            self.respond(&mut state, &command)
        };

        match framing::build_response(COMMAND_RESPONSE, command.code, sequence, &payload) {
            Ok(response) => self.deliver(&response),
            Err(e) => tracing::warn!("virtual device response not framed: {}", e),
        }
    }

    fn respond(&self, state: &mut SimState, command: &Command) -> Vec<u8> {
        let profile = &state.profile;
        match command.known_code() {
            Some(CommandCode::Init) | Some(CommandCode::Disconnect) => vec![ACCEPTED],
            Some(CommandCode::GetStatus) => profile.status.to_payload(),
            Some(CommandCode::GetDefaultSensorsMask) => mask_payload(profile.default_mask),
            Some(CommandCode::GetSensorIds) => {
                mask_payload(profile.sensor_mask() | profile.empty_slots)
            }
            Some(CommandCode::GetSensorInfo) => {
                let channel = command.payload.first().copied().unwrap_or(0);
                let spec = profile
                    .sensor(channel)
                    .cloned()
                    .unwrap_or_else(|| SensorSpec::new(channel, "", "").id(0));
                sensor_info_payload(&spec)
            }
            Some(CommandCode::GetInfo) => profile.identity.to_payload(),
            Some(CommandCode::SetMeasurementPeriod) => {
                if let Some(raw) = command.payload.get(1..5) {
                    let micros = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    state.period_ms = f64::from(micros) / 1000.0;
                }
                vec![ACCEPTED]
            }
            Some(CommandCode::Measurements) => self.measurements(state, &command.payload),
            None => vec![UNSUPPORTED],
        }
    }

    fn measurements(&self, state: &mut SimState, payload: &[u8]) -> Vec<u8> {
        let start = payload.get(1) == Some(&0x01);
        if !start {
            state.stop_stream();
            return vec![ACCEPTED];
        }
        if let Some(code) = state.refuse_start {
            return vec![code];
        }

        let requested = payload
            .get(2..6)
            .map(|m| u32::from_le_bytes([m[0], m[1], m[2], m[3]]))
            .unwrap_or(0);
        let mask = requested & state.profile.sensor_mask();
        let period = Duration::from_secs_f64(state.period_ms.max(1.0) / 1000.0);

        state.stop_stream();
        state.stream = Some(self.spawn_stream(mask, period));
        vec![ACCEPTED]
    }

    fn spawn_stream(&self, mask: u32, period: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let link = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; samples start one period later
            ticker.tick().await;
            let channels = channels_in_mask(mask, u32::MAX);
            let mut n: u32 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if channels.is_empty() {
                    continue;
                }
                let values: Vec<f32> = channels
                    .iter()
                    .map(|&c| f32::from(c) * 10.0 + n as f32)
                    .collect();
                link.deliver(&sample_notification(mask, 1, &values));
                n = n.wrapping_add(1);
            }
        });
        cancel
    }
}

/// In-memory device implementing [`TransportTrait`]
pub struct VirtualDevice {
    link: Link,
    inbound: BytesMut,
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new(VirtualDeviceProfile::default())
    }
}

impl VirtualDevice {
    /// Create a virtual device
    pub fn new(profile: VirtualDeviceProfile) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            link: Link {
                state: Arc::new(Mutex::new(SimState {
                    profile,
                    connected: false,
                    silenced: HashSet::new(),
                    refuse_start: None,
                    received: Vec::new(),
                    period_ms: 1000.0,
                    stream: None,
                    stats: TransportStats::default(),
                })),
                tx,
            },
            inbound: BytesMut::with_capacity(256),
        }
    }

    /// Control handle usable after the device is moved into a `Device`
    pub fn handle(&self) -> VirtualDeviceHandle {
        VirtualDeviceHandle {
            link: self.link.clone(),
        }
    }
}

#[async_trait]
impl TransportTrait for VirtualDevice {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.profile.fail_connect {
            state.stats.errors += 1;
            return Err(TransportError::ServiceNotFound(
                state.profile.identity.name.clone(),
            ));
        }
        state.connected = true;
        self.inbound.clear();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.link.drop_link();
        self.inbound.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.state.lock().connected
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        {
            let mut state = self.link.state.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.stats.bytes_sent += chunk.len() as u64;
            state.stats.packets_sent += 1;
        }

        self.inbound.extend_from_slice(chunk);
        let Some(&len) = self.inbound.get(LENGTH_OFFSET) else {
            return Ok(());
        };
        let len = usize::from(len).max(2);
        if self.inbound.len() >= len {
            let packet = self.inbound.split_to(len);
            self.inbound.clear();
            self.link.handle_packet(&packet);
        }
        Ok(())
    }

    fn max_packet_len(&self) -> usize {
        self.link.state.lock().profile.max_packet_len
    }

    fn transport_type(&self) -> TransportType {
        self.link.state.lock().profile.transport_type
    }

    fn connection_info(&self) -> String {
        let state = self.link.state.lock();
        format!(
            "{} ({}, virtual)",
            state.profile.identity.name, state.profile.transport_type
        )
    }

    fn stats(&self) -> TransportStats {
        self.link.state.lock().stats.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.link.tx.subscribe()
    }
}

/// Runtime control over a [`VirtualDevice`]
#[derive(Clone)]
pub struct VirtualDeviceHandle {
    link: Link,
}

impl VirtualDeviceHandle {
    /// Stop answering a command code
    pub fn silence(&self, code: u8) {
        self.link.state.lock().silenced.insert(code);
    }

    /// Answer a command code again
    pub fn unsilence(&self, code: u8) {
        self.link.state.lock().silenced.remove(&code);
    }

    /// Refuse start requests with a status code, or accept them again with `None`
    pub fn refuse_start(&self, code: Option<u8>) {
        self.link.state.lock().refuse_start = code;
    }

    /// Change the reported battery level
    pub fn set_battery(&self, percent: u8, charging: ChargingState) {
        let mut state = self.link.state.lock();
        state.profile.status.battery_percent = percent;
        state.profile.status.charging_state = charging;
    }

    /// Send a sample notification
    pub fn emit_samples(&self, mask: u32, count: u8, values: &[f32]) {
        self.link.deliver(&sample_notification(mask, count, values));
    }

    /// Send arbitrary bytes as one packet (split into chunks)
    pub fn emit_raw(&self, packet: &[u8]) {
        self.link.deliver(packet);
    }

    /// Simulate an unsolicited link loss
    pub fn drop_link(&self) {
        self.link.drop_link();
    }

    /// Commands received so far
    pub fn received_commands(&self) -> Vec<Command> {
        self.link.state.lock().received.clone()
    }

    /// Codes of the commands received so far
    pub fn received_codes(&self) -> Vec<u8> {
        self.link.state.lock().received.iter().map(|c| c.code).collect()
    }

    /// Whether measurements are being streamed
    pub fn is_streaming(&self) -> bool {
        self.link.state.lock().stream.is_some()
    }

    /// Last measurement period set by the host (ms)
    pub fn period_ms(&self) -> f64 {
        self.link.state.lock().period_ms
    }

    /// Transport statistics
    pub fn stats(&self) -> TransportStats {
        self.link.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::framing::{response_key, response_payload, Framer};
    use crate::core::protocol::reassembly::{Progress, Reassembler};
    use tokio::time::Instant;

    async fn send(device: &mut VirtualDevice, framer: &mut Framer, command: Command) {
        let frame = framer.frame(&command).unwrap();
        let max_len = device.max_packet_len();
        for chunk in framing::chunks(&frame.bytes, max_len) {
            device.write(chunk).await.unwrap();
        }
    }

    fn collect(rx: &mut broadcast::Receiver<TransportEvent>) -> Vec<Bytes> {
        let mut reassembler = Reassembler::new(Duration::from_secs(2));
        let mut responses = Vec::new();
        while let Ok(TransportEvent::Data(chunk)) = rx.try_recv() {
            assert!(chunk.len() <= crate::core::transport::BLE_MAX_PACKET_LEN);
            if let Progress::Complete(r) = reassembler.push(&chunk, Instant::now()) {
                responses.push(r);
            }
        }
        responses
    }

    #[tokio::test]
    async fn test_answers_init_and_status() {
        let mut device = VirtualDevice::default();
        let mut rx = device.subscribe();
        let mut framer = Framer::new();
        device.connect().await.unwrap();

        send(&mut device, &mut framer, Command::init()).await;
        send(&mut device, &mut framer, Command::status()).await;

        let responses = collect(&mut rx);
        assert_eq!(responses.len(), 2);
        assert_eq!(response_key(&responses[0]), Some((0x1A, 0xFE)));
        assert_eq!(response_key(&responses[1]), Some((0x10, 0xFD)));
        let status = DeviceStatus::parse(response_payload(&responses[1])).unwrap();
        assert_eq!(status.battery_percent, 87);
        assert!(responses.iter().all(|r| checksum::verify(r)));
    }

    #[tokio::test]
    async fn test_sensor_info_is_chunked() {
        let mut device = VirtualDevice::default();
        let mut rx = device.subscribe();
        let mut framer = Framer::new();
        device.connect().await.unwrap();

        send(&mut device, &mut framer, Command::sensor_info(1)).await;
        let responses = collect(&mut rx);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].len(), 6 + 148);
        assert!(device.stats().packets_received >= 8);
    }

    #[tokio::test]
    async fn test_bad_checksum_ignored() {
        let mut device = VirtualDevice::default();
        let mut rx = device.subscribe();
        device.connect().await.unwrap();

        let mut packet = framing::build_packet(0x10, &[], 0xFE).unwrap();
        packet[3] ^= 0x01;
        device.write(&packet).await.unwrap();

        assert!(collect(&mut rx).is_empty());
        assert_eq!(device.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_silenced_command() {
        let mut device = VirtualDevice::default();
        let handle = device.handle();
        let mut rx = device.subscribe();
        let mut framer = Framer::new();
        device.connect().await.unwrap();

        handle.silence(0x10);
        send(&mut device, &mut framer, Command::status()).await;
        assert!(collect(&mut rx).is_empty());
        assert_eq!(handle.received_codes(), vec![0x10]);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let mut device = VirtualDevice::default();
        tokio_test::assert_err!(device.write(&[0x58]).await);
        tokio_test::assert_ok!(device.connect().await);
        tokio_test::assert_ok!(device.write(&[0x58]).await);
        assert!(device.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let mut device = VirtualDevice::new(VirtualDeviceProfile {
            fail_connect: true,
            ..VirtualDeviceProfile::default()
        });
        assert!(matches!(
            device.connect().await,
            Err(TransportError::ServiceNotFound(_))
        ));
        assert_eq!(device.stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_while_started() {
        let mut device = VirtualDevice::default();
        let handle = device.handle();
        let mut rx = device.subscribe();
        let mut framer = Framer::new();
        device.connect().await.unwrap();

        send(&mut device, &mut framer, Command::set_measurement_period(100.0)).await;
        send(&mut device, &mut framer, Command::start_measurements(0b001)).await;
        assert!(handle.is_streaming());
        assert_eq!(handle.period_ms(), 100.0);

        tokio::time::sleep(Duration::from_millis(350)).await;
        send(&mut device, &mut framer, Command::stop_measurements()).await;
        assert!(!handle.is_streaming());

        let notifications = collect(&mut rx)
            .into_iter()
            .filter(|r| r[0] == MEASUREMENT_RESPONSE)
            .count();
        assert_eq!(notifications, 3);
    }

    #[test]
    fn test_sample_notification_layout() {
        let packet = sample_notification(0b11, 2, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(packet[4], 0x06);
        assert_eq!(packet[1] as usize, packet.len());
        assert_eq!(packet.len(), 9 + 16);
        assert!(checksum::verify(&packet));

        let wide = sample_notification(1 << 20, 1, &[1.0]);
        assert_eq!(wide[4], 0x07);
        assert_eq!(wide.len(), 11 + 4);
    }
}
