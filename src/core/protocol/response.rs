//! Command response payload parsing
//!
//! Parsers take the payload of a command response (bytes from offset 6).
//! The `to_payload` encoders are the inverse and are used by the virtual
//! device.

use super::measurement::ValueKind;
use crate::core::sensor::{MeasurementInfo, SamplingMode, SensorSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of a device status payload
pub const STATUS_LEN: usize = 10;
/// Size of a channel mask payload
pub const MASK_LEN: usize = 4;
/// Size of a device info payload
pub const DEVICE_INFO_LEN: usize = 48;
/// Size of a sensor info payload
pub const SENSOR_INFO_LEN: usize = 148;

const IDENTITY_FIELD_LEN: usize = 16;
const SENSOR_NAME: std::ops::Range<usize> = 8..68;
const SENSOR_UNIT: std::ops::Range<usize> = 68..100;

/// Response parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// Payload shorter than its layout
    #[error("{what} response too short: need {needed} bytes, got {got}")]
    TooShort {
        /// Which response
        what: &'static str,
        /// Required length
        needed: usize,
        /// Actual length
        got: usize,
    },
}

fn require(what: &'static str, payload: &[u8], needed: usize) -> Result<(), ResponseError> {
    if payload.len() < needed {
        return Err(ResponseError::TooShort {
            what,
            needed,
            got: payload.len(),
        });
    }
    Ok(())
}

fn u32_at(payload: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ])
}

fn f64_at(payload: &[u8], offset: usize) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[offset..offset + 8]);
    f64::from_le_bytes(raw)
}

fn u64_at(payload: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// NUL-padded UTF-8 field
fn text(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn put_text(buf: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(buf.len());
    buf[..len].copy_from_slice(&bytes[..len]);
}

fn micros_to_ms(micros: f64) -> f64 {
    micros / 1000.0
}

fn ms_to_micros(ms: f64) -> f64 {
    (ms * 1000.0).round()
}

/// Parse a channel mask (default sensors, available sensors)
pub fn parse_mask(payload: &[u8]) -> Result<u32, ResponseError> {
    require("mask", payload, MASK_LEN)?;
    Ok(u32_at(payload, 0))
}

/// Encode a channel mask payload
pub fn mask_payload(mask: u32) -> Vec<u8> {
    mask.to_le_bytes().to_vec()
}

/// Battery charger state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargingState {
    /// Not charging
    Idle,
    /// Charging
    Charging,
    /// Charge complete
    Complete,
    /// Charger fault
    Error,
    /// Undocumented value
    Unknown(u8),
}

impl ChargingState {
    /// Decode the wire byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Charging,
            2 => Self::Complete,
            3 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    /// Wire byte
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Charging => 1,
            Self::Complete => 2,
            Self::Error => 3,
            Self::Unknown(v) => *v,
        }
    }
}

impl fmt::Display for ChargingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Charging => write!(f, "charging"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
            Self::Unknown(v) => write!(f, "unknown ({})", v),
        }
    }
}

/// Firmware version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Major
    pub major: u8,
    /// Minor
    pub minor: u8,
    /// Build number; radio firmware reports none
    pub build: u16,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}.{}", self.major, self.minor, self.build)
    }
}

/// Answer to GET_STATUS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Raw status byte
    pub status: u8,
    /// Master processor firmware
    pub master_firmware: FirmwareVersion,
    /// Radio firmware
    pub radio_firmware: FirmwareVersion,
    /// Battery level in percent
    pub battery_percent: u8,
    /// Charger state
    pub charging_state: ChargingState,
}

impl DeviceStatus {
    /// Parse a status payload
    pub fn parse(payload: &[u8]) -> Result<Self, ResponseError> {
        require("status", payload, STATUS_LEN)?;
        Ok(Self {
            status: payload[0],
            master_firmware: FirmwareVersion {
                major: payload[2],
                minor: payload[3],
                build: u16::from_le_bytes([payload[4], payload[5]]),
            },
            radio_firmware: FirmwareVersion {
                major: payload[6],
                minor: payload[7],
                build: 0,
            },
            battery_percent: payload[8],
            charging_state: ChargingState::from_u8(payload[9]),
        })
    }

    /// Encode as a status payload
    pub fn to_payload(&self) -> Vec<u8> {
        let build = self.master_firmware.build.to_le_bytes();
        vec![
            self.status,
            0x00,
            self.master_firmware.major,
            self.master_firmware.minor,
            build[0],
            build[1],
            self.radio_firmware.major,
            self.radio_firmware.minor,
            self.battery_percent,
            self.charging_state.as_u8(),
        ]
    }
}

/// Answer to GET_INFO
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Order code
    pub order_code: String,
    /// Serial number
    pub serial_number: String,
    /// Device name
    pub name: String,
}

impl DeviceIdentity {
    /// Parse a device info payload
    pub fn parse(payload: &[u8]) -> Result<Self, ResponseError> {
        require("device info", payload, DEVICE_INFO_LEN)?;
        let field = |n: usize| text(&payload[n * IDENTITY_FIELD_LEN..(n + 1) * IDENTITY_FIELD_LEN]);
        Ok(Self {
            order_code: field(0),
            serial_number: field(1),
            name: field(2),
        })
    }

    /// Encode as a device info payload; fields longer than 16 bytes are cut
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; DEVICE_INFO_LEN];
        for (n, value) in [&self.order_code, &self.serial_number, &self.name]
            .into_iter()
            .enumerate()
        {
            put_text(
                &mut payload[n * IDENTITY_FIELD_LEN..(n + 1) * IDENTITY_FIELD_LEN],
                value,
            );
        }
        payload
    }
}

/// Parse a sensor info payload.
///
/// Returns `Ok(None)` for a sensor id of zero or below, which the device
/// uses for empty slots.
pub fn parse_sensor_info(payload: &[u8]) -> Result<Option<SensorSpec>, ResponseError> {
    require("sensor info", payload, SENSOR_INFO_LEN)?;

    let id = i32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
    if id <= 0 {
        return Ok(None);
    }

    let value_kind = if payload[6] == 0 {
        ValueKind::Real32
    } else {
        ValueKind::Int32
    };

    Ok(Some(SensorSpec {
        channel: payload[1],
        name: text(&payload[SENSOR_NAME]),
        unit: text(&payload[SENSOR_UNIT]),
        exclusion_mask: u32_at(payload, 144),
        id,
        info: MeasurementInfo {
            value_kind,
            sampling_mode: SamplingMode::from_u8(payload[7]),
            uncertainty: f64_at(payload, 100),
            min_value: f64_at(payload, 108),
            max_value: f64_at(payload, 116),
            min_period_ms: micros_to_ms(f64::from(u32_at(payload, 124))),
            max_period_ms: micros_to_ms(u64_at(payload, 128) as f64),
            typical_period_ms: micros_to_ms(f64::from(u32_at(payload, 136))),
            granularity_ms: micros_to_ms(f64::from(u32_at(payload, 140))),
        },
    }))
}

/// Encode a sensor descriptor as a sensor info payload
pub fn sensor_info_payload(spec: &SensorSpec) -> Vec<u8> {
    let info = &spec.info;
    let mut payload = vec![0u8; SENSOR_INFO_LEN];
    payload[1] = spec.channel;
    payload[2..6].copy_from_slice(&spec.id.to_le_bytes());
    payload[6] = match info.value_kind {
        ValueKind::Real32 => 0,
        ValueKind::Int32 => 1,
    };
    payload[7] = info.sampling_mode.as_u8();
    put_text(&mut payload[SENSOR_NAME], &spec.name);
    put_text(&mut payload[SENSOR_UNIT], &spec.unit);
    payload[100..108].copy_from_slice(&info.uncertainty.to_le_bytes());
    payload[108..116].copy_from_slice(&info.min_value.to_le_bytes());
    payload[116..124].copy_from_slice(&info.max_value.to_le_bytes());

    let micros32 = |ms: f64| (ms_to_micros(ms).clamp(0.0, f64::from(u32::MAX)) as u32).to_le_bytes();
    payload[124..128].copy_from_slice(&micros32(info.min_period_ms));
    payload[128..136].copy_from_slice(&(ms_to_micros(info.max_period_ms).max(0.0) as u64).to_le_bytes());
    payload[136..140].copy_from_slice(&micros32(info.typical_period_ms));
    payload[140..144].copy_from_slice(&micros32(info.granularity_ms));
    payload[144..148].copy_from_slice(&spec.exclusion_mask.to_le_bytes());
    payload
}

/// Start/stop acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ack {
    /// Device accepted the request
    Accepted,
    /// Device refused with a status code
    Refused(u8),
}

impl Ack {
    /// Parse an acknowledgement payload
    pub fn parse(payload: &[u8]) -> Result<Self, ResponseError> {
        require("acknowledgement", payload, 1)?;
        Ok(match payload[0] {
            0 => Self::Accepted,
            code => Self::Refused(code),
        })
    }

    /// Whether the request was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}
