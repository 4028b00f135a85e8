//! Immutable sensor descriptors reported by the device

use crate::core::protocol::measurement::ValueKind;
use serde::{Deserialize, Serialize};

/// Highest addressable sensor channel
pub const MAX_CHANNEL: u8 = 31;

/// How a sensor produces samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplingMode {
    /// Samples at the configured period
    Periodic,
    /// Samples on events
    Aperiodic,
}

impl SamplingMode {
    /// Decode the wire byte; anything non-zero is aperiodic
    pub fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::Periodic
        } else {
            Self::Aperiodic
        }
    }

    /// Wire byte
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Periodic => 0,
            Self::Aperiodic => 1,
        }
    }
}

/// Sensor capability descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementInfo {
    /// Encoding of sample values
    pub value_kind: ValueKind,
    /// Sampling mode
    pub sampling_mode: SamplingMode,
    /// Measurement uncertainty
    pub uncertainty: f64,
    /// Smallest measurable value
    pub min_value: f64,
    /// Largest measurable value
    pub max_value: f64,
    /// Fastest supported period (ms)
    pub min_period_ms: f64,
    /// Typical period (ms)
    pub typical_period_ms: f64,
    /// Slowest supported period (ms)
    pub max_period_ms: f64,
    /// Period granularity (ms)
    pub granularity_ms: f64,
}

impl Default for MeasurementInfo {
    fn default() -> Self {
        Self {
            value_kind: ValueKind::Real32,
            sampling_mode: SamplingMode::Periodic,
            uncertainty: 0.0,
            min_value: f64::from(f32::MIN),
            max_value: f64::from(f32::MAX),
            min_period_ms: 1.0,
            typical_period_ms: 100.0,
            max_period_ms: 1_000_000.0,
            granularity_ms: 1.0,
        }
    }
}

/// Sensor identity and constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    /// Channel number (bit position in channel masks)
    pub channel: u8,
    /// Display name
    pub name: String,
    /// Unit string
    pub unit: String,
    /// Channels that cannot be enabled together with this one
    pub exclusion_mask: u32,
    /// Numeric sensor id
    pub id: i32,
    /// Capabilities
    pub info: MeasurementInfo,
}

impl SensorSpec {
    /// Create a periodic float sensor with default capabilities
    pub fn new(channel: u8, name: &str, unit: &str) -> Self {
        Self {
            channel,
            name: name.to_string(),
            unit: unit.to_string(),
            exclusion_mask: 0,
            id: i32::from(channel) + 1,
            info: MeasurementInfo::default(),
        }
    }

    /// Set typical period
    #[must_use]
    pub fn typical_period(mut self, period_ms: f64) -> Self {
        self.info.typical_period_ms = period_ms;
        self
    }

    /// Set mutual-exclusion mask
    #[must_use]
    pub fn excludes(mut self, mask: u32) -> Self {
        self.exclusion_mask = mask;
        self
    }

    /// Set sensor id
    #[must_use]
    pub fn id(mut self, id: i32) -> Self {
        self.id = id;
        self
    }

    /// Set value encoding
    #[must_use]
    pub fn value_kind(mut self, kind: ValueKind) -> Self {
        self.info.value_kind = kind;
        self
    }

    /// Bit of this sensor in channel masks
    pub fn channel_bit(&self) -> u32 {
        1u32.checked_shl(u32::from(self.channel)).unwrap_or(0)
    }

    /// Whether enabling this sensor forces `other` off
    pub fn excludes_channel(&self, other: u8) -> bool {
        other <= MAX_CHANNEL && self.exclusion_mask & (1u32 << other) != 0
    }
}
