//! Measurement notification decoding
//!
//! Unsolicited notifications with response type [`MEASUREMENT_RESPONSE`]
//! carry samples. Byte 4 selects the layout:
//!
//! | sub-type | selection | value | count at | first value at |
//! |---|---|---|---|---|
//! | normal | u16 channel mask @5 | f32 | 7 | 9 |
//! | wide | u32 channel mask @5 | f32 | 9 | 11 |
//! | single/aperiodic real | channel @5 | f32 | 6 | 7 |
//! | single/aperiodic int | channel @5 | i32 | 6 | 7 |
//!
//! Start-time, dropped-sample and period notifications carry no samples.
//!
//! [`MEASUREMENT_RESPONSE`]: super::framing::MEASUREMENT_RESPONSE

use serde::{Deserialize, Serialize};

/// Offset of the measurement sub-type
pub const MEASUREMENT_TYPE_OFFSET: usize = 4;
/// Offset of the channel mask or channel number
pub const SELECTION_OFFSET: usize = 5;

const VALUE_SIZE: usize = 4;

/// Measurement notification sub-types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MeasurementType {
    /// 16-bit channel mask, f32 values
    NormalReal32 = 0x06,
    /// 32-bit channel mask, f32 values
    WideReal32 = 0x07,
    /// Single channel, f32 values
    SingleChannelReal32 = 0x08,
    /// Single channel, i32 values
    SingleChannelInt32 = 0x09,
    /// Aperiodic single channel, f32 values
    AperiodicReal32 = 0x0A,
    /// Aperiodic single channel, i32 values
    AperiodicInt32 = 0x0B,
    /// Collection start timestamp
    StartTime = 0x0C,
    /// Samples dropped by the device
    Dropped = 0x0D,
    /// Period notification
    Period = 0x0E,
}

impl MeasurementType {
    /// Get measurement type from u8
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x06 => Some(Self::NormalReal32),
            0x07 => Some(Self::WideReal32),
            0x08 => Some(Self::SingleChannelReal32),
            0x09 => Some(Self::SingleChannelInt32),
            0x0A => Some(Self::AperiodicReal32),
            0x0B => Some(Self::AperiodicInt32),
            0x0C => Some(Self::StartTime),
            0x0D => Some(Self::Dropped),
            0x0E => Some(Self::Period),
            _ => None,
        }
    }

    /// Whether this sub-type carries samples
    pub fn carries_samples(&self) -> bool {
        !matches!(self, Self::StartTime | Self::Dropped | Self::Period)
    }

    fn layout(&self) -> Option<Layout> {
        let layout = match self {
            Self::NormalReal32 => Layout {
                selection: Selection::Mask16,
                kind: ValueKind::Real32,
                count_offset: 7,
                values_offset: 9,
            },
            Self::WideReal32 => Layout {
                selection: Selection::Mask32,
                kind: ValueKind::Real32,
                count_offset: 9,
                values_offset: 11,
            },
            Self::SingleChannelReal32 | Self::AperiodicReal32 => Layout {
                selection: Selection::Channel,
                kind: ValueKind::Real32,
                count_offset: 6,
                values_offset: 7,
            },
            Self::SingleChannelInt32 | Self::AperiodicInt32 => Layout {
                selection: Selection::Channel,
                kind: ValueKind::Int32,
                count_offset: 6,
                values_offset: 7,
            },
            Self::StartTime | Self::Dropped | Self::Period => return None,
        };
        Some(layout)
    }
}

/// Encoding of a sample value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Little-endian IEEE-754 single precision
    Real32,
    /// Little-endian two's complement
    Int32,
}

impl ValueKind {
    /// Decode one little-endian value
    pub fn read(&self, bytes: [u8; 4]) -> f64 {
        match self {
            Self::Real32 => f64::from(f32::from_le_bytes(bytes)),
            Self::Int32 => f64::from(i32::from_le_bytes(bytes)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Selection {
    Mask16,
    Mask32,
    Channel,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    selection: Selection,
    kind: ValueKind,
    count_offset: usize,
    values_offset: usize,
}

/// One decoded value for one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    /// Sensor channel
    pub channel: u8,
    /// Decoded value
    pub value: f64,
}

/// Decoded measurement notification
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    /// Samples in wire order (sample-major, ascending channel within a sample)
    Samples {
        /// Notification sub-type
        kind: MeasurementType,
        /// Decoded values
        values: Vec<ChannelValue>,
        /// Declared sample count exceeded the payload
        truncated: bool,
    },
    /// Informational notification without samples
    Informational(MeasurementType),
    /// Sub-type byte not recognized
    Unrecognized(u8),
    /// Notification too short to hold its own header
    Malformed {
        /// Notification sub-type
        kind: MeasurementType,
        /// Length of the notification
        len: usize,
    },
}

/// Channels selected by a mask, ascending, limited to `registered`
pub fn channels_in_mask(mask: u32, registered: u32) -> Vec<u8> {
    (0u8..32)
        .filter(|&bit| mask & registered & (1u32 << bit) != 0)
        .collect()
}

/// Decode a complete measurement notification.
///
/// `registered` is the mask of channels present in the sensor collection;
/// channels outside it are skipped and do not occupy a value slot.
pub fn decode(response: &[u8], registered: u32) -> Measurement {
    let Some(&code) = response.get(MEASUREMENT_TYPE_OFFSET) else {
        return Measurement::Unrecognized(0);
    };
    let Some(kind) = MeasurementType::from_u8(code) else {
        return Measurement::Unrecognized(code);
    };
    let Some(layout) = kind.layout() else {
        return Measurement::Informational(kind);
    };

    let malformed = Measurement::Malformed {
        kind,
        len: response.len(),
    };
    let selection = &response[SELECTION_OFFSET.min(response.len())..];
    let channels = match layout.selection {
        Selection::Mask16 => match selection.get(..2) {
            Some(b) => channels_in_mask(u32::from(u16::from_le_bytes([b[0], b[1]])), registered),
            None => return malformed,
        },
        Selection::Mask32 => match selection.get(..4) {
            Some(b) => channels_in_mask(u32::from_le_bytes([b[0], b[1], b[2], b[3]]), registered),
            None => return malformed,
        },
        Selection::Channel => match selection.first() {
            Some(&channel) if channel < 32 => channels_in_mask(1u32 << channel, registered),
            Some(_) => Vec::new(),
            None => return malformed,
        },
    };
    let Some(&count) = response.get(layout.count_offset) else {
        return malformed;
    };

    let mut values = Vec::with_capacity(usize::from(count) * channels.len());
    let mut truncated = false;
    let mut offset = layout.values_offset;
    'samples: for _ in 0..count {
        for &channel in &channels {
            let Some(raw) = response.get(offset..offset + VALUE_SIZE) else {
                truncated = true;
                break 'samples;
            };
            let value = layout.kind.read([raw[0], raw[1], raw[2], raw[3]]);
            values.push(ChannelValue { channel, value });
            offset += VALUE_SIZE;
        }
    }

    Measurement::Samples {
        kind,
        values,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(sub_type: u8, selection: &[u8], count: u8, pad: usize, values: &[[u8; 4]]) -> Vec<u8> {
        let mut packet = vec![0x20, 0x00, 0x00, 0x00, sub_type];
        packet.extend_from_slice(selection);
        packet.push(count);
        packet.extend(std::iter::repeat(0u8).take(pad));
        for v in values {
            packet.extend_from_slice(v);
        }
        packet[1] = packet.len() as u8;
        packet
    }

    fn values_of(measurement: &Measurement, channel: u8) -> Vec<f64> {
        match measurement {
            Measurement::Samples { values, .. } => values
                .iter()
                .filter(|v| v.channel == channel)
                .map(|v| v.value)
                .collect(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_normal_interleaved() {
        let values = [1.0f32, 2.0, 3.0, 4.0].map(f32::to_le_bytes);
        let packet = notification(0x06, &0b11u16.to_le_bytes(), 2, 1, &values);
        let measurement = decode(&packet, 0b11);
        assert_eq!(values_of(&measurement, 0), vec![1.0, 3.0]);
        assert_eq!(values_of(&measurement, 1), vec![2.0, 4.0]);
    }

    #[test]
    fn test_wide_mask_high_channels() {
        let values = [10.5f32, -2.25].map(f32::to_le_bytes);
        let mask = (1u32 << 20) | (1u32 << 3);
        let packet = notification(0x07, &mask.to_le_bytes(), 1, 1, &values);
        let measurement = decode(&packet, mask);
        assert_eq!(values_of(&measurement, 3), vec![10.5]);
        assert_eq!(values_of(&measurement, 20), vec![-2.25]);
    }

    #[test]
    fn test_unknown_channels_skipped() {
        // Channel 1 selected but not registered: both values go to channel 0 and 2
        let values = [1.0f32, 2.0].map(f32::to_le_bytes);
        let packet = notification(0x06, &0b111u16.to_le_bytes(), 1, 1, &values);
        let measurement = decode(&packet, 0b101);
        assert_eq!(values_of(&measurement, 0), vec![1.0]);
        assert_eq!(values_of(&measurement, 1), Vec::<f64>::new());
        assert_eq!(values_of(&measurement, 2), vec![2.0]);
    }

    #[test]
    fn test_single_channel_int() {
        let values = [(-7i32).to_le_bytes(), 42i32.to_le_bytes()];
        let packet = notification(0x09, &[4], 2, 0, &values);
        let measurement = decode(&packet, 1 << 4);
        assert_eq!(values_of(&measurement, 4), vec![-7.0, 42.0]);
    }

    #[test]
    fn test_aperiodic_real() {
        let values = [0.5f32.to_le_bytes()];
        let packet = notification(0x0A, &[2], 1, 0, &values);
        assert_eq!(values_of(&decode(&packet, 0b100), 2), vec![0.5]);
        assert_eq!(values_of(&decode(&packet, 0), 2), Vec::<f64>::new());
    }

    #[test]
    fn test_truncated_payload() {
        let values = [1.0f32, 2.0, 3.0].map(f32::to_le_bytes);
        let packet = notification(0x06, &0b11u16.to_le_bytes(), 2, 1, &values);
        match decode(&packet, 0b11) {
            Measurement::Samples { values, truncated, .. } => {
                assert!(truncated);
                assert_eq!(values.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_informational_and_unknown() {
        let packet = [0x20, 0x06, 0x00, 0x00, 0x0D, 0x00];
        assert_eq!(decode(&packet, 0xFF), Measurement::Informational(MeasurementType::Dropped));
        let packet = [0x20, 0x06, 0x00, 0x00, 0x42, 0x00];
        assert_eq!(decode(&packet, 0xFF), Measurement::Unrecognized(0x42));
    }

    #[test]
    fn test_malformed_header() {
        let packet = [0x20, 0x06, 0x00, 0x00, 0x06, 0x01];
        assert!(matches!(decode(&packet, 0xFF), Measurement::Malformed { len: 6, .. }));
    }

    #[test]
    fn test_channels_in_mask() {
        assert_eq!(channels_in_mask(0b1011, u32::MAX), vec![0, 1, 3]);
        assert_eq!(channels_in_mask(0b1011, 0b0010), vec![1]);
        assert_eq!(channels_in_mask(1 << 31, u32::MAX), vec![31]);
    }
}
