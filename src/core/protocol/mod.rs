//! Device protocol
//!
//! Provides the wire-level pieces of the sensor protocol:
//! - Checksum (8-bit wrapping sum)
//! - Framing and sequence numbering
//! - Command catalogue
//! - Reassembly of fragmented responses
//! - Measurement notification decoding
//! - Command response parsing

pub mod checksum;
pub mod command;
pub mod framing;
pub mod measurement;
pub mod reassembly;
pub mod response;

pub use command::{Command, CommandCode};
pub use framing::{Frame, FrameError, Framer, COMMAND_RESPONSE, MEASUREMENT_RESPONSE};
pub use measurement::{ChannelValue, Measurement, MeasurementType, ValueKind};
pub use reassembly::{Progress, Reassembler};
pub use response::{Ack, ChargingState, DeviceIdentity, DeviceStatus, FirmwareVersion, ResponseError};
