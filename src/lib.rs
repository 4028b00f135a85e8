//! # Sensorlink Core Library
//!
//! Client-side protocol engine for battery-powered sensor interfaces
//! connected over USB or Bluetooth Low Energy:
//! - Packet framing with rolling sequence ids and 8-bit checksum
//! - Reassembly of responses split across notification chunks
//! - Single-flight command/response correlation with timeout
//! - Decoding of periodic and aperiodic measurement notifications
//! - Sensor registry with mutual-exclusion constraints
//! - Device lifecycle (open, start, stop, close)
//!
//! ## Example
//!
//! ```rust,no_run
//! use sensorlink_core::{Device, EngineConfig, SensorEvent, VirtualDevice};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = Device::new(VirtualDevice::default(), EngineConfig::default());
//!     device.open(false).await?;
//!
//!     device.on_sensor_event(0, |event| {
//!         if let SensorEvent::ValueChanged { value, .. } = event {
//!             println!("Temperature: {value}");
//!         }
//!     })?;
//!     device.start(None).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(2)).await;
//!     device.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::config::{ConfigError, EngineConfig};
pub use crate::core::device::{Device, DeviceError, DeviceEvent};
pub use crate::core::diagnostics::{DiagnosticSink, MemorySink, Severity, TracingSink};
pub use crate::core::protocol::{Ack, ChargingState, DeviceIdentity, DeviceStatus};
pub use crate::core::queue::CommandError;
pub use crate::core::sensor::{SensorEvent, SensorSnapshot, SensorSpec, Transition};
pub use crate::core::simulator::{VirtualDevice, VirtualDeviceHandle, VirtualDeviceProfile};
pub use crate::core::state_machine::DeviceState;
pub use crate::core::transport::{
    TransportError, TransportEvent, TransportStats, TransportTrait, TransportType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
