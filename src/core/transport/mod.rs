//! Transport layer interface
//!
//! The engine talks to the device through a duplex byte channel. Concrete
//! adapters (USB HID reports, Bluetooth GATT characteristics) live outside the
//! engine and implement [`TransportTrait`]; the crate ships an in-memory
//! [`VirtualDevice`](crate::core::simulator::VirtualDevice) for tests and demos.
//!
//! Adapters deliver inbound notification chunks and link loss through the
//! broadcast channel returned by [`TransportTrait::subscribe`]. Outbound
//! packets are already split to [`TransportTrait::max_packet_len`] by the
//! engine, so `write` receives one chunk at a time.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

/// Maximum packet length of a Bluetooth GATT characteristic write
pub const BLE_MAX_PACKET_LEN: usize = 20;

/// Maximum packet length of a USB HID report
pub const USB_MAX_PACKET_LEN: usize = 63;

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// USB HID
    Usb,
    /// Bluetooth Low Energy GATT
    Bluetooth,
    /// In-memory virtual device
    Virtual,
}

impl TransportType {
    /// Advertised maximum packet length for this kind of link
    pub fn default_max_packet_len(&self) -> usize {
        match self {
            Self::Usb => USB_MAX_PACKET_LEN,
            Self::Bluetooth | Self::Virtual => BLE_MAX_PACKET_LEN,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => write!(f, "USB"),
            Self::Bluetooth => write!(f, "Bluetooth"),
            Self::Virtual => write!(f, "Virtual"),
        }
    }
}

/// Events delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound notification chunk
    Data(Bytes),
    /// The underlying link went away
    Disconnected,
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No compatible service or endpoint on the device
    #[error("No compatible service found: {0}")]
    ServiceNotFound(String),

    /// Connection timeout
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Disconnected
    #[error("Disconnected")]
    Disconnected,

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Chunks sent
    pub packets_sent: u64,
    /// Chunks received
    pub packets_received: u64,
    /// Errors count
    pub errors: u64,
}

/// Duplex byte channel to one device
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportTrait: Send + Sync {
    /// Connect to the device; fails if no compatible service/endpoint is found
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Release the link. Subscribers observe [`TransportEvent::Disconnected`].
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Write one chunk of at most [`max_packet_len`](Self::max_packet_len) bytes
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Largest chunk the link accepts
    fn max_packet_len(&self) -> usize {
        self.transport_type().default_max_packet_len()
    }

    /// Get transport type
    fn transport_type(&self) -> TransportType;

    /// Get connection info string
    fn connection_info(&self) -> String;

    /// Get statistics
    fn stats(&self) -> TransportStats;

    /// Subscribe to inbound chunks and link events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
