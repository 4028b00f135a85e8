//! Diagnostic output
//!
//! Each device receives a [`DiagnosticSink`] at construction instead of
//! consulting a process-wide verbosity flag. [`TracingSink`] forwards to
//! `tracing`; [`MemorySink`] keeps entries for inspection.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fmt;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Wire-level detail
    Trace,
    /// Protocol detail
    Debug,
    /// Lifecycle milestones
    Info,
    /// Recoverable anomalies
    Warn,
    /// Failures
    Error,
}

/// Packet direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device
    Sent,
    /// Device to host
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "TX"),
            Self::Received => write!(f, "RX"),
        }
    }
}

/// Receives diagnostics from one device
pub trait DiagnosticSink: Send + Sync {
    /// Record a message
    fn record(&self, severity: Severity, message: &str);

    /// Record raw bytes crossing the transport
    fn packet(&self, direction: Direction, bytes: &[u8]) {
        self.record(Severity::Trace, &format!("{} {}", direction, hex::encode(bytes)));
    }
}

/// Forwards diagnostics to `tracing`
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    device: Option<String>,
}

impl TracingSink {
    /// Tag every event with a device label
    pub fn for_device(device: impl Into<String>) -> Self {
        Self {
            device: Some(device.into()),
        }
    }
}

impl DiagnosticSink for TracingSink {
    fn record(&self, severity: Severity, message: &str) {
        let device = self.device.as_deref().unwrap_or("-");
        match severity {
            Severity::Trace => tracing::trace!(device, "{}", message),
            Severity::Debug => tracing::debug!(device, "{}", message),
            Severity::Info => tracing::info!(device, "{}", message),
            Severity::Warn => tracing::warn!(device, "{}", message),
            Severity::Error => tracing::error!(device, "{}", message),
        }
    }
}

/// One recorded diagnostic
#[derive(Debug, Clone)]
pub struct DiagnosticEntry {
    /// When it was recorded
    pub timestamp: DateTime<Local>,
    /// Severity
    pub severity: Severity,
    /// Message text
    pub message: String,
}

/// Keeps diagnostics in memory
#[derive(Debug)]
pub struct MemorySink {
    entries: Mutex<Vec<DiagnosticEntry>>,
    min_severity: Severity,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(Severity::Debug)
    }
}

impl MemorySink {
    /// Keep entries at or above `min_severity`
    pub fn new(min_severity: Severity) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            min_severity,
        }
    }

    /// Snapshot of recorded entries
    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        self.entries.lock().clone()
    }

    /// Whether any entry at `severity` contains `needle`
    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.severity == severity && e.message.contains(needle))
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&self, severity: Severity, message: &str) {
        if severity < self.min_severity {
            return;
        }
        self.entries.lock().push(DiagnosticEntry {
            timestamp: Local::now(),
            severity,
            message: message.to_string(),
        });
    }
}
