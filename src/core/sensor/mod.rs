//! Sensors and the sensor registry
//!
//! A [`Sensor`] is the runtime state of one channel: its latest value, the
//! values retained during the current collection run, and whether it is
//! enabled. Sensors are owned by the [`SensorRegistry`], which also enforces
//! mutual exclusion between channels and derives the sampling period.

mod registry;
mod spec;

pub use registry::{SensorRegistry, Transition};
pub use spec::{MeasurementInfo, SamplingMode, SensorSpec, MAX_CHANNEL};

use crate::core::events::{Dispatch, EventHub, ListenerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Sensor registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// Channel outside `[0, 31]`
    #[error("Channel {0} out of range (max 31)")]
    ChannelOutOfRange(u8),

    /// Channel already registered
    #[error("Duplicate sensor channel: {0}")]
    DuplicateChannel(u8),

    /// No sensor on this channel
    #[error("Unknown sensor channel: {0}")]
    UnknownChannel(u8),
}

/// Events emitted by one sensor
#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    /// A new value was decoded
    ValueChanged {
        /// Sensor channel
        channel: u8,
        /// New value
        value: f64,
    },
    /// The sensor was enabled or disabled
    StateChanged {
        /// Sensor channel
        channel: u8,
        /// New enabled flag
        enabled: bool,
    },
}

/// Runtime state of one sensor channel
#[derive(Debug)]
pub struct Sensor {
    spec: SensorSpec,
    value: Option<f64>,
    history: Vec<f64>,
    enabled: bool,
    events: EventHub<SensorEvent>,
}

impl Sensor {
    /// Create a disabled sensor
    pub fn new(spec: SensorSpec, event_capacity: usize) -> Self {
        Self {
            spec,
            value: None,
            history: Vec::new(),
            enabled: false,
            events: EventHub::new(event_capacity),
        }
    }

    /// Descriptor
    pub fn spec(&self) -> &SensorSpec {
        &self.spec
    }

    /// Channel number
    pub fn channel(&self) -> u8 {
        self.spec.channel
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Unit string
    pub fn unit(&self) -> &str {
        &self.spec.unit
    }

    /// Whether the sensor is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Latest value
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Values retained during the current run
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// Store a decoded value.
    ///
    /// Returns the `ValueChanged` notification for the caller to deliver.
    pub fn set_value(&mut self, value: f64, keep: bool) -> Dispatch<SensorEvent> {
        self.value = Some(value);
        if keep {
            self.history.push(value);
        }
        self.events.prepare(SensorEvent::ValueChanged {
            channel: self.spec.channel,
            value,
        })
    }

    /// Drop retained values
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Flip the enabled flag without any constraint handling.
    ///
    /// Returns the `StateChanged` notification, or `None` if the flag
    /// already had this value.
    pub(crate) fn set_enabled(&mut self, enabled: bool) -> Option<Dispatch<SensorEvent>> {
        if self.enabled == enabled {
            return None;
        }
        self.enabled = enabled;
        Some(self.events.prepare(SensorEvent::StateChanged {
            channel: self.spec.channel,
            enabled,
        }))
    }

    /// Register a synchronous listener
    pub fn listen<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&SensorEvent) + Send + Sync + 'static,
    {
        self.events.listen(listener)
    }

    /// Remove a listener
    pub fn unlisten(&mut self, id: ListenerId) -> bool {
        self.events.unlisten(id)
    }

    /// Subscribe to this sensor's events
    pub fn subscribe(&self) -> broadcast::Receiver<SensorEvent> {
        self.events.subscribe()
    }

    /// Owned copy of the observable state
    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            channel: self.spec.channel,
            name: self.spec.name.clone(),
            unit: self.spec.unit.clone(),
            enabled: self.enabled,
            value: self.value,
            history: self.history.clone(),
            spec: self.spec.clone(),
        }
    }
}

/// Read-only copy of a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    /// Channel number
    pub channel: u8,
    /// Display name
    pub name: String,
    /// Unit string
    pub unit: String,
    /// Enabled flag
    pub enabled: bool,
    /// Latest value
    pub value: Option<f64>,
    /// Retained values
    pub history: Vec<f64>,
    /// Full descriptor
    pub spec: SensorSpec,
}
