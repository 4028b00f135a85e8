//! Sensor registry and constraint engine

use super::{Sensor, SensorError, SensorEvent, SensorSpec, MAX_CHANNEL};
use crate::core::events::{Dispatch, ListenerId};
use crate::core::protocol::measurement::ChannelValue;

/// Period used before any sensor has been enabled (ms)
pub const DEFAULT_PERIOD_MS: f64 = 1000.0;

/// Outcome of an enable/disable request
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Whether the target sensor changed state
    pub changed: bool,
    /// Channels forced off by mutual exclusion
    pub disabled: Vec<u8>,
    /// Measurement period after the transition (ms)
    pub period_ms: f64,
}

/// Owns every sensor of one device, in discovery order.
///
/// Sensor notifications raised by state changes are queued, not delivered;
/// the owner drains them with [`take_dispatches`](Self::take_dispatches).
#[derive(Debug)]
pub struct SensorRegistry {
    sensors: Vec<Sensor>,
    measurement_period_ms: f64,
    keep_values: bool,
    event_capacity: usize,
    outbox: Vec<Dispatch<SensorEvent>>,
}

impl SensorRegistry {
    /// Create an empty registry
    pub fn new(keep_values: bool, event_capacity: usize) -> Self {
        Self {
            sensors: Vec::new(),
            measurement_period_ms: DEFAULT_PERIOD_MS,
            keep_values,
            event_capacity,
            outbox: Vec::new(),
        }
    }

    /// Register a sensor
    pub fn insert(&mut self, spec: SensorSpec) -> Result<(), SensorError> {
        if spec.channel > MAX_CHANNEL {
            return Err(SensorError::ChannelOutOfRange(spec.channel));
        }
        if self.get(spec.channel).is_some() {
            return Err(SensorError::DuplicateChannel(spec.channel));
        }
        self.sensors.push(Sensor::new(spec, self.event_capacity));
        Ok(())
    }

    /// Remove every sensor and drop undelivered notifications
    pub fn clear(&mut self) {
        self.sensors.clear();
        self.outbox.clear();
    }

    /// Take the notifications queued since the last call, oldest first
    pub fn take_dispatches(&mut self) -> Vec<Dispatch<SensorEvent>> {
        std::mem::take(&mut self.outbox)
    }

    /// Number of sensors
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    /// Whether no sensor is registered
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Sensors in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.iter()
    }

    /// Sensor on a channel
    pub fn get(&self, channel: u8) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.channel() == channel)
    }

    fn index_of(&self, channel: u8) -> Result<usize, SensorError> {
        self.sensors
            .iter()
            .position(|s| s.channel() == channel)
            .ok_or(SensorError::UnknownChannel(channel))
    }

    /// Mask of registered channels
    pub fn registered_mask(&self) -> u32 {
        self.sensors.iter().fold(0, |mask, s| mask | s.spec().channel_bit())
    }

    /// Mask of enabled channels
    pub fn enabled_mask(&self) -> u32 {
        self.sensors
            .iter()
            .filter(|s| s.is_enabled())
            .fold(0, |mask, s| mask | s.spec().channel_bit())
    }

    /// Current measurement period (ms)
    pub fn measurement_period(&self) -> f64 {
        self.measurement_period_ms
    }

    /// Override the measurement period (ms)
    pub fn set_measurement_period(&mut self, period_ms: f64) {
        self.measurement_period_ms = period_ms;
    }

    /// Whether decoded values are appended to sensor history
    pub fn keep_values(&self) -> bool {
        self.keep_values
    }

    /// Toggle history retention
    pub fn set_keep_values(&mut self, keep: bool) {
        self.keep_values = keep;
    }

    /// Enable or disable one sensor.
    ///
    /// Enabling sets the period to the sensor's typical period, forces off
    /// every enabled sensor in its exclusion mask and raises the period to
    /// the slowest typical period among the sensors that stay enabled.
    /// Forced-off sensors go through a plain disable without a second scan.
    pub fn set_enabled(&mut self, channel: u8, enabled: bool) -> Result<Transition, SensorError> {
        let index = self.index_of(channel)?;

        match self.sensors[index].set_enabled(enabled) {
            Some(dispatch) => self.outbox.push(dispatch),
            None => return Ok(self.unchanged()),
        }
        if !enabled {
            return Ok(Transition {
                changed: true,
                disabled: Vec::new(),
                period_ms: self.measurement_period_ms,
            });
        }

        let target = self.sensors[index].spec().clone();
        let mut period = target.info.typical_period_ms;
        let mut disabled = Vec::new();

        for other in self.sensors.iter_mut() {
            if other.channel() == channel || !other.is_enabled() {
                continue;
            }
            if target.excludes_channel(other.channel()) {
                self.outbox.extend(other.set_enabled(false));
                disabled.push(other.channel());
            } else if other.spec().info.typical_period_ms > period {
                period = other.spec().info.typical_period_ms;
            }
        }
        self.measurement_period_ms = period;

        Ok(Transition {
            changed: true,
            disabled,
            period_ms: period,
        })
    }

    /// Enable every registered sensor selected by `mask`, in discovery order
    pub fn enable_mask(&mut self, mask: u32) -> Vec<u8> {
        let channels: Vec<u8> = self
            .sensors
            .iter()
            .map(Sensor::channel)
            .filter(|&c| mask & (1u32 << c) != 0)
            .collect();

        channels
            .into_iter()
            .filter(|&c| matches!(self.set_enabled(c, true), Ok(t) if t.changed))
            .collect()
    }

    /// Clear retained values of enabled sensors
    pub fn clear_enabled_history(&mut self) {
        for sensor in self.sensors.iter_mut().filter(|s| s.is_enabled()) {
            sensor.clear_history();
        }
    }

    /// Route decoded values to their sensors; returns how many were applied
    pub fn apply(&mut self, values: &[ChannelValue]) -> usize {
        let keep = self.keep_values;
        let mut applied = 0;
        for v in values {
            if let Some(sensor) = self.sensors.iter_mut().find(|s| s.channel() == v.channel) {
                self.outbox.push(sensor.set_value(v.value, keep));
                applied += 1;
            }
        }
        applied
    }

    /// Register a listener on one sensor
    pub fn listen<F>(&mut self, channel: u8, listener: F) -> Result<ListenerId, SensorError>
    where
        F: Fn(&SensorEvent) + Send + Sync + 'static,
    {
        let index = self.index_of(channel)?;
        Ok(self.sensors[index].listen(listener))
    }

    /// Remove a listener from one sensor
    pub fn unlisten(&mut self, channel: u8, id: ListenerId) -> Result<bool, SensorError> {
        let index = self.index_of(channel)?;
        Ok(self.sensors[index].unlisten(id))
    }

    fn unchanged(&self) -> Transition {
        Transition {
            changed: false,
            disabled: Vec::new(),
            period_ms: self.measurement_period_ms,
        }
    }
}
