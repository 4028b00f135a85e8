//! Device State Machine
//!
//! Tracks the lifecycle of one device and rejects transitions the
//! orchestrator should never make. Keeps a bounded, timestamped history for
//! diagnostics.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Maximum number of transitions kept in the history
pub const MAX_HISTORY: usize = 64;

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// No session
    Closed,
    /// Transport connecting
    Connecting,
    /// Running the open sequence (INIT, status, enumeration)
    Initializing,
    /// Session open, not collecting
    Open,
    /// Session open and collecting measurements
    Collecting,
    /// Tearing the session down
    Closing,
}

impl DeviceState {
    /// Whether the session is usable for commands
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open | Self::Collecting)
    }

    /// Check if state is a transitional state
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Connecting | Self::Initializing | Self::Closing)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Open => "open",
            Self::Collecting => "collecting",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Rejected transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition from {from} to {to}")]
pub struct StateError {
    /// Current state
    pub from: DeviceState,
    /// Requested state
    pub to: DeviceState,
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: DeviceState,
    /// New state
    pub to: DeviceState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Device state machine
#[derive(Debug)]
pub struct DeviceStateMachine {
    state: DeviceState,
    history: Vec<StateTransition>,
    max_history: usize,
    last_transition: Option<Instant>,
}

impl Default for DeviceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateMachine {
    /// Create a new state machine in `Closed`
    pub fn new() -> Self {
        Self {
            state: DeviceState::Closed,
            history: Vec::new(),
            max_history: MAX_HISTORY,
            last_transition: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Get state history, oldest first
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Get time in current state
    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// Transition to a new state.
    ///
    /// Same-state transitions are accepted and not recorded.
    pub fn transition(&mut self, new_state: DeviceState, reason: Option<&str>) -> Result<(), StateError> {
        if new_state == self.state {
            return Ok(());
        }
        if !Self::is_valid_transition(self.state, new_state) {
            return Err(StateError {
                from: self.state,
                to: new_state,
            });
        }

        self.history.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.state = new_state;
        self.last_transition = Some(Instant::now());
        Ok(())
    }

    /// Force `Closed` from any state (failure or link loss)
    pub fn force_closed(&mut self, reason: &str) {
        // Closed is reachable from every state
        let _ = self.transition(DeviceState::Closed, Some(reason));
    }

    fn is_valid_transition(from: DeviceState, to: DeviceState) -> bool {
        use DeviceState::*;

        match (from, to) {
            (_, Closed) => true,
            (Closed, Connecting) => true,
            (Connecting, Initializing) => true,
            (Initializing, Open) => true,
            (Open, Collecting) => true,
            (Collecting, Open) => true,
            (Open, Closing) | (Collecting, Closing) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_sequence() {
        let mut sm = DeviceStateMachine::new();
        assert_eq!(sm.state(), DeviceState::Closed);

        sm.transition(DeviceState::Connecting, Some("open")).unwrap();
        sm.transition(DeviceState::Initializing, None).unwrap();
        sm.transition(DeviceState::Open, None).unwrap();
        assert!(sm.state().is_open());

        sm.transition(DeviceState::Collecting, None).unwrap();
        sm.transition(DeviceState::Open, None).unwrap();
        sm.transition(DeviceState::Closing, None).unwrap();
        sm.transition(DeviceState::Closed, None).unwrap();

        assert_eq!(sm.history().len(), 7);
        assert_eq!(sm.history()[0].reason.as_deref(), Some("open"));
    }

    #[test]
    fn test_invalid_transition() {
        let mut sm = DeviceStateMachine::new();
        let err = sm.transition(DeviceState::Collecting, None).unwrap_err();
        assert_eq!(err.to_string(), "Invalid transition from closed to collecting");
        assert_eq!(sm.state(), DeviceState::Closed);
    }

    #[test]
    fn test_force_closed_from_anywhere() {
        let mut sm = DeviceStateMachine::new();
        sm.transition(DeviceState::Connecting, None).unwrap();
        sm.transition(DeviceState::Initializing, None).unwrap();
        sm.force_closed("link lost");
        assert_eq!(sm.state(), DeviceState::Closed);
        assert_eq!(sm.history().last().and_then(|t| t.reason.as_deref()), Some("link lost"));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = DeviceStateMachine::new();
        sm.transition(DeviceState::Connecting, None).unwrap();
        sm.transition(DeviceState::Initializing, None).unwrap();
        sm.transition(DeviceState::Open, None).unwrap();
        for _ in 0..MAX_HISTORY {
            sm.transition(DeviceState::Collecting, None).unwrap();
            sm.transition(DeviceState::Open, None).unwrap();
        }
        assert_eq!(sm.history().len(), MAX_HISTORY);
        assert_eq!(sm.history()[0].from, DeviceState::Open);
    }
}
