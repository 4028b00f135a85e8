//! Core module containing the protocol engine
//!
//! This module provides:
//! - Transport interface for USB and Bluetooth links
//! - Wire protocol (framing, checksum, reassembly, measurement decoding)
//! - Single-flight command queue with timeouts
//! - Sensor registry with mutual-exclusion constraints
//! - Device orchestrator and lifecycle state machine
//! - Typed event dispatch and injectable diagnostics
//! - Virtual device simulation

pub mod device;
pub mod diagnostics;
pub mod events;
pub mod protocol;
pub mod queue;
pub mod sensor;
pub mod simulator;
pub mod state_machine;
pub mod transport;
