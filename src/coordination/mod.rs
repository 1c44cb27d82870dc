//! Startup coordination
//!
//! Settle-once readiness signalling shared by the host's startup sequencer
//! and the transport client's handshake.

pub mod gate;

pub use gate::{GateState, ReadinessGate};
