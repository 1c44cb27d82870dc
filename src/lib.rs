//! Conduit - runtime coordination for external tool servers
//!
//! Conduit lets a host process talk to long-lived tool servers and keep an
//! audit trail of everything that happens: a readiness gate for startup, an
//! event bus, a durable buffered event log, a timeout-bounded request
//! correlator, and a client that reaches tool servers over stdio or HTTP.

pub mod coordination;
pub mod error;
pub mod events;
pub mod id;
pub mod rpc;
pub mod storage;
pub mod transport;

pub use error::{ConduitError, Result};
