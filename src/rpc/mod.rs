//! RPC layer - wire messages and the request correlator
//!
//! Both transports speak the same request/response shape; the correlator
//! turns raw inbound responses into settled calls.

pub mod correlator;
pub mod messages;

pub use correlator::{Correlator, DEFAULT_OUTBOUND_CAPACITY, Outbound, PendingCall};
pub use messages::{RpcErrorBody, RpcRequest, RpcResponse};
