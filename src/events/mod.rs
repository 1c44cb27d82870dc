//! Event bus and event types
//!
//! The bus is the fan-out point for every lifecycle and tool event. It is an
//! explicit instance owned by the host and passed to whoever produces or
//! consumes events.

pub mod bus;
pub mod types;

pub use bus::{ErrorReporter, EventBus, EventHandler, FnHandler, HandlerRef, PublishReport, handler_fn};
pub use types::{Event, EventKind};
