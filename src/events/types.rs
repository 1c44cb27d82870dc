//! Event types carried by the bus.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::now_ms;

/// Kinds of lifecycle and tool events.
///
/// Serialized as dotted strings. Hosts can publish their own kinds through
/// `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventKind {
    AppReady,
    SessionStarted,
    SessionEnded,
    TransportConnecting,
    TransportConnected,
    TransportDisconnected,
    TransportFailed,
    ToolCallStarted,
    ToolCallCompleted,
    ToolCallFailed,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::AppReady => "app.ready",
            EventKind::SessionStarted => "session.started",
            EventKind::SessionEnded => "session.ended",
            EventKind::TransportConnecting => "transport.connecting",
            EventKind::TransportConnected => "transport.connected",
            EventKind::TransportDisconnected => "transport.disconnected",
            EventKind::TransportFailed => "transport.failed",
            EventKind::ToolCallStarted => "tool.call_started",
            EventKind::ToolCallCompleted => "tool.call_completed",
            EventKind::ToolCallFailed => "tool.call_failed",
            EventKind::Custom(name) => name,
        }
    }

    /// Whether this kind closes a call opened by a `*.call_started` event
    pub fn is_call_end(&self) -> bool {
        match self {
            EventKind::ToolCallCompleted | EventKind::ToolCallFailed => true,
            EventKind::Custom(name) => name.ends_with(".call_completed") || name.ends_with(".call_failed"),
            _ => false,
        }
    }

    /// Whether this kind opens a call
    pub fn is_call_start(&self) -> bool {
        match self {
            EventKind::ToolCallStarted => true,
            EventKind::Custom(name) => name.ends_with(".call_started"),
            _ => false,
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "app.ready" => EventKind::AppReady,
            "session.started" => EventKind::SessionStarted,
            "session.ended" => EventKind::SessionEnded,
            "transport.connecting" => EventKind::TransportConnecting,
            "transport.connected" => EventKind::TransportConnected,
            "transport.disconnected" => EventKind::TransportDisconnected,
            "transport.failed" => EventKind::TransportFailed,
            "tool.call_started" => EventKind::ToolCallStarted,
            "tool.call_completed" => EventKind::ToolCallCompleted,
            "tool.call_failed" => EventKind::ToolCallFailed,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        EventKind::from(s.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub kind: EventKind,
    pub session_id: String,
    /// Milliseconds since Unix epoch
    pub timestamp: u64,
    pub payload: Value,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(kind: impl Into<EventKind>, session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            session_id: session_id.into(),
            timestamp: now_ms(),
            payload,
        }
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The `callId` field of the payload, if any
    pub fn call_id(&self) -> Option<&str> {
        self.payload.get("callId").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_string_forms() {
        assert_eq!(EventKind::ToolCallStarted.as_str(), "tool.call_started");
        assert_eq!(EventKind::from("transport.connected"), EventKind::TransportConnected);
        assert_eq!(
            EventKind::from("workspace.opened"),
            EventKind::Custom("workspace.opened".to_string())
        );
    }

    #[test]
    fn test_kind_serializes_as_string() {
        let json = serde_json::to_string(&EventKind::SessionStarted).unwrap();
        assert_eq!(json, "\"session.started\"");
        let kind: EventKind = serde_json::from_str("\"agent.call_failed\"").unwrap();
        assert!(kind.is_call_end());
    }

    #[test]
    fn test_call_boundaries() {
        assert!(EventKind::ToolCallStarted.is_call_start());
        assert!(EventKind::ToolCallCompleted.is_call_end());
        assert!(EventKind::ToolCallFailed.is_call_end());
        assert!(!EventKind::SessionStarted.is_call_end());
    }

    #[test]
    fn test_event_call_id() {
        let event = Event::new(EventKind::ToolCallStarted, "s1", json!({"callId": "c-1"}));
        assert_eq!(event.call_id(), Some("c-1"));
        assert_eq!(event.session_id, "s1");
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = Event::new("custom.kind", "s1", json!({})).at(42);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["kind"], "custom.kind");
        assert_eq!(value["timestamp"], 42);
    }
}
