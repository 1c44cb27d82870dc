//! Log record types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Event;

/// One line of the event log.
///
/// Field names on disk are `type`, `sessionId`, `workspaceId`, `data`,
/// `results`, `durationMs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    pub workspace_id: String,
    pub data: Value,
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl LogRecord {
    /// Build a record from an event.
    ///
    /// `results` is taken from the payload's `results` array when present.
    pub fn from_event(event: &Event, workspace_id: &str, duration_ms: u64) -> Self {
        let results = event
            .payload
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Self {
            kind: event.kind.to_string(),
            session_id: event.session_id.clone(),
            workspace_id: workspace_id.to_string(),
            data: event.payload.clone(),
            results,
            duration_ms,
        }
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            kind: self.kind.clone(),
            session_id: self.session_id.clone(),
            workspace_id: self.workspace_id.clone(),
        }
    }
}

/// Identifying fields of a record, handed to the loss callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    pub kind: String,
    pub session_id: String,
    pub workspace_id: String,
}

impl std::fmt::Display for RecordSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (session {}, workspace {})", self.kind, self.session_id, self.workspace_id)
    }
}
