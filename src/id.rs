//! ID generation utilities for Conduit
//!
//! Provides timestamps, workspace identifiers and session identifiers.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use sha2::{Digest, Sha256};

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Derive a stable workspace ID from a workspace path
///
/// Format: first 16 hex chars of the SHA-256 of the path.
/// The same path always yields the same ID, so the event log for a
/// workspace lands in the same directory across runs.
pub fn workspace_id(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

/// Generate a session ID
///
/// Format: `sess-{timestamp_ms}-{pid_hex}{counter_hex}`
pub fn generate_session_id() -> String {
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sess-{}-{:x}{:04x}", now_ms(), std::process::id(), counter & 0xffff)
}

/// Epoch milliseconds embedded in a session ID, if it has one
pub fn session_timestamp(session_id: &str) -> Option<u64> {
    session_id.strip_prefix("sess-")?.split('-').next()?.parse().ok()
}

/// Render epoch milliseconds as local time
pub fn format_ms(ms: u64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms as i64) {
        Some(utc) => utc
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string(),
        None => ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        assert!(ts > 1577836800000); // 2020-01-01
        assert!(ts < 4102444800000); // 2100-01-01
    }

    #[test]
    fn test_workspace_id_is_stable() {
        let a = workspace_id("/tmp/some/workspace");
        let b = workspace_id("/tmp/some/workspace");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_workspace_id_differs_per_path() {
        assert_ne!(workspace_id("/tmp/ws-a"), workspace_id("/tmp/ws-b"));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert!(a.starts_with("sess-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_timestamp_round_trip() {
        let id = generate_session_id();
        let ts = session_timestamp(&id).unwrap();
        assert!(ts > 1577836800000);
        assert_eq!(session_timestamp("not-a-session"), None);
        assert_eq!(session_timestamp("sess-abc-1"), None);
    }

    #[test]
    fn test_format_ms_shape() {
        let rendered = format_ms(1_700_000_000_123);
        assert_eq!(rendered.len(), "2023-11-14 22:13:20.123".len());
        assert!(rendered.ends_with(".123"));
    }
}
