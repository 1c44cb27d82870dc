//! Client for one named tool server.
//!
//! `Disconnected -> Connecting -> Connected`. A connect attempt only counts as
//! connected once a `tools/list` round trip succeeds; otherwise the transport
//! is torn down and the client drops back to `Disconnected`. Concurrent
//! `connect` calls share one attempt through a [`ReadinessGate`]; `close`
//! during an attempt fails that gate, which cancels the attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::env::EnvPolicy;
use super::http::HttpTransport;
use super::stdio::StdioTransport;
use super::{Transport, TransportConfig};
use crate::coordination::ReadinessGate;
use crate::error::{ConduitError, Result};
use crate::events::{EventBus, EventKind};
use crate::rpc::Correlator;

pub const LIST_TOOLS_METHOD: &str = "tools/list";
pub const CALL_TOOL_METHOD: &str = "tools/call";

/// Connection lifecycle as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        write!(f, "{}", s)
    }
}

/// Per-request deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    pub request_ms: u64,
    pub health_check_ms: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            request_ms: 30_000,
            health_check_ms: 10_000,
        }
    }
}

impl ClientTimeouts {
    fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }
}

/// A tool advertised by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Result of one tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub tool: String,
    pub result: Value,
    /// The server ran the tool but flagged the outcome as an error
    pub is_error: bool,
    pub duration_ms: u64,
}

impl ToolOutput {
    fn new(tool: &str, result: Value, duration_ms: u64) -> Self {
        let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
        Self {
            tool: tool.to_string(),
            result,
            is_error,
            duration_ms,
        }
    }

    /// Concatenated `text` items of the result's `content` array
    pub fn text(&self) -> Option<String> {
        let content = self.result.get("content")?.as_array()?;
        let parts: Vec<&str> = content
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if parts.is_empty() { None } else { Some(parts.join("\n")) }
    }
}

/// Parse a `tools/list` result: `{tools: [...]}` or a bare array
pub fn parse_tools(result: Value) -> Result<Vec<ToolDescriptor>> {
    let list = match result {
        Value::Object(mut map) => map.remove("tools").unwrap_or(Value::Array(Vec::new())),
        Value::Array(items) => Value::Array(items),
        Value::Null => Value::Array(Vec::new()),
        other => {
            return Err(ConduitError::Transport(format!(
                "unexpected {} result: {}",
                LIST_TOOLS_METHOD, other
            )));
        }
    };
    Ok(serde_json::from_value(list)?)
}

#[derive(Clone)]
struct Active {
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
}

enum Link {
    Disconnected,
    Connecting { attempt: u64, gate: ReadinessGate },
    Connected(Active),
}

impl Link {
    fn is_attempt(&self, id: u64) -> bool {
        matches!(self, Link::Connecting { attempt, .. } if *attempt == id)
    }
}

enum Attempt {
    Join(ReadinessGate),
    Lead(u64, ReadinessGate, Option<Active>),
}

/// Puts the client back to `Disconnected` if a leading connect is dropped
/// before it finishes.
struct LeadGuard<'a> {
    client: &'a ToolClient,
    attempt: u64,
    gate: ReadinessGate,
    finished: bool,
}

impl Drop for LeadGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        {
            let mut link = self.client.link();
            if link.is_attempt(self.attempt) {
                *link = Link::Disconnected;
            }
        }
        self.gate.mark_failed(ConduitError::ConnectionClosed(format!(
            "connect to '{}' was abandoned",
            self.client.name
        )));
    }
}

/// Client for a single tool server
pub struct ToolClient {
    name: String,
    config: TransportConfig,
    policy: EnvPolicy,
    timeouts: ClientTimeouts,
    events: Option<(EventBus, String)>,
    link: Mutex<Link>,
    tools: Mutex<Vec<ToolDescriptor>>,
    next_call: AtomicU64,
    next_attempt: AtomicU64,
}

impl std::fmt::Debug for ToolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolClient")
            .field("name", &self.name)
            .field("kind", &self.config.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl ToolClient {
    pub fn new(name: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            name: name.into(),
            config,
            policy: EnvPolicy::default(),
            timeouts: ClientTimeouts::default(),
            events: None,
            link: Mutex::new(Link::Disconnected),
            tools: Mutex::new(Vec::new()),
            next_call: AtomicU64::new(1),
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn with_env_policy(mut self, policy: EnvPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Publish lifecycle and call events on `bus` under `session_id`
    pub fn with_events(mut self, bus: EventBus, session_id: impl Into<String>) -> Self {
        self.events = Some((bus, session_id.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.link() {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting { .. } => ConnectionState::Connecting,
            Link::Connected(active) if active.transport.is_open() => ConnectionState::Connected,
            Link::Connected(_) => ConnectionState::Disconnected,
        }
    }

    /// Tools from the last successful listing
    pub fn cached_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Establish the transport and verify it with a health check.
    ///
    /// A no-op when already connected. Callers arriving while another
    /// attempt is in flight wait for that attempt's outcome.
    pub async fn connect(&self) -> Result<()> {
        let attempt = {
            let mut link = self.link();
            match &*link {
                Link::Connected(active) if active.transport.is_open() => return Ok(()),
                Link::Connecting { gate, .. } => Attempt::Join(gate.clone()),
                _ => {
                    let gate = ReadinessGate::new();
                    let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
                    let previous = std::mem::replace(
                        &mut *link,
                        Link::Connecting {
                            attempt,
                            gate: gate.clone(),
                        },
                    );
                    let stale = match previous {
                        Link::Connected(active) => Some(active),
                        _ => None,
                    };
                    Attempt::Lead(attempt, gate, stale)
                }
            }
        };

        let (attempt, gate, stale) = match attempt {
            Attempt::Join(gate) => return gate.wait().await,
            Attempt::Lead(attempt, gate, stale) => (attempt, gate, stale),
        };

        let mut guard = LeadGuard {
            client: self,
            attempt,
            gate: gate.clone(),
            finished: false,
        };
        if let Some(stale) = stale {
            log::info!("transport to '{}' went away, reconnecting", self.name);
            stale.transport.close().await;
        }

        // The gate only settles early when `close` cancels this attempt
        let outcome = tokio::select! {
            biased;
            outcome = self.establish() => outcome,
            _ = gate.wait() => {
                let err = self.closed_while_connecting();
                log::info!("{}", err);
                self.emit_failure(&err).await;
                Err(err)
            }
        };
        guard.finished = true;

        let committed = {
            let mut link = self.link();
            if link.is_attempt(attempt) {
                *link = match &outcome {
                    Ok(active) => Link::Connected(active.clone()),
                    Err(_) => Link::Disconnected,
                };
                true
            } else {
                false
            }
        };

        match outcome {
            Ok(active) if !committed => {
                active.transport.close().await;
                let err = self.closed_while_connecting();
                self.emit_failure(&err).await;
                gate.mark_failed(err.clone());
                Err(err)
            }
            Ok(_) => {
                gate.mark_ready();
                Ok(())
            }
            Err(err) => {
                gate.mark_failed(err.clone());
                Err(err)
            }
        }
    }

    fn closed_while_connecting(&self) -> ConduitError {
        ConduitError::ConnectionClosed(format!("'{}' was closed while connecting", self.name))
    }

    async fn establish(&self) -> Result<Active> {
        let started = Instant::now();
        self.emit(
            EventKind::TransportConnecting,
            json!({"server": self.name, "kind": self.config.kind(), "target": self.config.target()}),
        )
        .await;

        let active = match self.open_transport() {
            Ok(active) => active,
            Err(err) => {
                self.emit_failure(&err).await;
                return Err(err);
            }
        };

        match self.fetch_tools(&active, self.timeouts.health_check()).await {
            Ok(tools) => {
                log::info!(
                    "connected to '{}' via {} with {} tools",
                    self.name,
                    active.transport.describe(),
                    tools.len()
                );
                self.emit(
                    EventKind::TransportConnected,
                    json!({
                        "server": self.name,
                        "kind": self.config.kind(),
                        "tools": tools.len(),
                        "durationMs": started.elapsed().as_millis() as u64,
                    }),
                )
                .await;
                Ok(active)
            }
            Err(cause) => {
                active.transport.close().await;
                let err = ConduitError::HealthCheckFailed(format!(
                    "'{}' ({}): {}",
                    self.name,
                    active.transport.describe(),
                    cause
                ));
                log::warn!("{}", err);
                self.emit_failure(&err).await;
                Err(err)
            }
        }
    }

    fn open_transport(&self) -> Result<Active> {
        self.config.validate(&self.name)?;
        let (correlator, outbound) = Correlator::new();
        let correlator = Arc::new(correlator);
        let transport: Arc<dyn Transport> = match &self.config {
            TransportConfig::Stdio { command, args, env } => Arc::new(StdioTransport::spawn(
                command,
                args,
                env,
                &self.policy,
                Arc::clone(&correlator),
                outbound,
            )?),
            TransportConfig::Http { url, headers } => Arc::new(HttpTransport::open(
                url,
                headers,
                Arc::clone(&correlator),
                outbound,
            )?),
        };
        Ok(Active { transport, correlator })
    }

    async fn fetch_tools(&self, active: &Active, timeout: Duration) -> Result<Vec<ToolDescriptor>> {
        let result = active
            .correlator
            .send_request(LIST_TOOLS_METHOD, Some(json!({})), timeout)
            .await?;
        let tools = parse_tools(result)?;
        *self.tools.lock().unwrap_or_else(|e| e.into_inner()) = tools.clone();
        Ok(tools)
    }

    fn active(&self) -> Result<Active> {
        match &*self.link() {
            Link::Connected(active) => Ok(active.clone()),
            _ => Err(ConduitError::ConnectionClosed(format!("'{}' is not connected", self.name))),
        }
    }

    /// List the server's tools, connecting first if needed
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.connect().await?;
        let active = self.active()?;
        self.fetch_tools(&active, self.timeouts.request()).await
    }

    /// Invoke a tool, connecting first if needed
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput> {
        self.connect().await?;
        let active = self.active()?;

        let call_id = format!("{}-{}", self.name, self.next_call.fetch_add(1, Ordering::SeqCst));
        self.emit(
            EventKind::ToolCallStarted,
            json!({"callId": call_id, "server": self.name, "tool": tool, "arguments": arguments}),
        )
        .await;

        let started = Instant::now();
        let outcome = active
            .correlator
            .send_request(
                CALL_TOOL_METHOD,
                Some(json!({"name": tool, "arguments": arguments})),
                self.timeouts.request(),
            )
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                let output = ToolOutput::new(tool, result, duration_ms);
                self.emit(
                    EventKind::ToolCallCompleted,
                    json!({
                        "callId": call_id,
                        "server": self.name,
                        "tool": tool,
                        "isError": output.is_error,
                        "results": [output.result.clone()],
                        "durationMs": duration_ms,
                    }),
                )
                .await;
                Ok(output)
            }
            Err(err) => {
                log::warn!("tool '{}' on '{}' failed: {}", tool, self.name, err);
                self.emit(
                    EventKind::ToolCallFailed,
                    json!({
                        "callId": call_id,
                        "server": self.name,
                        "tool": tool,
                        "error": err.to_string(),
                        "durationMs": duration_ms,
                    }),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Tear down the transport, or cancel a connect in flight. Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.link(), Link::Disconnected);
        match previous {
            Link::Connected(active) => {
                active.transport.close().await;
                log::info!("closed connection to '{}'", self.name);
                self.emit(EventKind::TransportDisconnected, json!({"server": self.name})).await;
            }
            Link::Connecting { gate, .. } => {
                gate.mark_failed(self.closed_while_connecting());
            }
            Link::Disconnected => {}
        }
    }

    async fn emit_failure(&self, err: &ConduitError) {
        self.emit(
            EventKind::TransportFailed,
            json!({"server": self.name, "kind": self.config.kind(), "error": err.to_string()}),
        )
        .await;
    }

    async fn emit(&self, kind: EventKind, payload: Value) {
        if let Some((bus, session_id)) = &self.events {
            bus.publish(kind, session_id.clone(), payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, handler_fn};

    #[cfg(unix)]
    const FAKE_SERVER: &str = r##"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
  case "$line" in
    *'"tools/list"'*) printf '{"id":"%s","result":{"tools":[{"name":"echo","description":"Echo input","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"tools/call"'*) printf '{"id":"%s","result":{"content":[{"type":"text","text":"hi"}]}}\n' "$id" ;;
    *) printf '{"id":"%s","error":{"message":"unknown method"}}\n' "$id" ;;
  esac
done
"##;

    fn sh(script: &str) -> TransportConfig {
        TransportConfig::stdio("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn quick() -> ClientTimeouts {
        ClientTimeouts {
            request_ms: 5_000,
            health_check_ms: 2_000,
        }
    }

    fn recorder(bus: &EventBus) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on_any(handler_fn(move |event: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.kind.to_string());
                Ok(())
            }
        }));
        seen
    }

    #[test]
    fn test_parse_tools_shapes() {
        let tools = parse_tools(json!({"tools": [{"name": "a", "inputSchema": {"type": "object"}}]})).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "a");
        assert_eq!(tools[0].input_schema["type"], "object");

        assert_eq!(parse_tools(json!([{"name": "b"}])).unwrap()[0].name, "b");
        assert!(parse_tools(json!({})).unwrap().is_empty());
        assert!(parse_tools(Value::Null).unwrap().is_empty());
        assert!(parse_tools(json!("nope")).is_err());
    }

    #[test]
    fn test_tool_output_text_and_error_flag() {
        let output = ToolOutput::new(
            "echo",
            json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}], "isError": true}),
            3,
        );
        assert!(output.is_error);
        assert_eq!(output.text().as_deref(), Some("a\nb"));
        assert_eq!(ToolOutput::new("x", json!({}), 0).text(), None);
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = ToolClient::new("files", TransportConfig::stdio("true", vec![]));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.cached_tools().is_empty());
        assert_eq!(client.name(), "files");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_check_failure_leaves_client_disconnected() {
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let client = ToolClient::new("dead", sh("exit 0"))
            .with_timeouts(quick())
            .with_events(bus.clone(), "s1");

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ConduitError::HealthCheckFailed(_)), "got {}", err);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        // Not stuck in Connecting: a second attempt runs and fails the same way
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ConduitError::HealthCheckFailed(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "transport.connecting",
                "transport.failed",
                "transport.connecting",
                "transport.failed"
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_and_retryable() {
        let client = ToolClient::new("missing", TransportConfig::stdio("/no/such/server", vec![]));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ConduitError::Transport(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.list_tools().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_spawning() {
        let client = ToolClient::new("blank", TransportConfig::stdio("", vec![]));
        assert!(matches!(client.connect().await, Err(ConduitError::Config(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_list_and_call() {
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let client = ToolClient::new("fake", sh(FAKE_SERVER))
            .with_timeouts(quick())
            .with_events(bus.clone(), "s1");

        // Lazily connects
        let tools = client.list_tools().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].description.as_deref(), Some("Echo input"));
        assert_eq!(client.cached_tools(), tools);

        // Idempotent
        client.connect().await.unwrap();

        let output = client.call_tool("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(output.tool, "echo");
        assert!(!output.is_error);
        assert_eq!(output.text().as_deref(), Some("hi"));

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.close().await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "transport.connecting",
                "transport.connected",
                "tool.call_started",
                "tool.call_completed",
                "transport.disconnected"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_error_from_tool_call() {
        let script = r##"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
  case "$line" in
    *'"tools/list"'*) printf '{"id":"%s","result":{"tools":[]}}\n' "$id" ;;
    *) printf '{"id":"%s","error":{"message":"no such tool"}}\n' "$id" ;;
  esac
done
"##;
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let client = ToolClient::new("strict", sh(script))
            .with_timeouts(quick())
            .with_events(bus.clone(), "s1");

        let err = client.call_tool("missing", json!({})).await.unwrap_err();
        match err {
            ConduitError::Remote { method, message } => {
                assert_eq!(method, CALL_TOOL_METHOD);
                assert_eq!(message, "no such tool");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(seen.lock().unwrap().contains(&"tool.call_failed".to_string()));
        client.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let client = ToolClient::new("fake", sh(FAKE_SERVER))
            .with_timeouts(quick())
            .with_events(bus.clone(), "s1");

        let (a, b, c) = tokio::join!(client.connect(), client.connect(), client.connect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        let connects = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.as_str() == "transport.connecting")
            .count();
        assert_eq!(connects, 1);
        client.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_during_health_check_cancels_connect() {
        let script = format!("sleep 0.3\n{}", FAKE_SERVER);
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let client = ToolClient::new("slow", sh(&script))
            .with_timeouts(quick())
            .with_events(bus.clone(), "s1");

        let (connected, ()) = tokio::join!(client.connect(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(client.state(), ConnectionState::Connecting);
            client.close().await;
            assert_eq!(client.state(), ConnectionState::Disconnected);
        });
        assert!(matches!(connected, Err(ConduitError::ConnectionClosed(_))), "got {:?}", connected);

        // The slow server would have answered by now; the attempt stays cancelled
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["transport.connecting", "transport.failed"]
        );

        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        client.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_exit_is_observed_and_reconnect_works() {
        // Answers the health check, then exits
        let script = r##"
IFS= read -r line
id=$(printf '%s' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
printf '{"id":"%s","result":{"tools":[]}}\n' "$id"
"##;
        let client = ToolClient::new("once", sh(script)).with_timeouts(quick());
        client.connect().await.unwrap();

        for _ in 0..100 {
            if client.state() == ConnectionState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.connect().await.unwrap();
        client.close().await;
    }
}
