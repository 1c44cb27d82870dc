//! Durable buffered event log.
//!
//! Subscribes to the bus as a wildcard handler and turns every event into a
//! [`LogRecord`]. Records are buffered and written in batches: a batch is
//! flushed as soon as the buffer reaches `max_buffered_records`, or
//! `max_buffer_age_ms` after its first record arrived, whichever comes first.
//!
//! A record that cannot be committed is never dropped silently. It is handed
//! to the loss callback together with the reason, and the log keeps going.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{LogRecord, RecordSummary};
use super::sink::{FileSink, LogSink};
use crate::error::{ConduitError, Result};
use crate::events::{Event, EventBus, EventHandler, HandlerRef};
use crate::id;

/// Most calls tracked for duration derivation; the oldest start is evicted
/// past this
pub const MAX_OPEN_CALLS: usize = 1024;

/// Buffering policy and location of the event log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub dir: PathBuf,
    pub max_buffered_records: usize,
    pub max_buffer_age_ms: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("conduit")
                .join("events"),
            max_buffered_records: 50,
            max_buffer_age_ms: 1000,
        }
    }
}

impl EventLogConfig {
    /// Log file for a workspace: `{dir}/{workspace_id}/events.jsonl`
    pub fn path_for(&self, workspace_id: &str) -> PathBuf {
        self.dir.join(workspace_id).join("events.jsonl")
    }
}

/// A record that could not be committed
#[derive(Debug, Clone)]
pub struct LogLoss {
    pub record: RecordSummary,
    pub error: ConduitError,
}

/// Diagnostic callback for lost records
pub type LossCallback = Arc<dyn Fn(LogLoss) + Send + Sync>;

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub written: u64,
    pub lost: u64,
    pub buffered: usize,
}

#[derive(Default)]
struct Buffer {
    records: Vec<LogRecord>,
    /// Bumped on every flush so a stale age timer can tell its batch is gone
    generation: u64,
    /// callId -> start timestamp of calls still open
    call_starts: HashMap<String, u64>,
    closed: bool,
}

struct LogCore {
    workspace_id: String,
    max_records: usize,
    max_age: Duration,
    buffer: Mutex<Buffer>,
    sink: Mutex<Box<dyn LogSink>>,
    on_loss: LossCallback,
    written: AtomicU64,
    lost: AtomicU64,
    this: Weak<LogCore>,
}

fn as_log_write(err: ConduitError) -> ConduitError {
    match err {
        ConduitError::LogWrite(_) => err,
        other => ConduitError::LogWrite(other.to_string()),
    }
}

impl LogCore {
    fn lock_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sink(&self) -> MutexGuard<'_, Box<dyn LogSink>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn derive_duration(buffer: &mut Buffer, event: &Event, max_open: usize) -> u64 {
        let derived = match event.call_id() {
            Some(call_id) if event.kind.is_call_start() => {
                if !buffer.call_starts.contains_key(call_id) && buffer.call_starts.len() >= max_open {
                    let oldest = buffer
                        .call_starts
                        .iter()
                        .min_by_key(|(_, started)| **started)
                        .map(|(id, _)| id.clone());
                    if let Some(oldest) = oldest {
                        log::debug!("call {} never finished, no longer tracking it", oldest);
                        buffer.call_starts.remove(&oldest);
                    }
                }
                buffer.call_starts.insert(call_id.to_string(), event.timestamp);
                0
            }
            Some(call_id) if event.kind.is_call_end() => buffer
                .call_starts
                .remove(call_id)
                .map(|started| event.timestamp.saturating_sub(started))
                .unwrap_or(0),
            _ => 0,
        };
        event
            .payload
            .get("durationMs")
            .and_then(Value::as_u64)
            .unwrap_or(derived)
    }

    /// Write the event inline, flushing on the caller's thread if the batch
    /// is full
    fn append(&self, event: &Event) -> Result<()> {
        if self.buffer_event(event)? {
            self.flush(None)?;
        }
        Ok(())
    }

    /// Buffer the event and arm the age timer. Returns whether the batch is
    /// full and must be flushed now.
    fn buffer_event(&self, event: &Event) -> Result<bool> {
        let (flush_now, arm_generation) = {
            let mut buffer = self.lock_buffer();
            if buffer.closed {
                drop(buffer);
                let err = ConduitError::LogWrite("event log is closed".to_string());
                let record = LogRecord::from_event(event, &self.workspace_id, 0);
                self.report_loss(vec![record.summary()], &err);
                return Err(err);
            }

            let duration = Self::derive_duration(&mut buffer, event, MAX_OPEN_CALLS);
            buffer
                .records
                .push(LogRecord::from_event(event, &self.workspace_id, duration));

            let len = buffer.records.len();
            let flush_now = len >= self.max_records;
            let arm = (!flush_now && len == 1).then_some(buffer.generation);
            (flush_now, arm)
        };

        if let Some(generation) = arm_generation {
            self.arm_timer(generation);
        }
        Ok(flush_now)
    }

    fn arm_timer(&self, generation: u64) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let this = self.this.clone();
                let max_age = self.max_age;
                handle.spawn(async move {
                    tokio::time::sleep(max_age).await;
                    if let Some(core) = this.upgrade() {
                        // Failures were already reported through the loss callback
                        let _ = tokio::task::spawn_blocking(move || core.flush(Some(generation))).await;
                    }
                });
            }
            Err(_) => {
                log::debug!("no async runtime for the age timer, flushing immediately");
                let _ = self.flush(None);
            }
        }
    }

    /// Write the buffered batch. With `Some(generation)` only the batch that
    /// generation refers to is flushed.
    fn flush(&self, generation: Option<u64>) -> Result<usize> {
        // Sink lock first so batches reach the sink in the order they were taken
        let mut sink = self.lock_sink();
        let batch = {
            let mut buffer = self.lock_buffer();
            if generation.is_some_and(|g| g != buffer.generation) || buffer.records.is_empty() {
                return Ok(0);
            }
            buffer.generation += 1;
            std::mem::take(&mut buffer.records)
        };

        let mut lines = Vec::with_capacity(batch.len());
        let mut summaries = Vec::with_capacity(batch.len());
        let mut unserializable = Vec::new();
        for record in &batch {
            match serde_json::to_string(record) {
                Ok(line) => {
                    lines.push(line);
                    summaries.push(record.summary());
                }
                Err(e) => unserializable.push((record.summary(), e)),
            }
        }

        let write_result = if lines.is_empty() {
            Ok(())
        } else {
            sink.write_batch(&lines)
        };
        drop(sink);

        for (summary, e) in unserializable {
            let err = ConduitError::LogWrite(format!("serialization failed: {}", e));
            self.report_loss(vec![summary], &err);
        }

        match write_result {
            Ok(()) => {
                self.written.fetch_add(lines.len() as u64, Ordering::SeqCst);
                log::trace!("event log flushed {} records", lines.len());
                Ok(lines.len())
            }
            Err(err) => {
                let err = as_log_write(err);
                self.report_loss(summaries, &err);
                Err(err)
            }
        }
    }

    /// Close the buffer, write what is left and close the sink
    fn finish(&self) -> Result<()> {
        self.lock_buffer().closed = true;
        let flushed = self.flush(None);
        let closed = self.lock_sink().close().map_err(as_log_write);
        flushed?;
        closed
    }

    fn report_loss(&self, summaries: Vec<RecordSummary>, err: &ConduitError) {
        for summary in summaries {
            self.lost.fetch_add(1, Ordering::SeqCst);
            log::warn!("event log lost record {}: {}", summary, err);
            (self.on_loss)(LogLoss {
                record: summary,
                error: err.clone(),
            });
        }
    }
}

#[async_trait]
impl EventHandler for LogCore {
    async fn handle(&self, event: &Event) -> Result<()> {
        // Losses are surfaced through the callback, never to the bus
        if let Ok(true) = self.buffer_event(event) {
            if let Some(core) = self.this.upgrade() {
                if let Err(e) = tokio::task::spawn_blocking(move || core.flush(None)).await {
                    log::warn!("event log flush task failed: {}", e);
                }
            }
        }
        Ok(())
    }
}

/// Buffered, append-only event log attached to an [`EventBus`].
pub struct EventLog {
    core: Arc<LogCore>,
    bus: EventBus,
    handler: HandlerRef,
    disposed: AtomicBool,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("workspace_id", &self.core.workspace_id)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl EventLog {
    /// Create a log writing to `sink` and subscribe it to every event on `bus`.
    pub fn attach(
        bus: &EventBus,
        workspace_id: impl Into<String>,
        config: &EventLogConfig,
        sink: Box<dyn LogSink>,
        on_loss: LossCallback,
    ) -> Self {
        let core = Arc::new_cyclic(|this| LogCore {
            workspace_id: workspace_id.into(),
            max_records: config.max_buffered_records.max(1),
            max_age: Duration::from_millis(config.max_buffer_age_ms),
            buffer: Mutex::new(Buffer::default()),
            sink: Mutex::new(sink),
            on_loss,
            written: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            this: this.clone(),
        });
        let handler: HandlerRef = core.clone();
        bus.on_any(handler.clone());

        Self {
            core,
            bus: bus.clone(),
            handler,
            disposed: AtomicBool::new(false),
        }
    }

    /// Open the JSONL log for a workspace directory and attach it to `bus`.
    pub fn open_for_workspace(
        bus: &EventBus,
        workspace: impl AsRef<Path>,
        config: &EventLogConfig,
        on_loss: LossCallback,
    ) -> Result<Self> {
        let workspace_id = id::workspace_id(workspace);
        let path = config.path_for(&workspace_id);
        let sink = FileSink::open(&path)?;
        log::info!("Event log for workspace {} at {}", workspace_id, path.display());
        Ok(Self::attach(bus, workspace_id, config, Box::new(sink), on_loss))
    }

    pub fn workspace_id(&self) -> &str {
        &self.core.workspace_id
    }

    pub fn is_closed(&self) -> bool {
        self.core.lock_buffer().closed
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            written: self.core.written.load(Ordering::SeqCst),
            lost: self.core.lost.load(Ordering::SeqCst),
            buffered: self.core.lock_buffer().records.len(),
        }
    }

    /// Append an event directly, bypassing the bus.
    ///
    /// Fails with `LogWrite` once the log is disposed; the loss callback is
    /// invoked as well.
    pub fn write(&self, event: &Event) -> Result<()> {
        self.core.append(event)
    }

    /// Write whatever is buffered now. Returns the number of records written.
    pub async fn flush(&self) -> Result<usize> {
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || core.flush(None))
            .await
            .map_err(|e| ConduitError::LogWrite(format!("flush task failed: {}", e)))?
    }

    /// Final flush, then close the sink. Idempotent.
    ///
    /// The log stays subscribed so events published afterwards are reported
    /// through the loss callback instead of vanishing.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || core.finish())
            .await
            .map_err(|e| ConduitError::LogWrite(format!("final flush task failed: {}", e)))?
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.bus.off_any(&self.handler);
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.core.finish() {
            log::warn!("event log final flush on drop failed: {}", e);
        }
    }
}
