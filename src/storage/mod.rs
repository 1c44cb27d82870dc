//! Storage layer for Conduit - the durable, append-only event log.
//!
//! Records are newline-delimited JSON, one object per line, so writers only
//! ever append and readers can resume mid-file.

pub mod event_log;
pub mod reader;
pub mod record;
pub mod sink;

pub use event_log::{EventLog, EventLogConfig, LogLoss, LogStats, LossCallback};
pub use reader::{LogReader, ReadBatch, read_all};
pub use record::{LogRecord, RecordSummary};
pub use sink::{FileSink, LogSink, MemorySink};
