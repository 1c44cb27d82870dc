//! Request correlator.
//!
//! Tracks requests sent to a tool server until a response with the same id
//! arrives or the request's own timer fires. The pending map is only touched
//! under a short `std::sync::Mutex` section; timers, channel sends and
//! outbound I/O all happen after the lock is released.
//!
//! Outbound requests go into a bounded queue that the transport drains, so
//! the correlator never holds a reference to the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::messages::{RpcRequest, RpcResponse};
use crate::error::{ConduitError, Result};

/// Default outbound queue depth
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Receiving end of the outbound queue, drained by a transport
pub type Outbound = mpsc::Receiver<RpcRequest>;

/// A request awaiting its response
struct PendingRequest {
    method: String,
    sender: oneshot::Sender<Result<Value>>,
    timer: Option<JoinHandle<()>>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle for one in-flight request
#[derive(Debug)]
pub struct PendingCall {
    id: String,
    method: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response, the timeout, or connection teardown
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ConduitError::ConnectionClosed(format!(
                "request '{}' (id {}) was dropped without a response",
                self.method, self.id
            ))),
        }
    }
}

/// Matches asynchronous responses to requests by id
pub struct Correlator {
    pending: PendingMap,
    next_id: AtomicU64,
    outbound: mpsc::Sender<RpcRequest>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

impl Correlator {
    /// Create a correlator and the outbound queue its transport must drain
    pub fn new() -> (Self, Outbound) {
        Self::with_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, Outbound) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let correlator = Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            outbound,
        };
        (correlator, rx)
    }

    /// Allocate an id, record the request, arm its timer and queue it for
    /// transmission.
    pub async fn start_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<PendingCall> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();

        lock(&self.pending).insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                sender: tx,
                timer: None,
            },
        );

        let timer = tokio::spawn(expire(
            Arc::clone(&self.pending),
            id.clone(),
            method.to_string(),
            timeout,
        ));
        {
            let mut pending = lock(&self.pending);
            match pending.get_mut(&id) {
                Some(entry) => entry.timer = Some(timer),
                None => timer.abort(),
            }
        }

        let request = RpcRequest::new(id.clone(), method, params);
        if self.outbound.send(request).await.is_err() {
            self.take(&id);
            return Err(ConduitError::ConnectionClosed(format!(
                "transport is not accepting requests ('{}')",
                method
            )));
        }
        log::trace!("sent request '{}' (id {})", method, id);

        Ok(PendingCall {
            id,
            method: method.to_string(),
            rx,
        })
    }

    /// Send a request and wait for its outcome
    pub async fn send_request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        self.start_request(method, params, timeout).await?.wait().await
    }

    /// Remove a pending entry and cancel its timer
    fn take(&self, id: &str) -> Option<PendingRequest> {
        let entry = lock(&self.pending).remove(id);
        entry.map(|mut entry| {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry
        })
    }

    /// Settle a request successfully. Unknown or settled ids are a no-op.
    pub fn resolve_request(&self, id: &str, value: Value) -> bool {
        match self.take(id) {
            Some(entry) => {
                let _ = entry.sender.send(Ok(value));
                true
            }
            None => {
                log::debug!("ignoring result for unknown request id {}", id);
                false
            }
        }
    }

    /// Settle a request with an error. Unknown or settled ids are a no-op.
    pub fn reject_request(&self, id: &str, err: ConduitError) -> bool {
        match self.take(id) {
            Some(entry) => {
                let _ = entry.sender.send(Err(err));
                true
            }
            None => {
                log::debug!("ignoring error for unknown request id {}", id);
                false
            }
        }
    }

    /// Route an inbound response to its request
    pub fn dispatch(&self, response: RpcResponse) -> bool {
        let Some(entry) = self.take(&response.id) else {
            log::debug!("ignoring response for unknown request id {}", response.id);
            return false;
        };
        let outcome = match response.error {
            Some(error) => Err(ConduitError::Remote {
                method: entry.method,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = entry.sender.send(outcome);
        true
    }

    /// Reject every pending request with `ConnectionClosed`.
    ///
    /// Returns how many requests were rejected.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingRequest)> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (id, mut entry) in drained {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            let _ = entry.sender.send(Err(ConduitError::ConnectionClosed(format!(
                "{} (request '{}', id {})",
                reason, entry.method, id
            ))));
        }
        if count > 0 {
            log::info!("rejected {} pending requests: {}", count, reason);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.pending).contains_key(id)
    }

    /// Pending ids in allocation order
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.pending).keys().cloned().collect();
        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
        ids
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.reject_all("correlator dropped");
    }
}

async fn expire(pending: PendingMap, id: String, method: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let entry = lock(&pending).remove(&id);
    if let Some(entry) = entry {
        let err = ConduitError::Timeout {
            method,
            id,
            timeout_ms: timeout.as_millis() as u64,
        };
        log::warn!("{}", err);
        let _ = entry.sender.send(Err(err));
    }
}
