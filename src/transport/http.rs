//! HTTP streaming transport.
//!
//! Every request is its own POST. The reply is read as a server-sent event
//! stream whose `data` payloads are responses; a server that answers with a
//! plain JSON body instead is handled too. An error status rejects only the
//! request its POST carried; a server that cannot be reached at all closes
//! the transport and rejects everything in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest_eventsource::{Error as StreamError, Event, EventSource, retry};
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};

use super::Transport;
use crate::error::{ConduitError, Result};
use crate::rpc::{Correlator, Outbound, RpcRequest, RpcResponse};

/// A tool server reached over HTTP
pub struct HttpTransport {
    url: String,
    open: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    correlator: Arc<Correlator>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .field("open", &self.is_open())
            .finish()
    }
}

impl HttpTransport {
    /// Prepare the client and start draining the outbound queue.
    ///
    /// Nothing is sent until the first request; reachability is established
    /// by the caller's health check.
    pub fn open(
        url: &str,
        headers: &HashMap<String, String>,
        correlator: Arc<Correlator>,
        outbound: Outbound,
    ) -> Result<Self> {
        reqwest::Url::parse(url).map_err(|e| ConduitError::Config(format!("invalid url '{}': {}", url, e)))?;
        let client = build_client(headers)?;
        let open = Arc::new(AtomicBool::new(true));

        let pump = tokio::spawn(pump(
            client,
            url.to_string(),
            outbound,
            Arc::clone(&correlator),
            Arc::clone(&open),
        ));
        log::info!("opened http transport to {}", url);

        Ok(Self {
            url: url.to_string(),
            open,
            pump: Mutex::new(Some(pump)),
            correlator,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the pump's JoinSet aborts every in-flight stream
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        self.correlator.reject_all(&format!("transport to {} closed", self.url));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        self.correlator.reject_all(&format!("transport to {} dropped", self.url));
    }
}

/// How far a failed POST reaches
enum Failure {
    /// The server answered, but not with a usable reply for this request
    Request(ConduitError),
    /// The server could not be reached or the connection broke
    Link(ConduitError),
}

fn build_client(headers: &HashMap<String, String>) -> Result<Client> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConduitError::Config(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ConduitError::Config(format!("invalid value for header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Client::builder()
        .default_headers(map)
        .build()
        .map_err(|e| ConduitError::Transport(format!("failed to build http client: {}", e)))
}

async fn pump(client: Client, url: String, mut outbound: Outbound, correlator: Arc<Correlator>, open: Arc<AtomicBool>) {
    let mut streams = JoinSet::new();
    loop {
        tokio::select! {
            request = outbound.recv() => match request {
                Some(request) => {
                    streams.spawn(post(
                        client.clone(),
                        url.clone(),
                        request,
                        Arc::clone(&correlator),
                        Arc::clone(&open),
                    ));
                }
                None => break,
            },
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
        }
    }
    open.store(false, Ordering::SeqCst);
}

async fn post(client: Client, url: String, request: RpcRequest, correlator: Arc<Correlator>, open: Arc<AtomicBool>) {
    match stream_reply(&client, &url, &request, &correlator).await {
        Ok(()) => {}
        Err(Failure::Request(e)) => {
            log::warn!("request '{}' to {} failed: {}", request.method, url, e);
            correlator.reject_request(&request.id, e);
            return;
        }
        Err(Failure::Link(e)) => {
            log::warn!("lost {} during '{}': {}", url, request.method, e);
            open.store(false, Ordering::SeqCst);
            correlator.reject_request(&request.id, e);
            correlator.reject_all(&format!("{} is unreachable", url));
            return;
        }
    }
    if correlator.is_pending(&request.id) {
        correlator.reject_request(
            &request.id,
            ConduitError::ConnectionClosed(format!(
                "{} ended the reply to '{}' without a response",
                url, request.method
            )),
        );
    }
}

async fn stream_reply(
    client: &Client,
    url: &str,
    request: &RpcRequest,
    correlator: &Correlator,
) -> std::result::Result<(), Failure> {
    let builder = client.post(url).json(request);
    let mut source = EventSource::new(builder).map_err(|e| {
        Failure::Request(ConduitError::Transport(format!("cannot stream '{}': {}", request.method, e)))
    })?;
    source.set_retry_policy(Box::new(retry::Never));

    let mut outcome = Ok(());
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => log::trace!("stream open for '{}' (id {})", request.method, request.id),
            Ok(Event::Message(message)) => {
                if let Err(e) = dispatch_payload(&message.data, correlator) {
                    log::debug!("ignoring malformed event from {}: {}", url, e);
                }
            }
            Err(StreamError::StreamEnded) => break,
            Err(StreamError::InvalidContentType(_, response)) => {
                outcome = match response.text().await {
                    Ok(body) => dispatch_payload(&body, correlator)
                        .map(|_| ())
                        .map_err(Failure::Request),
                    Err(e) => Err(Failure::Link(ConduitError::Transport(format!(
                        "failed to read body from {}: {}",
                        url, e
                    )))),
                };
                break;
            }
            Err(StreamError::InvalidStatusCode(status, response)) => {
                let body = response.text().await.unwrap_or_default();
                outcome = Err(Failure::Request(ConduitError::Transport(format!(
                    "{} answered {}: {}",
                    url,
                    status,
                    body.trim()
                ))));
                break;
            }
            Err(StreamError::Transport(e)) => {
                outcome = Err(Failure::Link(ConduitError::Transport(format!(
                    "request to {} failed: {}",
                    url, e
                ))));
                break;
            }
            Err(e) => {
                outcome = Err(Failure::Request(ConduitError::Transport(format!(
                    "stream from {} failed: {}",
                    url, e
                ))));
                break;
            }
        }
    }
    source.close();
    outcome
}

/// Dispatch a response, or a batch of them, from one payload.
///
/// Returns how many were matched to a pending request.
pub fn dispatch_payload(text: &str, correlator: &Correlator) -> Result<usize> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    let messages = match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => items,
        single => vec![single],
    };
    let mut matched = 0;
    for message in messages {
        if let Some(response) = RpcResponse::from_value(message)? {
            if correlator.dispatch(response) {
                matched += 1;
            }
        }
    }
    Ok(matched)
}
