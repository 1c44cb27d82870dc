//! In-process publish/subscribe hub.
//!
//! Handlers are async and run sequentially per publish call: first the
//! handlers registered for the event's kind, then the wildcard handlers, each
//! group in registration order. `publish` returns once every handler it
//! invoked has finished, so a producer knows logging was attempted before it
//! continues.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use super::types::{Event, EventKind};
use crate::error::{ConduitError, Result};

/// A bus subscriber
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Shared handler reference; identity is the `Arc` allocation
pub type HandlerRef = Arc<dyn EventHandler>;

/// Callback for failures isolated by the bus
pub type ErrorReporter = Arc<dyn Fn(&Event, &ConduitError) + Send + Sync>;

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a handler reference
pub fn handler_fn<F, Fut>(f: F) -> HandlerRef
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Outcome of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers that completed successfully
    pub delivered: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<HandlerRef>>,
    any: Vec<HandlerRef>,
}

struct BusInner {
    registry: RwLock<Registry>,
    reporter: Option<ErrorReporter>,
}

/// Event bus handle. Cloning shares the same subscriber lists.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("any_handlers", &self.any_handler_count())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn same_handler(a: &HandlerRef, b: &HandlerRef) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

impl EventBus {
    /// Create a bus that only logs handler failures
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(Registry::default()),
                reporter: None,
            }),
        }
    }

    /// Create a bus that also reports handler failures to `reporter`
    pub fn with_error_reporter(reporter: ErrorReporter) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(Registry::default()),
                reporter: Some(reporter),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a handler for one kind. Returns `false` if already registered.
    pub fn subscribe(&self, kind: impl Into<EventKind>, handler: HandlerRef) -> bool {
        let mut registry = self.write();
        let handlers = registry.by_kind.entry(kind.into()).or_default();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    /// Remove a kind handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, kind: impl Into<EventKind>, handler: &HandlerRef) -> bool {
        let kind = kind.into();
        let mut registry = self.write();
        let Some(handlers) = registry.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.by_kind.remove(&kind);
        }
        removed
    }

    /// Register a wildcard handler. Returns `false` if already registered.
    pub fn on_any(&self, handler: HandlerRef) -> bool {
        let mut registry = self.write();
        if registry.any.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        registry.any.push(handler);
        true
    }

    /// Remove a wildcard handler. Returns `false` if it was not registered.
    pub fn off_any(&self, handler: &HandlerRef) -> bool {
        let mut registry = self.write();
        let before = registry.any.len();
        registry.any.retain(|h| !same_handler(h, handler));
        registry.any.len() != before
    }

    pub fn handler_count(&self, kind: impl Into<EventKind>) -> usize {
        self.read().by_kind.get(&kind.into()).map_or(0, Vec::len)
    }

    pub fn any_handler_count(&self) -> usize {
        self.read().any.len()
    }

    /// Build an event stamped now and deliver it
    pub async fn publish(
        &self,
        kind: impl Into<EventKind>,
        session_id: impl Into<String>,
        payload: Value,
    ) -> PublishReport {
        self.publish_event(Event::new(kind, session_id, payload)).await
    }

    /// Deliver an event to every handler registered at call time
    pub async fn publish_event(&self, event: Event) -> PublishReport {
        // Snapshot so no lock is held while handlers run
        let handlers: Vec<HandlerRef> = {
            let registry = self.read();
            registry
                .by_kind
                .get(&event.kind)
                .into_iter()
                .flatten()
                .chain(registry.any.iter())
                .cloned()
                .collect()
        };

        let mut report = PublishReport::default();
        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(&event)).catch_unwind().await;
            let result = outcome.unwrap_or_else(|panic| Err(ConduitError::Handler(panic_message(panic.as_ref()))));
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    let err = match err {
                        ConduitError::Handler(_) => err,
                        other => ConduitError::Handler(other.to_string()),
                    };
                    log::warn!("event handler failed for {}: {}", event.kind, err);
                    if let Some(reporter) = &self.inner.reporter {
                        reporter(&event, &err);
                    }
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(name: &'static str, seen: Arc<Mutex<Vec<String>>>) -> HandlerRef {
        handler_fn(move |event: Event| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(format!("{}:{}", name, event.kind));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_kind_handlers_then_wildcards_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.on_any(recorder("any1", seen.clone()));
        bus.subscribe(EventKind::ToolCallStarted, recorder("k1", seen.clone()));
        bus.subscribe(EventKind::ToolCallStarted, recorder("k2", seen.clone()));
        bus.on_any(recorder("any2", seen.clone()));

        let report = bus.publish(EventKind::ToolCallStarted, "s1", json!({})).await;

        assert_eq!(report.delivered, 4);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "k1:tool.call_started",
                "k2:tool.call_started",
                "any1:tool.call_started",
                "any2:tool.call_started"
            ]
        );
    }

    #[tokio::test]
    async fn test_kind_handler_only_sees_its_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::SessionStarted, recorder("k", seen.clone()));

        bus.publish(EventKind::SessionEnded, "s1", json!({})).await;
        bus.publish(EventKind::SessionStarted, "s1", json!({})).await;

        assert_eq!(*seen.lock().unwrap(), vec!["k:session.started"]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_tracked_once() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("h", seen.clone());

        assert!(bus.subscribe("custom.kind", handler.clone()));
        assert!(!bus.subscribe("custom.kind", handler.clone()));
        assert!(bus.on_any(handler.clone()));
        assert!(!bus.on_any(handler.clone()));

        bus.publish("custom.kind", "s1", json!({})).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(bus.handler_count("custom.kind"), 1);
        assert_eq!(bus.any_handler_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_off_any() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("h", seen.clone());

        bus.subscribe(EventKind::AppReady, handler.clone());
        bus.on_any(handler.clone());
        assert!(bus.unsubscribe(EventKind::AppReady, &handler));
        assert!(!bus.unsubscribe(EventKind::AppReady, &handler));
        assert!(bus.off_any(&handler));
        assert!(!bus.off_any(&handler));

        let report = bus.publish(EventKind::AppReady, "s1", json!({})).await;
        assert_eq!(report, PublishReport::default());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let reported_clone = reported.clone();
        let bus = EventBus::with_error_reporter(Arc::new(move |event: &Event, err: &ConduitError| {
            reported_clone.lock().unwrap().push(format!("{}|{}", event.kind, err));
        }));
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.on_any(handler_fn(|_event: Event| async {
            Err::<(), _>(ConduitError::Transport("sink down".to_string()))
        }));
        bus.on_any(recorder("after", seen.clone()));

        let report = bus.publish(EventKind::SessionStarted, "s1", json!({})).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.is_clean());
        assert_eq!(*seen.lock().unwrap(), vec!["after:session.started"]);
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].starts_with("session.started|Handler error:"));
        assert!(reported[0].contains("sink down"));
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _event: &Event) -> Result<()> {
            panic!("subscriber bug")
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.on_any(Arc::new(Panicking));
        bus.on_any(recorder("after", seen.clone()));

        let report = bus.publish(EventKind::SessionStarted, "s1", json!({})).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_waits_for_slow_handlers() {
        let bus = EventBus::new();
        let done = Arc::new(Mutex::new(false));
        let done_clone = done.clone();
        bus.on_any(handler_fn(move |_event: Event| {
            let done = done_clone.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                *done.lock().unwrap() = true;
                Ok(())
            }
        }));

        bus.publish(EventKind::AppReady, "s1", json!({})).await;
        assert!(*done.lock().unwrap());
    }

    #[tokio::test]
    async fn test_handler_registered_during_publish_misses_that_event() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let late = recorder("late", seen.clone());
        let bus_clone = bus.clone();
        bus.on_any(handler_fn(move |_event: Event| {
            let bus = bus_clone.clone();
            let late = late.clone();
            async move {
                bus.on_any(late);
                Ok(())
            }
        }));

        bus.publish("first", "s1", json!({})).await;
        assert!(seen.lock().unwrap().is_empty());

        bus.publish("second", "s1", json!({})).await;
        assert_eq!(*seen.lock().unwrap(), vec!["late:second"]);
    }

    #[tokio::test]
    async fn test_each_handler_observes_event_exactly_once() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.on_any(recorder("a", seen.clone()));

        for i in 0..10 {
            bus.publish(format!("kind.{}", i).as_str(), "s1", json!({ "n": i })).await;
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[3], "a:kind.3");
    }
}
