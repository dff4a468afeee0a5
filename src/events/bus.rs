//! Execution progress pub/sub keyed by agent id.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// A single progress update for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub agent_id: String,
    pub execution_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

type Listener = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

struct ListenerEntry {
    agent_id: Option<String>,
    listener: Listener,
}

/// `None` or an empty filter matches every agent.
fn matches(filter: Option<&str>, agent_id: &str) -> bool {
    match filter {
        None => true,
        Some(f) if f.is_empty() => true,
        Some(f) => f == agent_id,
    }
}

/// In-process event bus.
///
/// Callback listeners run synchronously inside `emit_update`; their relative
/// order is unspecified. Stream subscribers go through a broadcast channel
/// and may lag under load.
pub struct EventBus {
    listeners: RwLock<HashMap<u64, ListenerEntry>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tx,
        })
    }

    /// Publish a progress payload for `execution_id` owned by `agent_id`.
    pub fn emit_update(
        &self,
        agent_id: impl Into<String>,
        execution_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> ExecutionEvent {
        let event = ExecutionEvent {
            agent_id: agent_id.into(),
            execution_id: execution_id.into(),
            payload,
            timestamp: Utc::now(),
        };

        // Snapshot matching listeners so a listener may unsubscribe itself.
        let targets: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners
                .values()
                .filter(|entry| matches(entry.agent_id.as_deref(), &event.agent_id))
                .map(|entry| Arc::clone(&entry.listener))
                .collect()
        };
        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(
                    agent_id = %event.agent_id,
                    execution_id = %event.execution_id,
                    "Event listener panicked"
                );
            }
        }

        // ok if nobody is streaming
        let _ = self.tx.send(event.clone());
        event
    }

    /// Register a callback. `None` (or an empty id) receives all events.
    pub fn subscribe<F>(self: &Arc<Self>, agent_id: Option<&str>, listener: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                ListenerEntry {
                    agent_id: agent_id.map(str::to_string),
                    listener: Arc::new(listener),
                },
            );
        debug!(listener_id = id, agent_id = ?agent_id, "Event listener registered");
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    /// Stream events, optionally filtered to one agent.
    pub fn stream(&self, agent_id: Option<String>) -> impl Stream<Item = ExecutionEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| match item {
            Ok(event) if matches(agent_id.as_deref(), &event.agent_id) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event stream subscriber lagged");
                None
            }
        })
    }

    /// Number of registered callback listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn remove(&self, id: u64) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }
}

/// Handle for one registered listener.
///
/// Dropping the handle leaves the listener registered; call `unsubscribe`.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Remove exactly this listener. Returns `false` if already removed.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector() -> (Arc<Mutex<Vec<ExecutionEvent>>>, impl Fn(&ExecutionEvent) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |e: &ExecutionEvent| sink.lock().unwrap().push(e.clone()))
    }

    #[test]
    fn agent_filter() {
        let bus = EventBus::new();
        let (all, all_fn) = collector();
        let (only_a, a_fn) = collector();
        let _s1 = bus.subscribe(None, all_fn);
        let _s2 = bus.subscribe(Some("agent-a"), a_fn);

        bus.emit_update("agent-a", "exec-1", serde_json::json!({"step": 1}));
        bus.emit_update("agent-b", "exec-2", serde_json::json!({"step": 2}));

        assert_eq!(all.lock().unwrap().len(), 2);
        let only_a = only_a.lock().unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].execution_id, "exec-1");
    }

    #[test]
    fn panicking_listener_does_not_reach_publisher() {
        let bus = EventBus::new();
        let _bad = bus.subscribe(None, |_: &ExecutionEvent| panic!("listener bug"));
        let (seen, seen_fn) = collector();
        let _good = bus.subscribe(None, seen_fn);

        bus.emit_update("agent-a", "exec-1", serde_json::json!({"step": 1}));
        bus.emit_update("agent-a", "exec-1", serde_json::json!({"step": 2}));

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn empty_agent_id_receives_everything() {
        let bus = EventBus::new();
        let (seen, f) = collector();
        let _s = bus.subscribe(Some(""), f);
        bus.emit_update("x", "1", serde_json::Value::Null);
        bus.emit_update("y", "2", serde_json::Value::Null);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let bus = EventBus::new();
        let (first, f1) = collector();
        let (second, f2) = collector();
        let s1 = bus.subscribe(None, f1);
        let _s2 = bus.subscribe(None, f2);

        assert!(s1.unsubscribe());
        bus.emit_update("a", "1", serde_json::Value::Null);

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        let event = bus.emit_update("a", "1", serde_json::json!("hello"));
        assert_eq!(event.payload, "hello");
    }

    #[tokio::test]
    async fn stream_filters_by_agent() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.stream(Some("agent-a".to_string())));

        bus.emit_update("agent-b", "skip", serde_json::Value::Null);
        bus.emit_update("agent-a", "keep", serde_json::Value::Null);

        let event = stream.next().await.unwrap();
        assert_eq!(event.execution_id, "keep");
    }

    #[test]
    fn event_serializes_camel_case() {
        let bus = EventBus::new();
        let event = bus.emit_update("a", "e", serde_json::Value::Null);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["agentId"], "a");
        assert_eq!(json["executionId"], "e");
    }
}
