//! Per-agent registry of live output sinks (streaming transports).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::EventBus;

/// Receiving end is owned by the transport (e.g. an SSE response body).
pub type ClientSink = mpsc::UnboundedSender<String>;

/// Identifier for one registered sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame a payload as a server-sent event.
pub fn frame<T: Serialize + ?Sized>(data: &T) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(data)?))
}

/// Connection registry.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, HashMap<ClientId, ClientSink>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_client(&self, agent_id: &str, sink: ClientSink) -> ClientId {
        let id = ClientId(Uuid::new_v4());
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(agent_id.to_string())
            .or_default()
            .insert(id, sink);
        debug!(agent_id, client_id = %id, "Client registered");
        id
    }

    /// Returns `false` if the client was not registered.
    pub fn remove_client(&self, agent_id: &str, client_id: ClientId) -> bool {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        let Some(set) = clients.get_mut(agent_id) else {
            return false;
        };
        let removed = set.remove(&client_id).is_some();
        if set.is_empty() {
            clients.remove(agent_id);
        }
        removed
    }

    /// Write a framed message to every sink registered for `agent_id`.
    ///
    /// Returns the number of sinks written. Closed sinks are pruned.
    pub fn broadcast<T: Serialize + ?Sized>(&self, agent_id: &str, data: &T) -> usize {
        let message = match frame(data) {
            Ok(m) => m,
            Err(e) => {
                warn!(agent_id, error = %e, "Failed to serialize broadcast payload");
                return 0;
            }
        };

        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        let Some(set) = clients.get_mut(agent_id) else {
            return 0;
        };

        let mut delivered = 0;
        set.retain(|client_id, sink| match sink.send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                debug!(agent_id, client_id = %client_id, "Pruning closed client");
                false
            }
        });
        if set.is_empty() {
            clients.remove(agent_id);
        }
        delivered
    }

    pub fn client_count(&self, agent_id: &str) -> usize {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .map_or(0, HashMap::len)
    }
}

/// Relay every bus event to the registry's sinks for that event's agent.
pub fn forward_to_registry(bus: &EventBus, registry: Arc<ConnectionRegistry>) -> JoinHandle<()> {
    let mut events = Box::pin(bus.stream(None));
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            registry.broadcast(&event.agent_id, &event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_sse() {
        let framed = frame(&serde_json::json!({"ok": true})).unwrap();
        assert_eq!(framed, "data: {\"ok\":true}\n\n");
    }

    #[test]
    fn broadcast_reaches_only_agent_clients() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.add_client("a", tx_a);
        registry.add_client("b", tx_b);

        assert_eq!(registry.broadcast("a", &serde_json::json!({"n": 1})), 1);
        assert_eq!(rx_a.try_recv().unwrap(), "data: {\"n\":1}\n\n");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn broadcast_to_missing_agent_is_noop() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.broadcast("nobody", &"x"), 0);
    }

    #[test]
    fn closed_sinks_are_pruned() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add_client("a", tx);
        drop(rx);

        assert_eq!(registry.broadcast("a", &"x"), 0);
        assert_eq!(registry.client_count("a"), 0);
    }

    #[test]
    fn remove_client() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.add_client("a", tx);
        assert!(registry.remove_client("a", id));
        assert!(!registry.remove_client("a", id));
        assert_eq!(registry.client_count("a"), 0);
    }

    #[tokio::test]
    async fn forwards_bus_events() {
        let bus = EventBus::new();
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.add_client("agent-1", tx);

        let handle = forward_to_registry(&bus, Arc::clone(&registry));
        bus.emit_update("agent-1", "exec-1", serde_json::json!({"status": "running"}));

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.starts_with("data: "));
        assert!(msg.contains("\"executionId\":\"exec-1\""));
        handle.abort();
    }
}
