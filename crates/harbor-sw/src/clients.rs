//! Connected clients and message delivery.
//!
//! Delivery is at-most-once per currently connected client. Nothing is queued
//! for clients that are gone; a client whose channel is closed is pruned the
//! first time a post to it fails.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::ServiceWorkerError;

/// Opaque identifier of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

/// A connected execution context of the hosted application.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Worker currently controlling this client, if any.
    pub controller: Option<String>,
}

/// Messages the core sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    SyncRequest {
        timestamp: u64,
    },
    UpdateAvailable {
        version: String,
    },
    Ack {
        command: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// The set of clients the core can reach.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Snapshot of currently connected clients.
    async fn clients(&self) -> Vec<Client>;

    /// Deliver a message to one client.
    async fn post(&self, id: &ClientId, message: ClientMessage) -> Result<(), ServiceWorkerError>;

    /// Deliver a message to every connected client. Returns how many received it.
    async fn broadcast(&self, message: ClientMessage) -> usize {
        let mut delivered = 0;
        for client in self.clients().await {
            match self.post(&client.id, message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(client = %client.id, error = %e, "Broadcast delivery failed"),
            }
        }
        delivered
    }

    /// Make `controller` the controller of every connected client.
    async fn claim(&self, controller: &str) -> Result<usize, ServiceWorkerError>;

    /// Open a new window client.
    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError>;

    /// Focus a window client.
    async fn focus(&self, id: &ClientId) -> Result<(), ServiceWorkerError>;
}

struct Connection {
    client: Client,
    tx: mpsc::UnboundedSender<ClientMessage>,
}

/// Channel-backed client registry.
#[derive(Default)]
pub struct InMemoryClients {
    connections: RwLock<HashMap<ClientId, Connection>>,
    /// Receivers for windows opened by the core, waiting for the host to pick up.
    opened: RwLock<HashMap<ClientId, mpsc::UnboundedReceiver<ClientMessage>>>,
}

impl InMemoryClients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client; the receiver yields every message posted to it.
    pub async fn connect(
        &self,
        url: Url,
        client_type: ClientType,
    ) -> (ClientId, mpsc::UnboundedReceiver<ClientMessage>) {
        let id = ClientId::generate();
        let rx = self.insert(id.clone(), url, client_type, false).await;
        (id, rx)
    }

    /// Remove a client.
    pub async fn disconnect(&self, id: &ClientId) -> Option<Client> {
        self.opened.write().await.remove(id);
        self.connections
            .write()
            .await
            .remove(id)
            .map(|conn| conn.client)
    }

    /// Take the receiver of a window opened through [`ClientRegistry::open_window`].
    pub async fn take_opened(&self, id: &ClientId) -> Option<mpsc::UnboundedReceiver<ClientMessage>> {
        self.opened.write().await.remove(id)
    }

    /// Look up a client.
    pub async fn get(&self, id: &ClientId) -> Option<Client> {
        self.connections
            .read()
            .await
            .get(id)
            .map(|conn| conn.client.clone())
    }

    async fn insert(
        &self,
        id: ClientId,
        url: Url,
        client_type: ClientType,
        focused: bool,
    ) -> mpsc::UnboundedReceiver<ClientMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client {
            id: id.clone(),
            url,
            client_type,
            focused,
            controller: None,
        };
        debug!(client = %id, url = %client.url, "Client connected");
        self.connections
            .write()
            .await
            .insert(id, Connection { client, tx });
        rx
    }
}

#[async_trait]
impl ClientRegistry for InMemoryClients {
    async fn clients(&self) -> Vec<Client> {
        self.connections
            .read()
            .await
            .values()
            .map(|conn| conn.client.clone())
            .collect()
    }

    async fn post(&self, id: &ClientId, message: ClientMessage) -> Result<(), ServiceWorkerError> {
        let mut connections = self.connections.write().await;
        let conn = connections
            .get(id)
            .ok_or_else(|| ServiceWorkerError::ClientGone(id.to_string()))?;

        if conn.tx.send(message).is_err() {
            connections.remove(id);
            debug!(client = %id, "Pruned disconnected client");
            return Err(ServiceWorkerError::ClientGone(id.to_string()));
        }
        trace!(client = %id, "Message posted");
        Ok(())
    }

    async fn claim(&self, controller: &str) -> Result<usize, ServiceWorkerError> {
        let mut connections = self.connections.write().await;
        for conn in connections.values_mut() {
            conn.client.controller = Some(controller.to_string());
        }
        Ok(connections.len())
    }

    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError> {
        let id = ClientId::generate();
        let rx = self.insert(id.clone(), url.clone(), ClientType::Window, true).await;
        self.opened.write().await.insert(id.clone(), rx);
        self.get(&id)
            .await
            .ok_or_else(|| ServiceWorkerError::ClientGone(id.to_string()))
    }

    async fn focus(&self, id: &ClientId) -> Result<(), ServiceWorkerError> {
        let mut connections = self.connections.write().await;
        let conn = connections
            .get_mut(id)
            .ok_or_else(|| ServiceWorkerError::ClientGone(id.to_string()))?;
        if conn.client.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }
        conn.client.focused = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_message_wire_shapes() {
        let sync = serde_json::to_value(ClientMessage::SyncRequest { timestamp: 42 }).unwrap();
        assert_eq!(sync, json!({"type": "sync-request", "timestamp": 42}));

        let update = serde_json::to_value(ClientMessage::UpdateAvailable {
            version: "2.0.0".into(),
        })
        .unwrap();
        assert_eq!(update, json!({"type": "update-available", "version": "2.0.0"}));

        let ack = serde_json::to_value(ClientMessage::Ack {
            command: "clear-cache".into(),
            ok: true,
            error: None,
        })
        .unwrap();
        assert_eq!(ack, json!({"type": "ack", "command": "clear-cache", "ok": true}));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client_once() {
        let clients = InMemoryClients::new();
        let (_, mut rx1) = clients.connect(url("https://app.test/"), ClientType::Window).await;
        let (_, mut rx2) = clients.connect(url("https://app.test/b"), ClientType::Window).await;

        let delivered = clients
            .broadcast(ClientMessage::UpdateAvailable { version: "2".into() })
            .await;

        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let clients = InMemoryClients::new();
        let (gone, rx) = clients.connect(url("https://app.test/"), ClientType::Window).await;
        drop(rx);

        let result = clients
            .post(&gone, ClientMessage::SyncRequest { timestamp: 1 })
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::ClientGone(_))));
        assert!(clients.clients().await.is_empty());
    }

    #[tokio::test]
    async fn test_claim_sets_controller() {
        let clients = InMemoryClients::new();
        let (id, _rx) = clients.connect(url("https://app.test/"), ClientType::Window).await;

        assert_eq!(clients.claim("harbor-2").await.unwrap(), 1);
        assert_eq!(
            clients.get(&id).await.unwrap().controller.as_deref(),
            Some("harbor-2")
        );
    }

    #[tokio::test]
    async fn test_open_and_focus_window() {
        let clients = InMemoryClients::new();
        let opened = clients.open_window(&url("https://app.test/")).await.unwrap();
        assert!(opened.focused);
        assert!(clients.take_opened(&opened.id).await.is_some());

        let (worker, _rx) = clients.connect(url("https://app.test/w.js"), ClientType::Worker).await;
        assert!(matches!(
            clients.focus(&worker).await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }
}
