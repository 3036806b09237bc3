//! Connected clients and the points each one registered.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use scadalink_core::{DeliveryMode, PointId};
use scadalink_protocol::ServerMessage;

pub type ClientId = Uuid;

struct ClientEntry {
    sender: mpsc::Sender<ServerMessage>,
    points: HashMap<PointId, DeliveryMode>,
}

/// Outcome of [`ClientRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Added,
    /// The client already held the point with this mode.
    Existing(DeliveryMode),
    UnknownClient,
}

/// Registry of client subscription sets.
///
/// Writes are serialized by the lock; fan-out only holds the read lock long
/// enough to clone the target senders.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client with an empty subscription set.
    ///
    /// Returns the points of a previous entry under the same id, if any.
    pub async fn connect(
        &self,
        client: ClientId,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Option<HashMap<PointId, DeliveryMode>> {
        let entry = ClientEntry {
            sender,
            points: HashMap::new(),
        };
        self.clients
            .write()
            .await
            .insert(client, entry)
            .map(|old| old.points)
    }

    pub async fn contains(&self, client: &ClientId) -> bool {
        self.clients.read().await.contains_key(client)
    }

    /// Mode previously granted to `client` for `point`.
    pub async fn granted(&self, client: &ClientId, point: &PointId) -> Option<DeliveryMode> {
        self.clients
            .read()
            .await
            .get(client)
            .and_then(|e| e.points.get(point).copied())
    }

    pub async fn insert(&self, client: &ClientId, point: &PointId, mode: DeliveryMode) -> Insert {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.get_mut(client) else {
            return Insert::UnknownClient;
        };
        if let Some(existing) = entry.points.get(point) {
            return Insert::Existing(*existing);
        }
        entry.points.insert(point.clone(), mode);
        Insert::Added
    }

    /// Remove one point from a client's set, returning the mode it held.
    pub async fn remove(&self, client: &ClientId, point: &PointId) -> Option<DeliveryMode> {
        self.clients
            .write()
            .await
            .get_mut(client)
            .and_then(|e| e.points.remove(point))
    }

    /// Remove a client together with its whole subscription set.
    pub async fn remove_client(&self, client: &ClientId) -> Option<HashMap<PointId, DeliveryMode>> {
        self.clients
            .write()
            .await
            .remove(client)
            .map(|e| e.points)
    }

    /// Senders of every client subscribed to `point`.
    pub async fn targets(&self, point: &PointId) -> Vec<(ClientId, mpsc::Sender<ServerMessage>)> {
        self.clients
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.points.contains_key(point))
            .map(|(id, e)| (*id, e.sender.clone()))
            .collect()
    }

    /// Queue a message for one client without waiting.
    pub async fn send(&self, client: &ClientId, message: ServerMessage) -> bool {
        let sender = match self.clients.read().await.get(client) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };
        deliver(client, &sender, message)
    }

    pub async fn points_of(&self, client: &ClientId) -> Vec<PointId> {
        let mut points: Vec<PointId> = self
            .clients
            .read()
            .await
            .get(client)
            .map(|e| e.points.keys().cloned().collect())
            .unwrap_or_default();
        points.sort();
        points
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

/// `try_send` with logging. A full or closed queue drops the message.
pub(crate) fn deliver(
    client: &ClientId,
    sender: &mpsc::Sender<ServerMessage>,
    message: ServerMessage,
) -> bool {
    match sender.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(client = %client, "Client queue full, message dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(client = %client, "Client queue closed");
            false
        }
    }
}
