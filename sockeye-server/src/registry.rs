//! Connection registry: identifier ↔ connection mapping.
//!
//! Two maps are kept in lockstep behind a single lock:
//!
//! ```text
//! subscribers: Identifier ──► { ConnectionId ──► ConnectionHandle }   (never empty)
//! owner:       ConnectionId ──► Identifier
//! ```
//!
//! `owner[c] == i` holds exactly when `c` is in `subscribers[i]`. Every
//! operation takes the lock for its whole mutation, so a concurrent lookup
//! never sees one map updated without the other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Identifier;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames that may wait in one connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Process-unique connection handle value. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Outbound side of one live connection.
///
/// Messages are queued to the connection's writer task, which owns the
/// WebSocket sink. The queue is bounded: a peer that stops reading gets its
/// frames refused instead of growing server memory. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    /// Wrap a writer channel with a freshly assigned id.
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            id: ConnectionId::next(),
            sender,
        }
    }

    /// Handle plus the receiving end its writer task should drain.
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        Self::with_capacity(OUTBOUND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message without waiting. Fails once the writer task has gone
    /// away or while the queue is full.
    pub fn send(&self, msg: Message) -> Result<(), DeliveryError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull(self.id),
            TrySendError::Closed(_) => DeliveryError::ConnectionClosed(self.id),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("Outbound queue of {0} is full")]
    QueueFull(ConnectionId),
}

/// Result of [`ConnectionRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Connection was not registered before.
    New,
    /// Connection was already registered under the same identifier.
    Unchanged,
    /// Connection moved away from `previous`.
    Replaced { previous: Identifier },
}

#[derive(Default)]
struct RegistryMaps {
    subscribers: HashMap<Identifier, HashMap<ConnectionId, ConnectionHandle>>,
    owner: HashMap<ConnectionId, Identifier>,
}

impl RegistryMaps {
    /// Remove `id` from `identifier`'s set, dropping the key when it empties.
    fn detach(&mut self, identifier: &str, id: ConnectionId) {
        if let Some(set) = self.subscribers.get_mut(identifier) {
            set.remove(&id);
            if set.is_empty() {
                self.subscribers.remove(identifier);
            }
        }
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward = self.subscribers.iter().all(|(identifier, set)| {
            !set.is_empty()
                && set.iter().all(|(id, handle)| {
                    *id == handle.id() && self.owner.get(id) == Some(identifier)
                })
        });
        let backward = self.owner.iter().all(|(id, identifier)| {
            self.subscribers
                .get(identifier)
                .is_some_and(|set| set.contains_key(id))
        });
        forward && backward
    }
}

/// Registry of authenticated connections, shared by every session of a server.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    maps: Arc<RwLock<RegistryMaps>>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under `identifier`.
    ///
    /// A connection already registered under a different identifier is moved:
    /// it stops receiving deliveries for the old one.
    pub async fn register(&self, identifier: &str, connection: ConnectionHandle) -> Registration {
        let id = connection.id();
        let mut maps = self.maps.write().await;

        let registration = match maps.owner.get(&id).cloned() {
            Some(previous) if previous == identifier => Registration::Unchanged,
            Some(previous) => {
                maps.detach(&previous, id);
                Registration::Replaced { previous }
            }
            None => Registration::New,
        };

        maps.subscribers
            .entry(identifier.to_string())
            .or_default()
            .insert(id, connection);
        maps.owner.insert(id, identifier.to_string());

        if let Registration::Replaced { previous } = &registration {
            log::info!("{id} re-authenticated: {previous} -> {identifier}");
        }
        log::debug!(
            "Registered {id} as {identifier} ({} identifiers, {} connections)",
            maps.subscribers.len(),
            maps.owner.len()
        );
        registration
    }

    /// Remove a connection. Returns the identifier it was registered under,
    /// or `None` if it was not registered (safe to call repeatedly).
    pub async fn unregister(&self, id: ConnectionId) -> Option<Identifier> {
        let mut maps = self.maps.write().await;
        let identifier = maps.owner.remove(&id)?;
        maps.detach(&identifier, id);
        log::debug!(
            "Unregistered {id} from {identifier} ({} identifiers, {} connections)",
            maps.subscribers.len(),
            maps.owner.len()
        );
        Some(identifier)
    }

    /// Snapshot of the connections registered under `identifier`.
    pub async fn lookup(&self, identifier: &str) -> Vec<ConnectionHandle> {
        self.maps
            .read()
            .await
            .subscribers
            .get(identifier)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn identifier_of(&self, id: ConnectionId) -> Option<Identifier> {
        self.maps.read().await.owner.get(&id).cloned()
    }

    pub async fn is_registered(&self, id: ConnectionId) -> bool {
        self.maps.read().await.owner.contains_key(&id)
    }

    pub async fn identifier_count(&self) -> usize {
        self.maps.read().await.subscribers.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.maps.read().await.owner.len()
    }

    pub async fn identifiers(&self) -> Vec<Identifier> {
        self.maps.read().await.subscribers.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) async fn is_consistent(&self) -> bool {
        self.maps.read().await.is_consistent()
    }
}
