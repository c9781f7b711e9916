//! Connection registry: live bridge connections keyed by (session, bot number).
//!
//! Each entry holds the sending half of the connection's outbound queue; a writer task owned by
//! the connection drains it onto the socket. The map lock is held only while the map is read or
//! changed, never across a send or a receive.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub const DEFAULT_SESSION: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub session: String,
    pub number: String,
}

impl ConnectionKey {
    /// Empty session falls back to [`DEFAULT_SESSION`].
    pub fn new(session: Option<&str>, number: impl Into<String>) -> Self {
        let session = session
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SESSION);
        Self {
            session: session.to_string(),
            number: number.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.number)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} already registered")]
    Conflict(String),
    #[error("no connection registered for {0}")]
    NotFound(String),
    #[error("delivery to {key} failed: {reason}")]
    DeliveryFailed { key: String, reason: String },
}

/// Sending side of one live connection. Cloning shares the same queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    /// New handle plus the receiving half for the connection's writer task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionKey, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `Conflict` when the key is taken; never replaces.
    pub async fn register(
        &self,
        key: ConnectionKey,
        handle: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        let mut g = self.inner.write().await;
        if g.contains_key(&key) {
            return Err(RegistryError::Conflict(key.to_string()));
        }
        log::info!("connection registered: {}", key);
        g.insert(key, handle);
        Ok(())
    }

    /// Idempotent.
    pub async fn unregister(&self, key: &ConnectionKey) {
        if self.inner.write().await.remove(key).is_some() {
            log::info!("connection unregistered: {}", key);
        }
    }

    /// Remove `key` only if it still maps to the connection `id`. Returns whether it did.
    pub async fn unregister_if_owner(&self, key: &ConnectionKey, id: Uuid) -> bool {
        let mut g = self.inner.write().await;
        match g.get(key) {
            Some(h) if h.id == id => {
                g.remove(key);
                log::info!("connection unregistered: {}", key);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, key: &ConnectionKey) -> Result<ConnectionHandle, RegistryError> {
        self.inner
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    /// Serialize `payload` and queue it on the connection registered under `key`.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        key: &ConnectionKey,
        payload: &T,
    ) -> Result<(), RegistryError> {
        let handle = self.lookup(key).await?;
        let text = serde_json::to_string(payload).map_err(|e| RegistryError::DeliveryFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        handle
            .tx
            .send(text)
            .map_err(|_| RegistryError::DeliveryFailed {
                key: key.to_string(),
                reason: "connection closed".to_string(),
            })
    }

    /// Point-in-time snapshot, sorted.
    pub async fn list_keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<_> = self.inner.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
