//! Live-connection registry: one send queue per authenticated user.
//!
//! Deliveries are independent and best-effort. A slow or closed receiver
//! loses events instead of stalling the rest; the client reconciles on its
//! next `load_chat`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use shared::protocol::ServerEvent;

const SEND_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Default)]
pub(crate) struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, Connection>>>,
}

struct Connection {
    id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
}

/// Proof of registration. Unregistering through the handle only removes the
/// entry it created, never a replacement that evicted it.
pub(crate) struct ConnectionHandle {
    pub(crate) username: String,
    id: Uuid,
}

impl ConnectionRegistry {
    /// Registers a user's connection and hands back its event queue. An
    /// existing connection under the same name is evicted: its queue closes
    /// and its session winds down.
    pub(crate) async fn register(
        &self,
        username: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        let previous = self
            .inner
            .write()
            .await
            .insert(username.to_string(), Connection { id, tx });
        if previous.is_some() {
            debug!(user = username, "evicted previous connection");
        }
        (
            ConnectionHandle {
                username: username.to_string(),
                id,
            },
            rx,
        )
    }

    /// Removes the handle's entry. Returns false when the handle was already
    /// evicted by a newer connection, which then owns the user's presence.
    pub(crate) async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut connections = self.inner.write().await;
        if connections
            .get(&handle.username)
            .is_some_and(|connection| connection.id == handle.id)
        {
            connections.remove(&handle.username);
            true
        } else {
            false
        }
    }

    /// Delivers an event to every currently-registered connection.
    pub(crate) async fn broadcast(&self, event: &ServerEvent) {
        let connections = self.inner.read().await;
        for (username, connection) in connections.iter() {
            deliver(username, connection, event);
        }
    }

    /// Delivers an event to the named users only; absent names are skipped.
    pub(crate) async fn send_to(&self, recipients: &[String], event: &ServerEvent) {
        let connections = self.inner.read().await;
        for username in recipients {
            if let Some(connection) = connections.get(username) {
                deliver(username, connection, event);
            }
        }
    }
}

fn deliver(username: &str, connection: &Connection, event: &ServerEvent) {
    if let Err(err) = connection.tx.try_send(event.clone()) {
        debug!(user = username, error = %err, "dropped event for connection");
    }
}
