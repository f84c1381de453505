use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::RegistryError;
use crate::message::{ClientId, Message, BROADCAST_ID};
use super::connection::{decode_frame, ClientSocket, Frame, Received};

/// Sockets owned by this process, keyed by client id.
///
/// Knows nothing about clients attached to other processes.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ClientId, Arc<ClientSocket>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `socket` under `id`. A live id is never replaced.
    pub async fn connect(&self, id: ClientId, socket: ClientSocket) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            warn!("Rejected duplicate connection for client {}", id);
            return Err(RegistryError::DuplicateClient(id));
        }
        connections.insert(id, Arc::new(socket));
        info!("Added connection {} to registry", id);
        Ok(())
    }

    pub async fn disconnect(&self, id: ClientId) -> bool {
        let removed = self.connections.write().await.remove(&id).is_some();
        if removed {
            info!("Removed connection {} from registry", id);
        } else {
            warn!("Disconnect for unknown client {}", id);
        }
        removed
    }

    /// Writes `message` to the socket(s) it is addressed to.
    ///
    /// Broadcasts go to every registered socket; a socket that has already
    /// gone away is logged and skipped.
    pub async fn deliver(&self, message: &Message) -> Result<(), RegistryError> {
        let connections = self.connections.read().await;

        if message.is_broadcast() {
            for (id, socket) in connections.iter() {
                if let Err(e) = socket.send(*id, message) {
                    error!("Failed to broadcast to connection {}: {}", id, e);
                }
            }
            return Ok(());
        }

        let id = message.destination();
        connections
            .get(&id)
            .ok_or(RegistryError::UnknownLocalClient(id))?
            .send(id, message)
    }

    /// Waits for the next usable payload from `id`'s socket.
    ///
    /// A malformed payload is answered with the service diagnostic on the same
    /// socket and reported as `Received::Rejected`.
    pub async fn receive_next(&self, id: ClientId) -> Received {
        let Some(socket) = self.socket(id).await else {
            return Received::Terminal;
        };

        loop {
            let Some(frame) = socket.next_frame().await else {
                return Received::Terminal;
            };

            match decode_frame(frame) {
                Frame::Payload(message) => return Received::Message(message),
                Frame::Malformed(reason) => {
                    warn!("Malformed payload from client {}: {}", id, reason);
                    if let Err(e) = socket.send(id, &Message::invalid_format()) {
                        warn!("Failed to send diagnostic to client {}: {}", id, e);
                    }
                    return Received::Rejected;
                }
                Frame::Close => return Received::Terminal,
                Frame::Control => continue,
            }
        }
    }

    /// Whether a message to `id` can be delivered from here.
    pub async fn exists(&self, id: ClientId) -> bool {
        id == BROADCAST_ID || self.connections.read().await.contains_key(&id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connected_ids(&self) -> Vec<ClientId> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Asks the socket writer for `id` to close the connection.
    pub async fn close(&self, id: ClientId) {
        if let Some(socket) = self.socket(id).await {
            socket.close();
        }
    }

    async fn socket(&self, id: ClientId) -> Option<Arc<ClientSocket>> {
        self.connections.read().await.get(&id).cloned()
    }
}
