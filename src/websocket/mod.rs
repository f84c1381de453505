//! WebSocket module for the chat relay
//!
//! This module owns the sockets connected to this process: the local
//! connection registry, the per-client session loop, and the listener that
//! accepts `/ws/{client_id}` upgrades.

mod connection;
mod pool;
mod server;
mod session;

pub use connection::{ClientSocket, Received, SocketPeer};
pub use pool::ConnectionRegistry;
pub use server::{parse_client_path, WebSocketServer};
pub use session::{Session, SessionState};
