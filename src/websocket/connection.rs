use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::warn;

use crate::error::RegistryError;
use crate::message::{ClientId, Message};

/// Outcome of reading one payload from a client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(Message),
    /// The payload was malformed; the client has already been sent the
    /// service diagnostic.
    Rejected,
    /// The socket closed or failed. No further payloads will arrive.
    Terminal,
}

/// What a single inbound frame amounts to.
#[derive(Debug)]
pub(crate) enum Frame {
    Payload(Message),
    Malformed(String),
    Control,
    Close,
}

pub(crate) fn decode_frame(frame: WsMessage) -> Frame {
    match frame {
        WsMessage::Text(text) => match Message::parse(&text) {
            Ok(message) => Frame::Payload(message),
            Err(e) => Frame::Malformed(e.to_string()),
        },
        WsMessage::Binary(bin) => Frame::Malformed(format!("binary frame of {} bytes", bin.len())),
        WsMessage::Close(_) => Frame::Close,
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Frame::Control,
    }
}

/// Handle to one client's duplex connection.
///
/// Outbound frames go to a queue drained by the socket writer; inbound frames
/// arrive on a queue fed by the socket reader. The reader dropping its end
/// means the socket is gone.
#[derive(Debug)]
pub struct ClientSocket {
    outbound: mpsc::UnboundedSender<WsMessage>,
    inbound: Mutex<mpsc::UnboundedReceiver<WsMessage>>,
}

/// The far ends of a `ClientSocket`'s queues.
///
/// An in-process stand-in for the client side of a connection. Tests use it
/// to drive sessions without a network socket; an embedder can use it to
/// bridge a transport other than tokio-tungstenite onto the registry.
#[derive(Debug)]
pub struct SocketPeer {
    pub to_server: mpsc::UnboundedSender<WsMessage>,
    pub from_server: mpsc::UnboundedReceiver<WsMessage>,
}

impl ClientSocket {
    pub fn new(
        outbound: mpsc::UnboundedSender<WsMessage>,
        inbound: mpsc::UnboundedReceiver<WsMessage>,
    ) -> Self {
        Self {
            outbound,
            inbound: Mutex::new(inbound),
        }
    }

    /// Builds a socket together with the peer ends of its queues.
    pub fn pair() -> (Self, SocketPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self::new(outbound_tx, inbound_rx),
            SocketPeer {
                to_server: inbound_tx,
                from_server: outbound_rx,
            },
        )
    }

    pub fn send(&self, id: ClientId, message: &Message) -> Result<(), RegistryError> {
        let text = message.to_json().map_err(|e| {
            warn!("Failed to serialize message for client {}: {}", id, e);
            RegistryError::SendFailed(id)
        })?;
        self.outbound
            .send(WsMessage::Text(text))
            .map_err(|_| RegistryError::SendFailed(id))
    }

    /// Waits for the next frame. `None` once the reader side is gone.
    pub async fn next_frame(&self) -> Option<WsMessage> {
        self.inbound.lock().await.recv().await
    }

    pub fn close(&self) {
        let _ = self.outbound.send(WsMessage::Close(None));
    }
}

impl SocketPeer {
    /// Sends a text frame as the client would.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_server.send(WsMessage::Text(text.into())).is_ok()
    }

    /// Next message the server wrote to this client, if it parses.
    pub async fn recv_message(&mut self) -> Option<Message> {
        loop {
            match self.from_server.recv().await? {
                WsMessage::Text(text) => return serde_json::from_str(&text).ok(),
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
    }
}
