use futures::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::message::ClientId;
use crate::relay::SharedRelay;
use super::connection::ClientSocket;
use super::pool::ConnectionRegistry;
use super::session::Session;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Extracts the client id from an upgrade path of the form `/ws/{client_id}`.
///
/// Reserved (negative) ids are refused.
pub fn parse_client_path(path: &str) -> Option<ClientId> {
    let id: ClientId = path.strip_prefix("/ws/")?.trim_end_matches('/').parse().ok()?;
    (id >= 0).then_some(id)
}

pub struct WebSocketServer {
    registry: Arc<ConnectionRegistry>,
    relay: Arc<SharedRelay>,
}

impl WebSocketServer {
    pub fn new(registry: Arc<ConnectionRegistry>, relay: Arc<SharedRelay>) -> Self {
        Self { registry, relay }
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept WebSocket connection: {}", e);
                    break;
                }
            }
        }
    }

    pub async fn handle_connection(self: Arc<Self>, raw_stream: TcpStream, addr: SocketAddr) {
        info!("New WebSocket connection from: {}", addr);

        let mut path = String::new();
        let callback = |request: &Request, response: Response| {
            path = request.uri().path().to_string();
            Ok::<Response, ErrorResponse>(response)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(raw_stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("Error during WebSocket handshake: {}", e);
                return;
            }
        };

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let Some(client_id) = parse_client_path(&path) else {
            warn!("Refusing {} with bad path {:?}", addr, path);
            let _ = ws_sink.send(policy_close("expected /ws/{client_id}")).await;
            return;
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let socket = ClientSocket::new(outbound_tx, inbound_rx);

        let session = match Session::open(client_id, socket, self.registry.clone(), self.relay.clone()).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Refusing client {} from {}: {}", client_id, addr, e);
                let _ = ws_sink.send(policy_close("client id unavailable")).await;
                return;
            }
        };

        let peer_closed = Arc::new(AtomicBool::new(false));

        let send_task = tokio::spawn(drain_outbound(
            ws_sink,
            outbound_rx,
            peer_closed.clone(),
            HEARTBEAT_INTERVAL,
        ));

        // Feed inbound frames to the session; dropping `inbound_tx` ends it.
        let receive_task = tokio::spawn(async move {
            while let Some(message) = ws_stream.next().await {
                match message {
                    Ok(msg) => {
                        if let WsMessage::Close(_) = msg {
                            peer_closed.store(true, Ordering::Release);
                        }
                        if inbound_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Error receiving WebSocket message: {}", e);
                        break;
                    }
                }
            }
        });

        let state = session.run().await;
        info!("Connection {} for client {} finished in state {:?}", addr, client_id, state);

        receive_task.abort();
        match tokio::time::timeout(Duration::from_secs(5), send_task).await {
            Ok(Ok(end)) => debug!("Writer for client {} stopped: {:?}", client_id, end),
            Ok(Err(e)) => error!("Writer for client {} panicked: {}", client_id, e),
            Err(_) => warn!("Timed out flushing connection for client {}", client_id),
        }
    }
}

/// Why a connection's writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriterEnd {
    /// We sent the close frame.
    Closed,
    /// The client closed first; the library already answered it.
    PeerClosed,
    /// Every sender for the outbound queue was dropped.
    QueueEnded,
    SinkFailed,
}

/// Writes queued frames to `sink`, pinging every `heartbeat` while idle.
pub(crate) async fn drain_outbound<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<WsMessage>,
    peer_closed: Arc<AtomicBool>,
    heartbeat: Duration,
) -> WriterEnd
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    let end = loop {
        let message = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break WriterEnd::QueueEnded,
            },
            _ = ticker.tick() => WsMessage::Ping(Vec::new()),
        };

        let closing = matches!(message, WsMessage::Close(_));
        if closing && peer_closed.load(Ordering::Acquire) {
            return WriterEnd::PeerClosed;
        }
        if let Err(e) = sink.send(message).await {
            if peer_closed.load(Ordering::Acquire) {
                debug!("Dropped frame after client closed: {}", e);
                return WriterEnd::PeerClosed;
            }
            error!("Error sending WebSocket message: {}", e);
            return WriterEnd::SinkFailed;
        }
        if closing {
            break WriterEnd::Closed;
        }
    };

    if let Err(e) = sink.close().await {
        warn!("Error closing WebSocket connection: {}", e);
    }
    end
}

fn policy_close(reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Policy,
        reason: reason.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as sink_channel;

    #[test]
    fn test_parse_client_path() {
        assert_eq!(parse_client_path("/ws/1"), Some(1));
        assert_eq!(parse_client_path("/ws/0"), Some(0));
        assert_eq!(parse_client_path("/ws/1700000000000/"), Some(1_700_000_000_000));
        assert_eq!(parse_client_path("/ws/-1"), None);
        assert_eq!(parse_client_path("/ws/-2"), None);
        assert_eq!(parse_client_path("/ws/abc"), None);
        assert_eq!(parse_client_path("/ws/"), None);
        assert_eq!(parse_client_path("/chat/1"), None);
    }

    async fn run_writer(frames: Vec<WsMessage>, peer_closed: bool) -> (WriterEnd, Vec<WsMessage>) {
        let (sink, written) = sink_channel::unbounded();
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in frames {
            tx.send(frame).unwrap();
        }
        drop(tx);

        let flag = Arc::new(AtomicBool::new(peer_closed));
        let end = drain_outbound(sink, rx, flag, Duration::from_secs(60)).await;
        (end, written.collect().await)
    }

    #[tokio::test]
    async fn test_writer_sends_server_close() {
        let text = WsMessage::Text("{}".into());
        let (end, written) = run_writer(vec![text.clone(), WsMessage::Close(None)], false).await;

        assert_eq!(end, WriterEnd::Closed);
        assert_eq!(written, vec![text, WsMessage::Close(None)]);
    }

    #[tokio::test]
    async fn test_writer_skips_close_after_client_close() {
        let (end, written) = run_writer(vec![WsMessage::Close(None)], true).await;

        assert_eq!(end, WriterEnd::PeerClosed);
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_writer_stops_when_queue_ends() {
        let (end, written) = run_writer(Vec::new(), false).await;

        assert_eq!(end, WriterEnd::QueueEnded);
        assert!(written.is_empty());
    }
}
