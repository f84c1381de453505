use futures::FutureExt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::message::ClientId;
use crate::relay::SharedRelay;
use super::connection::{ClientSocket, Received};
use super::pool::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting on both the client's socket and its broker channel.
    Active,
    /// The client side has ended; the broker wait is being cancelled.
    Draining,
    Closed,
}

/// Lifecycle of one connected client within this process.
pub struct Session {
    id: ClientId,
    registry: Arc<ConnectionRegistry>,
    relay: Arc<SharedRelay>,
    state: SessionState,
}

impl Session {
    /// Registers the socket and subscribes to the client's channel.
    ///
    /// If the subscription fails the registry entry is rolled back, so a
    /// session only exists once both steps succeeded.
    pub async fn open(
        id: ClientId,
        socket: ClientSocket,
        registry: Arc<ConnectionRegistry>,
        relay: Arc<SharedRelay>,
    ) -> Result<Self, AppError> {
        registry.connect(id, socket).await?;

        if let Err(e) = relay.subscribe(id).await {
            registry.disconnect(id).await;
            return Err(e.into());
        }

        info!("Session for client {} opened", id);
        Ok(Self {
            id,
            registry,
            relay,
            state: SessionState::Active,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Relays messages in both directions until the client goes away, then
    /// tears the session down.
    pub async fn run(mut self) -> SessionState {
        let id = self.id;
        let registry = self.registry.clone();
        let relay = self.relay.clone();

        let mut local = registry.receive_next(id).boxed();
        let mut remote = relay.receive_next(id).boxed();

        while self.state == SessionState::Active {
            tokio::select! {
                received = &mut local => match received {
                    Received::Message(message) => {
                        match relay.publish_personal(&message, true).await {
                            Ok(()) => local = registry.receive_next(id).boxed(),
                            Err(e) => {
                                error!("Failed to relay message from client {}: {}", id, e);
                                self.state = SessionState::Draining;
                            }
                        }
                    }
                    Received::Rejected => local = registry.receive_next(id).boxed(),
                    Received::Terminal => {
                        info!("Client {} disconnected", id);
                        self.state = SessionState::Draining;
                    }
                },
                result = &mut remote => match result {
                    Ok(message) => {
                        if let Err(e) = registry.deliver(&message).await {
                            warn!("Dropped message for client {}: {}", id, e);
                        }
                        remote = relay.receive_next(id).boxed();
                    }
                    Err(e) => {
                        error!("Broker wait failed for client {}: {}", id, e);
                        self.state = SessionState::Draining;
                    }
                },
            }
        }

        drop(remote);
        drop(local);
        self.teardown().await;
        self.state
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.relay.unsubscribe(self.id).await {
            warn!("Unsubscribe for client {} failed: {}", self.id, e);
        }
        self.registry.close(self.id).await;
        self.registry.disconnect(self.id).await;
        self.state = SessionState::Closed;
        info!("Session for client {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BroadcastMode, RelayConfig};
    use crate::error::{RegistryError, RelayError};
    use crate::message::{Message, INVALID_MESSAGE_TEXT, SERVICE_ID};
    use crate::relay::{Broker, MemoryBroker, MockBroker, Subscription};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    const WAIT: Duration = Duration::from_secs(2);

    fn relay_config() -> RelayConfig {
        RelayConfig {
            poll_timeout_ms: 20,
            broadcast_mode: BroadcastMode::Shared,
            ..RelayConfig::default()
        }
    }

    fn process(broker: &MemoryBroker) -> (Arc<ConnectionRegistry>, Arc<SharedRelay>) {
        (
            Arc::new(ConnectionRegistry::new()),
            Arc::new(SharedRelay::new(Arc::new(broker.clone()), relay_config())),
        )
    }

    #[tokio::test]
    async fn test_personal_message_between_sessions() {
        let broker = MemoryBroker::new();
        let (registry, relay) = process(&broker);

        let (socket_a, peer_a) = ClientSocket::pair();
        let (socket_b, mut peer_b) = ClientSocket::pair();
        let session_a = Session::open(1, socket_a, registry.clone(), relay.clone()).await.unwrap();
        let session_b = Session::open(2, socket_b, registry.clone(), relay.clone()).await.unwrap();
        let task_a = tokio::spawn(session_a.run());
        let task_b = tokio::spawn(session_b.run());

        let message = Message::new(1, 2, "hello b");
        peer_a.send_text(message.to_json().unwrap());

        let received = timeout(WAIT, peer_b.recv_message()).await.unwrap();
        assert_eq!(received, Some(message));

        drop(peer_a);
        drop(peer_b);
        assert_eq!(timeout(WAIT, task_a).await.unwrap().unwrap(), SessionState::Closed);
        assert_eq!(timeout(WAIT, task_b).await.unwrap().unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_session_alive() {
        let broker = MemoryBroker::new();
        let (registry, relay) = process(&broker);

        let (socket_a, mut peer_a) = ClientSocket::pair();
        let (socket_b, mut peer_b) = ClientSocket::pair();
        let session_a = Session::open(1, socket_a, registry.clone(), relay.clone()).await.unwrap();
        let session_b = Session::open(2, socket_b, registry.clone(), relay.clone()).await.unwrap();
        tokio::spawn(session_a.run());
        tokio::spawn(session_b.run());

        peer_a.send_text("definitely not json");
        let diagnostic = timeout(WAIT, peer_a.recv_message()).await.unwrap().unwrap();
        assert_eq!(diagnostic.sender(), SERVICE_ID);
        assert_eq!(diagnostic.text(), INVALID_MESSAGE_TEXT);

        let message = Message::new(1, 2, "after the typo");
        peer_a.send_text(message.to_json().unwrap());
        assert_eq!(timeout(WAIT, peer_b.recv_message()).await.unwrap(), Some(message));
        assert!(peer_a.from_server.try_recv().is_err());
        assert!(relay.history(50).await.unwrap().iter().all(|m| !m.is_service()));
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_once() {
        let broker = MemoryBroker::new();
        let (registry, relay) = process(&broker);

        let (socket, peer) = ClientSocket::pair();
        let session = Session::open(7, socket, registry.clone(), relay.clone()).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(broker.subscriber_count("channel:7").await, 1);
        let task = tokio::spawn(session.run());

        drop(peer);
        assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), SessionState::Closed);

        assert!(!registry.exists(7).await);
        assert!(!relay.is_subscribed(7).await);
        assert_eq!(broker.subscriber_count("channel:7").await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let broker = MemoryBroker::new();
        let (registry, relay) = process(&broker);

        let (first, _first_peer) = ClientSocket::pair();
        let _session = Session::open(3, first, registry.clone(), relay.clone()).await.unwrap();

        let (second, _second_peer) = ClientSocket::pair();
        let result = Session::open(3, second, registry.clone(), relay.clone()).await;
        assert!(matches!(
            result,
            Err(AppError::RegistryError(RegistryError::DuplicateClient(3)))
        ));
        assert_eq!(broker.subscriber_count("channel:3").await, 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_rolls_back_registry() {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .times(1)
            .returning(|_| Err(RelayError::Broker("connection refused".into())));

        let registry = Arc::new(ConnectionRegistry::new());
        let relay = Arc::new(SharedRelay::new(Arc::new(broker), relay_config()));
        let (socket, _peer) = ClientSocket::pair();

        let result = Session::open(4, socket, registry.clone(), relay).await;
        assert!(matches!(result, Err(AppError::RelayError(RelayError::Broker(_)))));
        assert!(!registry.exists(4).await);
    }

    struct BrokenSubscription;

    #[async_trait]
    impl Subscription for BrokenSubscription {
        fn channel(&self) -> &str {
            "channel:5"
        }

        async fn next_payload(&mut self, _wait: Duration) -> Result<Option<String>, RelayError> {
            Err(RelayError::Broker("connection reset".into()))
        }

        async fn unsubscribe(&mut self) -> Result<(), RelayError> {
            Err(RelayError::Broker("connection reset".into()))
        }

        async fn release(&mut self) {}
    }

    #[tokio::test]
    async fn test_broker_outage_ends_session() {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .times(1)
            .returning(|_| Ok(Box::new(BrokenSubscription) as Box<dyn Subscription>));

        let registry = Arc::new(ConnectionRegistry::new());
        let relay = Arc::new(SharedRelay::new(Arc::new(broker), relay_config()));
        let (socket, mut peer) = ClientSocket::pair();

        let session = Session::open(5, socket, registry.clone(), relay.clone()).await.unwrap();
        let state = timeout(WAIT, session.run()).await.unwrap();

        assert_eq!(state, SessionState::Closed);
        assert!(!registry.exists(5).await);
        assert!(!relay.is_subscribed(5).await);
        assert_eq!(timeout(WAIT, peer.recv_message()).await.unwrap(), None);
    }

    /// Working pub/sub whose history list refuses writes.
    struct ReadOnlyHistory(MemoryBroker);

    #[async_trait]
    impl Broker for ReadOnlyHistory {
        async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, RelayError> {
            self.0.subscribe(channel).await
        }

        async fn publish(&self, channel: &str, payload: &str) -> Result<(), RelayError> {
            self.0.publish(channel, payload).await
        }

        async fn push_capped(&self, _key: &str, _payload: &str, _cap: usize) -> Result<(), RelayError> {
            Err(RelayError::Broker("read only replica".into()))
        }

        async fn head(&self, key: &str, count: usize) -> Result<Vec<String>, RelayError> {
            self.0.head(key, count).await
        }
    }

    #[tokio::test]
    async fn test_publish_failure_ends_session() {
        let memory = MemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = Arc::new(SharedRelay::new(
            Arc::new(ReadOnlyHistory(memory.clone())),
            relay_config(),
        ));
        let (socket, peer) = ClientSocket::pair();

        let session = Session::open(6, socket, registry.clone(), relay.clone()).await.unwrap();
        peer.send_text(Message::new(6, 8, "into the void").to_json().unwrap());

        assert_eq!(timeout(WAIT, session.run()).await.unwrap(), SessionState::Closed);
        assert!(!registry.exists(6).await);
        assert_eq!(memory.subscriber_count("channel:6").await, 0);
    }

    type Events = Arc<StdMutex<Vec<String>>>;

    /// Logs teardown calls together with whether the socket was still registered.
    struct TeardownRecorder {
        id: ClientId,
        registry: Arc<ConnectionRegistry>,
        events: Events,
    }

    impl TeardownRecorder {
        async fn record(&self, call: &str) {
            let registered = self.registry.exists(self.id).await;
            self.events
                .lock()
                .unwrap()
                .push(format!("{} registered={}", call, registered));
        }
    }

    #[async_trait]
    impl Subscription for TeardownRecorder {
        fn channel(&self) -> &str {
            "channel:12"
        }

        async fn next_payload(&mut self, wait: Duration) -> Result<Option<String>, RelayError> {
            tokio::time::sleep(wait).await;
            Ok(None)
        }

        async fn unsubscribe(&mut self) -> Result<(), RelayError> {
            self.record("unsubscribe").await;
            Ok(())
        }

        async fn release(&mut self) {
            self.record("release").await;
        }
    }

    #[tokio::test]
    async fn test_teardown_unsubscribes_before_disconnect() {
        let events: Events = Arc::default();
        let registry = Arc::new(ConnectionRegistry::new());

        let mut broker = MockBroker::new();
        let (recorded, watched) = (events.clone(), registry.clone());
        broker.expect_subscribe().times(1).returning(move |_| {
            Ok(Box::new(TeardownRecorder {
                id: 12,
                registry: watched.clone(),
                events: recorded.clone(),
            }) as Box<dyn Subscription>)
        });

        let relay = Arc::new(SharedRelay::new(Arc::new(broker), relay_config()));
        let (socket, mut peer) = ClientSocket::pair();
        let session = Session::open(12, socket, registry.clone(), relay.clone()).await.unwrap();
        let task = tokio::spawn(session.run());

        peer.to_server.send(WsMessage::Close(None)).unwrap();
        assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), SessionState::Closed);

        // One unsubscribe and one release, both while the socket was still registered.
        assert_eq!(
            *events.lock().unwrap(),
            vec!["unsubscribe registered=true", "release registered=true"]
        );

        // Then the socket is closed and dropped from the registry.
        assert_eq!(peer.from_server.recv().await, Some(WsMessage::Close(None)));
        assert_eq!(peer.from_server.recv().await, None);
        assert!(!registry.exists(12).await);
        assert!(!relay.is_subscribed(12).await);
    }
}
