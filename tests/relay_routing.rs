use chat_relay::config::{BroadcastMode, RelayConfig};
use chat_relay::websocket::{ClientSocket, SocketPeer};
use chat_relay::{ConnectionRegistry, MemoryBroker, Message, SharedRelay, BROADCAST_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

/// One server process: its own registry and relay over a shared broker.
struct Process {
    registry: Arc<ConnectionRegistry>,
    relay: Arc<SharedRelay>,
}

impl Process {
    fn new(broker: &MemoryBroker, mode: BroadcastMode) -> Self {
        let config = RelayConfig {
            poll_timeout_ms: 20,
            broadcast_mode: mode,
            ..RelayConfig::default()
        };
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            relay: Arc::new(SharedRelay::new(Arc::new(broker.clone()), config)),
        }
    }

    async fn attach(&self, id: i64) -> SocketPeer {
        let (socket, peer) = ClientSocket::pair();
        self.registry.connect(id, socket).await.unwrap();
        self.relay.subscribe(id).await.unwrap();
        peer
    }
}

#[tokio::test]
async fn test_personal_message_crosses_processes() {
    let broker = MemoryBroker::new();
    let a = Process::new(&broker, BroadcastMode::Shared);
    let b = Process::new(&broker, BroadcastMode::Shared);
    a.relay.subscribe(1).await.unwrap();
    b.relay.subscribe(2).await.unwrap();

    let message = Message::new(1, 2, "across the wire");
    a.relay.publish_personal(&message, true).await.unwrap();

    let received = timeout(WAIT, b.relay.receive_next(2)).await.unwrap().unwrap();
    assert_eq!(received, message);

    // Both processes read the same history.
    assert_eq!(a.relay.history(50).await.unwrap(), vec![message.clone()]);
    assert_eq!(b.relay.history(50).await.unwrap(), vec![message]);
}

#[tokio::test]
async fn test_shared_broadcast_reaches_every_process_once() {
    let broker = MemoryBroker::new();
    let a = Process::new(&broker, BroadcastMode::Shared);
    let b = Process::new(&broker, BroadcastMode::Shared);
    let listener_a = a.relay.start_broadcast_listener(a.registry.clone()).await.unwrap();
    let listener_b = b.relay.start_broadcast_listener(b.registry.clone()).await.unwrap();

    let mut peers = vec![a.attach(1).await, a.attach(2).await, b.attach(3).await];

    a.relay
        .publish_personal(&Message::broadcast(1, "hello everyone"), true)
        .await
        .unwrap();

    for peer in peers.iter_mut() {
        let received = timeout(WAIT, peer.recv_message()).await.unwrap().unwrap();
        assert_eq!(received.sender(), 1);
        assert_eq!(received.destination(), BROADCAST_ID);
        assert_eq!(received.text(), "hello everyone");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for peer in peers.iter_mut() {
        assert!(peer.from_server.try_recv().is_err());
    }

    let history = a.relay.history(50).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_broadcast());

    listener_a.abort();
    listener_b.abort();
}

#[tokio::test]
async fn test_local_broadcast_stays_in_process() {
    let broker = MemoryBroker::new();
    let a = Process::new(&broker, BroadcastMode::Local);
    let b = Process::new(&broker, BroadcastMode::Local);
    a.relay.subscribe(1).await.unwrap();
    a.relay.subscribe(2).await.unwrap();
    b.relay.subscribe(3).await.unwrap();

    a.relay
        .publish_personal(&Message::broadcast(1, "only here"), true)
        .await
        .unwrap();

    for id in [1, 2] {
        let copy = timeout(WAIT, a.relay.receive_next(id)).await.unwrap().unwrap();
        assert_eq!(copy.destination(), id);
        assert_eq!(copy.text(), "only here");
    }
    assert!(timeout(Duration::from_millis(100), b.relay.receive_next(3)).await.is_err());

    let history = b.relay.history(50).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].destination(), BROADCAST_ID);
}

#[tokio::test]
async fn test_history_keeps_latest_entries() {
    let broker = MemoryBroker::new();
    let a = Process::new(&broker, BroadcastMode::Shared);

    for i in 0..60 {
        a.relay
            .publish_personal(&Message::new(1, 2, format!("message {}", i)), true)
            .await
            .unwrap();
    }

    let history = a.relay.history(50).await.unwrap();
    assert_eq!(history.len(), 50);
    assert_eq!(history.first().unwrap().text(), "message 10");
    assert_eq!(history.last().unwrap().text(), "message 59");

    let shorter = a.relay.history(5).await.unwrap();
    assert_eq!(shorter.len(), 5);
    assert_eq!(shorter[0].text(), "message 10");
}

#[tokio::test]
async fn test_unsubscribed_destination_is_not_an_error() {
    let broker = MemoryBroker::new();
    let a = Process::new(&broker, BroadcastMode::Shared);
    a.relay.subscribe(1).await.unwrap();
    a.relay.subscribe(2).await.unwrap();
    a.relay.unsubscribe(2).await.unwrap();

    a.relay
        .publish_personal(&Message::new(1, 2, "nobody home"), true)
        .await
        .unwrap();

    assert_eq!(broker.subscriber_count("channel:2").await, 0);
    assert_eq!(a.relay.subscribed_ids().await, vec![1]);
    assert_eq!(a.relay.history(50).await.unwrap().len(), 1);
}
