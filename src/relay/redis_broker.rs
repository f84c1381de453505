use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, RedisResult};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use super::broker::{Broker, Subscription};

type StopSignal = oneshot::Sender<RedisResult<()>>;

/// Broker backed by a Redis server.
///
/// Commands share one multiplexed connection; each subscription gets a
/// dedicated pub/sub connection.
pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to redis broker at {}", url);
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, RelayError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let pump = tokio::spawn(pump(pubsub, channel.to_string(), tx, stop_rx));

        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            rx,
            stop: Some(stop_tx),
            pump: Some(pump),
        }))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RelayError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn push_capped(&self, key: &str, payload: &str, cap: usize) -> Result<(), RelayError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .rpush(key, payload)
            .ignore()
            .ltrim(key, -(cap as isize), -1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn head(&self, key: &str, count: usize) -> Result<Vec<String>, RelayError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(key, 0, count as isize - 1).await?;
        Ok(entries)
    }
}

/// Moves payloads from the pub/sub connection into `tx` until asked to stop,
/// then unsubscribes and hands the connection back for release.
async fn pump(
    mut pubsub: PubSub,
    channel: String,
    tx: mpsc::UnboundedSender<String>,
    mut stop_rx: oneshot::Receiver<StopSignal>,
) -> Option<PubSub> {
    let ack = {
        let mut messages = Box::pin(pubsub.on_message());
        loop {
            tokio::select! {
                msg = messages.next() => match msg {
                    Some(msg) => match msg.get_payload::<String>() {
                        Ok(payload) => {
                            if tx.send(payload).is_err() {
                                return None;
                            }
                        }
                        Err(e) => warn!("Dropping undecodable payload on {}: {}", channel, e),
                    },
                    None => {
                        warn!("Pub/sub connection for {} closed", channel);
                        return None;
                    }
                },
                ack = &mut stop_rx => break ack.ok(),
            }
        }
    };

    let result = pubsub.unsubscribe(&channel).await;
    debug!("Unsubscribed from {}", channel);
    if let Some(ack) = ack {
        let _ = ack.send(result);
    }
    Some(pubsub)
}

struct RedisSubscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    stop: Option<oneshot::Sender<StopSignal>>,
    pump: Option<JoinHandle<Option<PubSub>>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_payload(&mut self, wait: Duration) -> Result<Option<String>, RelayError> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(RelayError::Broker(format!("subscription to {} closed", self.channel))),
            Err(_) => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), RelayError> {
        let stop = self
            .stop
            .take()
            .ok_or_else(|| RelayError::Broker(format!("{} already unsubscribed", self.channel)))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        stop.send(ack_tx)
            .map_err(|_| RelayError::Broker(format!("pump for {} is gone", self.channel)))?;
        ack_rx
            .await
            .map_err(|_| RelayError::Broker(format!("pump for {} is gone", self.channel)))?
            .map_err(RelayError::from)
    }

    async fn release(&mut self) {
        // Dropping an unused stop handle makes the pump unsubscribe on its own.
        drop(self.stop.take());
        if let Some(pump) = self.pump.take() {
            match pump.await {
                Ok(Some(pubsub)) => drop(pubsub),
                Ok(None) => {}
                Err(e) => warn!("Pump for {} ended abnormally: {}", self.channel, e),
            }
        }
        self.rx.close();
    }
}
