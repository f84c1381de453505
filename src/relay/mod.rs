//! Shared relay for the chat server
//!
//! Carries messages between processes through a pub/sub broker. Each
//! locally connected client owns one subscription to its own channel; a
//! personal message is published to the destination's channel, wherever
//! that client happens to be connected. The broker also holds a capped
//! history list shared by every process.

mod broker;
pub mod handlers;
mod memory;
mod redis_broker;

pub use broker::{Broker, Subscription};
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

#[cfg(test)]
pub use broker::MockBroker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BroadcastMode, BrokerConfig, BrokerKind, RelayConfig};
use crate::error::RelayError;
use crate::message::{ClientId, Message, BROADCAST_ID};
use crate::websocket::ConnectionRegistry;

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Name of the broker channel carrying messages for `id`.
pub fn channel_name(id: ClientId) -> String {
    format!("channel:{}", id)
}

/// Connects to the broker selected by `config`.
pub async fn connect_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>, RelayError> {
    match config.kind {
        BrokerKind::Redis => Ok(Arc::new(RedisBroker::connect(&config.url).await?)),
        BrokerKind::Memory => {
            warn!("Using in-memory broker; messages will not cross process boundaries");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

struct RelayEntry {
    subscription: Arc<Mutex<Box<dyn Subscription>>>,
    channel_name: String,
}

pub struct SharedRelay {
    broker: Arc<dyn Broker>,
    config: RelayConfig,
    subscriptions: RwLock<HashMap<ClientId, RelayEntry>>,
}

impl SharedRelay {
    pub fn new(broker: Arc<dyn Broker>, config: RelayConfig) -> Self {
        Self {
            broker,
            config,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Subscribes this process to `id`'s channel. Fails if `id` already has a
    /// subscription here.
    pub async fn subscribe(&self, id: ClientId) -> Result<(), RelayError> {
        if self.subscriptions.read().await.contains_key(&id) {
            return Err(RelayError::AlreadySubscribed(id));
        }

        let channel_name = channel_name(id);
        let mut subscription = self.broker.subscribe(&channel_name).await?;

        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(&id) {
            // Lost a race with a concurrent subscribe for the same id.
            drop(subscriptions);
            if let Err(e) = subscription.unsubscribe().await {
                warn!("Failed to unsubscribe surplus subscription for {}: {}", id, e);
            }
            subscription.release().await;
            return Err(RelayError::AlreadySubscribed(id));
        }

        info!("Subscribed client {} to {}", id, channel_name);
        subscriptions.insert(
            id,
            RelayEntry {
                subscription: Arc::new(Mutex::new(subscription)),
                channel_name,
            },
        );
        Ok(())
    }

    /// Unsubscribes the channel, releases the subscription, then forgets it.
    ///
    /// Waits for any in-flight `receive_next` on `id` to be dropped first.
    pub async fn unsubscribe(&self, id: ClientId) -> Result<(), RelayError> {
        let (subscription, channel_name) = {
            let subscriptions = self.subscriptions.read().await;
            let entry = subscriptions.get(&id).ok_or(RelayError::NotSubscribed(id))?;
            (entry.subscription.clone(), entry.channel_name.clone())
        };

        let result = {
            let mut subscription = subscription.lock().await;
            let result = subscription.unsubscribe().await;
            subscription.release().await;
            result
        };

        self.subscriptions.write().await.remove(&id);
        info!("Unsubscribed client {} from {}", id, channel_name);
        result
    }

    /// Up to `count` messages from the shared history, oldest first.
    pub async fn history(&self, count: usize) -> Result<Vec<Message>, RelayError> {
        let entries = self.broker.head(&self.config.history_key, count).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| match Message::parse(entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Skipping unreadable history entry: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Sends `message` towards its destination through the broker.
    ///
    /// Broadcasts are handed to `broadcast_fanout`. Personal messages are
    /// optionally recorded in history, then published to the destination's
    /// channel.
    pub async fn publish_personal(&self, message: &Message, persist: bool) -> Result<(), RelayError> {
        if message.is_broadcast() {
            return self.broadcast_fanout(message).await;
        }

        let payload = message.to_json()?;
        if persist {
            self.append_history(&payload).await?;
        }
        self.broker.publish(&channel_name(message.destination()), &payload).await
    }

    /// Publishes a broadcast and records it in history exactly once.
    ///
    /// In `local` mode only clients subscribed through this process receive
    /// a copy, each addressed to them. In `shared` mode the canonical message
    /// goes to the broadcast channel, where every process's listener picks it
    /// up.
    pub async fn broadcast_fanout(&self, message: &Message) -> Result<(), RelayError> {
        let canonical = message.readdressed(BROADCAST_ID);

        match self.config.broadcast_mode {
            BroadcastMode::Local => {
                for id in self.subscribed_ids().await {
                    let copy = message.readdressed(id);
                    self.broker.publish(&channel_name(id), &copy.to_json()?).await?;
                }
            }
            BroadcastMode::Shared => {
                self.broker
                    .publish(&channel_name(BROADCAST_ID), &canonical.to_json()?)
                    .await?;
            }
        }

        self.append_history(&canonical.to_json()?).await
    }

    /// Waits for the next message on `id`'s channel.
    ///
    /// Polls the subscription with a bounded timeout and keeps polling until a
    /// message arrives, so dropping the returned future cancels it promptly.
    pub async fn receive_next(&self, id: ClientId) -> Result<Message, RelayError> {
        let subscription = self
            .subscriptions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.subscription.clone())
            .ok_or(RelayError::NotSubscribed(id))?;

        let mut subscription = subscription.lock().await;
        loop {
            let Some(payload) = subscription.next_payload(self.config.poll_timeout()).await? else {
                continue;
            };
            match Message::parse(&payload) {
                Ok(message) => return Ok(message),
                Err(e) => warn!("Dropping unreadable payload on {}: {}", subscription.channel(), e),
            }
        }
    }

    pub async fn subscribed_ids(&self) -> Vec<ClientId> {
        self.subscriptions.read().await.keys().cloned().collect()
    }

    pub async fn is_subscribed(&self, id: ClientId) -> bool {
        self.subscriptions.read().await.contains_key(&id)
    }

    /// Subscribes this process to the broadcast channel and spawns a task
    /// handing every broadcast to `registry`.
    ///
    /// Returns once the first subscription is in place. After a broker fault
    /// the task resubscribes with a fixed back-off.
    pub async fn start_broadcast_listener(
        &self,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<JoinHandle<()>, RelayError> {
        let broker = self.broker.clone();
        let poll_timeout = self.config.poll_timeout();
        let channel = channel_name(BROADCAST_ID);
        let first = broker.subscribe(&channel).await?;
        info!("Broadcast listener subscribed to {}", channel);

        Ok(tokio::spawn(async move {
            let mut subscription = first;
            loop {
                let fault = listen(subscription.as_mut(), &registry, poll_timeout).await;
                error!("Broadcast listener lost {}: {}", channel, fault);
                if let Err(e) = subscription.unsubscribe().await {
                    debug!("Unsubscribe from {} after fault failed: {}", channel, e);
                }
                subscription.release().await;

                subscription = loop {
                    tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                    match broker.subscribe(&channel).await {
                        Ok(subscription) => break subscription,
                        Err(e) => error!("Broadcast listener failed to resubscribe: {}", e),
                    }
                };
                info!("Broadcast listener resubscribed to {}", channel);
            }
        }))
    }

    async fn append_history(&self, payload: &str) -> Result<(), RelayError> {
        self.broker
            .push_capped(&self.config.history_key, payload, self.config.history_size)
            .await
    }
}

/// Delivers broadcasts locally until the subscription fails.
async fn listen(
    subscription: &mut dyn Subscription,
    registry: &ConnectionRegistry,
    poll_timeout: Duration,
) -> RelayError {
    loop {
        match subscription.next_payload(poll_timeout).await {
            Ok(Some(payload)) => match Message::parse(&payload) {
                Ok(message) => {
                    debug!("Broadcast from {} received", message.sender());
                    if let Err(e) = registry.deliver(&message).await {
                        warn!("Failed to deliver broadcast: {}", e);
                    }
                }
                Err(e) => warn!("Dropping unreadable broadcast: {}", e),
            },
            Ok(None) => continue,
            Err(e) => return e,
        }
    }
}
