use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::error::RelayError;
use super::broker::{Broker, Subscription};

type Subscribers = HashMap<u64, mpsc::UnboundedSender<String>>;

#[derive(Debug, Default)]
struct Inner {
    channels: RwLock<HashMap<String, Subscribers>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    next_subscriber: AtomicU64,
}

/// In-process broker.
///
/// Cloning shares the same channels and lists, so several relays built on
/// clones of one `MemoryBroker` behave like separate processes attached to
/// one Redis.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .read()
            .await
            .get(channel)
            .map_or(0, |subscribers| subscribers.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, RelayError> {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .channels
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);
        debug!("Memory subscriber {} joined {}", id, channel);

        Ok(Box::new(MemorySubscription {
            id,
            channel: channel.to_string(),
            rx,
            inner: self.inner.clone(),
            subscribed: true,
        }))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RelayError> {
        if let Some(subscribers) = self.inner.channels.read().await.get(channel) {
            for tx in subscribers.values() {
                // A closed receiver belongs to a subscription being torn down.
                let _ = tx.send(payload.to_string());
            }
        }
        Ok(())
    }

    async fn push_capped(&self, key: &str, payload: &str, cap: usize) -> Result<(), RelayError> {
        let mut lists = self.inner.lists.lock().await;
        let list = lists.entry(key.to_string()).or_default();
        list.push_back(payload.to_string());
        while list.len() > cap {
            list.pop_front();
        }
        Ok(())
    }

    async fn head(&self, key: &str, count: usize) -> Result<Vec<String>, RelayError> {
        let lists = self.inner.lists.lock().await;
        Ok(lists
            .get(key)
            .map(|list| list.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }
}

struct MemorySubscription {
    id: u64,
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    inner: Arc<Inner>,
    subscribed: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_payload(&mut self, wait: Duration) -> Result<Option<String>, RelayError> {
        if !self.subscribed {
            return Err(RelayError::Broker(format!("{} is unsubscribed", self.channel)));
        }
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(RelayError::Broker(format!("{} was closed", self.channel))),
            Err(_) => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), RelayError> {
        let mut channels = self.inner.channels.write().await;
        if let Some(subscribers) = channels.get_mut(&self.channel) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                channels.remove(&self.channel);
            }
        }
        self.subscribed = false;
        Ok(())
    }

    async fn release(&mut self) {
        self.rx.close();
    }
}
