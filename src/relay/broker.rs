use async_trait::async_trait;
use std::time::Duration;

use crate::error::RelayError;

#[cfg(test)]
use mockall::automock;

/// Networked store offering pub/sub channels and capped lists.
///
/// The broker is the only path by which state becomes visible to other
/// processes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a dedicated subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, RelayError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RelayError>;

    /// Appends `payload` to the tail of `key` and trims the list to its last
    /// `cap` entries, as one atomic unit.
    async fn push_capped(&self, key: &str, payload: &str, cap: usize) -> Result<(), RelayError>;

    /// Reads up to `count` entries from the head of `key`.
    async fn head(&self, key: &str, count: usize) -> Result<Vec<String>, RelayError>;
}

/// A live subscription to one channel.
#[async_trait]
pub trait Subscription: Send {
    fn channel(&self) -> &str;

    /// Waits at most `wait` for the next payload. `Ok(None)` means the wait
    /// timed out.
    async fn next_payload(&mut self, wait: Duration) -> Result<Option<String>, RelayError>;

    /// Drops the broker-side registration for the channel.
    async fn unsubscribe(&mut self) -> Result<(), RelayError>;

    /// Releases the underlying connection. Call after `unsubscribe`.
    async fn release(&mut self);
}
