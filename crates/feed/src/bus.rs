//! In-process change bus.
//!
//! Stands in for the hosted realtime service: named channels, each scoped to
//! one table, fan change notices out to every subscriber. Delivery is
//! fire-and-forget; a subscriber that falls behind loses notices and is told
//! how many.

use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::event::RawChange;

/// Row filter applied on the subscriber side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Deliver every notice on the channel.
    All,
    /// Deliver notices whose row has `column == value`.
    Eq { column: String, value: String },
}

impl ChangeFilter {
    /// Filter on one column.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Parse the `column=eq.value` form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for any other operator or shape.
    pub fn parse(text: &str) -> Result<Self> {
        let (column, rest) = text
            .split_once('=')
            .ok_or_else(|| Error::config(format!("filter '{text}' has no '='")))?;
        let value = rest
            .strip_prefix("eq.")
            .ok_or_else(|| Error::config(format!("filter '{text}' uses an unsupported operator")))?;
        if column.is_empty() {
            return Err(Error::config(format!("filter '{text}' has no column")));
        }
        Ok(Self::eq(column, value))
    }

    /// Check if a notice passes this filter.
    pub fn matches(&self, change: &RawChange) -> bool {
        match self {
            Self::All => true,
            Self::Eq { column, value } => change.column(column) == Some(value.as_str()),
        }
    }
}

/// Subscription handle for one channel.
pub struct Subscription {
    channel: String,
    filter: ChangeFilter,
    receiver: Option<broadcast::Receiver<RawChange>>,
    missed: u64,
}

impl Subscription {
    /// Receive the next matching notice, or `None` once the channel is closed.
    ///
    /// Cancel safe: a notice is either returned or was filtered out.
    pub async fn recv(&mut self) -> Option<RawChange> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(change) if self.filter.matches(&change) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.missed = self.missed.saturating_add(skipped);
                    warn!(
                        channel = %self.channel,
                        skipped,
                        "Subscriber lagged; change notices were dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(channel = %self.channel, "Change channel closed");
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Receive a matching notice without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] once the channel is closed or the
    /// subscription was closed.
    pub fn try_recv(&mut self) -> Result<Option<RawChange>> {
        loop {
            let receiver = self.receiver.as_mut().ok_or(Error::ChannelClosed)?;
            match receiver.try_recv() {
                Ok(change) if self.filter.matches(&change) => return Ok(Some(change)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.missed = self.missed.saturating_add(skipped);
                    warn!(channel = %self.channel, skipped, "Subscriber lagged");
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.receiver = None;
                    return Err(Error::ChannelClosed);
                }
            }
        }
    }

    /// Unsubscribe. Later receives return `None`.
    pub fn close(&mut self) {
        if self.receiver.take().is_some() {
            debug!(channel = %self.channel, "Unsubscribed");
        }
    }

    /// Whether the subscription can still deliver notices.
    pub fn is_open(&self) -> bool {
        self.receiver.is_some()
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Notices lost to lag so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

/// Named broadcast channels for change notices.
pub struct ChangeBus {
    channels: RwLock<HashMap<String, broadcast::Sender<RawChange>>>,
    capacity: usize,
}

impl ChangeBus {
    /// Create a bus whose channels buffer `capacity` notices.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create a bus sized from configuration.
    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.channel_capacity)
    }

    /// Publish a notice. Returns how many subscribers it reached; zero is fine.
    pub async fn publish(&self, channel: &str, change: RawChange) -> usize {
        let channels = self.channels.read().await;
        let delivered = channels
            .get(channel)
            .and_then(|sender| sender.send(change.clone()).ok())
            .unwrap_or(0);
        debug!(
            channel,
            operation = %change.operation,
            delivered,
            "Published change notice"
        );
        delivered
    }

    /// Subscribe to a channel, opening it if needed.
    pub async fn subscribe(&self, channel: &str, filter: ChangeFilter) -> Subscription {
        let mut channels = self.channels.write().await;
        let receiver = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(channel, filter = ?filter, "Subscribed");
        Subscription {
            channel: channel.to_string(),
            filter,
            receiver: Some(receiver),
            missed: 0,
        }
    }

    /// Close a channel. Subscribers drain what is buffered, then see the end.
    pub async fn close_channel(&self, channel: &str) -> bool {
        self.channels.write().await.remove(channel).is_some()
    }

    /// Live subscribers on a channel.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::from_config(&FeedConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_parse() {
        assert_eq!(
            ChangeFilter::parse("user_id=eq.u1").unwrap(),
            ChangeFilter::eq("user_id", "u1")
        );
        assert!(ChangeFilter::parse("user_id=neq.u1").is_err());
        assert!(ChangeFilter::parse("user_id").is_err());
        assert!(ChangeFilter::parse("=eq.u1").is_err());
    }

    #[test]
    fn test_filter_matches_row_column() {
        let filter = ChangeFilter::eq("user_id", "u1");
        assert!(filter.matches(&RawChange::created(json!({"id": "n", "user_id": "u1"}))));
        assert!(!filter.matches(&RawChange::created(json!({"id": "n", "user_id": "u2"}))));
        assert!(!filter.matches(&RawChange::deleted("n")));
        assert!(ChangeFilter::All.matches(&RawChange::deleted("n")));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let bus = ChangeBus::default();
        assert_eq!(bus.publish("public-wills", RawChange::deleted("a")).await, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = ChangeBus::default();
        let mut sub = bus.subscribe("public-wills", ChangeFilter::All).await;

        bus.publish("public-wills", RawChange::deleted("a")).await;
        bus.publish("public-wills", RawChange::deleted("b")).await;

        assert_eq!(sub.recv().await.and_then(|c| c.record_id), Some("a".to_string()));
        assert_eq!(sub.recv().await.and_then(|c| c.record_id), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = ChangeBus::default();
        let mut wills = bus.subscribe("public-wills", ChangeFilter::All).await;

        bus.publish("notifications", RawChange::deleted("n1")).await;
        assert!(matches!(wills.try_recv(), Ok(None)));
    }

    #[tokio::test]
    async fn test_filtered_subscription_skips_other_rows() {
        let bus = ChangeBus::default();
        let mut mine = bus
            .subscribe("notifications", ChangeFilter::eq("user_id", "me"))
            .await;

        bus.publish("notifications", RawChange::created(json!({"id": "1", "user_id": "you"})))
            .await;
        bus.publish("notifications", RawChange::created(json!({"id": "2", "user_id": "me"})))
            .await;

        let got = mine.recv().await.unwrap();
        assert_eq!(got.column("id"), Some("2"));
    }

    #[tokio::test]
    async fn test_close_channel_ends_stream_after_drain() {
        let bus = ChangeBus::default();
        let mut sub = bus.subscribe("public-wills", ChangeFilter::All).await;
        bus.publish("public-wills", RawChange::deleted("a")).await;
        assert!(bus.close_channel("public-wills").await);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
        assert!(!sub.is_open());
    }

    #[tokio::test]
    async fn test_close_unsubscribes() {
        let bus = ChangeBus::default();
        let mut sub = bus.subscribe("public-wills", ChangeFilter::All).await;
        assert_eq!(bus.subscriber_count("public-wills").await, 1);

        sub.close();
        assert_eq!(bus.subscriber_count("public-wills").await, 0);
        assert!(sub.recv().await.is_none());
        assert!(matches!(sub.try_recv(), Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_counts_missed_notices() {
        let bus = ChangeBus::new(2);
        let mut sub = bus.subscribe("public-wills", ChangeFilter::All).await;
        for id in ["a", "b", "c", "d"] {
            bus.publish("public-wills", RawChange::deleted(id)).await;
        }

        let first = sub.recv().await.and_then(|c| c.record_id);
        assert_eq!(first, Some("c".to_string()));
        assert_eq!(sub.missed(), 2);
    }
}
