//! Live fan-out of accepted messages to channel subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use padlog_shared::{ChannelId, LogMessage};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Messages buffered per subscriber before it starts lagging.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Clone, Default)]
pub struct ChannelHub {
    channels: Arc<RwLock<HashMap<ChannelId, broadcast::Sender<Arc<LogMessage>>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel (creating its sender if missing).
    pub async fn subscribe(&self, channel: &ChannelId) -> broadcast::Receiver<Arc<LogMessage>> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0);
        let rx = tx.subscribe();

        debug!(
            channel = %channel,
            subscribers = tx.receiver_count(),
            "Subscriber joined channel"
        );
        rx
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub async fn publish(&self, channel: &ChannelId, message: &LogMessage) -> usize {
        let channels = self.channels.read().await;
        let Some(tx) = channels.get(channel) else {
            return 0;
        };
        // Err only means nobody is listening right now.
        tx.send(Arc::new(message.clone())).unwrap_or(0)
    }

    pub async fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Drop senders with no subscribers left.
    pub async fn purge_idle(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let removed = before - channels.len();
        if removed > 0 {
            debug!(removed, "Purged idle channel subscriptions");
        }
        removed
    }
}
