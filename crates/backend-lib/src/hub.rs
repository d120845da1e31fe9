// ============================
// crates/backend-lib/src/hub.rs
// ============================
//! Broadcast primitive: publish a message to every subscriber of a channel.
//!
//! Delivery is at-most-once and best effort. A publish with no subscribers,
//! or to a subscriber that lagged behind, is silently lost.
use dashmap::DashMap;
use pika_common::ServerMessage;
use tokio::sync::broadcast;

/// Per-channel buffer before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 128;

/// Where a message is published
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Shared channel every connection follows (session start/end, now playing)
    Discovery,
    /// Listeners and the DJ of one session
    Session(String),
}

/// The broadcast primitive the coordinator publishes through
pub trait Broadcaster: Send + Sync {
    /// Non-blocking, never fails the caller
    fn publish(&self, channel: &Channel, message: ServerMessage);

    /// Follow a channel, creating it on first use
    fn subscribe(&self, channel: &Channel) -> broadcast::Receiver<ServerMessage>;

    /// Drop a channel once nothing more will be published on it
    fn close(&self, _channel: &Channel) {}
}

/// In-process hub, one `tokio::sync::broadcast` sender per channel
#[derive(Default)]
pub struct ChannelHub {
    channels: DashMap<Channel, broadcast::Sender<ServerMessage>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow a channel, creating it on first use
    pub fn subscribe(&self, channel: &Channel) -> broadcast::Receiver<ServerMessage> {
        self.channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Broadcaster for ChannelHub {
    fn subscribe(&self, channel: &Channel) -> broadcast::Receiver<ServerMessage> {
        ChannelHub::subscribe(self, channel)
    }

    fn publish(&self, channel: &Channel, message: ServerMessage) {
        let Some(sender) = self.channels.get(channel) else {
            tracing::trace!(?channel, "No subscribers, dropping broadcast");
            return;
        };

        if sender.send(message).is_err() {
            tracing::trace!(?channel, "All subscribers gone, dropping broadcast");
        }
    }

    fn close(&self, channel: &Channel) {
        // Receivers drain what is buffered, then observe `Closed`
        self.channels.remove(channel);
    }
}
