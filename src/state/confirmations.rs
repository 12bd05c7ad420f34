use std::time::Duration;

use dashmap::DashMap;
use tokio::{sync::watch, time::timeout};

use crate::platform::ChannelId;

/// Outcome of waiting for a session to be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Nothing was pending for the resource.
    NotPending,
    /// The producer confirmed the resource.
    Confirmed,
    /// The producer gave up on the resource.
    Abandoned,
    /// The bounded wait elapsed first.
    TimedOut,
}

/// Bounded "wait until this session exists" handshake keyed by channel id.
///
/// The room creator registers the expectation before its primary write and
/// resolves it afterwards; dependent handlers wait with a timeout.
#[derive(Debug, Default)]
pub struct ConfirmationRegistry {
    pending: DashMap<ChannelId, watch::Sender<bool>>,
}

impl ConfirmationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce that `channel` is being registered.
    pub fn expect(&self, channel: ChannelId) {
        self.pending
            .entry(channel)
            .or_insert_with(|| watch::channel(false).0);
    }

    /// Resolve `channel`, waking every waiter.
    pub fn confirm(&self, channel: ChannelId) {
        if let Some((_, sender)) = self.pending.remove(&channel) {
            sender.send_replace(true);
        }
    }

    /// Give up on `channel`; waiters observe [`Confirmation::Abandoned`].
    pub fn abandon(&self, channel: ChannelId) {
        self.pending.remove(&channel);
    }

    /// Whether a registration for `channel` is in flight.
    pub fn is_pending(&self, channel: ChannelId) -> bool {
        self.pending.contains_key(&channel)
    }

    /// Wait at most `limit` for `channel` to be confirmed.
    pub async fn wait_for(&self, channel: ChannelId, limit: Duration) -> Confirmation {
        let Some(mut receiver) = self.pending.get(&channel).map(|sender| sender.subscribe()) else {
            return Confirmation::NotPending;
        };

        match timeout(limit, receiver.wait_for(|confirmed| *confirmed)).await {
            Ok(Ok(_)) => Confirmation::Confirmed,
            Ok(Err(_)) => Confirmation::Abandoned,
            Err(_) => Confirmation::TimedOut,
        }
    }
}
