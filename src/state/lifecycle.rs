use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    clock::Timestamp,
    platform::{ChannelId, MemberId},
};

/// Lifecycle notifications emitted once per real room transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A session was registered.
    SessionBegin {
        /// Room id.
        room: ChannelId,
        /// First leader.
        leader: MemberId,
        /// Session begin.
        at: Timestamp,
    },
    /// Leadership moved to another member.
    LeaderChange {
        /// Room id.
        room: ChannelId,
        /// Outgoing leader.
        from: MemberId,
        /// Incoming leader.
        to: MemberId,
        /// Hand-over instant, shared by both intervals.
        at: Timestamp,
    },
    /// A member entered a room.
    MemberJoin {
        /// Room id.
        room: ChannelId,
        /// Joining member.
        member: MemberId,
        /// Join time.
        at: Timestamp,
    },
    /// A member left a room.
    MemberAbandon {
        /// Room id.
        room: ChannelId,
        /// Leaving member.
        member: MemberId,
        /// Leave time.
        at: Timestamp,
    },
    /// The session ended and the room was torn down.
    SessionOver {
        /// Room id.
        room: ChannelId,
        /// Session end.
        ended_at: Timestamp,
        /// Total duration in seconds.
        duration_secs: u64,
        /// Whether the session counts as a completed session in reports.
        retained: bool,
    },
}

/// Broadcast hub for [`LifecycleEvent`]s.
pub struct LifecycleHub {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }
}
