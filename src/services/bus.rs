//! Static event routing from platform events to handlers.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    error::ServiceError,
    platform::{ChannelId, Member, MemberSnapshot},
    services::orchestrator::{SessionOrchestrator, SharedOrchestrator},
};

/// Inbound events from the platform binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// A member moved between voice channels.
    VoiceStateChanged {
        /// Moving member.
        member: Member,
        /// Previous channel.
        before: Option<ChannelId>,
        /// New channel.
        after: Option<ChannelId>,
    },
    /// A member's presence (activity) changed.
    PresenceChanged {
        /// Snapshot before the change.
        before: MemberSnapshot,
        /// Snapshot after the change.
        after: MemberSnapshot,
    },
    /// A member joined the guild.
    MemberJoinedGuild(Member),
    /// A room was edited.
    RoomUpdated {
        /// Edited room.
        room: ChannelId,
        /// Name after the edit.
        name: String,
    },
    /// Periodic reconciliation trigger.
    ReconciliationTick,
}

/// Discriminant of [`PlatformEvent`], used as the routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`PlatformEvent::VoiceStateChanged`].
    VoiceStateChanged,
    /// [`PlatformEvent::PresenceChanged`].
    PresenceChanged,
    /// [`PlatformEvent::MemberJoinedGuild`].
    MemberJoinedGuild,
    /// [`PlatformEvent::RoomUpdated`].
    RoomUpdated,
    /// [`PlatformEvent::ReconciliationTick`].
    ReconciliationTick,
}

impl EventKind {
    /// Number of kinds.
    pub const COUNT: usize = 5;
    /// Every kind, in table order.
    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::VoiceStateChanged,
        EventKind::PresenceChanged,
        EventKind::MemberJoinedGuild,
        EventKind::RoomUpdated,
        EventKind::ReconciliationTick,
    ];

    /// Slot in the handler table.
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl PlatformEvent {
    /// Routing key of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            PlatformEvent::VoiceStateChanged { .. } => EventKind::VoiceStateChanged,
            PlatformEvent::PresenceChanged { .. } => EventKind::PresenceChanged,
            PlatformEvent::MemberJoinedGuild(_) => EventKind::MemberJoinedGuild,
            PlatformEvent::RoomUpdated { .. } => EventKind::RoomUpdated,
            PlatformEvent::ReconciliationTick => EventKind::ReconciliationTick,
        }
    }
}

/// Something that reacts to platform events.
pub trait EventHandler: Send + Sync {
    /// React to `event`.
    fn handle<'a>(&'a self, event: &'a PlatformEvent) -> BoxFuture<'a, Result<(), ServiceError>>;
}

impl EventHandler for SessionOrchestrator {
    fn handle<'a>(&'a self, event: &'a PlatformEvent) -> BoxFuture<'a, Result<(), ServiceError>> {
        Box::pin(async move {
            match event {
                PlatformEvent::VoiceStateChanged {
                    member,
                    before,
                    after,
                } => self.on_voice_state_change(member, *before, *after).await,
                PlatformEvent::PresenceChanged { before, after } => {
                    self.on_presence_change(before, after).await
                }
                PlatformEvent::MemberJoinedGuild(member) => self.on_member_join_guild(member).await,
                PlatformEvent::RoomUpdated { room, name } => self.on_room_updated(*room, name).await,
                PlatformEvent::ReconciliationTick => self.reconcile().await.map(|_| ()),
            }
        })
    }
}

/// Handler table indexed by [`EventKind`]. Built once at startup.
#[derive(Default)]
pub struct EventBus {
    handlers: [Vec<Arc<dyn EventHandler>>; EventKind::COUNT],
}

impl EventBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus routing every kind to the orchestrator.
    pub fn with_orchestrator(orchestrator: SharedOrchestrator) -> Self {
        let handler: Arc<dyn EventHandler> = orchestrator;
        let mut bus = Self::new();
        for kind in EventKind::ALL {
            bus.register(kind, handler.clone());
        }
        bus
    }

    /// Add `handler` for `kind`. Handlers run in registration order.
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers[kind.index()].push(handler);
    }

    /// Run every handler registered for the event's kind. Handler errors are
    /// logged and counted; the returned value is the number of failures.
    pub async fn dispatch(&self, event: &PlatformEvent) -> usize {
        let kind = event.kind();
        let handlers = &self.handlers[kind.index()];
        if handlers.is_empty() {
            debug!(?kind, "no handler registered");
            return 0;
        }

        let mut failures = 0;
        for handler in handlers {
            let outcome = handler
                .handle(event)
                .instrument(info_span!("platform_event", ?kind))
                .await;
            if let Err(err) = outcome {
                warn!(?kind, error = %err, "event handler failed");
                failures += 1;
            }
        }
        failures
    }
}
