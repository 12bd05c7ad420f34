//! Session orchestration: turns voice, presence and room events into room
//! transitions, primary writes and lifecycle notifications.

use std::{sync::Arc, time::Duration};

use tokio::{sync::broadcast, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, Timestamp},
    config::CoreConfig,
    dao::models::{
        ActivityEntity, LeadershipEntity, MAX_NAME_LENGTH, MemberEntity, PresenceEntity, SessionEntity,
        SessionPatch,
    },
    error::ServiceError,
    platform::{ChannelId, Member, MemberId, MemberSnapshot, PlatformClient, RoomSpec, room_overwrites},
    services::{
        mutator::{EditOutcome, RoomMutator},
        tracker::{ActivityChange, ActivityTracker},
        writer::{DeferredWriter, Operation, OrderingClass, operation},
    },
    state::{
        Confirmation, LifecycleEvent, OrchestratorState, RoomAction, RoomEvent, RoomPhase,
        RoomState, SharedState,
    },
};

/// How long a flag for an orchestrator-issued rename suppresses the matching room update.
const OWN_ACTION_TTL: Duration = Duration::from_secs(30);

/// Shared handle on the orchestrator.
pub type SharedOrchestrator = Arc<SessionOrchestrator>;

/// Channel layout and session policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Joining this channel creates a room.
    pub create_channel: ChannelId,
    /// Category rooms are created in.
    pub room_category: ChannelId,
    /// Bounded wait for a pending registration.
    pub confirmation_timeout: Duration,
    /// Shorter sessions are not retained in reports.
    pub min_session_duration: Duration,
}

impl From<&CoreConfig> for OrchestratorSettings {
    fn from(config: &CoreConfig) -> Self {
        Self {
            create_channel: config.create_channel_id,
            room_category: config.room_category_id,
            confirmation_timeout: config.confirmation_timeout,
            min_session_duration: config.min_session_duration,
        }
    }
}

/// What happened to a room after a member left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Unchanged,
    Transferred,
    Closed,
}

/// Owns every room and drives it through its lifecycle.
pub struct SessionOrchestrator {
    pub(crate) state: SharedState,
    pub(crate) platform: Arc<dyn PlatformClient>,
    pub(crate) writer: DeferredWriter,
    pub(crate) tracker: ActivityTracker,
    pub(crate) mutator: RoomMutator,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: OrchestratorSettings,
}

impl SessionOrchestrator {
    /// Build an orchestrator with fresh in-memory state.
    pub fn new(
        config: &CoreConfig,
        platform: Arc<dyn PlatformClient>,
        writer: DeferredWriter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: OrchestratorState::new(config.creation_cooldown, OWN_ACTION_TTL),
            tracker: ActivityTracker::new(config.dedup_ttl, clock.clone()),
            mutator: RoomMutator::new(platform.clone(), config.mutator),
            platform,
            writer,
            clock,
            settings: OrchestratorSettings::from(config),
        }
    }

    /// In-memory room state.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Writer used for every store mutation.
    pub fn writer(&self) -> &DeferredWriter {
        &self.writer
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.state.lifecycle().subscribe()
    }

    /// A member's voice channel changed from `before` to `after`.
    ///
    /// Leaving is handled before joining; both sides run even if one fails and
    /// the first error is returned.
    pub async fn on_voice_state_change(
        &self,
        member: &Member,
        before: Option<ChannelId>,
        after: Option<ChannelId>,
    ) -> Result<(), ServiceError> {
        if member.bot || before == after {
            return Ok(());
        }

        let mut first_error = None;
        if let Some(room) = before.filter(|room| *room != self.settings.create_channel) {
            if let Err(err) = self.leave_room(member, room).await {
                warn!(member = %member.id, room = %room, error = %err, "leave handling failed");
                first_error.get_or_insert(err);
            }
        }

        let joined = match after {
            Some(room) if room == self.settings.create_channel => {
                self.create_session(member).await.map(|_| ())
            }
            Some(room) => self.join_room(member, room).await,
            None => Ok(()),
        };
        if let Err(err) = joined {
            warn!(member = %member.id, error = %err, "join handling failed");
            first_error.get_or_insert(err);
        }

        first_error.map_or(Ok(()), Err)
    }

    /// A member's presence changed; record activity intervals.
    pub async fn on_presence_change(
        &self,
        before: &MemberSnapshot,
        after: &MemberSnapshot,
    ) -> Result<(), ServiceError> {
        let change = self.tracker.on_activity_changed(before, after);
        if change.is_empty() {
            return Ok(());
        }
        let recorded = self.record_activity(change).await;
        if recorded.is_err() {
            // A redelivery must not be mistaken for a duplicate.
            self.tracker.forget(before, after);
        }
        recorded
    }

    async fn record_activity(&self, change: ActivityChange) -> Result<(), ServiceError> {
        if let Some(close) = change.close {
            self.write_ordered(
                "close_activity",
                operation(move |store| {
                    store.close_activity(close.member, close.activity_id.clone(), close.at)
                }),
            )
            .await?;
        }
        if let Some(open) = change.open {
            let interval = ActivityEntity::from(open);
            self.write_ordered(
                "open_activity",
                operation(move |store| store.open_activity(interval.clone())),
            )
            .await?;
        }
        Ok(())
    }

    /// A member joined the guild.
    pub async fn on_member_join_guild(&self, member: &Member) -> Result<(), ServiceError> {
        if member.bot {
            return Ok(());
        }
        self.upsert_member(member, None).await
    }

    /// A room was edited on the platform. Echoes of the orchestrator's own
    /// renames are dropped; anything else is a user rename and is persisted.
    pub async fn on_room_updated(&self, room: ChannelId, name: &str) -> Result<(), ServiceError> {
        if self.state.own_actions().take_fresh(&(room, RoomAction::Rename)) {
            debug!(room = %room, "ignoring echo of own rename");
            return Ok(());
        }

        let _gate = self.state.lock_room(room).await;
        let Some(current) = self.state.room(room) else {
            return Ok(());
        };
        if current.name == name {
            return Ok(());
        }

        let name = validate_room_name(name)?;
        self.persist_name(room, &name).await?;
        info!(room = %room, name = %name, "room renamed on the platform");
        Ok(())
    }

    /// Rename a session on behalf of its leader. The new name becomes the
    /// leader's default for rooms they open later.
    pub async fn rename_session(
        &self,
        requester: MemberId,
        room: ChannelId,
        name: &str,
    ) -> Result<EditOutcome, ServiceError> {
        let name = validate_room_name(name)?;

        let _gate = self.state.lock_room(room).await;
        let current = self
            .state
            .room(room)
            .ok_or_else(|| ServiceError::NotFound(format!("room `{room}`")))?;
        if current.phase() != RoomPhase::Active {
            return Err(ServiceError::InvalidState(format!(
                "room `{room}` is {:?}",
                current.phase()
            )));
        }
        if current.leader_id != requester {
            return Err(ServiceError::Unauthorized(
                "only the room leader can rename it".into(),
            ));
        }

        let flag = (room, RoomAction::Rename);
        self.state.own_actions().touch(flag);
        let outcome = self
            .mutator
            .edit_name_and_category(
                room,
                name.clone(),
                Some(self.settings.room_category),
                room_overwrites(current.leader_id, &[]),
            )
            .await;

        match outcome {
            Ok(EditOutcome::Renamed) => {}
            Ok(EditOutcome::NameDeferred) => {
                self.state.own_actions().take_fresh(&flag);
                info!(room = %room, "rename deferred by platform limits");
                return Ok(EditOutcome::NameDeferred);
            }
            Err(err) => {
                self.state.own_actions().take_fresh(&flag);
                return Err(err.into());
            }
        }

        self.persist_name(room, &name).await?;
        if let Some(leader) = current.members.get(&requester) {
            if let Err(err) = self.upsert_member(leader, Some(name)).await {
                warn!(member = %requester, error = %err, "failed to store default room name");
            }
        }
        Ok(EditOutcome::Renamed)
    }

    /// Open a room for `member`, who just joined the create-room channel.
    ///
    /// A member still leading an open session who is inside the creation
    /// cooldown is held back for the rest of the cooldown, then moved to that
    /// room if it is still active.
    pub async fn create_session(&self, member: &Member) -> Result<ChannelId, ServiceError> {
        let _creating = self.state.lock_creation(member.id).await;
        let led = self
            .writer
            .primary()
            .unclosed_session_for_leader(member.id)
            .await?;
        if let Some(session) = led {
            if let Some(wait) = self.state.creation_cooldowns().remaining(&member.id) {
                info!(member = %member.id, wait_ms = wait.as_millis() as u64, "creation cooldown active");
                sleep(wait).await;
            }
            if self.reuse_room(member, session.channel_id).await {
                return Ok(session.channel_id);
            }
        }
        self.state.creation_cooldowns().touch(member.id);

        let name = self.default_room_name(member).await;
        let room = self
            .platform
            .create_room(RoomSpec {
                name: name.clone(),
                category: self.settings.room_category,
                overwrites: room_overwrites(member.id, &[]),
            })
            .await?;
        self.state.confirmations().expect(room);

        let _gate = self.state.lock_room(room).await;
        let at = self.clock.now();
        if let Err(err) = self.register_session(room, member, name.clone(), at).await {
            self.state.confirmations().abandon(room);
            warn!(room = %room, error = %err, "session registration failed; removing room");
            if let Err(delete_err) = self.platform.delete_room(room).await {
                debug!(room = %room, error = %delete_err, "room cleanup failed");
            }
            return Err(err);
        }
        self.state.confirmations().confirm(room);

        if let Err(err) = self.platform.move_member(member.id, room).await {
            warn!(member = %member.id, room = %room, error = %err, "failed to move creator");
        }
        self.post_session_log(room, member, &name).await;
        if let Err(err) = self.upsert_member(member, None).await {
            warn!(member = %member.id, error = %err, "member upsert failed");
        }

        info!(room = %room, leader = %member.id, name = %name, "session opened");
        Ok(room)
    }

    /// Hand leadership of `room` to `to`.
    pub async fn transfer_leadership(&self, room: ChannelId, to: &Member) -> Result<(), ServiceError> {
        let _gate = self.state.lock_room(room).await;
        let current = self
            .state
            .room(room)
            .ok_or_else(|| ServiceError::NotFound(format!("room `{room}`")))?;
        if !current.members.contains_key(&to.id) {
            return Err(ServiceError::InvalidInput(format!(
                "member `{}` is not in room `{room}`",
                to.id
            )));
        }
        if current.leader_id == to.id {
            return Ok(());
        }
        self.transfer_locked(room, current.leader_id, to, self.clock.now())
            .await
    }

    /// End the session of `room` and delete it. No-op for unmanaged rooms.
    pub async fn close_session(&self, room: ChannelId) -> Result<(), ServiceError> {
        let _gate = self.state.lock_room(room).await;
        self.close_locked(room, self.clock.now()).await
    }

    async fn join_room(&self, member: &Member, room: ChannelId) -> Result<(), ServiceError> {
        if self.state.confirmations().is_pending(room) {
            match self
                .state
                .confirmations()
                .wait_for(room, self.settings.confirmation_timeout)
                .await
            {
                Confirmation::Confirmed | Confirmation::NotPending => {}
                outcome @ (Confirmation::TimedOut | Confirmation::Abandoned) => {
                    warn!(
                        room = %room,
                        member = %member.id,
                        ?outcome,
                        "room not registered; leaving join to reconciliation"
                    );
                    return Ok(());
                }
            }
        }

        let _gate = self.state.lock_room(room).await;
        let Some(current) = self.state.room(room) else {
            debug!(room = %room, "join in unmanaged channel");
            return Ok(());
        };
        if current.phase() != RoomPhase::Active || current.members.contains_key(&member.id) {
            return Ok(());
        }

        self.record_join(room, member, self.clock.now()).await?;
        if let Err(err) = self.upsert_member(member, None).await {
            warn!(member = %member.id, error = %err, "member upsert failed");
        }
        Ok(())
    }

    async fn leave_room(&self, member: &Member, room: ChannelId) -> Result<(), ServiceError> {
        let _gate = self.state.lock_room(room).await;
        let Some(current) = self.state.room(room) else {
            return Ok(());
        };
        if current.phase() != RoomPhase::Active || !current.members.contains_key(&member.id) {
            return Ok(());
        }

        let at = self.clock.now();
        self.record_leave(room, member.id, at).await?;
        self.settle_room(room, at).await.map(|_| ())
    }

    /// Register a session for `room` led by `leader`. Caller holds the room gate.
    pub(crate) async fn register_session(
        &self,
        room: ChannelId,
        leader: &Member,
        name: String,
        at: Timestamp,
    ) -> Result<(), ServiceError> {
        self.state
            .insert_room(RoomState::new(room, leader, name.clone(), at));

        let session = SessionEntity {
            channel_id: room,
            creator_id: leader.id,
            leader_id: leader.id,
            name,
            began_at: at,
            ended_at: None,
            log_message_id: None,
        };
        let leadership = LeadershipEntity {
            channel_id: room,
            member_id: leader.id,
            began_at: at,
            ended_at: None,
        };
        let presence = PresenceEntity {
            channel_id: room,
            member_id: leader.id,
            began_at: at,
            ended_at: None,
        };

        let create = operation(move |store| store.create_session(session.clone()));
        let lead = operation(move |store| store.open_leadership(leadership.clone()));
        let attend = operation(move |store| store.open_presence(presence.clone()));

        let registered = self
            .state
            .run_transition(room, RoomEvent::Create { leader: leader.id }, || async {
                self.write_ordered("create_session", create).await?;
                self.write_ordered("open_leadership", lead).await?;
                self.write_ordered("open_presence", attend).await
            })
            .await;

        if let Err(err) = registered {
            self.state.remove_room(room);
            return Err(err);
        }

        self.state.with_room(room, |state| {
            state.members.insert(leader.id, leader.clone());
        });
        self.state.lifecycle().broadcast(LifecycleEvent::SessionBegin {
            room,
            leader: leader.id,
            at,
        });
        Ok(())
    }

    /// Record `member` entering `room`. Caller holds the gate.
    pub(crate) async fn record_join(
        &self,
        room: ChannelId,
        member: &Member,
        at: Timestamp,
    ) -> Result<(), ServiceError> {
        let presence = PresenceEntity {
            channel_id: room,
            member_id: member.id,
            began_at: at,
            ended_at: None,
        };
        let attend = operation(move |store| store.open_presence(presence.clone()));
        self.state
            .run_transition(room, RoomEvent::MemberJoined(member.id), || {
                self.write_ordered("open_presence", attend)
            })
            .await?;

        self.state.with_room(room, |state| {
            state.members.insert(member.id, member.clone());
        });
        self.state.lifecycle().broadcast(LifecycleEvent::MemberJoin {
            room,
            member: member.id,
            at,
        });
        debug!(room = %room, member = %member.id, "member joined");
        Ok(())
    }

    /// Record `member` leaving `room`. Caller holds the gate.
    pub(crate) async fn record_leave(
        &self,
        room: ChannelId,
        member: MemberId,
        at: Timestamp,
    ) -> Result<(), ServiceError> {
        let depart = operation(move |store| store.close_presence(room, member, at));
        self.state
            .run_transition(room, RoomEvent::MemberLeft(member), || {
                self.write_ordered("close_presence", depart)
            })
            .await?;

        self.state.with_room(room, |state| {
            state.members.shift_remove(&member);
        });
        self.state.lifecycle().broadcast(LifecycleEvent::MemberAbandon { room, member, at });
        debug!(room = %room, member = %member, "member left");
        Ok(())
    }

    /// Close `room` when nobody is left, or hand leadership over when its
    /// leader is gone. Caller holds the gate.
    pub(crate) async fn settle_room(
        &self,
        room: ChannelId,
        at: Timestamp,
    ) -> Result<Settlement, ServiceError> {
        let Some(current) = self.state.room(room) else {
            return Ok(Settlement::Unchanged);
        };
        if current.members.is_empty() {
            self.close_locked(room, at).await?;
            return Ok(Settlement::Closed);
        }
        if current.members.contains_key(&current.leader_id) {
            return Ok(Settlement::Unchanged);
        }
        match current.next_leader(current.leader_id) {
            Some(next) => {
                self.transfer_locked(room, current.leader_id, &next, at)
                    .await?;
                Ok(Settlement::Transferred)
            }
            None => Ok(Settlement::Unchanged),
        }
    }

    /// Caller holds the gate.
    pub(crate) async fn transfer_locked(
        &self,
        room: ChannelId,
        from: MemberId,
        to: &Member,
        at: Timestamp,
    ) -> Result<(), ServiceError> {
        let leadership = LeadershipEntity {
            channel_id: room,
            member_id: to.id,
            began_at: at,
            ended_at: None,
        };
        let patch = SessionPatch {
            leader_id: Some(to.id),
            ..SessionPatch::for_session(room)
        };

        let lead = operation(move |store| store.open_leadership(leadership.clone()));
        let record_leader = operation(move |store| store.update_session(patch.clone()));
        self.state
            .run_transition(room, RoomEvent::TransferLeader { from, to: to.id }, || async {
                self.write_ordered("open_leadership", lead).await?;
                self.write_ordered("update_session", record_leader).await
            })
            .await?;

        self.state.with_room(room, |state| state.leader_id = to.id);
        self.state.advance(room, RoomEvent::LeaderSettled)?;

        if let Err(err) = self
            .mutator
            .apply_overwrites(room, room_overwrites(to.id, &[from]))
            .await
        {
            warn!(room = %room, leader = %to.id, error = %err, "failed to apply leader overwrites");
        }

        self.state.lifecycle().broadcast(LifecycleEvent::LeaderChange {
            room,
            from,
            to: to.id,
            at,
        });
        info!(room = %room, from = %from, to = %to.id, "leadership transferred");
        Ok(())
    }

    /// End the session and delete the room. Caller holds the gate.
    pub(crate) async fn close_locked(&self, room: ChannelId, at: Timestamp) -> Result<(), ServiceError> {
        let Some(current) = self.state.room(room) else {
            return Ok(());
        };

        if current.phase() != RoomPhase::Closing {
            let end = operation(move |store| store.end_session(room, at));
            self.state
                .run_transition(room, RoomEvent::BeginClosing, || {
                    self.write_ordered("end_session", end)
                })
                .await?;
        }

        match self.platform.delete_room(room).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => debug!(room = %room, "room already deleted"),
            Err(err) => warn!(room = %room, error = %err, "failed to delete room"),
        }
        self.state.advance(room, RoomEvent::Closed)?;
        self.state.remove_room(room);
        self.mutator.forget(room);

        let duration = at.elapsed_since(current.began_at);
        let retained = duration >= self.settings.min_session_duration;
        if !retained {
            if let Some(message) = current.log_message_id {
                match self.platform.delete_message(message).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => debug!(room = %room, "log message already gone"),
                    Err(err) => warn!(room = %room, error = %err, "failed to delete log message"),
                }
            }
        }

        self.state.lifecycle().broadcast(LifecycleEvent::SessionOver {
            room,
            ended_at: at,
            duration_secs: duration.as_secs(),
            retained,
        });
        info!(room = %room, duration_secs = duration.as_secs(), retained, "session closed");
        Ok(())
    }

    async fn reuse_room(&self, member: &Member, room: ChannelId) -> bool {
        let leads_active_room = self.state.room(room).is_some_and(|state| {
            state.phase() == RoomPhase::Active && state.leader_id == member.id
        });
        if !leads_active_room {
            return false;
        }
        match self.platform.move_member(member.id, room).await {
            Ok(()) => {
                info!(member = %member.id, room = %room, "moved member back to the room it leads");
                true
            }
            Err(err) => {
                debug!(member = %member.id, room = %room, error = %err, "room reuse failed");
                false
            }
        }
    }

    async fn default_room_name(&self, member: &Member) -> String {
        let preferred = match self.writer.primary().find_member(member.id).await {
            Ok(entity) => entity.and_then(|entity| entity.default_session_name),
            Err(err) => {
                warn!(member = %member.id, error = %err, "member lookup failed");
                None
            }
        };
        let name = preferred.unwrap_or_else(|| format!("{}'s room", member.display_name));
        truncate_name(&name)
    }

    async fn post_session_log(&self, room: ChannelId, leader: &Member, name: &str) {
        let text = format!("{} opened {name}", leader.display_name);
        let message = match self.platform.post_log(room, text).await {
            Ok(message) => message,
            Err(err) => {
                warn!(room = %room, error = %err, "failed to post session log");
                return;
            }
        };
        self.state
            .with_room(room, |state| state.log_message_id = Some(message));

        let patch = SessionPatch {
            log_message_id: Some(message),
            ..SessionPatch::for_session(room)
        };
        let stored = self
            .write_ordered(
                "update_session",
                operation(move |store| store.update_session(patch.clone())),
            )
            .await;
        if let Err(err) = stored {
            warn!(room = %room, error = %err, "failed to attach log message");
        }
    }

    async fn persist_name(&self, room: ChannelId, name: &str) -> Result<(), ServiceError> {
        let patch = SessionPatch {
            name: Some(name.to_owned()),
            ..SessionPatch::for_session(room)
        };
        self.write_ordered(
            "update_session",
            operation(move |store| store.update_session(patch.clone())),
        )
        .await?;
        self.state
            .with_room(room, |state| state.name = name.to_owned());
        Ok(())
    }

    /// Session-scoped write: primary inline, replicas in submission order.
    async fn write_ordered(&self, label: &'static str, op: Operation) -> Result<(), ServiceError> {
        Ok(self.writer.write(label, op, OrderingClass::Ordered).await?)
    }

    /// Upsert the member row, keeping the stored default name unless one is given.
    async fn upsert_member(
        &self,
        member: &Member,
        default_session_name: Option<String>,
    ) -> Result<(), ServiceError> {
        let default_session_name = match default_session_name {
            Some(name) => Some(name),
            None => self
                .writer
                .primary()
                .find_member(member.id)
                .await?
                .and_then(|entity| entity.default_session_name),
        };
        let entity = MemberEntity {
            id: member.id,
            display_name: truncate_name(&member.display_name),
            default_session_name,
        };
        self.writer
            .write(
                "upsert_member",
                operation(move |store| store.upsert_member(entity.clone())),
                OrderingClass::Unordered,
            )
            .await?;
        Ok(())
    }
}

fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LENGTH as usize).collect()
}

/// Trim `name` and check it fits a room name.
pub fn validate_room_name(name: &str) -> Result<String, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::InvalidInput("room name must not be empty".into()));
    }
    if name.chars().count() as u64 > MAX_NAME_LENGTH {
        return Err(ServiceError::InvalidInput(format!(
            "room name must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(name.to_owned())
}
