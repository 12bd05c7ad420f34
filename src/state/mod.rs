pub mod confirmations;
pub mod cooldown;
pub mod lifecycle;
pub mod room;

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::warn;

use crate::{
    error::ServiceError,
    platform::{ChannelId, MemberId},
};

pub use self::confirmations::{Confirmation, ConfirmationRegistry};
pub use self::cooldown::CooldownCache;
pub use self::lifecycle::{LifecycleEvent, LifecycleHub};
pub use self::room::{
    AbortError, ApplyError, Plan, PlanError, PlanId, RoomEvent, RoomPhase, RoomState,
};

pub type SharedState = Arc<OrchestratorState>;
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(10);
const LIFECYCLE_CAPACITY: usize = 64;

/// Structural actions the orchestrator performs itself, whose platform echoes must be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomAction {
    /// A rename issued through the mutator.
    Rename,
}

/// In-memory orchestrator state: rooms, per-room gates, caches and flags.
///
/// Constructed once per process; every map here is owned by this instance.
pub struct OrchestratorState {
    rooms: DashMap<ChannelId, RoomState>,
    gates: DashMap<ChannelId, Arc<Mutex<()>>>,
    creation_gates: DashMap<MemberId, Arc<Mutex<()>>>,
    creation_cooldowns: CooldownCache<MemberId>,
    own_actions: CooldownCache<(ChannelId, RoomAction)>,
    confirmations: ConfirmationRegistry,
    lifecycle: LifecycleHub,
    transition_timeout: Option<Duration>,
}

impl OrchestratorState {
    /// Build the state. `creation_cooldown` throttles room re-creation per member and
    /// `flag_ttl` bounds how long an own-action flag suppresses its echo.
    pub fn new(creation_cooldown: Duration, flag_ttl: Duration) -> SharedState {
        Arc::new(Self {
            rooms: DashMap::new(),
            gates: DashMap::new(),
            creation_gates: DashMap::new(),
            creation_cooldowns: CooldownCache::new(creation_cooldown),
            own_actions: CooldownCache::new(flag_ttl),
            confirmations: ConfirmationRegistry::new(),
            lifecycle: LifecycleHub::new(LIFECYCLE_CAPACITY),
            transition_timeout: Some(DEFAULT_TRANSITION_TIMEOUT),
        })
    }

    /// Per-member room creation cooldowns.
    pub fn creation_cooldowns(&self) -> &CooldownCache<MemberId> {
        &self.creation_cooldowns
    }

    /// Flags marking structural edits the orchestrator issued itself.
    pub fn own_actions(&self) -> &CooldownCache<(ChannelId, RoomAction)> {
        &self.own_actions
    }

    /// Pending session registrations.
    pub fn confirmations(&self) -> &ConfirmationRegistry {
        &self.confirmations
    }

    /// Broadcast hub used for lifecycle events.
    pub fn lifecycle(&self) -> &LifecycleHub {
        &self.lifecycle
    }

    /// Serialise handlers touching `room`. Different rooms never contend.
    pub async fn lock_room(&self, room: ChannelId) -> OwnedMutexGuard<()> {
        lock_gate(&self.gates, room).await
    }

    /// Serialise room creation for `member`. Taken before the per-room gate.
    pub async fn lock_creation(&self, member: MemberId) -> OwnedMutexGuard<()> {
        lock_gate(&self.creation_gates, member).await
    }

    /// Whether `room` is managed.
    pub fn has_room(&self, room: ChannelId) -> bool {
        self.rooms.contains_key(&room)
    }

    /// Current phase of `room`, if managed.
    pub fn phase(&self, room: ChannelId) -> Option<RoomPhase> {
        self.rooms.get(&room).map(|state| state.phase())
    }

    /// Owned copy of the room state.
    pub fn room(&self, room: ChannelId) -> Option<RoomState> {
        self.rooms.get(&room).map(|state| state.clone())
    }

    /// Ids of every managed room.
    pub fn room_ids(&self) -> Vec<ChannelId> {
        self.rooms.iter().map(|entry| *entry.key()).collect()
    }

    /// Start managing a room, keeping any existing state.
    pub fn insert_room(&self, state: RoomState) {
        self.rooms.entry(state.channel_id).or_insert(state);
    }

    /// Stop managing a room.
    pub fn remove_room(&self, room: ChannelId) -> Option<RoomState> {
        self.rooms.remove(&room).map(|(_, state)| state)
    }

    /// Mutate the room in place. Never hold the returned value across an await.
    pub fn with_room<R>(&self, room: ChannelId, f: impl FnOnce(&mut RoomState) -> R) -> Option<R> {
        self.rooms.get_mut(&room).map(|mut state| f(state.value_mut()))
    }

    /// Apply a transition that needs no remote write.
    pub fn advance(&self, room: ChannelId, event: RoomEvent) -> Result<RoomPhase, ServiceError> {
        let outcome = self
            .with_room(room, |state| state.machine.advance(event))
            .ok_or_else(|| ServiceError::NotFound(format!("room `{room}` is not managed")))?;
        Ok(outcome?)
    }

    fn plan_transition(&self, room: ChannelId, event: RoomEvent) -> Result<Plan, ServiceError> {
        let plan = self
            .with_room(room, |state| state.machine.plan(event))
            .ok_or_else(|| ServiceError::NotFound(format!("room `{room}` is not managed")))?;
        Ok(plan?)
    }

    fn apply_planned_transition(
        &self,
        room: ChannelId,
        plan_id: PlanId,
    ) -> Result<RoomPhase, ServiceError> {
        let applied = self
            .with_room(room, |state| state.machine.apply(plan_id))
            .ok_or_else(|| ServiceError::NotFound(format!("room `{room}` is not managed")))?;
        Ok(applied?)
    }

    fn abort_transition(&self, room: ChannelId, plan_id: PlanId, event: &RoomEvent, reason: &str) {
        let aborted = self.with_room(room, |state| state.machine.abort(plan_id));
        if let Some(Err(abort_err)) = aborted {
            warn!(
                room = %room,
                event = ?event,
                plan_id = %plan_id,
                error = ?abort_err,
                reason,
                "failed to abort room transition"
            );
        }
    }

    /// Plan `event` on `room`, run the primary write `work`, then apply or abort.
    ///
    /// The caller must hold the room gate.
    pub async fn run_transition<F, Fut, T>(
        &self,
        room: ChannelId,
        event: RoomEvent,
        work: F,
    ) -> Result<(T, RoomPhase), ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ServiceError>>,
    {
        let Plan { id: plan_id, .. } = self.plan_transition(room, event.clone())?;

        let work_future = work();
        let outcome = if let Some(limit) = self.transition_timeout {
            match timeout(limit, work_future).await {
                Ok(result) => result,
                Err(_) => {
                    self.abort_transition(room, plan_id, &event, "timeout");
                    return Err(ServiceError::Timeout);
                }
            }
        } else {
            work_future.await
        };

        match outcome {
            Ok(value) => {
                let next = self.apply_planned_transition(room, plan_id)?;
                Ok((value, next))
            }
            Err(err) => {
                self.abort_transition(room, plan_id, &event, "work error");
                Err(err)
            }
        }
    }
}

async fn lock_gate<K>(gates: &DashMap<K, Arc<Mutex<()>>>, key: K) -> OwnedMutexGuard<()>
where
    K: Eq + std::hash::Hash,
{
    let gate = gates
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    gate.lock_owned().await
}
