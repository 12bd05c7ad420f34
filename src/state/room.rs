use std::time::Instant;

use indexmap::IndexMap;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    clock::Timestamp,
    dao::models::SessionEntity,
    platform::{ChannelId, Member, MemberId, MessageId},
};

/// Lifecycle phases of a single room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Room exists on the platform but no session is registered yet.
    Empty,
    /// Session registered and led by a present member.
    Active,
    /// Leadership is being handed over to the next member.
    LeaderTransfer,
    /// Session end recorded; the room is being deleted.
    Closing,
    /// Terminal.
    Closed,
}

/// Events that can be applied to a room state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// Register the session with its first leader.
    Create {
        /// Creator and first leader.
        leader: MemberId,
    },
    /// A member entered the room.
    MemberJoined(MemberId),
    /// A member left the room.
    MemberLeft(MemberId),
    /// Start handing leadership over.
    TransferLeader {
        /// Outgoing leader.
        from: MemberId,
        /// Incoming leader.
        to: MemberId,
    },
    /// Leadership hand-over finished.
    LeaderSettled,
    /// Record the session end.
    BeginClosing,
    /// Room deleted (or already gone).
    Closed,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the room was in when the invalid event was received.
    pub from: RoomPhase,
    /// The event that cannot be applied from this phase.
    pub event: RoomEvent,
}

/// Errors that can occur when planning a room transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    AlreadyPending,
    /// The requested transition is not valid from the current phase.
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned room transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
    /// Room phase changed since the plan was created.
    PhaseMismatch {
        /// Phase when plan was created.
        expected: RoomPhase,
        /// Current phase.
        actual: RoomPhase,
    },
}

/// Errors that can occur when aborting a planned room transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Unique identifier for a planned room transition.
pub type PlanId = Uuid;

/// A validated transition waiting for its primary write.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// Phase the room is currently in.
    pub from: RoomPhase,
    /// Phase the room will transition to.
    pub to: RoomPhase,
    /// Event that triggered this transition.
    pub event: RoomEvent,
    /// Timestamp when this plan was created.
    pub pending_since: Instant,
}

/// Per-room state machine with plan / apply / abort semantics.
///
/// A transition is planned, its primary-store write performed, and only then
/// applied; a failed write aborts the plan and leaves the phase untouched.
#[derive(Debug, Clone)]
pub struct RoomStateMachine {
    phase: RoomPhase,
    version: usize,
    pending: Option<Plan>,
}

impl Default for RoomStateMachine {
    fn default() -> Self {
        Self {
            phase: RoomPhase::Empty,
            version: 0,
            pending: None,
        }
    }
}

impl RoomStateMachine {
    /// Create a machine in the empty phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Machine for a session restored from the primary store.
    pub fn restored() -> Self {
        Self {
            phase: RoomPhase::Active,
            ..Self::default()
        }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    /// Number of transitions applied so far.
    pub fn version(&self) -> usize {
        self.version
    }

    /// Whether a plan is awaiting apply/abort.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Validate `event` against the current phase and park it as the pending plan.
    pub fn plan(&mut self, event: RoomEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self
            .compute_transition(&event)
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.phase,
            to: next,
            event,
            pending_since: Instant::now(),
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Apply a planned transition, returning the new phase.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<RoomPhase, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected_plan_id = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected: expected_plan_id,
                got: plan_id,
            });
        }

        if self.phase != plan.from {
            return Err(ApplyError::PhaseMismatch {
                expected: plan.from,
                actual: self.phase,
            });
        }

        self.phase = plan.to;
        self.version += 1;

        Ok(self.phase)
    }

    /// Drop a planned transition without applying it.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Plan and apply a transition that needs no remote write.
    pub fn advance(&mut self, event: RoomEvent) -> Result<RoomPhase, PlanError> {
        let plan = self.plan(event)?;
        self.phase = plan.to;
        self.version += 1;
        self.pending = None;
        Ok(self.phase)
    }

    fn compute_transition(&self, event: &RoomEvent) -> Result<RoomPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            (RoomPhase::Empty, RoomEvent::Create { .. }) => RoomPhase::Active,
            (RoomPhase::Active, RoomEvent::MemberJoined(_) | RoomEvent::MemberLeft(_)) => {
                RoomPhase::Active
            }
            (RoomPhase::Active, RoomEvent::TransferLeader { .. }) => RoomPhase::LeaderTransfer,
            (RoomPhase::LeaderTransfer, RoomEvent::LeaderSettled) => RoomPhase::Active,
            (RoomPhase::Active | RoomPhase::LeaderTransfer, RoomEvent::BeginClosing) => {
                RoomPhase::Closing
            }
            (RoomPhase::Closing, RoomEvent::Closed) => RoomPhase::Closed,
            (from, event) => {
                return Err(InvalidTransition {
                    from,
                    event: event.clone(),
                });
            }
        };

        Ok(next)
    }
}

/// In-memory view of one managed room. Members are keyed by id in platform order.
#[derive(Debug, Clone)]
pub struct RoomState {
    /// Voice channel id, also the session key.
    pub channel_id: ChannelId,
    /// Member who opened the room.
    pub creator_id: MemberId,
    /// Current leader.
    pub leader_id: MemberId,
    /// Room display name.
    pub name: String,
    /// Session begin.
    pub began_at: Timestamp,
    /// Log message announcing the session.
    pub log_message_id: Option<MessageId>,
    /// Non-bot members currently inside, in platform order.
    pub members: IndexMap<MemberId, Member>,
    /// Lifecycle state machine.
    pub machine: RoomStateMachine,
}

impl RoomState {
    /// Fresh room about to be registered.
    pub fn new(channel_id: ChannelId, leader: &Member, name: String, began_at: Timestamp) -> Self {
        Self {
            channel_id,
            creator_id: leader.id,
            leader_id: leader.id,
            name,
            began_at,
            log_message_id: None,
            members: IndexMap::new(),
            machine: RoomStateMachine::new(),
        }
    }

    /// Room rebuilt from an open session of the primary store; membership is re-derived later.
    pub fn restored(session: &SessionEntity) -> Self {
        Self {
            channel_id: session.channel_id,
            creator_id: session.creator_id,
            leader_id: session.leader_id,
            name: session.name.clone(),
            began_at: session.began_at,
            log_message_id: session.log_message_id,
            members: IndexMap::new(),
            machine: RoomStateMachine::restored(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> RoomPhase {
        self.machine.phase()
    }

    /// First member in platform order that is not `excluding`.
    pub fn next_leader(&self, excluding: MemberId) -> Option<Member> {
        self.members
            .values()
            .find(|member| !member.bot && member.id != excluding)
            .cloned()
    }
}
