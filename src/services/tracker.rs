//! Derives activity and presence intervals from raw before/after snapshots.
//!
//! Pure apart from the dedup cache: nothing here performs I/O; the
//! orchestrator forwards the derived changes to the writer.

use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    clock::{Clock, Timestamp},
    dao::models::ActivityEntity,
    platform::{Activity, ChannelId, MemberId, MemberSnapshot},
    state::CooldownCache,
};

/// An activity interval to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityIntervalStart {
    /// Playing member.
    pub member: MemberId,
    /// Started activity.
    pub activity: Activity,
    /// Start time.
    pub at: Timestamp,
}

impl From<ActivityIntervalStart> for ActivityEntity {
    fn from(start: ActivityIntervalStart) -> Self {
        Self {
            member_id: start.member,
            activity_id: start.activity.id,
            activity_name: start.activity.name,
            began_at: start.at,
            ended_at: None,
        }
    }
}

/// An activity interval to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityIntervalEnd {
    /// Member who stopped.
    pub member: MemberId,
    /// Stopped activity id.
    pub activity_id: String,
    /// End time.
    pub at: Timestamp,
}

/// Result of comparing two presence snapshots. Both sides may be set when
/// a member switches directly from one activity to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityChange {
    /// Interval to open.
    pub open: Option<ActivityIntervalStart>,
    /// Interval to close.
    pub close: Option<ActivityIntervalEnd>,
}

impl ActivityChange {
    /// Whether nothing needs to be written.
    pub fn is_empty(&self) -> bool {
        self.open.is_none() && self.close.is_none()
    }
}

/// Presence interval boundary for a member in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    /// The member entered the room.
    Opened {
        /// Room id.
        room: ChannelId,
        /// Member id.
        member: MemberId,
        /// Boundary timestamp.
        at: Timestamp,
    },
    /// The member left the room.
    Closed {
        /// Room id.
        room: ChannelId,
        /// Member id.
        member: MemberId,
        /// Boundary timestamp.
        at: Timestamp,
    },
}

impl PresenceEvent {
    /// Boundary timestamp.
    pub fn at(&self) -> Timestamp {
        match self {
            PresenceEvent::Opened { at, .. } | PresenceEvent::Closed { at, .. } => *at,
        }
    }
}

/// Activity/presence derivation with duplicate suppression.
pub struct ActivityTracker {
    seen: CooldownCache<String>,
    clock: Arc<dyn Clock>,
}

impl ActivityTracker {
    /// Tracker treating identical transitions within `dedup_ttl` as duplicates.
    pub fn new(dedup_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: CooldownCache::new(dedup_ttl),
            clock,
        }
    }

    /// Decide which activity intervals open and close between two snapshots.
    pub fn on_activity_changed(&self, before: &MemberSnapshot, after: &MemberSnapshot) -> ActivityChange {
        if after.member.bot {
            return ActivityChange::default();
        }

        let Some(key) = transition_key(before, after) else {
            return ActivityChange::default();
        };
        if self.seen.check_and_touch(key) {
            debug!(member = %after.member.id, "duplicate activity transition ignored");
            return ActivityChange::default();
        }
        self.seen.evict_expired();

        let at = self.clock.now();
        ActivityChange {
            open: after.activity.clone().map(|activity| ActivityIntervalStart {
                member: after.member.id,
                activity,
                at,
            }),
            close: before.activity.as_ref().map(|activity| ActivityIntervalEnd {
                member: after.member.id,
                activity_id: activity.id.clone(),
                at,
            }),
        }
    }

    /// Let the same transition through again, after its writes failed.
    pub fn forget(&self, before: &MemberSnapshot, after: &MemberSnapshot) {
        if let Some(key) = transition_key(before, after) {
            self.seen.forget(&key);
        }
    }

    /// Presence boundary for `member` entering (`joined`) or leaving `room`, stamped now.
    pub fn on_presence_changed(&self, member: MemberId, room: ChannelId, joined: bool) -> PresenceEvent {
        let at = self.clock.now();
        if joined {
            PresenceEvent::Opened { room, member, at }
        } else {
            PresenceEvent::Closed { room, member, at }
        }
    }
}

/// Dedup key of an activity transition, `None` when the activity did not change.
fn transition_key(before: &MemberSnapshot, after: &MemberSnapshot) -> Option<String> {
    let previous = before.activity.as_ref().map(|activity| activity.id.as_str());
    let current = after.activity.as_ref().map(|activity| activity.id.as_str());
    if previous == current {
        return None;
    }
    Some(format!(
        "{}:{}:{}",
        after.member.id,
        previous.unwrap_or("-"),
        current.unwrap_or("-")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, platform::Member};

    fn snapshot(activity: Option<&str>) -> MemberSnapshot {
        MemberSnapshot {
            member: Member::new(1, "alice"),
            activity: activity.map(|id| Activity {
                id: id.into(),
                name: id.to_uppercase(),
            }),
        }
    }

    fn tracker() -> (ActivityTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(1_000));
        (ActivityTracker::new(Duration::from_secs(5), clock.clone()), clock)
    }

    #[tokio::test(start_paused = true)]
    async fn starting_an_activity_opens_an_interval() {
        let (tracker, _) = tracker();
        let change = tracker.on_activity_changed(&snapshot(None), &snapshot(Some("chess")));
        let open = change.open.unwrap();
        assert_eq!(open.activity.id, "chess");
        assert_eq!(open.at, Timestamp::from_unix(1_000));
        assert!(change.close.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn switching_activity_closes_and_opens_at_same_instant() {
        let (tracker, _) = tracker();
        let change = tracker.on_activity_changed(&snapshot(Some("chess")), &snapshot(Some("go")));
        let (open, close) = (change.open.unwrap(), change.close.unwrap());
        assert_eq!(close.activity_id, "chess");
        assert_eq!(open.activity.id, "go");
        assert_eq!(open.at, close.at);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_event_within_ttl_is_a_noop() {
        let (tracker, _) = tracker();
        let first = tracker.on_activity_changed(&snapshot(None), &snapshot(Some("chess")));
        let second = tracker.on_activity_changed(&snapshot(None), &snapshot(Some("chess")));
        assert!(!first.is_empty());
        assert!(second.is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let third = tracker.on_activity_changed(&snapshot(None), &snapshot(Some("chess")));
        assert!(!third.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_transition_is_derived_again() {
        let (tracker, _) = tracker();
        let (before, after) = (snapshot(None), snapshot(Some("chess")));
        assert!(!tracker.on_activity_changed(&before, &after).is_empty());
        tracker.forget(&before, &after);
        assert!(!tracker.on_activity_changed(&before, &after).is_empty());
        assert!(tracker.on_activity_changed(&before, &after).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_activity_and_bots_are_ignored() {
        let (tracker, _) = tracker();
        assert!(tracker
            .on_activity_changed(&snapshot(Some("chess")), &snapshot(Some("chess")))
            .is_empty());

        let mut bot = snapshot(Some("music"));
        bot.member.bot = true;
        assert!(tracker.on_activity_changed(&snapshot(None), &bot).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn presence_events_carry_clock_time() {
        let (tracker, clock) = tracker();
        clock.advance(30);
        let event = tracker.on_presence_changed(MemberId(1), ChannelId(9), true);
        assert_eq!(
            event,
            PresenceEvent::Opened {
                room: ChannelId(9),
                member: MemberId(1),
                at: Timestamp::from_unix(1_030),
            }
        );
        assert!(matches!(
            tracker.on_presence_changed(MemberId(1), ChannelId(9), false),
            PresenceEvent::Closed { .. }
        ));
    }
}
