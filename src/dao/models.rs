use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    clock::Timestamp,
    platform::{ChannelId, MemberId, MessageId},
};

/// Longest name the platform accepts for a voice channel.
pub const MAX_NAME_LENGTH: u64 = 100;

/// Guild member row. Created on first sighting, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct MemberEntity {
    /// Platform user id.
    pub id: MemberId,
    /// Last known display name.
    #[validate(length(min = 1, max = 100))]
    pub display_name: String,
    /// Name the member wants for rooms they open.
    #[validate(length(min = 1, max = 100))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_session_name: Option<String>,
}

/// Ephemeral room session, keyed by the voice channel id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct SessionEntity {
    /// Voice channel backing the session.
    pub channel_id: ChannelId,
    /// Member who opened the room.
    pub creator_id: MemberId,
    /// Member currently leading the room.
    pub leader_id: MemberId,
    /// Room display name.
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    /// When the room was opened.
    pub began_at: Timestamp,
    /// When the room was torn down; `None` while open.
    #[serde(default)]
    pub ended_at: Option<Timestamp>,
    /// Externally visible log message for this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message_id: Option<MessageId>,
}

impl SessionEntity {
    /// Whether the session has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Total duration in seconds once closed.
    pub fn duration_secs(&self) -> Option<i64> {
        self.ended_at.map(|end| end.seconds_since(self.began_at))
    }
}

/// Partial session update (PATCH). Only `Some` fields are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate, Default)]
pub struct SessionPatch {
    /// Session to update.
    #[serde(skip)]
    pub channel_id: ChannelId,
    /// New room name.
    #[validate(length(min = 1, max = 100))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New leader.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<MemberId>,
    /// Log message attached to the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_message_id: Option<MessageId>,
}

impl SessionPatch {
    /// Empty patch addressed at `channel_id`.
    pub fn for_session(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            ..Self::default()
        }
    }
}

/// Leadership interval. At most one is open per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeadershipEntity {
    /// Session the interval belongs to.
    pub channel_id: ChannelId,
    /// Leading member.
    pub member_id: MemberId,
    /// Start of the leadership.
    pub began_at: Timestamp,
    /// End of the leadership; `None` while open.
    #[serde(default)]
    pub ended_at: Option<Timestamp>,
}

/// Presence interval: a member physically inside a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEntity {
    /// Session the member is attending.
    pub channel_id: ChannelId,
    /// Attending member.
    pub member_id: MemberId,
    /// Join time.
    pub began_at: Timestamp,
    /// Leave time; `None` while present.
    #[serde(default)]
    pub ended_at: Option<Timestamp>,
}

/// Activity interval: a member playing something, independent of rooms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ActivityEntity {
    /// Playing member.
    pub member_id: MemberId,
    /// Stable activity identifier.
    #[validate(length(min = 1, max = 128))]
    pub activity_id: String,
    /// Activity display name.
    #[validate(length(min = 1, max = 128))]
    pub activity_name: String,
    /// Start of the activity.
    pub began_at: Timestamp,
    /// End of the activity; `None` while ongoing.
    #[serde(default)]
    pub ended_at: Option<Timestamp>,
}

/// Body of an interval-closing PATCH.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntervalEnd {
    /// Closing timestamp.
    pub ended_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(name: &str) -> SessionEntity {
        SessionEntity {
            channel_id: ChannelId(10),
            creator_id: MemberId(1),
            leader_id: MemberId(1),
            name: name.into(),
            began_at: Timestamp::from_unix(0),
            ended_at: None,
            log_message_id: None,
        }
    }

    #[test]
    fn session_name_is_validated() {
        assert!(session("Alice's room").validate().is_ok());
        assert!(session("").validate().is_err());
        assert!(session(&"x".repeat(MAX_NAME_LENGTH as usize + 1)).validate().is_err());
    }

    #[test]
    fn patch_serializes_only_present_fields() {
        let mut patch = SessionPatch::for_session(ChannelId(10));
        patch.leader_id = Some(MemberId(7));
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "leader_id": 7 }));
    }

    #[test]
    fn duration_is_known_once_closed() {
        let mut entity = session("room");
        assert_eq!(entity.duration_secs(), None);
        entity.ended_at = Some(Timestamp::from_unix(299));
        assert_eq!(entity.duration_secs(), Some(299));
        assert!(!entity.is_open());
    }
}
