//! Narrow contract towards the chat platform: identifiers, member snapshots and the
//! rate-limited HTTP calls the orchestrator issues against rooms.

use std::{fmt, time::Duration};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

snowflake!(
    /// Platform user identifier.
    MemberId
);
snowflake!(
    /// Platform channel identifier (voice rooms, categories, the create-room channel).
    ChannelId
);
snowflake!(
    /// Identifier of a message posted by the bot.
    MessageId
);

/// Guild member as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Platform user id.
    pub id: MemberId,
    /// Guild display name.
    pub display_name: String,
    /// Bots never lead rooms and are not tracked.
    pub bot: bool,
}

impl Member {
    /// Build a human member.
    pub fn new(id: u64, display_name: impl Into<String>) -> Self {
        Self {
            id: MemberId(id),
            display_name: display_name.into(),
            bot: false,
        }
    }

    /// Build a bot member.
    pub fn bot(id: u64, display_name: impl Into<String>) -> Self {
        Self {
            bot: true,
            ..Self::new(id, display_name)
        }
    }
}

/// Foreground activity ("playing X") a member reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Stable activity identifier (application id or normalised name).
    pub id: String,
    /// Human readable name.
    pub name: String,
}

/// Presence snapshot delivered with presence updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    /// The member the snapshot describes.
    pub member: Member,
    /// Tracked activity, if any.
    pub activity: Option<Activity>,
}

/// Who a permission overwrite applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverwriteTarget {
    /// The `@everyone` role of the guild.
    Everyone,
    /// A single member.
    Member(MemberId),
}

/// Permission preset applied by an overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionLevel {
    /// Manage the room: rename, move and mute members.
    Leader,
    /// Connect and speak only.
    Default,
}

/// A single permission overwrite on a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverwrite {
    /// Overwrite subject.
    pub target: OverwriteTarget,
    /// Granted preset.
    pub level: PermissionLevel,
}

/// Overwrites for a room led by `leader`; `demoted` members get explicit default rights.
pub fn room_overwrites(leader: MemberId, demoted: &[MemberId]) -> Vec<PermissionOverwrite> {
    let mut overwrites = vec![
        PermissionOverwrite {
            target: OverwriteTarget::Everyone,
            level: PermissionLevel::Default,
        },
        PermissionOverwrite {
            target: OverwriteTarget::Member(leader),
            level: PermissionLevel::Leader,
        },
    ];
    overwrites.extend(
        demoted
            .iter()
            .filter(|member| **member != leader)
            .map(|member| PermissionOverwrite {
                target: OverwriteTarget::Member(*member),
                level: PermissionLevel::Default,
            }),
    );
    overwrites
}

/// Parameters for creating a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSpec {
    /// Initial room name.
    pub name: String,
    /// Category the room is created in.
    pub category: ChannelId,
    /// Initial permission overwrites.
    pub overwrites: Vec<PermissionOverwrite>,
}

/// Structural edit of an existing room. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEdit {
    /// New name; renames are heavily rate limited by the platform.
    pub name: Option<String>,
    /// Category to (re)attach the room to.
    pub category: Option<ChannelId>,
    /// Replacement overwrites.
    pub overwrites: Vec<PermissionOverwrite>,
}

/// Live view of a room and its connected members, in platform order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRoom {
    /// Room id.
    pub id: ChannelId,
    /// Current room name.
    pub name: String,
    /// Connected members in platform-reported order.
    pub members: Vec<Member>,
}

/// Result alias for platform calls.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Failures reported by the platform client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// The resource no longer exists (already deleted, message gone, ...).
    #[error("platform resource `{resource}` not found")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },
    /// The platform rejected the call because of a rate limit.
    #[error("rate limited by the platform (retry after {retry_after:?})")]
    RateLimited {
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
    /// Network failure or server-side error.
    #[error("platform unavailable: {message}")]
    Unavailable {
        /// Error description.
        message: String,
    },
}

impl PlatformError {
    /// Construct a not-found error for the given resource description.
    pub fn not_found(resource: impl Into<String>) -> Self {
        PlatformError::NotFound {
            resource: resource.into(),
        }
    }

    /// Whether the error means the desired end state was already reached elsewhere.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }
}

/// Outbound calls towards the chat platform.
///
/// Implementations are expected to handle the platform's own request
/// rate-limit buckets; structural edits are additionally bounded by
/// [`crate::services::mutator::RoomMutator`].
pub trait PlatformClient: Send + Sync {
    /// Create a voice room; returns its id.
    fn create_room(&self, spec: RoomSpec) -> BoxFuture<'static, PlatformResult<ChannelId>>;
    /// Delete a room.
    fn delete_room(&self, room: ChannelId) -> BoxFuture<'static, PlatformResult<()>>;
    /// Apply a structural edit.
    fn edit_room(&self, room: ChannelId, edit: RoomEdit) -> BoxFuture<'static, PlatformResult<()>>;
    /// Move a connected member into `room`.
    fn move_member(
        &self,
        member: MemberId,
        room: ChannelId,
    ) -> BoxFuture<'static, PlatformResult<()>>;
    /// Rooms currently under `category`, with their connected members.
    fn live_rooms(&self, category: ChannelId) -> BoxFuture<'static, PlatformResult<Vec<LiveRoom>>>;
    /// Post a session log message.
    fn post_log(&self, room: ChannelId, text: String) -> BoxFuture<'static, PlatformResult<MessageId>>;
    /// Delete a previously posted message.
    fn delete_message(&self, message: MessageId) -> BoxFuture<'static, PlatformResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_overwrites_promote_leader_and_demote_others() {
        let overwrites = room_overwrites(MemberId(2), &[MemberId(1), MemberId(2)]);
        assert_eq!(overwrites.len(), 3);
        assert!(overwrites.contains(&PermissionOverwrite {
            target: OverwriteTarget::Member(MemberId(2)),
            level: PermissionLevel::Leader,
        }));
        assert!(overwrites.contains(&PermissionOverwrite {
            target: OverwriteTarget::Member(MemberId(1)),
            level: PermissionLevel::Default,
        }));
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&ChannelId(42)).unwrap();
        assert_eq!(json, "42");
    }
}
