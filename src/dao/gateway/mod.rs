#[cfg(feature = "http-gateway")]
pub mod http;
pub mod memory;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{
    clock::Timestamp,
    dao::{
        models::{
            ActivityEntity, LeadershipEntity, MemberEntity, PresenceEntity, SessionEntity,
            SessionPatch,
        },
        storage::StorageResult,
    },
    platform::{ChannelId, MemberId},
};

/// Shared handle on a persistence destination.
pub type SharedGateway = Arc<dyn PersistenceGateway>;

/// Narrow client over the CRUD API backing sessions, members and intervals.
///
/// Every write except [`PersistenceGateway::create_session`] is idempotent:
/// PATCHes overwrite the named fields, interval opens are keyed and
/// [`PersistenceGateway::open_leadership`] closes the previous open interval
/// of the session at the new interval's start.
pub trait PersistenceGateway: Send + Sync {
    /// Destination name used in logs.
    fn name(&self) -> &str;
    /// Insert or replace a member record.
    fn upsert_member(&self, member: MemberEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find_member(&self, id: MemberId) -> BoxFuture<'static, StorageResult<Option<MemberEntity>>>;
    /// Register a new session. Not idempotent.
    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find_session(
        &self,
        channel: ChannelId,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Overwrite the fields set in `patch`.
    fn update_session(&self, patch: SessionPatch) -> BoxFuture<'static, StorageResult<()>>;
    /// Set the end timestamp and close every open leadership/presence interval of the session at it.
    fn end_session(
        &self,
        channel: ChannelId,
        ended_at: Timestamp,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn open_leadership(&self, interval: LeadershipEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn open_presence(&self, interval: PresenceEntity) -> BoxFuture<'static, StorageResult<()>>;
    /// Close the member's open presence interval in `channel`.
    fn close_presence(
        &self,
        channel: ChannelId,
        member: MemberId,
        ended_at: Timestamp,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn open_activity(&self, interval: ActivityEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn close_activity(
        &self,
        member: MemberId,
        activity_id: String,
        ended_at: Timestamp,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Sessions without an end timestamp.
    fn list_unclosed_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>>;
    fn unclosed_session_for_leader(
        &self,
        leader: MemberId,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Presence intervals of `channel` that have no end yet.
    fn list_open_presence(
        &self,
        channel: ChannelId,
    ) -> BoxFuture<'static, StorageResult<Vec<PresenceEntity>>>;
    /// Cheap reachability probe.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
