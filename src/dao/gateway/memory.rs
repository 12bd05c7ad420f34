//! In-process persistence backend with flat, id-keyed tables.
//!
//! Used as the store for tests and embedded deployments, and as a replica
//! target. It enforces the interval invariants the REST API enforces
//! server-side and offers the reporting queries used for completed sessions.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use validator::Validate;

use crate::{
    clock::Timestamp,
    dao::{
        gateway::PersistenceGateway,
        models::{
            ActivityEntity, LeadershipEntity, MemberEntity, PresenceEntity, SessionEntity,
            SessionPatch,
        },
        storage::{StorageError, StorageResult},
    },
    platform::{ChannelId, MemberId},
};

#[derive(Default)]
struct Tables {
    members: HashMap<MemberId, MemberEntity>,
    sessions: Vec<SessionEntity>,
    leadership: Vec<LeadershipEntity>,
    presence: Vec<PresenceEntity>,
    activity: Vec<ActivityEntity>,
}

impl Tables {
    fn session_mut(&mut self, channel: ChannelId) -> Option<&mut SessionEntity> {
        self.sessions
            .iter_mut()
            .rev()
            .find(|session| session.channel_id == channel)
    }
}

struct Inner {
    name: String,
    tables: Mutex<Tables>,
    offline: AtomicBool,
    failures_left: AtomicU32,
    write_attempts: AtomicU32,
}

/// In-memory [`PersistenceGateway`] with failure injection.
#[derive(Clone)]
pub struct MemoryGateway {
    inner: Arc<Inner>,
}

impl MemoryGateway {
    /// Create an empty store identified by `name` in logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tables: Mutex::new(Tables::default()),
                offline: AtomicBool::new(false),
                failures_left: AtomicU32::new(0),
                write_attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Fail the next `count` writes with an unavailable error.
    pub fn fail_next(&self, count: u32) {
        self.inner.failures_left.store(count, Ordering::SeqCst);
    }

    /// Toggle a permanent outage affecting reads and writes.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of write calls received, failed ones included.
    pub fn write_attempts(&self) -> u32 {
        self.inner.write_attempts.load(Ordering::SeqCst)
    }

    /// Closed sessions that lasted at least `min_duration`.
    pub async fn completed_sessions(&self, min_duration: Duration) -> Vec<SessionEntity> {
        let min = min_duration.as_secs() as i64;
        let tables = self.inner.tables.lock().await;
        tables
            .sessions
            .iter()
            .filter(|session| session.duration_secs().is_some_and(|secs| secs >= min))
            .cloned()
            .collect()
    }

    /// Every session row, closed ones included.
    pub async fn sessions(&self) -> Vec<SessionEntity> {
        self.inner.tables.lock().await.sessions.clone()
    }

    /// Latest session row recorded for `channel`.
    pub async fn session(&self, channel: ChannelId) -> Option<SessionEntity> {
        let tables = self.inner.tables.lock().await;
        tables
            .sessions
            .iter()
            .rev()
            .find(|session| session.channel_id == channel)
            .cloned()
    }

    /// Stored member row.
    pub async fn member(&self, id: MemberId) -> Option<MemberEntity> {
        self.inner.tables.lock().await.members.get(&id).cloned()
    }

    /// Leadership intervals of a session, in insertion order.
    pub async fn leadership_history(&self, channel: ChannelId) -> Vec<LeadershipEntity> {
        let tables = self.inner.tables.lock().await;
        tables
            .leadership
            .iter()
            .filter(|row| row.channel_id == channel)
            .cloned()
            .collect()
    }

    /// Presence intervals of a session, in insertion order.
    pub async fn presence_history(&self, channel: ChannelId) -> Vec<PresenceEntity> {
        let tables = self.inner.tables.lock().await;
        tables
            .presence
            .iter()
            .filter(|row| row.channel_id == channel)
            .cloned()
            .collect()
    }

    /// Activity intervals of a member, in insertion order.
    pub async fn activity_history(&self, member: MemberId) -> Vec<ActivityEntity> {
        let tables = self.inner.tables.lock().await;
        tables
            .activity
            .iter()
            .filter(|row| row.member_id == member)
            .cloned()
            .collect()
    }

    fn ensure_online(&self) -> StorageResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(
                format!("store `{}` is offline", self.inner.name),
                io::Error::from(io::ErrorKind::NotConnected),
            ));
        }
        Ok(())
    }

    fn begin_write(&self) -> StorageResult<()> {
        self.inner.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        let injected = self
            .inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::unavailable(
                format!("injected failure on store `{}`", self.inner.name),
                io::Error::from(io::ErrorKind::TimedOut),
            ));
        }
        Ok(())
    }

    async fn write<F>(&self, apply: F) -> StorageResult<()>
    where
        F: FnOnce(&mut Tables) -> StorageResult<()>,
    {
        self.begin_write()?;
        let mut tables = self.inner.tables.lock().await;
        apply(&mut tables)
    }

    async fn read<T, F>(&self, query: F) -> StorageResult<T>
    where
        F: FnOnce(&Tables) -> T,
    {
        self.ensure_online()?;
        let tables = self.inner.tables.lock().await;
        Ok(query(&tables))
    }
}

fn end_session_rows(tables: &mut Tables, channel: ChannelId, ended_at: Timestamp) -> StorageResult<()> {
    let session = tables
        .session_mut(channel)
        .ok_or_else(|| StorageError::not_found(format!("session `{channel}`")))?;
    if session.ended_at.is_some() {
        return Ok(());
    }
    session.ended_at = Some(ended_at);

    tables
        .leadership
        .iter_mut()
        .filter(|row| row.channel_id == channel && row.ended_at.is_none())
        .for_each(|row| row.ended_at = Some(ended_at));
    tables
        .presence
        .iter_mut()
        .filter(|row| row.channel_id == channel && row.ended_at.is_none())
        .for_each(|row| row.ended_at = Some(ended_at));
    Ok(())
}

fn open_leadership_row(tables: &mut Tables, interval: LeadershipEntity) -> StorageResult<()> {
    let open = tables
        .leadership
        .iter_mut()
        .find(|row| row.channel_id == interval.channel_id && row.ended_at.is_none());
    match open {
        Some(row) if row.member_id == interval.member_id => return Ok(()),
        Some(row) => row.ended_at = Some(interval.began_at),
        None => {}
    }
    tables.leadership.push(LeadershipEntity {
        ended_at: None,
        ..interval
    });
    Ok(())
}

impl PersistenceGateway for MemoryGateway {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn upsert_member(&self, member: MemberEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            member.validate()?;
            store
                .write(move |tables| {
                    tables.members.insert(member.id, member);
                    Ok(())
                })
                .await
        })
    }

    fn find_member(&self, id: MemberId) -> BoxFuture<'static, StorageResult<Option<MemberEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.read(|tables| tables.members.get(&id).cloned()).await })
    }

    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            session.validate()?;
            store
                .write(move |tables| {
                    tables.sessions.push(session);
                    Ok(())
                })
                .await
        })
    }

    fn find_session(
        &self,
        channel: ChannelId,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .read(|tables| {
                    tables
                        .sessions
                        .iter()
                        .rev()
                        .find(|session| session.channel_id == channel)
                        .cloned()
                })
                .await
        })
    }

    fn update_session(&self, patch: SessionPatch) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            patch.validate()?;
            store
                .write(move |tables| {
                    let channel = patch.channel_id;
                    let session = tables
                        .session_mut(channel)
                        .ok_or_else(|| StorageError::not_found(format!("session `{channel}`")))?;
                    if let Some(name) = patch.name {
                        session.name = name;
                    }
                    if let Some(leader) = patch.leader_id {
                        session.leader_id = leader;
                    }
                    if let Some(message) = patch.log_message_id {
                        session.log_message_id = Some(message);
                    }
                    Ok(())
                })
                .await
        })
    }

    fn end_session(
        &self,
        channel: ChannelId,
        ended_at: Timestamp,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .write(move |tables| end_session_rows(tables, channel, ended_at))
                .await
        })
    }

    fn open_leadership(&self, interval: LeadershipEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .write(move |tables| open_leadership_row(tables, interval))
                .await
        })
    }

    fn open_presence(&self, interval: PresenceEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .write(move |tables| {
                    let already_open = tables.presence.iter().any(|row| {
                        row.channel_id == interval.channel_id
                            && row.member_id == interval.member_id
                            && row.ended_at.is_none()
                    });
                    if !already_open {
                        tables.presence.push(PresenceEntity {
                            ended_at: None,
                            ..interval
                        });
                    }
                    Ok(())
                })
                .await
        })
    }

    fn close_presence(
        &self,
        channel: ChannelId,
        member: MemberId,
        ended_at: Timestamp,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .write(move |tables| {
                    tables
                        .presence
                        .iter_mut()
                        .filter(|row| {
                            row.channel_id == channel
                                && row.member_id == member
                                && row.ended_at.is_none()
                        })
                        .for_each(|row| row.ended_at = Some(ended_at));
                    Ok(())
                })
                .await
        })
    }

    fn open_activity(&self, interval: ActivityEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            interval.validate()?;
            store
                .write(move |tables| {
                    let already_open = tables.activity.iter().any(|row| {
                        row.member_id == interval.member_id
                            && row.activity_id == interval.activity_id
                            && row.ended_at.is_none()
                    });
                    if !already_open {
                        tables.activity.push(ActivityEntity {
                            ended_at: None,
                            ..interval
                        });
                    }
                    Ok(())
                })
                .await
        })
    }

    fn close_activity(
        &self,
        member: MemberId,
        activity_id: String,
        ended_at: Timestamp,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .write(move |tables| {
                    tables
                        .activity
                        .iter_mut()
                        .filter(|row| {
                            row.member_id == member
                                && row.activity_id == activity_id
                                && row.ended_at.is_none()
                        })
                        .for_each(|row| row.ended_at = Some(ended_at));
                    Ok(())
                })
                .await
        })
    }

    fn list_unclosed_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .read(|tables| {
                    tables
                        .sessions
                        .iter()
                        .filter(|session| session.is_open())
                        .cloned()
                        .collect()
                })
                .await
        })
    }

    fn list_open_presence(
        &self,
        channel: ChannelId,
    ) -> BoxFuture<'static, StorageResult<Vec<PresenceEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .read(|tables| {
                    tables
                        .presence
                        .iter()
                        .filter(|row| row.channel_id == channel && row.ended_at.is_none())
                        .cloned()
                        .collect()
                })
                .await
        })
    }

    fn unclosed_session_for_leader(
        &self,
        leader: MemberId,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .read(|tables| {
                    tables
                        .sessions
                        .iter()
                        .rev()
                        .find(|session| session.is_open() && session.leader_id == leader)
                        .cloned()
                })
                .await
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_online() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(seconds: i64) -> Timestamp {
        Timestamp::from_unix(seconds)
    }

    fn session(channel: u64, leader: u64, began: i64) -> SessionEntity {
        SessionEntity {
            channel_id: ChannelId(channel),
            creator_id: MemberId(leader),
            leader_id: MemberId(leader),
            name: "room".into(),
            began_at: ts(began),
            ended_at: None,
            log_message_id: None,
        }
    }

    fn leadership(channel: u64, member: u64, began: i64) -> LeadershipEntity {
        LeadershipEntity {
            channel_id: ChannelId(channel),
            member_id: MemberId(member),
            began_at: ts(began),
            ended_at: None,
        }
    }

    fn presence(channel: u64, member: u64, began: i64) -> PresenceEntity {
        PresenceEntity {
            channel_id: ChannelId(channel),
            member_id: MemberId(member),
            began_at: ts(began),
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn opening_leadership_closes_previous_at_same_instant() {
        let store = MemoryGateway::new("primary");
        store.create_session(session(10, 1, 0)).await.unwrap();
        store.open_leadership(leadership(10, 1, 0)).await.unwrap();
        store.open_leadership(leadership(10, 2, 50)).await.unwrap();
        // Replaying the same open keeps a single open interval.
        store.open_leadership(leadership(10, 2, 50)).await.unwrap();

        let history = store.leadership_history(ChannelId(10)).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].ended_at, Some(ts(50)));
        assert_eq!(history[1].began_at, ts(50));
        assert_eq!(history[1].ended_at, None);
    }

    #[tokio::test]
    async fn open_presence_lists_only_unended_rows_of_the_channel() {
        let store = MemoryGateway::new("primary");
        store.open_presence(presence(10, 1, 0)).await.unwrap();
        store.open_presence(presence(10, 2, 5)).await.unwrap();
        store.open_presence(presence(11, 3, 5)).await.unwrap();
        store.close_presence(ChannelId(10), MemberId(1), ts(20)).await.unwrap();

        let open = store.list_open_presence(ChannelId(10)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].member_id, MemberId(2));
    }

    #[tokio::test]
    async fn ending_session_closes_all_intervals_with_same_timestamp() {
        let store = MemoryGateway::new("primary");
        store.create_session(session(10, 1, 0)).await.unwrap();
        store.open_leadership(leadership(10, 1, 0)).await.unwrap();
        store.open_presence(presence(10, 1, 0)).await.unwrap();
        store.open_presence(presence(10, 2, 5)).await.unwrap();
        store.open_presence(presence(10, 2, 6)).await.unwrap();

        store.end_session(ChannelId(10), ts(400)).await.unwrap();
        // Ending twice keeps the first timestamp.
        store.end_session(ChannelId(10), ts(500)).await.unwrap();

        let presence = store.presence_history(ChannelId(10)).await;
        assert_eq!(presence.len(), 2);
        assert!(presence.iter().all(|row| row.ended_at == Some(ts(400))));
        let leadership = store.leadership_history(ChannelId(10)).await;
        assert_eq!(leadership[0].ended_at, Some(ts(400)));
        assert!(store.list_unclosed_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_sessions_exclude_short_ones() {
        let store = MemoryGateway::new("primary");
        store.create_session(session(10, 1, 0)).await.unwrap();
        store.create_session(session(11, 2, 0)).await.unwrap();
        store.end_session(ChannelId(10), ts(120)).await.unwrap();
        store.end_session(ChannelId(11), ts(300)).await.unwrap();

        let completed = store.completed_sessions(Duration::from_secs(300)).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].channel_id, ChannelId(11));
        assert_eq!(store.sessions().await.len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryGateway::new("replica");
        store.fail_next(2);
        assert!(store.create_session(session(10, 1, 0)).await.is_err());
        assert!(store.create_session(session(10, 1, 0)).await.is_err());
        assert!(store.create_session(session(10, 1, 0)).await.is_ok());
        assert_eq!(store.write_attempts(), 3);
    }

    #[tokio::test]
    async fn patching_missing_session_is_not_found() {
        let store = MemoryGateway::new("primary");
        let err = store
            .update_session(SessionPatch::for_session(ChannelId(99)))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_write() {
        let store = MemoryGateway::new("primary");
        let mut bad = session(10, 1, 0);
        bad.name.clear();
        let err = store.create_session(bad).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn leader_lookup_only_returns_open_sessions() {
        let store = MemoryGateway::new("primary");
        store.create_session(session(10, 1, 0)).await.unwrap();
        store.end_session(ChannelId(10), ts(10)).await.unwrap();
        assert!(store.unclosed_session_for_leader(MemberId(1)).await.unwrap().is_none());
        store.create_session(session(11, 1, 20)).await.unwrap();
        let open = store.unclosed_session_for_leader(MemberId(1)).await.unwrap();
        assert_eq!(open.map(|s| s.channel_id), Some(ChannelId(11)));
    }
}
