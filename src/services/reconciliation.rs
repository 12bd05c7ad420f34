//! Periodic sweep re-deriving room state from the primary store and the
//! platform. Repairs drift left by missed events, failed transitions and
//! restarts. Every step runs under the room gate and is idempotent, so the
//! sweep can interleave freely with live event handling.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::{
    dao::models::SessionEntity,
    error::ServiceError,
    platform::{ChannelId, LiveRoom, Member},
    services::orchestrator::{SessionOrchestrator, Settlement},
    state::{RoomPhase, RoomState},
};

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Open sessions rebuilt in memory.
    pub restored: usize,
    /// Sessions closed because their room vanished or emptied.
    pub closed: usize,
    /// Synthesised joins.
    pub joined: usize,
    /// Synthesised leaves.
    pub left: usize,
    /// Leaderships handed over because the leader was gone.
    pub transferred: usize,
    /// Live rooms registered as new sessions.
    pub registered: usize,
    /// Empty unregistered rooms deleted.
    pub deleted: usize,
    /// Rooms whose repair failed; retried on the next sweep.
    pub failed: usize,
}

impl ReconciliationReport {
    /// Whether the sweep found nothing to repair.
    pub fn is_clean(&self) -> bool {
        self.closed
            + self.joined
            + self.left
            + self.transferred
            + self.registered
            + self.deleted
            + self.failed
            == 0
    }
}

impl SessionOrchestrator {
    /// Bring memory, the primary store and the platform back in line.
    pub async fn reconcile(&self) -> Result<ReconciliationReport, ServiceError> {
        let sessions = self.writer.primary().list_unclosed_sessions().await?;
        let live: HashMap<ChannelId, LiveRoom> = self
            .platform
            .live_rooms(self.settings.room_category)
            .await?
            .into_iter()
            .filter(|room| room.id != self.settings.create_channel)
            .map(|room| (room.id, room))
            .collect();

        let mut report = ReconciliationReport::default();
        let mut registered: HashSet<ChannelId> = HashSet::new();

        for session in &sessions {
            registered.insert(session.channel_id);
            let _gate = self.state.lock_room(session.channel_id).await;
            let repaired = match live.get(&session.channel_id) {
                Some(room) => self.sync_session(session, room, &mut report).await,
                None => self.close_vanished(session, &mut report).await,
            };
            if let Err(err) = repaired {
                warn!(room = %session.channel_id, error = %err, "reconciliation step failed");
                report.failed += 1;
            }
        }

        for room in live.values().filter(|room| !registered.contains(&room.id)) {
            if self.state.confirmations().is_pending(room.id) || self.state.has_room(room.id) {
                continue;
            }
            let _gate = self.state.lock_room(room.id).await;
            if self.state.has_room(room.id) {
                continue;
            }
            if let Err(err) = self.adopt_room(room, &mut report).await {
                warn!(room = %room.id, error = %err, "failed to adopt unregistered room");
                report.failed += 1;
            }
        }

        self.state.creation_cooldowns().evict_expired();
        self.state.own_actions().evict_expired();

        if report.is_clean() {
            debug!(?report, "reconciliation found no drift");
        } else {
            info!(?report, "reconciliation repaired drift");
        }
        Ok(report)
    }

    fn restore(&self, session: &SessionEntity, report: &mut ReconciliationReport) {
        if !self.state.has_room(session.channel_id) {
            self.state.insert_room(RoomState::restored(session));
            report.restored += 1;
        }
    }

    async fn close_vanished(
        &self,
        session: &SessionEntity,
        report: &mut ReconciliationReport,
    ) -> Result<(), ServiceError> {
        self.restore(session, report);
        self.close_locked(session.channel_id, self.clock.now()).await?;
        report.closed += 1;
        Ok(())
    }

    async fn sync_session(
        &self,
        session: &SessionEntity,
        live: &LiveRoom,
        report: &mut ReconciliationReport,
    ) -> Result<(), ServiceError> {
        let room = session.channel_id;
        self.restore(session, report);
        let Some(current) = self.state.room(room) else {
            return Ok(());
        };
        let at = self.clock.now();

        match current.phase() {
            RoomPhase::Active => {}
            RoomPhase::Closing => {
                self.close_locked(room, at).await?;
                report.closed += 1;
                return Ok(());
            }
            phase => {
                debug!(room = %room, ?phase, "room busy; skipped");
                return Ok(());
            }
        }

        let present: Vec<&Member> = live.members.iter().filter(|m| !m.bot).collect();
        let gone: Vec<_> = current
            .members
            .keys()
            .filter(|id| !present.iter().any(|m| m.id == **id))
            .copied()
            .collect();
        for member in gone {
            self.record_leave(room, member, at).await?;
            report.left += 1;
        }
        // Rows left open by members who departed while nobody was watching.
        let stale: Vec<_> = self
            .writer
            .primary()
            .list_open_presence(room)
            .await?
            .into_iter()
            .map(|row| row.member_id)
            .filter(|id| !current.members.contains_key(id))
            .filter(|id| !present.iter().any(|m| m.id == *id))
            .collect();
        for member in stale {
            self.record_leave(room, member, at).await?;
            report.left += 1;
        }
        for member in present
            .iter()
            .filter(|m| !current.members.contains_key(&m.id))
        {
            self.record_join(room, member, at).await?;
            report.joined += 1;
        }

        match self.settle_room(room, at).await? {
            Settlement::Closed => report.closed += 1,
            Settlement::Transferred => report.transferred += 1,
            Settlement::Unchanged => {}
        }
        Ok(())
    }

    async fn adopt_room(
        &self,
        live: &LiveRoom,
        report: &mut ReconciliationReport,
    ) -> Result<(), ServiceError> {
        let mut humans = live.members.iter().filter(|m| !m.bot);
        let Some(leader) = humans.next() else {
            match self.platform.delete_room(live.id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => debug!(room = %live.id, "room already deleted"),
                Err(err) => return Err(err.into()),
            }
            report.deleted += 1;
            return Ok(());
        };

        let at = self.clock.now();
        self.register_session(live.id, leader, live.name.clone(), at)
            .await?;
        report.registered += 1;
        for member in humans {
            self.record_join(live.id, member, at).await?;
            report.joined += 1;
        }
        info!(room = %live.id, leader = %leader.id, "adopted unregistered room");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        dao::gateway::PersistenceGateway,
        services::orchestrator::tests::{Harness, harness},
        testing::CREATE_CHANNEL,
    };

    async fn open_room(h: &Harness, leader: &Member, others: &[&Member]) -> ChannelId {
        h.orchestrator
            .on_voice_state_change(leader, None, Some(CREATE_CHANNEL))
            .await
            .unwrap();
        let room = h.orchestrator.state().room_ids()[0];
        for member in others {
            h.platform.connect(member, room);
            h.orchestrator
                .on_voice_state_change(member, None, Some(room))
                .await
                .unwrap();
        }
        room
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_room_is_closed() {
        let h = harness();
        let alice = Member::new(1, "alice");
        let room = open_room(&h, &alice, &[]).await;

        h.platform.vanish(room);
        h.clock.advance(400);
        let report = h.orchestrator.reconcile().await.unwrap();

        assert_eq!(report.closed, 1);
        assert!(h.primary.session(room).await.unwrap().ended_at.is_some());
        assert!(!h.orchestrator.state().has_room(room));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_leave_is_synthesised_and_leader_replaced() {
        let h = harness();
        let (alice, bob) = (Member::new(1, "alice"), Member::new(2, "bob"));
        let room = open_room(&h, &alice, &[&bob]).await;

        h.platform.disconnect(alice.id);
        let report = h.orchestrator.reconcile().await.unwrap();

        assert_eq!((report.left, report.transferred), (1, 1));
        assert_eq!(h.orchestrator.state().room(room).unwrap().leader_id, bob.id);
        assert_eq!(h.primary.session(room).await.unwrap().leader_id, bob.id);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_restored_after_restart() {
        let h = harness();
        let (alice, bob) = (Member::new(1, "alice"), Member::new(2, "bob"));
        let room = open_room(&h, &alice, &[&bob]).await;

        // A fresh process sharing the same store and platform.
        let config = crate::config::CoreConfig {
            create_channel_id: CREATE_CHANNEL,
            room_category_id: crate::testing::CATEGORY,
            ..Default::default()
        };
        let writer = crate::services::writer::DeferredWriter::new(
            Arc::new(h.primary.clone()),
            Vec::new(),
            config.writer,
        );
        let restarted = SessionOrchestrator::new(
            &config,
            Arc::new(h.platform.clone()),
            writer,
            h.clock.clone(),
        );

        let report = restarted.reconcile().await.unwrap();
        assert_eq!(report.restored, 1);
        let state = restarted.state().room(room).unwrap();
        assert_eq!(state.phase(), RoomPhase::Active);
        assert_eq!(state.leader_id, alice.id);
        assert_eq!(state.members.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn departures_during_downtime_close_presence_rows() {
        let h = harness();
        let (alice, bob) = (Member::new(1, "alice"), Member::new(2, "bob"));
        let room = open_room(&h, &alice, &[&bob]).await;
        h.platform.disconnect(bob.id);

        let writer = crate::services::writer::DeferredWriter::new(
            Arc::new(h.primary.clone()),
            Vec::new(),
            Default::default(),
        );
        let restarted = SessionOrchestrator::new(
            &crate::config::CoreConfig {
                create_channel_id: CREATE_CHANNEL,
                room_category_id: crate::testing::CATEGORY,
                ..Default::default()
            },
            Arc::new(h.platform.clone()),
            writer,
            h.clock.clone(),
        );
        h.clock.advance(120);

        let report = restarted.reconcile().await.unwrap();
        assert_eq!((report.restored, report.left), (1, 1));
        let bob_rows: Vec<_> = h
            .primary
            .presence_history(room)
            .await
            .into_iter()
            .filter(|row| row.member_id == bob.id)
            .collect();
        assert_eq!(bob_rows.len(), 1);
        assert!(bob_rows[0].ended_at.is_some());
        assert!(h.primary.list_open_presence(room).await.unwrap().iter().all(|row| row.member_id == alice.id));

        // Returning later opens a fresh interval instead of extending the old one.
        h.platform.connect(&bob, room);
        restarted
            .on_voice_state_change(&bob, None, Some(room))
            .await
            .unwrap();
        let bob_rows = h.primary.presence_history(room).await;
        assert_eq!(bob_rows.iter().filter(|row| row.member_id == bob.id).count(), 2);
        assert!(restarted.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_rooms_are_adopted_or_deleted() {
        let h = harness();
        let (alice, bob) = (Member::new(1, "alice"), Member::new(2, "bob"));
        let dj = Member::bot(9, "dj");
        let busy = h.platform.add_room("stray", &[dj.clone(), bob.clone(), alice.clone()]);
        let empty = h.platform.add_room("ghost", &[dj]);

        let report = h.orchestrator.reconcile().await.unwrap();

        assert_eq!((report.registered, report.deleted, report.joined), (1, 1, 1));
        let session = h.primary.session(busy).await.unwrap();
        assert_eq!(session.leader_id, bob.id);
        assert_eq!(session.name, "stray");
        assert!(h.platform.room(empty).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_expired_creation_cooldowns() {
        let h = harness();
        let alice = Member::new(1, "alice");
        open_room(&h, &alice, &[]).await;
        assert_eq!(h.orchestrator.state().creation_cooldowns().len(), 1);

        h.orchestrator.reconcile().await.unwrap();
        assert_eq!(h.orchestrator.state().creation_cooldowns().len(), 1);

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        h.orchestrator.reconcile().await.unwrap();
        assert!(h.orchestrator.state().creation_cooldowns().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_is_idempotent() {
        let h = harness();
        let (alice, bob) = (Member::new(1, "alice"), Member::new(2, "bob"));
        let room = open_room(&h, &alice, &[&bob]).await;
        h.platform.disconnect(bob.id);

        let first = h.orchestrator.reconcile().await.unwrap();
        let second = h.orchestrator.reconcile().await.unwrap();

        assert_eq!(first.left, 1);
        assert!(second.is_clean());
        let presence = h.primary.presence_history(room).await;
        assert_eq!(presence.iter().filter(|row| row.member_id == bob.id).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_interleaves_with_a_live_leave() {
        let h = harness();
        let (alice, bob) = (Member::new(1, "alice"), Member::new(2, "bob"));
        let room = open_room(&h, &alice, &[&bob]).await;
        h.platform.disconnect(alice.id);

        let (swept, left) = tokio::join!(
            h.orchestrator.reconcile(),
            h.orchestrator.on_voice_state_change(&alice, Some(room), None),
        );
        swept.unwrap();
        left.unwrap();

        let state = h.orchestrator.state().room(room).unwrap();
        assert_eq!(state.leader_id, bob.id);
        assert!(!state.members.contains_key(&alice.id));
        let leadership = h.primary.leadership_history(room).await;
        assert_eq!(leadership.len(), 2);
        let presence = h.primary.presence_history(room).await;
        assert_eq!(presence.iter().filter(|row| row.member_id == alice.id).count(), 1);
        assert!(h.orchestrator.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_close_is_retried_by_the_next_sweep() {
        let h = harness();
        let alice = Member::new(1, "alice");
        let room = open_room(&h, &alice, &[]).await;

        h.primary.fail_next(1);
        h.platform.disconnect(alice.id);
        // close_presence fails, the leave is abandoned.
        assert!(
            h.orchestrator
                .on_voice_state_change(&alice, Some(room), None)
                .await
                .is_err()
        );
        assert!(h.orchestrator.state().has_room(room));

        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!((report.left, report.closed), (1, 1));
        let open = h.primary.list_unclosed_sessions().await.unwrap();
        assert!(open.is_empty());
    }
}
