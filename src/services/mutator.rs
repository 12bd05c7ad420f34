//! Structural room edits under the platform's rename limit.
//!
//! Renames are limited per room to a handful per sliding window while other
//! edits are not, so a blocked rename degrades to an edit that only touches
//! category and overwrites.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::{
    config::MutatorSettings,
    platform::{ChannelId, PermissionOverwrite, PlatformClient, PlatformError, RoomEdit},
};

/// How an edit request was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The full edit, name included, went through.
    Renamed,
    /// Only category and overwrites were applied; the name is unchanged.
    NameDeferred,
}

/// Edits that could not be applied at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    /// Even the name-less fallback was rate limited or timed out.
    #[error("room edit rate limited")]
    RateLimited,
    /// The room no longer exists.
    #[error("room `{0}` not found")]
    NotFound(ChannelId),
    /// Any other platform failure.
    #[error(transparent)]
    Platform(PlatformError),
}

enum Attempt {
    Done,
    Limited,
    Failed(MutationError),
}

/// Rate-limit aware wrapper around [`PlatformClient::edit_room`].
pub struct RoomMutator {
    platform: Arc<dyn PlatformClient>,
    settings: MutatorSettings,
    renames: DashMap<ChannelId, VecDeque<Instant>>,
}

impl RoomMutator {
    /// Mutator issuing edits through `platform`.
    pub fn new(platform: Arc<dyn PlatformClient>, settings: MutatorSettings) -> Self {
        Self {
            platform,
            settings,
            renames: DashMap::new(),
        }
    }

    /// Rename `room` and apply category/overwrites, falling back to a
    /// name-less edit when the rename budget is spent or the edit stalls.
    pub async fn edit_name_and_category(
        &self,
        room: ChannelId,
        name: String,
        category: Option<ChannelId>,
        overwrites: Vec<PermissionOverwrite>,
    ) -> Result<EditOutcome, MutationError> {
        if let Some(slot) = self.reserve_rename(room) {
            let edit = RoomEdit {
                name: Some(name),
                category,
                overwrites: overwrites.clone(),
            };
            match self.attempt(room, edit).await {
                Attempt::Done => return Ok(EditOutcome::Renamed),
                Attempt::Failed(err) => {
                    self.release_rename(room, slot);
                    return Err(err);
                }
                Attempt::Limited => {
                    self.release_rename(room, slot);
                    debug!(room = %room, "rename stalled; retrying without name");
                }
            }
        } else {
            debug!(room = %room, "rename budget spent; editing without name");
        }

        self.fallback(room, category, overwrites)
            .await
            .map(|()| EditOutcome::NameDeferred)
    }

    /// Replace the permission overwrites of `room`.
    pub async fn apply_overwrites(
        &self,
        room: ChannelId,
        overwrites: Vec<PermissionOverwrite>,
    ) -> Result<(), MutationError> {
        self.fallback(room, None, overwrites).await
    }

    /// Renames left for `room` in the current window.
    pub fn renames_left(&self, room: ChannelId) -> usize {
        let window = self.settings.rename_window;
        let used = self.renames.get_mut(&room).map_or(0, |mut stamps| {
            prune(&mut stamps, window);
            stamps.len()
        });
        self.settings.renames_per_window.saturating_sub(used)
    }

    /// Forget the rename history of a deleted room.
    pub fn forget(&self, room: ChannelId) {
        self.renames.remove(&room);
    }

    fn reserve_rename(&self, room: ChannelId) -> Option<Instant> {
        let mut stamps = self.renames.entry(room).or_default();
        prune(&mut stamps, self.settings.rename_window);
        if stamps.len() >= self.settings.renames_per_window {
            return None;
        }
        let slot = Instant::now();
        stamps.push_back(slot);
        Some(slot)
    }

    /// Give back a slot whose rename never went through.
    fn release_rename(&self, room: ChannelId, slot: Instant) {
        if let Some(mut stamps) = self.renames.get_mut(&room) {
            if let Some(pos) = stamps.iter().rposition(|stamp| *stamp == slot) {
                stamps.remove(pos);
            }
        }
    }

    async fn fallback(
        &self,
        room: ChannelId,
        category: Option<ChannelId>,
        overwrites: Vec<PermissionOverwrite>,
    ) -> Result<(), MutationError> {
        let edit = RoomEdit {
            name: None,
            category,
            overwrites,
        };
        match self.attempt(room, edit).await {
            Attempt::Done => Ok(()),
            Attempt::Failed(err) => Err(err),
            Attempt::Limited => {
                warn!(room = %room, "room edit rate limited");
                Err(MutationError::RateLimited)
            }
        }
    }

    async fn attempt(&self, room: ChannelId, edit: RoomEdit) -> Attempt {
        match timeout(self.settings.edit_timeout, self.platform.edit_room(room, edit)).await {
            Ok(Ok(())) => Attempt::Done,
            Ok(Err(PlatformError::RateLimited { .. })) | Err(_) => Attempt::Limited,
            Ok(Err(err)) if err.is_not_found() => Attempt::Failed(MutationError::NotFound(room)),
            Ok(Err(err)) => Attempt::Failed(MutationError::Platform(err)),
        }
    }
}

fn prune(stamps: &mut VecDeque<Instant>, window: Duration) {
    while stamps
        .front()
        .is_some_and(|stamp| stamp.elapsed() >= window)
    {
        stamps.pop_front();
    }
}
