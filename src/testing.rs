//! Scripted in-memory platform used by unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::platform::{
    ChannelId, LiveRoom, Member, MemberId, MessageId, PermissionOverwrite, PlatformClient,
    PlatformError, PlatformResult, RoomEdit, RoomSpec,
};

/// Category every fake room lives in.
pub const CATEGORY: ChannelId = ChannelId(500);
/// Channel members join to get a room.
pub const CREATE_CHANNEL: ChannelId = ChannelId(501);

#[derive(Debug, Clone)]
pub struct FakeRoom {
    pub name: String,
    pub category: ChannelId,
    pub members: Vec<Member>,
    pub overwrites: Vec<PermissionOverwrite>,
}

#[derive(Default)]
struct World {
    rooms: IndexMap<ChannelId, FakeRoom>,
    messages: HashMap<MessageId, (ChannelId, String)>,
    calls: Vec<String>,
}

#[derive(Default)]
struct Inner {
    world: Mutex<World>,
    next_id: AtomicU64,
    stall_renames: AtomicBool,
    rate_limit_edits: AtomicBool,
    fail_creates: AtomicBool,
}

/// Platform double keeping rooms, members and log messages in memory.
#[derive(Clone, Default)]
pub struct FakePlatform {
    inner: Arc<Inner>,
}

impl FakePlatform {
    pub fn new() -> Self {
        let platform = Self::default();
        platform.inner.next_id.store(1_000, Ordering::SeqCst);
        platform
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.inner.world.lock().unwrap()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Add a room in [`CATEGORY`] with `members` already connected.
    pub fn add_room(&self, name: &str, members: &[Member]) -> ChannelId {
        let id = ChannelId(self.next_id());
        self.world().rooms.insert(
            id,
            FakeRoom {
                name: name.into(),
                category: CATEGORY,
                members: members.to_vec(),
                overwrites: Vec::new(),
            },
        );
        id
    }

    /// Connect `member` to `room`, disconnecting it from anywhere else.
    pub fn connect(&self, member: &Member, room: ChannelId) {
        let mut world = self.world();
        for other in world.rooms.values_mut() {
            other.members.retain(|m| m.id != member.id);
        }
        if let Some(target) = world.rooms.get_mut(&room) {
            target.members.push(member.clone());
        }
    }

    /// Disconnect `member` from every room.
    pub fn disconnect(&self, member: MemberId) {
        for room in self.world().rooms.values_mut() {
            room.members.retain(|m| m.id != member);
        }
    }

    /// Remove a room behind the orchestrator's back.
    pub fn vanish(&self, room: ChannelId) {
        self.world().rooms.shift_remove(&room);
    }

    pub fn room(&self, room: ChannelId) -> Option<FakeRoom> {
        self.world().rooms.get(&room).cloned()
    }

    pub fn room_name(&self, room: ChannelId) -> Option<String> {
        self.room(room).map(|room| room.name)
    }

    pub fn room_ids(&self) -> Vec<ChannelId> {
        self.world().rooms.keys().copied().collect()
    }

    pub fn message_exists(&self, message: MessageId) -> bool {
        self.world().messages.contains_key(&message)
    }

    /// Calls received so far, as `"verb:target"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.world().calls.clone()
    }

    /// Make edits carrying a name hang forever.
    pub fn stall_renames(&self, stall: bool) {
        self.inner.stall_renames.store(stall, Ordering::SeqCst);
    }

    /// Reject every edit with a rate limit.
    pub fn rate_limit_edits(&self, limited: bool) {
        self.inner.rate_limit_edits.store(limited, Ordering::SeqCst);
    }

    /// Reject room creation.
    pub fn fail_creates(&self, fail: bool) {
        self.inner.fail_creates.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.world().calls.push(call);
    }
}

impl PlatformClient for FakePlatform {
    fn create_room(&self, spec: RoomSpec) -> BoxFuture<'static, PlatformResult<ChannelId>> {
        let platform = self.clone();
        Box::pin(async move {
            // Real platform calls suspend; let concurrent handlers interleave here.
            tokio::task::yield_now().await;
            platform.record(format!("create:{}", spec.name));
            if platform.inner.fail_creates.load(Ordering::SeqCst) {
                return Err(PlatformError::Unavailable {
                    message: "create rejected".into(),
                });
            }
            let id = ChannelId(platform.next_id());
            platform.world().rooms.insert(
                id,
                FakeRoom {
                    name: spec.name,
                    category: spec.category,
                    members: Vec::new(),
                    overwrites: spec.overwrites,
                },
            );
            Ok(id)
        })
    }

    fn delete_room(&self, room: ChannelId) -> BoxFuture<'static, PlatformResult<()>> {
        let platform = self.clone();
        Box::pin(async move {
            platform.record(format!("delete:{room}"));
            platform
                .world()
                .rooms
                .shift_remove(&room)
                .map(|_| ())
                .ok_or_else(|| PlatformError::not_found(format!("room {room}")))
        })
    }

    fn edit_room(&self, room: ChannelId, edit: RoomEdit) -> BoxFuture<'static, PlatformResult<()>> {
        let platform = self.clone();
        Box::pin(async move {
            platform.record(format!("edit:{room}"));
            if platform.inner.rate_limit_edits.load(Ordering::SeqCst) {
                return Err(PlatformError::RateLimited {
                    retry_after: Duration::from_secs(600),
                });
            }
            if edit.name.is_some() && platform.inner.stall_renames.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let mut world = platform.world();
            let target = world
                .rooms
                .get_mut(&room)
                .ok_or_else(|| PlatformError::not_found(format!("room {room}")))?;
            if let Some(name) = edit.name {
                target.name = name;
            }
            if let Some(category) = edit.category {
                target.category = category;
            }
            target.overwrites = edit.overwrites;
            Ok(())
        })
    }

    fn move_member(
        &self,
        member: MemberId,
        room: ChannelId,
    ) -> BoxFuture<'static, PlatformResult<()>> {
        let platform = self.clone();
        Box::pin(async move {
            platform.record(format!("move:{member}:{room}"));
            let mut world = platform.world();
            if !world.rooms.contains_key(&room) {
                return Err(PlatformError::not_found(format!("room {room}")));
            }
            let mut moved = None;
            for other in world.rooms.values_mut() {
                if let Some(pos) = other.members.iter().position(|m| m.id == member) {
                    moved = Some(other.members.remove(pos));
                }
            }
            let moved = moved.unwrap_or_else(|| Member::new(member.0, format!("member-{member}")));
            if let Some(target) = world.rooms.get_mut(&room) {
                target.members.push(moved);
            }
            Ok(())
        })
    }

    fn live_rooms(&self, category: ChannelId) -> BoxFuture<'static, PlatformResult<Vec<LiveRoom>>> {
        let platform = self.clone();
        Box::pin(async move {
            let world = platform.world();
            Ok(world
                .rooms
                .iter()
                .filter(|(_, room)| room.category == category)
                .map(|(id, room)| LiveRoom {
                    id: *id,
                    name: room.name.clone(),
                    members: room.members.clone(),
                })
                .collect())
        })
    }

    fn post_log(&self, room: ChannelId, text: String) -> BoxFuture<'static, PlatformResult<MessageId>> {
        let platform = self.clone();
        Box::pin(async move {
            let id = MessageId(platform.next_id());
            platform.world().messages.insert(id, (room, text));
            Ok(id)
        })
    }

    fn delete_message(&self, message: MessageId) -> BoxFuture<'static, PlatformResult<()>> {
        let platform = self.clone();
        Box::pin(async move {
            platform
                .world()
                .messages
                .remove(&message)
                .map(|_| ())
                .ok_or_else(|| PlatformError::not_found(format!("message {message}")))
        })
    }
}
