use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use super::{
    IncomingMessage, NewCategory, NewChannel, NewOverwrite, NewRole, OutgoingMessage,
    OverwriteTarget, RemoteChannel, RemoteChannelKind, RemoteFuture, RemoteMessage,
    RemoteOverwrite, ReplySource, SpaceReader, SpaceWriter, StatusSink,
};
use crate::model::{EmojiRecord, Id, MemberRecord, RoleRecord, SpaceInfo};
use crate::Error;

const FIRST_ALLOCATED_ID: u64 = 9_000_000;

/// Everything an in-process space holds, plus the knobs used to make
/// individual remote calls fail.
#[derive(Debug, Clone)]
pub struct SpaceState {
    pub info: SpaceInfo,
    pub roles: Vec<RoleRecord>,
    pub channels: Vec<RemoteChannel>,
    pub emojis: Vec<EmojiRecord>,
    pub members: Vec<MemberRecord>,
    /// Per channel, oldest first.
    pub history: HashMap<Id, Vec<RemoteMessage>>,
    pub blobs: HashMap<String, Vec<u8>>,
    pub sent: Vec<(Id, OutgoingMessage)>,

    pub failing_history: HashSet<Id>,
    pub failing_role_names: HashSet<String>,
    pub failing_channel_names: HashSet<String>,
    pub failing_members: bool,
    pub rejected_content: Option<String>,
}

impl SpaceState {
    pub fn new(info: SpaceInfo) -> Self {
        Self {
            info,
            roles: Vec::new(),
            channels: Vec::new(),
            emojis: Vec::new(),
            members: Vec::new(),
            history: HashMap::new(),
            blobs: HashMap::new(),
            sent: Vec::new(),
            failing_history: HashSet::new(),
            failing_role_names: HashSet::new(),
            failing_channel_names: HashSet::new(),
            failing_members: false,
            rejected_content: None,
        }
    }
}

#[derive(Debug)]
pub struct InMemorySpace {
    inner: Mutex<SpaceState>,
    next_id: AtomicU64,
    mutations: AtomicUsize,
    info_reads: AtomicUsize,
}

impl InMemorySpace {
    pub fn new(state: SpaceState) -> Self {
        Self {
            inner: Mutex::new(state),
            next_id: AtomicU64::new(FIRST_ALLOCATED_ID),
            mutations: AtomicUsize::new(0),
            info_reads: AtomicUsize::new(0),
        }
    }

    pub async fn state(&self) -> SpaceState {
        self.inner.lock().await.clone()
    }

    pub async fn update(&self, f: impl FnOnce(&mut SpaceState)) {
        let mut state = self.inner.lock().await;
        f(&mut *state);
    }

    /// Number of mutating calls issued, successful or not.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::Relaxed)
    }

    pub fn info_reads(&self) -> usize {
        self.info_reads.load(Ordering::Relaxed)
    }

    fn allocate_id(&self) -> Id {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn count_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }
}

fn role_overwrites(overwrites: &[NewOverwrite]) -> Vec<RemoteOverwrite> {
    overwrites
        .iter()
        .map(|o| RemoteOverwrite {
            target_id: o.role_id,
            target: OverwriteTarget::Role,
            allow_bits: o.allow_bits,
            deny_bits: o.deny_bits,
        })
        .collect()
}

impl SpaceReader for InMemorySpace {
    fn space_info(&self) -> RemoteFuture<'_, SpaceInfo> {
        Box::pin(async move {
            self.info_reads.fetch_add(1, Ordering::Relaxed);
            Ok(self.inner.lock().await.info.clone())
        })
    }

    fn list_roles(&self) -> RemoteFuture<'_, Vec<RoleRecord>> {
        Box::pin(async move {
            let mut roles = self.inner.lock().await.roles.clone();
            roles.sort_by_key(|r| (r.position, r.id));
            Ok(roles)
        })
    }

    fn list_channels(&self) -> RemoteFuture<'_, Vec<RemoteChannel>> {
        Box::pin(async move {
            let mut channels = self.inner.lock().await.channels.clone();
            channels.sort_by_key(|c| (c.position, c.id));
            Ok(channels)
        })
    }

    fn list_emojis(&self) -> RemoteFuture<'_, Vec<EmojiRecord>> {
        Box::pin(async move { Ok(self.inner.lock().await.emojis.clone()) })
    }

    fn list_members(&self) -> RemoteFuture<'_, Vec<MemberRecord>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            if state.failing_members {
                return Err(Error::remote("member listing unavailable"));
            }
            Ok(state.members.clone())
        })
    }

    fn fetch_history_page(
        &self,
        channel_id: Id,
        after: Option<Id>,
        limit: usize,
    ) -> RemoteFuture<'_, Vec<RemoteMessage>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            if state.failing_history.contains(&channel_id) {
                return Err(Error::remote(format!(
                    "history unavailable for channel {channel_id}"
                )));
            }
            let page = state
                .history
                .get(&channel_id)
                .map(|msgs| {
                    msgs.iter()
                        .filter(|m| after.is_none_or(|a| m.id > a))
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok(page)
        })
    }

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> RemoteFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.inner
                .lock()
                .await
                .blobs
                .get(url)
                .cloned()
                .ok_or_else(|| Error::remote(format!("object not found: {url}")))
        })
    }
}

impl SpaceWriter for InMemorySpace {
    fn delete_channel(&self, channel_id: Id) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.count_mutation();
            let mut state = self.inner.lock().await;
            let before = state.channels.len();
            state.channels.retain(|c| c.id != channel_id);
            if state.channels.len() == before {
                return Err(Error::remote(format!("unknown channel {channel_id}")));
            }
            state.history.remove(&channel_id);
            Ok(())
        })
    }

    fn delete_role(&self, role_id: Id) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.count_mutation();
            let mut state = self.inner.lock().await;
            match state.roles.iter().position(|r| r.id == role_id) {
                Some(idx) if state.roles[idx].is_default || state.roles[idx].managed => Err(
                    Error::remote(format!("role {role_id} cannot be deleted")),
                ),
                Some(idx) => {
                    state.roles.remove(idx);
                    Ok(())
                }
                None => Err(Error::remote(format!("unknown role {role_id}"))),
            }
        })
    }

    fn create_role<'a>(&'a self, role: &'a NewRole) -> RemoteFuture<'a, Id> {
        Box::pin(async move {
            self.count_mutation();
            let mut state = self.inner.lock().await;
            if state.failing_role_names.contains(&role.name) {
                return Err(Error::remote(format!("role rejected: {}", role.name)));
            }
            let id = self.allocate_id();
            let position = state.roles.iter().map(|r| r.position).max().unwrap_or(0) + 1;
            state.roles.push(RoleRecord {
                id,
                name: role.name.clone(),
                position,
                permission_bits: role.permission_bits,
                color: role.color,
                hoist: role.hoist,
                mentionable: role.mentionable,
                managed: false,
                is_default: false,
            });
            Ok(id)
        })
    }

    fn create_category<'a>(&'a self, category: &'a NewCategory) -> RemoteFuture<'a, Id> {
        Box::pin(async move {
            self.count_mutation();
            let mut state = self.inner.lock().await;
            if state.failing_channel_names.contains(&category.name) {
                return Err(Error::remote(format!(
                    "category rejected: {}",
                    category.name
                )));
            }
            let id = self.allocate_id();
            state.channels.push(RemoteChannel {
                id,
                name: category.name.clone(),
                kind: RemoteChannelKind::Category,
                parent_id: None,
                position: category.position,
                topic: None,
                nsfw: false,
                slowmode: 0,
                overwrites: role_overwrites(&category.overwrites),
            });
            Ok(id)
        })
    }

    fn create_channel<'a>(&'a self, channel: &'a NewChannel) -> RemoteFuture<'a, Id> {
        Box::pin(async move {
            self.count_mutation();
            let mut state = self.inner.lock().await;
            if state.failing_channel_names.contains(&channel.name) {
                return Err(Error::remote(format!("channel rejected: {}", channel.name)));
            }
            let id = self.allocate_id();
            state.channels.push(RemoteChannel {
                id,
                name: channel.name.clone(),
                kind: RemoteChannelKind::Channel(channel.kind),
                parent_id: channel.parent_id,
                position: channel.position,
                topic: channel.topic.clone(),
                nsfw: channel.nsfw,
                slowmode: channel.slowmode,
                overwrites: role_overwrites(&channel.overwrites),
            });
            Ok(id)
        })
    }

    fn send_message(&self, channel_id: Id, message: OutgoingMessage) -> RemoteFuture<'_, Id> {
        Box::pin(async move {
            self.count_mutation();
            let mut state = self.inner.lock().await;
            if !state.channels.iter().any(|c| c.id == channel_id) {
                return Err(Error::remote(format!("unknown channel {channel_id}")));
            }
            if let Some(rejected) = &state.rejected_content
                && message.content.contains(rejected.as_str())
            {
                return Err(Error::remote("message rejected"));
            }
            let id = self.allocate_id();
            state.sent.push((channel_id, message));
            Ok(id)
        })
    }
}

/// Keeps every status edit so tests can inspect the sequence.
#[derive(Debug, Default)]
pub struct RecordingStatus {
    history: Mutex<Vec<String>>,
    relocations: Mutex<Vec<Id>>,
}

impl RecordingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history(&self) -> Vec<String> {
        self.history.lock().await.clone()
    }

    pub async fn current(&self) -> Option<String> {
        self.history.lock().await.last().cloned()
    }

    pub async fn relocations(&self) -> Vec<Id> {
        self.relocations.lock().await.clone()
    }
}

impl StatusSink for RecordingStatus {
    fn set_status<'a>(&'a self, text: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.history.lock().await.push(text.to_string());
            Ok(())
        })
    }

    fn relocate(&self, channel_id: Id) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.relocations.lock().await.push(channel_id);
            Ok(())
        })
    }
}

/// Replays a fixed list of messages, each delivered after its delay.
#[derive(Debug, Default)]
pub struct ScriptedReplies {
    queue: Mutex<VecDeque<(Duration, IncomingMessage)>>,
}

impl ScriptedReplies {
    pub fn new(script: impl IntoIterator<Item = (Duration, IncomingMessage)>) -> Self {
        Self {
            queue: Mutex::new(script.into_iter().collect()),
        }
    }
}

impl ReplySource for ScriptedReplies {
    fn next_reply(&self) -> RemoteFuture<'_, Option<IncomingMessage>> {
        Box::pin(async move {
            let next = self.queue.lock().await.pop_front();
            let Some((delay, message)) = next else {
                return Ok(None);
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(Some(message))
        })
    }
}
