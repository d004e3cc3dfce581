use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::Result;
use crate::model::{ChannelKind, EmojiRecord, Embed, Id, MemberRecord, RoleRecord, SpaceInfo};

pub mod discord;
pub mod memory;

pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteTarget {
    Role,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOverwrite {
    pub target_id: Id,
    pub target: OverwriteTarget,
    pub allow_bits: u64,
    pub deny_bits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChannelKind {
    Category,
    Channel(ChannelKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChannel {
    pub id: Id,
    pub name: String,
    pub kind: RemoteChannelKind,
    pub parent_id: Option<Id>,
    pub position: i64,
    pub topic: Option<String>,
    pub nsfw: bool,
    pub slowmode: u32,
    pub overwrites: Vec<RemoteOverwrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAttachment {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: Id,
    pub channel_id: Id,
    pub author_id: Id,
    pub author_display: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub embeds: Vec<Embed>,
    pub attachments: Vec<RemoteAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRole {
    pub name: String,
    pub permission_bits: u64,
    pub color: u32,
    pub hoist: bool,
    pub mentionable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOverwrite {
    pub role_id: Id,
    pub allow_bits: u64,
    pub deny_bits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCategory {
    pub name: String,
    pub position: i64,
    pub overwrites: Vec<NewOverwrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub parent_id: Option<Id>,
    pub position: i64,
    pub topic: Option<String>,
    pub nsfw: bool,
    pub slowmode: u32,
    pub overwrites: Vec<NewOverwrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    pub embeds: Vec<Embed>,
    pub files: Vec<OutgoingFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub author_id: Id,
    pub channel_id: Id,
    pub content: String,
}

/// Read side of a live space.
pub trait SpaceReader: Send + Sync {
    fn space_info(&self) -> RemoteFuture<'_, SpaceInfo>;

    fn list_roles(&self) -> RemoteFuture<'_, Vec<RoleRecord>>;

    fn list_channels(&self) -> RemoteFuture<'_, Vec<RemoteChannel>>;

    fn list_emojis(&self) -> RemoteFuture<'_, Vec<EmojiRecord>>;

    fn list_members(&self) -> RemoteFuture<'_, Vec<MemberRecord>>;

    /// Up to `limit` messages strictly newer than `after`, oldest first.
    fn fetch_history_page(
        &self,
        channel_id: Id,
        after: Option<Id>,
        limit: usize,
    ) -> RemoteFuture<'_, Vec<RemoteMessage>>;

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> RemoteFuture<'a, Vec<u8>>;
}

/// Write side of a live space. Every call is a mutation.
pub trait SpaceWriter: Send + Sync {
    fn delete_channel(&self, channel_id: Id) -> RemoteFuture<'_, ()>;

    fn delete_role(&self, role_id: Id) -> RemoteFuture<'_, ()>;

    fn create_role<'a>(&'a self, role: &'a NewRole) -> RemoteFuture<'a, Id>;

    fn create_category<'a>(&'a self, category: &'a NewCategory) -> RemoteFuture<'a, Id>;

    fn create_channel<'a>(&'a self, channel: &'a NewChannel) -> RemoteFuture<'a, Id>;

    fn send_message(&self, channel_id: Id, message: OutgoingMessage) -> RemoteFuture<'_, Id>;
}

/// The single status message edited in place while a run is active.
pub trait StatusSink: Send + Sync {
    fn set_status<'a>(&'a self, text: &'a str) -> RemoteFuture<'a, ()>;

    /// Moves later edits to a fresh status message in `channel_id`. Sinks
    /// that are not bound to a channel ignore this.
    fn relocate(&self, _channel_id: Id) -> RemoteFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Messages observed after a prompt was posted. `None` means the source is
/// exhausted and nothing else will arrive.
pub trait ReplySource: Send + Sync {
    fn next_reply(&self) -> RemoteFuture<'_, Option<IncomingMessage>>;
}

const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Snowflake ids carry their creation time in the upper bits.
pub fn snowflake_created_at(id: Id) -> DateTime<Utc> {
    let ms = (id >> 22) as i64 + SNOWFLAKE_EPOCH_MS;
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// The smallest id that could have been created at `at`.
pub fn snowflake_at(at: DateTime<Utc>) -> Id {
    let ms = (at.timestamp_millis() - SNOWFLAKE_EPOCH_MS).max(0) as u64;
    ms << 22
}

pub(crate) const HISTORY_PAGE_SIZE: usize = 100;
