//! Discord REST v10 implementation of the remote accessors.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    IncomingMessage, NewCategory, NewChannel, NewOverwrite, NewRole, OutgoingMessage,
    OverwriteTarget, RemoteAttachment, RemoteChannel, RemoteChannelKind, RemoteFuture,
    RemoteMessage, RemoteOverwrite, ReplySource, SpaceReader, SpaceWriter, StatusSink,
    snowflake_at, snowflake_created_at,
};
use crate::model::{ChannelKind, Embed, EmojiRecord, Id, MemberRecord, RoleRecord, SpaceInfo};
use crate::{Error, Result};

pub const CDN_BASE: &str = "https://cdn.discordapp.com";

const MEMBER_PAGE_SIZE: usize = 1000;
const MAX_STATUS_CHARS: usize = 2000;
const RATE_LIMIT_RETRIES: u32 = 3;
const REPLY_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CHANNEL_TEXT: u8 = 0;
const CHANNEL_VOICE: u8 = 2;
const CHANNEL_CATEGORY: u8 = 4;
const CHANNEL_ANNOUNCEMENT: u8 = 5;
const CHANNEL_STAGE: u8 = 13;
const CHANNEL_FORUM: u8 = 15;

const OVERWRITE_ROLE: u8 = 0;
const OVERWRITE_MEMBER: u8 = 1;

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub api_base: String,
    pub bot_token: String,
    pub guild_id: Id,
}

/// Shared HTTP plumbing. Cloning shares the connection pool.
#[derive(Clone)]
struct Http {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl std::fmt::Debug for Http {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RateLimited {
    retry_after: f64,
}

impl Http {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base.trim_end_matches('/'))
    }

    /// Sends the request built by `build`, waiting out 429 responses as the
    /// API asks. Any other non-2xx status is an error.
    async fn execute(&self, what: &str, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let res = build()
                .header(AUTHORIZATION, format!("Bot {}", self.bot_token))
                .send()
                .await
                .map_err(|e| Error::remote(format!("{what}: request failed: {e}")))?;

            let status = res.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < RATE_LIMIT_RETRIES {
                attempt += 1;
                let wait = res
                    .json::<RateLimited>()
                    .await
                    .map(|r| r.retry_after)
                    .unwrap_or(1.0)
                    .clamp(0.0, 60.0);
                warn!(
                    event = "remote.rate_limited",
                    what,
                    retry_after_s = wait,
                    attempt,
                    "remote.rate_limited"
                );
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                continue;
            }
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                warn!(
                    event = "remote.request_failed",
                    what,
                    status = status.as_u16(),
                    "remote.request_failed"
                );
                return Err(Error::remote(format!("{what}: http {status}: {body}")));
            }
            return Ok(res);
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, what: &str, path: &str) -> Result<T> {
        let url = self.url(path);
        let res = self.execute(what, || self.client.get(url.as_str())).await?;
        decode(what, res).await
    }

    async fn send_json<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        what: &str,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(path);
        let res = self
            .execute(what, || self.client.request(method.clone(), url.as_str()).json(body))
            .await?;
        decode(what, res).await
    }

    async fn delete(&self, what: &str, path: &str) -> Result<()> {
        let url = self.url(path);
        self.execute(what, || self.client.delete(url.as_str())).await?;
        Ok(())
    }

    async fn post_message(&self, channel_id: Id, message: &OutgoingMessage) -> Result<Id> {
        let url = self.url(&format!("/channels/{channel_id}/messages"));
        let payload = message_payload(message);
        let res = if message.files.is_empty() {
            self.execute("send message", || self.client.post(url.as_str()).json(&payload))
                .await?
        } else {
            let payload_json = payload.to_string();
            self.execute("send message", || {
                let mut form =
                    reqwest::multipart::Form::new().text("payload_json", payload_json.clone());
                for (i, file) in message.files.iter().enumerate() {
                    let part = reqwest::multipart::Part::bytes(file.bytes.clone())
                        .file_name(file.filename.clone());
                    form = form.part(format!("files[{i}]"), part);
                }
                self.client.post(url.as_str()).multipart(form)
            })
            .await?
        };
        let created: WireCreated = decode("send message", res).await?;
        Ok(created.id.0)
    }

    async fn get_messages(
        &self,
        channel_id: Id,
        after: Id,
        limit: usize,
    ) -> Result<Vec<WireMessage>> {
        let mut page: Vec<WireMessage> = self
            .get_json(
                "list messages",
                &format!("/channels/{channel_id}/messages?after={after}&limit={limit}"),
            )
            .await?;
        page.sort_by_key(|m| m.id.0);
        Ok(page)
    }
}

async fn decode<T: DeserializeOwned>(what: &str, res: Response) -> Result<T> {
    let body = res
        .text()
        .await
        .map_err(|e| Error::remote(format!("{what}: read response failed: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| Error::remote(format!("{what}: invalid json: {e}; body={body}")))
}

/// Ids travel as decimal strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snowflake(Id);

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map(Snowflake).map_err(D::Error::custom)
    }
}

fn de_bits<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    let s = String::deserialize(d)?;
    s.parse().map_err(D::Error::custom)
}

#[derive(Debug, Deserialize)]
struct WireCreated {
    id: Snowflake,
}

#[derive(Debug, Deserialize)]
struct WireGuild {
    id: Snowflake,
    name: String,
    owner_id: Snowflake,
    #[serde(default)]
    approximate_member_count: Option<u64>,
    #[serde(default)]
    member_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireRole {
    id: Snowflake,
    name: String,
    position: i64,
    #[serde(deserialize_with = "de_bits")]
    permissions: u64,
    #[serde(default)]
    color: u32,
    #[serde(default)]
    hoist: bool,
    #[serde(default)]
    mentionable: bool,
    #[serde(default)]
    managed: bool,
}

#[derive(Debug, Deserialize)]
struct WireOverwrite {
    id: Snowflake,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(deserialize_with = "de_bits")]
    allow: u64,
    #[serde(deserialize_with = "de_bits")]
    deny: u64,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: Snowflake,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parent_id: Option<Snowflake>,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    nsfw: bool,
    #[serde(default)]
    rate_limit_per_user: u32,
    #[serde(default)]
    permission_overwrites: Vec<WireOverwrite>,
}

#[derive(Debug, Deserialize)]
struct WireEmoji {
    #[serde(default)]
    id: Option<Snowflake>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    animated: bool,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: Snowflake,
    username: String,
    #[serde(default)]
    discriminator: Option<String>,
    #[serde(default)]
    bot: bool,
}

impl WireUser {
    fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            None | Some("0") | Some("") => self.username.clone(),
            Some(d) => format!("{}#{d}", self.username),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireMember {
    user: WireUser,
    #[serde(default)]
    roles: Vec<Snowflake>,
    #[serde(default)]
    joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    filename: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: Snowflake,
    channel_id: Snowflake,
    author: WireUser,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
    /// Kept loose so one odd embed does not fail the whole page.
    #[serde(default)]
    embeds: Vec<serde_json::Value>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

fn channel_kind(kind: u8) -> Option<RemoteChannelKind> {
    Some(match kind {
        CHANNEL_TEXT => RemoteChannelKind::Channel(ChannelKind::Text),
        CHANNEL_ANNOUNCEMENT => RemoteChannelKind::Channel(ChannelKind::Announcement),
        CHANNEL_VOICE => RemoteChannelKind::Channel(ChannelKind::Voice),
        CHANNEL_STAGE => RemoteChannelKind::Channel(ChannelKind::Stage),
        CHANNEL_FORUM => RemoteChannelKind::Channel(ChannelKind::Forum),
        CHANNEL_CATEGORY => RemoteChannelKind::Category,
        _ => return None,
    })
}

fn wire_channel_type(kind: ChannelKind) -> u8 {
    match kind {
        ChannelKind::Text => CHANNEL_TEXT,
        ChannelKind::Announcement => CHANNEL_ANNOUNCEMENT,
        ChannelKind::Voice => CHANNEL_VOICE,
        ChannelKind::Stage => CHANNEL_STAGE,
        ChannelKind::Forum => CHANNEL_FORUM,
    }
}

impl WireChannel {
    /// Threads and other channel types this tool does not model are
    /// dropped.
    fn into_remote(self) -> Option<RemoteChannel> {
        let kind = channel_kind(self.kind)?;
        let overwrites = self
            .permission_overwrites
            .into_iter()
            .filter_map(|o| {
                let target = match o.kind {
                    OVERWRITE_ROLE => OverwriteTarget::Role,
                    OVERWRITE_MEMBER => OverwriteTarget::Member,
                    _ => return None,
                };
                Some(RemoteOverwrite {
                    target_id: o.id.0,
                    target,
                    allow_bits: o.allow,
                    deny_bits: o.deny,
                })
            })
            .collect();
        Some(RemoteChannel {
            id: self.id.0,
            name: self.name.unwrap_or_default(),
            kind,
            parent_id: self.parent_id.map(|p| p.0),
            position: self.position,
            topic: self.topic,
            nsfw: self.nsfw,
            slowmode: self.rate_limit_per_user,
            overwrites,
        })
    }
}

impl WireMessage {
    fn into_remote(self) -> RemoteMessage {
        let embeds = self
            .embeds
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Embed>(v).ok())
            .collect();
        RemoteMessage {
            id: self.id.0,
            channel_id: self.channel_id.0,
            author_id: self.author.id.0,
            author_display: self.author.tag(),
            content: self.content,
            created_at: self.timestamp,
            embeds,
            attachments: self
                .attachments
                .into_iter()
                .map(|a| RemoteAttachment {
                    filename: a.filename,
                    url: a.url,
                })
                .collect(),
        }
    }
}

fn wire_overwrites(overwrites: &[NewOverwrite]) -> Vec<serde_json::Value> {
    overwrites
        .iter()
        .map(|o| {
            json!({
                "id": o.role_id.to_string(),
                "type": OVERWRITE_ROLE,
                "allow": o.allow_bits.to_string(),
                "deny": o.deny_bits.to_string(),
            })
        })
        .collect()
}

fn channel_payload(channel: &NewChannel) -> serde_json::Value {
    let mut body = json!({
        "name": channel.name,
        "type": wire_channel_type(channel.kind),
        "position": channel.position,
        "nsfw": channel.nsfw,
        "permission_overwrites": wire_overwrites(&channel.overwrites),
    });
    if let Some(parent) = channel.parent_id {
        body["parent_id"] = json!(parent.to_string());
    }
    if let Some(topic) = &channel.topic {
        body["topic"] = json!(topic);
    }
    if channel.kind.is_text_capable() || channel.kind == ChannelKind::Forum {
        body["rate_limit_per_user"] = json!(channel.slowmode);
    }
    body
}

fn message_payload(message: &OutgoingMessage) -> serde_json::Value {
    let mut body = json!({
        "content": message.content,
        "embeds": message.embeds,
        "allowed_mentions": { "parse": [] },
    });
    if !message.files.is_empty() {
        let attachments: Vec<_> = message
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| json!({ "id": i, "filename": f.filename }))
            .collect();
        body["attachments"] = json!(attachments);
    }
    body
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

/// One guild, read and written through the bot's REST credentials.
#[derive(Debug, Clone)]
pub struct DiscordSpace {
    http: Http,
    guild_id: Id,
}

impl DiscordSpace {
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            http: Http {
                client: reqwest::Client::new(),
                api_base: config.api_base,
                bot_token: config.bot_token,
            },
            guild_id: config.guild_id,
        }
    }

    pub fn guild_id(&self) -> Id {
        self.guild_id
    }

    /// A status message in `channel_id`, posted on the first update and
    /// edited in place after that.
    pub fn status_message(&self, channel_id: Id) -> DiscordStatus {
        DiscordStatus {
            http: self.http.clone(),
            target: Mutex::new(StatusTarget {
                channel_id,
                message_id: None,
            }),
        }
    }

    /// Messages posted in `channel_id` from now on.
    pub fn replies(&self, channel_id: Id) -> DiscordReplies {
        DiscordReplies {
            http: self.http.clone(),
            channel_id,
            poll_interval: REPLY_POLL_INTERVAL,
            state: Mutex::new(ReplyCursor {
                after: snowflake_at(Utc::now()),
                pending: VecDeque::new(),
            }),
        }
    }
}

impl SpaceReader for DiscordSpace {
    fn space_info(&self) -> RemoteFuture<'_, SpaceInfo> {
        Box::pin(async move {
            let guild: WireGuild = self
                .http
                .get_json(
                    "get guild",
                    &format!("/guilds/{}?with_counts=true", self.guild_id),
                )
                .await?;
            Ok(SpaceInfo {
                id: guild.id.0,
                name: guild.name,
                owner_id: guild.owner_id.0,
                member_count: guild
                    .approximate_member_count
                    .or(guild.member_count)
                    .unwrap_or_default(),
                created_at: snowflake_created_at(guild.id.0),
            })
        })
    }

    fn list_roles(&self) -> RemoteFuture<'_, Vec<RoleRecord>> {
        Box::pin(async move {
            let roles: Vec<WireRole> = self
                .http
                .get_json("list roles", &format!("/guilds/{}/roles", self.guild_id))
                .await?;
            let mut roles: Vec<_> = roles
                .into_iter()
                .map(|r| RoleRecord {
                    is_default: r.id.0 == self.guild_id,
                    id: r.id.0,
                    name: r.name,
                    position: r.position,
                    permission_bits: r.permissions,
                    color: r.color,
                    hoist: r.hoist,
                    mentionable: r.mentionable,
                    managed: r.managed,
                })
                .collect();
            roles.sort_by_key(|r| (r.position, r.id));
            Ok(roles)
        })
    }

    fn list_channels(&self) -> RemoteFuture<'_, Vec<RemoteChannel>> {
        Box::pin(async move {
            let channels: Vec<WireChannel> = self
                .http
                .get_json(
                    "list channels",
                    &format!("/guilds/{}/channels", self.guild_id),
                )
                .await?;
            let mut channels: Vec<_> = channels
                .into_iter()
                .filter_map(WireChannel::into_remote)
                .collect();
            channels.sort_by_key(|c| (c.position, c.id));
            Ok(channels)
        })
    }

    fn list_emojis(&self) -> RemoteFuture<'_, Vec<EmojiRecord>> {
        Box::pin(async move {
            let emojis: Vec<WireEmoji> = self
                .http
                .get_json("list emojis", &format!("/guilds/{}/emojis", self.guild_id))
                .await?;
            Ok(emojis
                .into_iter()
                .filter_map(|e| {
                    let id = e.id?.0;
                    let ext = if e.animated { "gif" } else { "png" };
                    Some(EmojiRecord {
                        id,
                        name: e.name.unwrap_or_else(|| id.to_string()),
                        animated: e.animated,
                        source_url: format!("{CDN_BASE}/emojis/{id}.{ext}"),
                    })
                })
                .collect())
        })
    }

    fn list_members(&self) -> RemoteFuture<'_, Vec<MemberRecord>> {
        Box::pin(async move {
            let mut members = Vec::new();
            let mut after: Id = 0;
            loop {
                let page: Vec<WireMember> = self
                    .http
                    .get_json(
                        "list members",
                        &format!(
                            "/guilds/{}/members?limit={MEMBER_PAGE_SIZE}&after={after}",
                            self.guild_id
                        ),
                    )
                    .await?;
                let page_len = page.len();
                for m in page {
                    after = after.max(m.user.id.0);
                    members.push(MemberRecord {
                        id: m.user.id.0,
                        tag: m.user.tag(),
                        bot: m.user.bot,
                        role_ids: m.roles.into_iter().map(|r| r.0).collect(),
                        created_at: snowflake_created_at(m.user.id.0),
                        joined_at: m.joined_at,
                    });
                }
                if page_len < MEMBER_PAGE_SIZE {
                    break;
                }
            }
            debug!(
                event = "remote.members_listed",
                members = members.len(),
                "remote.members_listed"
            );
            Ok(members)
        })
    }

    fn fetch_history_page(
        &self,
        channel_id: Id,
        after: Option<Id>,
        limit: usize,
    ) -> RemoteFuture<'_, Vec<RemoteMessage>> {
        Box::pin(async move {
            let page = self
                .http
                .get_messages(channel_id, after.unwrap_or(0), limit.clamp(1, 100))
                .await?;
            Ok(page.into_iter().map(WireMessage::into_remote).collect())
        })
    }

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> RemoteFuture<'a, Vec<u8>> {
        // CDN downloads go out without the bot token.
        Box::pin(async move {
            let res = self
                .http
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| Error::remote(format!("download failed: {e}")))?;
            let status = res.status();
            if !status.is_success() {
                return Err(Error::remote(format!("download http {status}: {url}")));
            }
            let bytes = res
                .bytes()
                .await
                .map_err(|e| Error::remote(format!("download read failed: {e}")))?;
            Ok(bytes.to_vec())
        })
    }
}

impl SpaceWriter for DiscordSpace {
    fn delete_channel(&self, channel_id: Id) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.http
                .delete("delete channel", &format!("/channels/{channel_id}"))
                .await
        })
    }

    fn delete_role(&self, role_id: Id) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.http
                .delete(
                    "delete role",
                    &format!("/guilds/{}/roles/{role_id}", self.guild_id),
                )
                .await
        })
    }

    fn create_role<'a>(&'a self, role: &'a NewRole) -> RemoteFuture<'a, Id> {
        Box::pin(async move {
            let body = json!({
                "name": role.name,
                "permissions": role.permission_bits.to_string(),
                "color": role.color,
                "hoist": role.hoist,
                "mentionable": role.mentionable,
            });
            let created: WireCreated = self
                .http
                .send_json(
                    "create role",
                    reqwest::Method::POST,
                    &format!("/guilds/{}/roles", self.guild_id),
                    &body,
                )
                .await?;
            Ok(created.id.0)
        })
    }

    fn create_category<'a>(&'a self, category: &'a NewCategory) -> RemoteFuture<'a, Id> {
        Box::pin(async move {
            let body = json!({
                "name": category.name,
                "type": CHANNEL_CATEGORY,
                "position": category.position,
                "permission_overwrites": wire_overwrites(&category.overwrites),
            });
            let created: WireCreated = self
                .http
                .send_json(
                    "create category",
                    reqwest::Method::POST,
                    &format!("/guilds/{}/channels", self.guild_id),
                    &body,
                )
                .await?;
            Ok(created.id.0)
        })
    }

    fn create_channel<'a>(&'a self, channel: &'a NewChannel) -> RemoteFuture<'a, Id> {
        Box::pin(async move {
            let created: WireCreated = self
                .http
                .send_json(
                    "create channel",
                    reqwest::Method::POST,
                    &format!("/guilds/{}/channels", self.guild_id),
                    &channel_payload(channel),
                )
                .await?;
            Ok(created.id.0)
        })
    }

    fn send_message(&self, channel_id: Id, message: OutgoingMessage) -> RemoteFuture<'_, Id> {
        Box::pin(async move { self.http.post_message(channel_id, &message).await })
    }
}

#[derive(Debug)]
pub struct DiscordStatus {
    http: Http,
    target: Mutex<StatusTarget>,
}

#[derive(Debug)]
struct StatusTarget {
    channel_id: Id,
    message_id: Option<Id>,
}

impl StatusSink for DiscordStatus {
    fn set_status<'a>(&'a self, text: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let content = truncate_chars(text, MAX_STATUS_CHARS);
            let mut target = self.target.lock().await;
            match target.message_id {
                Some(id) => {
                    let _: serde_json::Value = self
                        .http
                        .send_json(
                            "edit status",
                            reqwest::Method::PATCH,
                            &format!("/channels/{}/messages/{id}", target.channel_id),
                            &json!({ "content": content }),
                        )
                        .await?;
                }
                None => {
                    let outgoing = OutgoingMessage {
                        content: content.to_string(),
                        ..OutgoingMessage::default()
                    };
                    target.message_id =
                        Some(self.http.post_message(target.channel_id, &outgoing).await?);
                }
            }
            Ok(())
        })
    }

    fn relocate(&self, channel_id: Id) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            let mut target = self.target.lock().await;
            debug!(
                event = "status.relocated",
                from = target.channel_id,
                to = channel_id,
                "status.relocated"
            );
            target.channel_id = channel_id;
            target.message_id = None;
            Ok(())
        })
    }
}

#[derive(Debug)]
struct ReplyCursor {
    after: Id,
    pending: VecDeque<IncomingMessage>,
}

/// Polls a channel for new messages. It never reports exhaustion; callers
/// bound the wait themselves.
#[derive(Debug)]
pub struct DiscordReplies {
    http: Http,
    channel_id: Id,
    poll_interval: Duration,
    state: Mutex<ReplyCursor>,
}

impl ReplySource for DiscordReplies {
    fn next_reply(&self) -> RemoteFuture<'_, Option<IncomingMessage>> {
        Box::pin(async move {
            loop {
                {
                    let mut cursor = self.state.lock().await;
                    if let Some(next) = cursor.pending.pop_front() {
                        return Ok(Some(next));
                    }
                    let page = self
                        .http
                        .get_messages(self.channel_id, cursor.after, 100)
                        .await?;
                    for m in page {
                        cursor.after = cursor.after.max(m.id.0);
                        cursor.pending.push_back(IncomingMessage {
                            author_id: m.author.id.0,
                            channel_id: m.channel_id.0,
                            content: m.content,
                        });
                    }
                    if let Some(next) = cursor.pending.pop_front() {
                        return Ok(Some(next));
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::OutgoingFile;

    #[test]
    fn channel_wire_maps_kinds_and_overwrites() {
        let raw = r#"{
            "id": "41", "type": 0, "name": "general", "parent_id": "40",
            "position": 3, "topic": "hi", "nsfw": false, "rate_limit_per_user": 5,
            "permission_overwrites": [
                {"id": "7", "type": 0, "allow": "1024", "deny": "0"},
                {"id": "8", "type": 1, "allow": "0", "deny": "2048"}
            ]
        }"#;
        let ch: WireChannel = serde_json::from_str(raw).unwrap();
        let remote = ch.into_remote().unwrap();
        assert_eq!(remote.kind, RemoteChannelKind::Channel(ChannelKind::Text));
        assert_eq!(remote.parent_id, Some(40));
        assert_eq!(remote.slowmode, 5);
        assert_eq!(remote.overwrites.len(), 2);
        assert_eq!(remote.overwrites[0].target, OverwriteTarget::Role);
        assert_eq!(remote.overwrites[0].allow_bits, 1024);
        assert_eq!(remote.overwrites[1].target, OverwriteTarget::Member);

        let thread: WireChannel =
            serde_json::from_str(r#"{"id": "42", "type": 11, "name": "t"}"#).unwrap();
        assert!(thread.into_remote().is_none());
    }

    #[test]
    fn message_wire_keeps_parseable_embeds() {
        let raw = r#"{
            "id": "100", "channel_id": "41",
            "author": {"id": "5", "username": "alice", "discriminator": "0"},
            "content": "hello", "timestamp": "2024-01-02T03:04:05.000000+00:00",
            "embeds": [{"title": "ok"}, {"footer": 3}],
            "attachments": [{"filename": "a.png", "url": "https://cdn/a.png", "size": 4}]
        }"#;
        let m: WireMessage = serde_json::from_str(raw).unwrap();
        let m = m.into_remote();
        assert_eq!(m.author_display, "alice");
        assert_eq!(m.embeds.len(), 1);
        assert_eq!(m.embeds[0].title.as_deref(), Some("ok"));
        assert_eq!(m.attachments[0].filename, "a.png");
    }

    #[test]
    fn legacy_discriminator_is_kept_in_tag() {
        let user: WireUser =
            serde_json::from_str(r#"{"id": "5", "username": "bob", "discriminator": "1234"}"#)
                .unwrap();
        assert_eq!(user.tag(), "bob#1234");
    }

    #[test]
    fn channel_payload_sends_ids_as_strings() {
        let body = channel_payload(&NewChannel {
            name: "general".to_string(),
            kind: ChannelKind::Text,
            parent_id: Some(9),
            position: 2,
            topic: None,
            nsfw: false,
            slowmode: 10,
            overwrites: vec![NewOverwrite {
                role_id: 7,
                allow_bits: 1024,
                deny_bits: 0,
            }],
        });
        assert_eq!(body["type"], 0);
        assert_eq!(body["parent_id"], "9");
        assert_eq!(body["rate_limit_per_user"], 10);
        assert_eq!(body["permission_overwrites"][0]["id"], "7");
        assert_eq!(body["permission_overwrites"][0]["allow"], "1024");
        assert!(body.get("topic").is_none());
    }

    #[test]
    fn message_payload_lists_files_as_attachments() {
        let body = message_payload(&OutgoingMessage {
            content: "hi".to_string(),
            embeds: Vec::new(),
            files: vec![OutgoingFile {
                filename: "a.png".to_string(),
                bytes: vec![1, 2],
            }],
        });
        assert_eq!(body["attachments"][0]["id"], 0);
        assert_eq!(body["attachments"][0]["filename"], "a.png");
        assert_eq!(body["allowed_mentions"]["parse"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn status_text_is_cut_to_the_limit() {
        let long = "x".repeat(2500);
        assert_eq!(truncate_chars(&long, MAX_STATUS_CHARS).len(), 2000);
        assert_eq!(truncate_chars("short", MAX_STATUS_CHARS), "short");
    }
}
