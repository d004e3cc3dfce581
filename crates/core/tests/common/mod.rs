#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use space_vault_core::model::{
    ChannelKind, Embed, EmojiRecord, Id, MemberRecord, RoleRecord, SpaceInfo,
};
use space_vault_core::progress::ProgressOptions;
use space_vault_core::remote::{
    IncomingMessage, OverwriteTarget, RemoteAttachment, RemoteChannel, RemoteChannelKind,
    RemoteMessage, RemoteOverwrite,
};
use space_vault_core::{
    ArchiveOptions, BackupConfig, BackupFormat, ConfirmationGate, DepthMode, InMemorySpace,
    RestoreConfig, ScriptedReplies, SpaceState,
};

pub const SPACE_ID: Id = 100;
pub const MODS_ROLE: Id = 201;
pub const MEMBERS_ROLE: Id = 202;
pub const CATEGORY: Id = 300;
pub const GENERAL: Id = 401;
pub const QUIET: Id = 402;
pub const VOICE: Id = 403;
pub const ACTOR: Id = 7;
pub const COMMAND_CHANNEL: Id = 8;
pub const ATTACHMENT_URL: &str = "https://cdn.test/attachments/a.png";
pub const EMOJI_URL: &str = "https://cdn.test/emojis/501.png";

fn role(id: Id, name: &str, position: i64, is_default: bool) -> RoleRecord {
    RoleRecord {
        id,
        name: name.to_string(),
        position,
        permission_bits: 1024 * position as u64,
        color: 0,
        hoist: false,
        mentionable: !is_default,
        managed: false,
        is_default,
    }
}

fn role_overwrite(target_id: Id, allow_bits: u64) -> RemoteOverwrite {
    RemoteOverwrite {
        target_id,
        target: OverwriteTarget::Role,
        allow_bits,
        deny_bits: 0,
    }
}

pub fn text_channel(id: Id, name: &str, parent_id: Option<Id>, position: i64) -> RemoteChannel {
    RemoteChannel {
        id,
        name: name.to_string(),
        kind: RemoteChannelKind::Channel(ChannelKind::Text),
        parent_id,
        position,
        topic: None,
        nsfw: false,
        slowmode: 0,
        overwrites: Vec::new(),
    }
}

pub fn message(channel_id: Id, id: Id, author: &str, content: &str) -> RemoteMessage {
    RemoteMessage {
        id,
        channel_id,
        author_id: 50,
        author_display: author.to_string(),
        content: content.to_string(),
        created_at: Utc
            .timestamp_opt(1_700_000_000 + id as i64, 0)
            .single()
            .unwrap(),
        embeds: Vec::new(),
        attachments: Vec::new(),
    }
}

/// Two non-default roles, one category, two text channels (three messages
/// and none) and a voice channel.
pub fn fixture_state() -> SpaceState {
    let mut state = SpaceState::new(SpaceInfo {
        id: SPACE_ID,
        name: "Test Guild".to_string(),
        owner_id: 1,
        member_count: 2,
        created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
    });
    state.roles = vec![
        role(SPACE_ID, "@everyone", 0, true),
        role(MEMBERS_ROLE, "Members", 1, false),
        role(MODS_ROLE, "Mods", 2, false),
    ];

    let mut category = RemoteChannel {
        kind: RemoteChannelKind::Category,
        ..text_channel(CATEGORY, "Text Channels", None, 0)
    };
    category.overwrites = vec![
        role_overwrite(MODS_ROLE, 8192),
        RemoteOverwrite {
            target_id: 999,
            target: OverwriteTarget::Member,
            allow_bits: 1,
            deny_bits: 0,
        },
    ];
    let mut general = text_channel(GENERAL, "general", Some(CATEGORY), 0);
    general.topic = Some("talk here".to_string());
    general.overwrites = vec![role_overwrite(MEMBERS_ROLE, 2048)];
    let quiet = text_channel(QUIET, "quiet", Some(CATEGORY), 1);
    let voice = RemoteChannel {
        kind: RemoteChannelKind::Channel(ChannelKind::Voice),
        ..text_channel(VOICE, "Lounge", None, 2)
    };
    state.channels = vec![category, general, quiet, voice];

    let mut with_embed = message(GENERAL, 1002, "bob", "look");
    with_embed.embeds = vec![Embed {
        title: Some("link".to_string()),
        ..Embed::default()
    }];
    let mut with_file = message(GENERAL, 1003, "alice", "");
    with_file.attachments = vec![RemoteAttachment {
        filename: "a.png".to_string(),
        url: ATTACHMENT_URL.to_string(),
    }];
    state.history.insert(
        GENERAL,
        vec![message(GENERAL, 1001, "alice", "hello"), with_embed, with_file],
    );
    state.history.insert(QUIET, Vec::new());
    state
        .blobs
        .insert(ATTACHMENT_URL.to_string(), b"\x89PNG fake".to_vec());

    state.emojis = vec![EmojiRecord {
        id: 501,
        name: "party".to_string(),
        animated: false,
        source_url: EMOJI_URL.to_string(),
    }];
    state.blobs.insert(EMOJI_URL.to_string(), b"emoji".to_vec());

    state.members = vec![MemberRecord {
        id: 50,
        tag: "alice".to_string(),
        bot: false,
        role_ids: vec![MEMBERS_ROLE],
        created_at: Utc.with_ymd_and_hms(2021, 5, 1, 0, 0, 0).unwrap(),
        joined_at: None,
    }];
    state
}

pub fn fixture_space() -> InMemorySpace {
    InMemorySpace::new(fixture_state())
}

pub fn fast_progress() -> ProgressOptions {
    ProgressOptions {
        interval: Duration::from_millis(5),
        bar_length: 10,
    }
}

pub fn backup_config(out: &std::path::Path, format: BackupFormat, mode: DepthMode) -> BackupConfig {
    BackupConfig {
        output_dir: out.to_path_buf(),
        format,
        archive: ArchiveOptions {
            mode,
            rapid_message_limit: 500,
        },
        progress: fast_progress(),
    }
}

pub fn restore_config(metadata_path: &std::path::Path, timeout: Duration) -> RestoreConfig {
    RestoreConfig {
        metadata_path: metadata_path.to_path_buf(),
        target_space_id: SPACE_ID,
        actor_id: ACTOR,
        channel_id: COMMAND_CHANNEL,
        gate: ConfirmationGate::new("CONFIRM", timeout),
        replay_messages: true,
        progress: fast_progress(),
    }
}

pub fn reply(content: &str) -> IncomingMessage {
    IncomingMessage {
        author_id: ACTOR,
        channel_id: COMMAND_CHANNEL,
        content: content.to_string(),
    }
}

pub fn confirming() -> ScriptedReplies {
    ScriptedReplies::new([(Duration::ZERO, reply("CONFIRM"))])
}

/// Overwrites as a plain map keyed by role name, for comparing two spaces
/// whose ids differ.
pub fn named_overwrites(
    roles: &[RoleRecord],
    overwrites: &[RemoteOverwrite],
) -> BTreeMap<String, u64> {
    overwrites
        .iter()
        .filter(|o| o.target == OverwriteTarget::Role)
        .filter_map(|o| {
            roles
                .iter()
                .find(|r| r.id == o.target_id)
                .map(|r| (r.name.clone(), o.allow_bits))
        })
        .collect()
}
