use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::Result;
use crate::bundle::{BundleLayout, append_error_line, sanitize_name, write_json};
use crate::model::{
    CategoryRecord, ChannelRecord, EmojiRecord, Overwrites, PermissionPair, STRUCTURE_VERSION,
    StructuralSnapshot,
};
use crate::remote::{OverwriteTarget, RemoteChannelKind, RemoteOverwrite, SpaceReader};

/// One read of every structural collection. Any failed read fails the
/// build; a partial structure is never written.
pub async fn build_structural_snapshot<R: SpaceReader + ?Sized>(
    reader: &R,
) -> Result<StructuralSnapshot> {
    let info = reader.space_info().await?;
    let mut roles = reader.list_roles().await?;
    let remote_channels = reader.list_channels().await?;
    let emojis = reader.list_emojis().await?;

    roles.sort_by_key(|r| (r.position, r.id));
    let role_ids: HashSet<_> = roles.iter().map(|r| r.id).collect();

    let mut omitted = 0u64;
    let mut categories = Vec::new();
    let mut channels = Vec::new();
    for ch in remote_channels {
        let overwrites = role_overwrites(&ch.overwrites, &role_ids, &mut omitted);
        match ch.kind {
            RemoteChannelKind::Category => categories.push(CategoryRecord {
                id: ch.id,
                name: ch.name,
                position: ch.position,
                overwrites,
            }),
            RemoteChannelKind::Channel(kind) => channels.push(ChannelRecord {
                id: ch.id,
                name: ch.name,
                kind,
                category_id: ch.parent_id,
                position: ch.position,
                topic: ch.topic,
                nsfw: ch.nsfw,
                slowmode: ch.slowmode,
                overwrites,
            }),
        }
    }

    categories.sort_by_key(|c| (c.position, c.id));
    let category_ids: HashSet<_> = categories.iter().map(|c| c.id).collect();
    for ch in &mut channels {
        if ch.category_id.is_some_and(|id| !category_ids.contains(&id)) {
            ch.category_id = None;
        }
    }
    channels.sort_by_key(|c| (c.position, c.id));

    if omitted > 0 {
        warn!(
            event = "snapshot.member_overwrites_omitted",
            count = omitted,
            "snapshot.member_overwrites_omitted"
        );
    }

    debug!(
        event = "snapshot.built",
        roles = roles.len(),
        categories = categories.len(),
        channels = channels.len(),
        emojis = emojis.len(),
        "snapshot.built"
    );

    Ok(StructuralSnapshot {
        version: STRUCTURE_VERSION,
        info,
        roles,
        categories,
        channels,
        emojis,
        member_overwrites_omitted: omitted,
    })
}

fn role_overwrites(
    raw: &[RemoteOverwrite],
    role_ids: &HashSet<u64>,
    omitted: &mut u64,
) -> Overwrites {
    let mut out = Overwrites::new();
    for o in raw {
        match o.target {
            OverwriteTarget::Member => *omitted += 1,
            OverwriteTarget::Role if role_ids.contains(&o.target_id) => {
                out.insert(
                    o.target_id,
                    PermissionPair {
                        allow_bits: o.allow_bits,
                        deny_bits: o.deny_bits,
                    },
                );
            }
            OverwriteTarget::Role => {}
        }
    }
    out
}

pub fn write_structural_snapshot(
    layout: &BundleLayout,
    snapshot: &StructuralSnapshot,
) -> Result<PathBuf> {
    let path = layout.structure_path();
    write_json(&path, snapshot)?;
    Ok(path)
}

/// Writes `members.json` and returns how many members it lists.
pub async fn capture_members<R: SpaceReader + ?Sized>(
    reader: &R,
    layout: &BundleLayout,
) -> Result<u64> {
    let members = reader.list_members().await?;
    write_json(&layout.members_path(), &members)?;
    debug!(
        event = "snapshot.members_saved",
        members = members.len(),
        "snapshot.members_saved"
    );
    Ok(members.len() as u64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmojiAssets {
    pub saved: u64,
    pub failed: u64,
}

fn emoji_extension(emoji: &EmojiRecord) -> &str {
    let from_url = emoji
        .source_url
        .rsplit('/')
        .next()
        .and_then(|last| last.split('?').next())
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match from_url {
        Some(ext) => ext,
        None if emoji.animated => "gif",
        None => "png",
    }
}

/// Downloads each custom emoji image into `emoji/`. Failures are logged and
/// listed in `errors.txt`; they never fail the backup.
pub async fn save_emoji_assets<R: SpaceReader + ?Sized>(
    reader: &R,
    layout: &BundleLayout,
    emojis: &[EmojiRecord],
) -> Result<EmojiAssets> {
    let dir = layout.emoji_dir();
    std::fs::create_dir_all(&dir)?;

    let mut assets = EmojiAssets::default();
    for emoji in emojis {
        let filename = format!(
            "{}.{}",
            sanitize_name(&emoji.name, emoji.id),
            emoji_extension(emoji)
        );
        let saved = match reader.fetch_bytes(&emoji.source_url).await {
            Ok(bytes) => std::fs::write(dir.join(&filename), bytes).map_err(Into::into),
            Err(e) => Err(e),
        };
        match saved {
            Ok(()) => assets.saved += 1,
            Err(e) => {
                assets.failed += 1;
                warn!(
                    event = "snapshot.emoji_failed",
                    emoji = %emoji.name,
                    error = %e,
                    "snapshot.emoji_failed"
                );
                append_error_line(
                    &layout.errors_path(),
                    &format!("[EMOJI ERROR] {} - {e}", emoji.name),
                )?;
            }
        }
    }
    Ok(assets)
}
