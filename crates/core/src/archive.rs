use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bundle::{BundleLayout, safe_file_name, sanitize_name};
use crate::formats::{ArchiveChannel, MessageBackend};
use crate::model::{AttachmentOutcome, AttachmentRecord, ChannelRecord, MessageRecord};
use crate::progress::ProgressCounter;
use crate::remote::{HISTORY_PAGE_SIZE, RemoteAttachment, RemoteMessage, SpaceReader};
use crate::{Error, Result};

pub const DEFAULT_RAPID_MESSAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthMode {
    /// Bounded history, attachments referenced but not downloaded.
    Rapid,
    #[default]
    Full,
}

impl DepthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rapid => "rapid",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for DepthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "rapid" | "fast" => Ok(Self::Rapid),
            "full" => Ok(Self::Full),
            other => Err(Error::InvalidConfig {
                message: format!("unknown depth mode: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveOptions {
    pub mode: DepthMode,
    pub rapid_message_limit: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            mode: DepthMode::Full,
            rapid_message_limit: DEFAULT_RAPID_MESSAGE_LIMIT,
        }
    }
}

impl ArchiveOptions {
    fn message_limit(&self) -> Option<usize> {
        match self.mode {
            DepthMode::Rapid => Some(self.rapid_message_limit),
            DepthMode::Full => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveResult {
    pub channels: u64,
    pub messages: u64,
    pub embeds: u64,
    pub attachments_saved: u64,
    pub attachments_failed: u64,
    pub attachments_not_downloaded: u64,
    pub channel_errors: u64,
    /// Channels whose history reached the rapid limit.
    pub truncated_channels: u64,
}

/// Text-capable channels in archive order, each with a unique file-system
/// name derived from its display name.
pub fn plan_channels(channels: &[ChannelRecord]) -> Vec<ArchiveChannel> {
    let mut used = HashSet::new();
    channels
        .iter()
        .filter(|c| c.kind.is_text_capable())
        .map(|c| {
            let mut dir_name = sanitize_name(&c.name, c.id);
            if !used.insert(dir_name.clone()) {
                dir_name = format!("{dir_name}_{}", c.id);
                used.insert(dir_name.clone());
            }
            ArchiveChannel {
                id: c.id,
                name: c.name.clone(),
                dir_name,
            }
        })
        .collect()
}

/// Streams every planned channel's history into `backend`, oldest first.
///
/// A failed history fetch or attachment download becomes an in-band record
/// and the loop moves on. Only a failing backend write (the bundle itself is
/// broken) returns an error. `counter` is bumped once per finished channel.
pub async fn archive_messages<R: SpaceReader + ?Sized>(
    reader: &R,
    layout: &BundleLayout,
    channels: &[ArchiveChannel],
    backend: &mut dyn MessageBackend,
    options: &ArchiveOptions,
    counter: &ProgressCounter,
    cancel: Option<&CancellationToken>,
) -> Result<ArchiveResult> {
    let mut result = ArchiveResult::default();
    let limit = options.message_limit();
    if let Some(limit) = limit {
        debug!(
            event = "archive.rapid_window",
            window = "oldest",
            limit,
            "archive.rapid_window"
        );
    }

    for channel in channels {
        if let Some(cancel) = cancel
            && cancel.is_cancelled()
        {
            return Err(Error::Cancelled);
        }

        let media_dir = layout.media_dir().join(&channel.dir_name);
        std::fs::create_dir_all(&media_dir)?;

        backend.begin_channel(channel).await?;
        let outcome = archive_channel(
            reader,
            channel,
            &media_dir,
            backend,
            options.mode,
            limit,
            &mut result,
        )
        .await?;
        if let Err(e) = outcome {
            result.channel_errors += 1;
            warn!(
                event = "archive.channel_failed",
                channel_id = channel.id,
                channel = %channel.name,
                error = %e,
                "archive.channel_failed"
            );
            backend
                .record_error(channel, None, &format!("history fetch failed: {e}"))
                .await?;
        }
        backend.end_channel().await?;

        result.channels += 1;
        counter.increment();
    }

    Ok(result)
}

/// The outer `Result` is a backend failure; the inner one is a remote
/// failure that only ends this channel.
async fn archive_channel<R: SpaceReader + ?Sized>(
    reader: &R,
    channel: &ArchiveChannel,
    media_dir: &Path,
    backend: &mut dyn MessageBackend,
    mode: DepthMode,
    limit: Option<usize>,
    result: &mut ArchiveResult,
) -> Result<Result<()>> {
    let mut after = None;
    let mut taken = 0usize;
    loop {
        let want = match limit {
            Some(limit) if taken >= limit => {
                result.truncated_channels += 1;
                debug!(
                    event = "archive.channel_truncated",
                    channel_id = channel.id,
                    limit,
                    "archive.channel_truncated"
                );
                break;
            }
            Some(limit) => HISTORY_PAGE_SIZE.min(limit - taken),
            None => HISTORY_PAGE_SIZE,
        };

        let page = match reader.fetch_history_page(channel.id, after, want).await {
            Ok(page) => page,
            Err(e) => return Ok(Err(e)),
        };
        let page_len = page.len();
        for message in page {
            after = Some(message.id);
            taken += 1;
            store_message(reader, channel, media_dir, backend, mode, message, result).await?;
        }
        if page_len < want {
            break;
        }
    }
    Ok(Ok(()))
}

async fn store_message<R: SpaceReader + ?Sized>(
    reader: &R,
    channel: &ArchiveChannel,
    media_dir: &Path,
    backend: &mut dyn MessageBackend,
    mode: DepthMode,
    message: RemoteMessage,
    result: &mut ArchiveResult,
) -> Result<()> {
    let record = MessageRecord {
        id: message.id,
        channel_id: message.channel_id,
        author_id: message.author_id,
        author_display: message.author_display,
        content: message.content,
        created_at: message.created_at,
        embeds: Vec::new(),
        attachments: Vec::new(),
    };
    backend.append_message(&record).await?;
    result.messages += 1;

    if !message.embeds.is_empty() {
        backend.append_embeds(record.id, &message.embeds).await?;
        result.embeds += message.embeds.len() as u64;
    }

    for attachment in &message.attachments {
        let outcome = match mode {
            DepthMode::Rapid => AttachmentOutcome::NotDownloaded,
            DepthMode::Full => {
                download_attachment(reader, channel, media_dir, record.id, attachment).await
            }
        };
        match &outcome {
            AttachmentOutcome::Saved { .. } => result.attachments_saved += 1,
            AttachmentOutcome::Failed { .. } => result.attachments_failed += 1,
            AttachmentOutcome::NotDownloaded => result.attachments_not_downloaded += 1,
        }
        let entry = AttachmentRecord {
            filename: attachment.filename.clone(),
            url: attachment.url.clone(),
            outcome,
        };
        backend.append_attachment(record.id, &entry).await?;
    }
    Ok(())
}

async fn download_attachment<R: SpaceReader + ?Sized>(
    reader: &R,
    channel: &ArchiveChannel,
    media_dir: &Path,
    message_id: u64,
    attachment: &RemoteAttachment,
) -> AttachmentOutcome {
    let base = safe_file_name(&attachment.filename);
    let mut filename = base.clone();
    let mut taken = 0u32;
    while media_dir.join(&filename).exists() {
        taken += 1;
        filename = match taken {
            1 => format!("{message_id}_{base}"),
            n => format!("{message_id}_{n}_{base}"),
        };
    }

    let saved = match reader.fetch_bytes(&attachment.url).await {
        Ok(bytes) => std::fs::write(media_dir.join(&filename), bytes).map_err(Error::from),
        Err(e) => Err(e),
    };
    match saved {
        Ok(()) => AttachmentOutcome::Saved {
            path: BundleLayout::media_relative(&channel.dir_name, &filename),
        },
        Err(e) => {
            warn!(
                event = "archive.attachment_failed",
                channel_id = channel.id,
                message_id,
                filename = %attachment.filename,
                error = %e,
                "archive.attachment_failed"
            );
            AttachmentOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelKind;

    fn channel(id: u64, name: &str, kind: ChannelKind) -> ChannelRecord {
        ChannelRecord {
            id,
            name: name.to_string(),
            kind,
            category_id: None,
            position: id as i64,
            topic: None,
            nsfw: false,
            slowmode: 0,
            overwrites: Default::default(),
        }
    }

    #[test]
    fn plan_skips_voice_and_dedupes_names() {
        let plan = plan_channels(&[
            channel(1, "general", ChannelKind::Text),
            channel(2, "lobby", ChannelKind::Voice),
            channel(3, "general!", ChannelKind::Announcement),
            channel(4, "???", ChannelKind::Text),
        ]);
        let names: Vec<_> = plan.iter().map(|c| c.dir_name.as_str()).collect();
        assert_eq!(names, vec!["general", "general_3", "4"]);
    }

    #[test]
    fn depth_mode_parses() {
        assert_eq!("rapid".parse::<DepthMode>().expect("rapid"), DepthMode::Rapid);
        assert_eq!("full".parse::<DepthMode>().expect("full"), DepthMode::Full);
        assert!("deep".parse::<DepthMode>().is_err());
    }
}
