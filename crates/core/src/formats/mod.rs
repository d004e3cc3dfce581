//! Interchangeable message serializers. All three accept the same stream of
//! appends and keep the same information; only the on-disk shape differs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bundle::BundleLayout;
use crate::model::{AttachmentRecord, Embed, Id, MessageRecord};
use crate::remote::RemoteFuture;
use crate::{Error, Result};

pub mod aggregate;
pub mod relational;
pub mod text;

pub use aggregate::{AggregateBackend, AggregateDocument, ArchiveError, ChannelArchive};
pub use relational::RelationalBackend;
pub use text::TextBackend;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    Text,
    #[default]
    Aggregate,
    Relational,
}

impl BackupFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Aggregate => "aggregate",
            Self::Relational => "relational",
        }
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "text" | "txt" => Ok(Self::Text),
            "aggregate" | "json" => Ok(Self::Aggregate),
            "relational" | "sqlite" | "db" => Ok(Self::Relational),
            other => Err(Error::InvalidConfig {
                message: format!("unknown backup format: {other}"),
            }),
        }
    }
}

/// A channel as the backends see it: its id, display name and the
/// sanitized name used for per-channel files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveChannel {
    pub id: Id,
    pub name: String,
    pub dir_name: String,
}

/// Append-only sink for one backup run. Calls arrive in this order per
/// channel: `begin_channel`, then for each message `append_message`
/// followed by its embeds and attachments, then `end_channel`. Errors may be
/// recorded at any point after `begin_channel`.
pub trait MessageBackend: Send {
    fn begin_channel<'a>(&'a mut self, channel: &'a ArchiveChannel) -> RemoteFuture<'a, ()>;

    /// `message.embeds` and `message.attachments` are ignored here; they
    /// arrive through the dedicated appends.
    fn append_message<'a>(&'a mut self, message: &'a MessageRecord) -> RemoteFuture<'a, ()>;

    fn append_embeds<'a>(&'a mut self, message_id: Id, embeds: &'a [Embed])
    -> RemoteFuture<'a, ()>;

    fn append_attachment<'a>(
        &'a mut self,
        message_id: Id,
        attachment: &'a AttachmentRecord,
    ) -> RemoteFuture<'a, ()>;

    fn record_error<'a>(
        &'a mut self,
        channel: &'a ArchiveChannel,
        message_id: Option<Id>,
        error: &'a str,
    ) -> RemoteFuture<'a, ()>;

    fn end_channel(&mut self) -> RemoteFuture<'_, ()>;

    /// Flushes everything and returns the data file name relative to the
    /// bundle, if this format produces one.
    fn finish(&mut self) -> RemoteFuture<'_, Option<String>>;
}

pub async fn open_backend(
    format: BackupFormat,
    layout: &BundleLayout,
) -> Result<Box<dyn MessageBackend>> {
    Ok(match format {
        BackupFormat::Text => Box::new(TextBackend::create(layout)?),
        BackupFormat::Aggregate => Box::new(AggregateBackend::new(layout)),
        BackupFormat::Relational => Box::new(RelationalBackend::create(layout).await?),
    })
}

/// What a finished backend holds, counted back from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSummary {
    pub channels: u64,
    pub messages: u64,
    pub embeds: u64,
    pub attachments_saved: u64,
    pub attachments_failed: u64,
    pub attachments_not_downloaded: u64,
    pub errors: u64,
}

pub async fn read_summary(format: BackupFormat, layout: &BundleLayout) -> Result<BackendSummary> {
    match format {
        BackupFormat::Text => text::summarize(&layout.logs_dir()),
        BackupFormat::Aggregate => aggregate::summarize(&layout.data_path()),
        BackupFormat::Relational => relational::summarize(&layout.db_path()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_round_trips_through_str() {
        for f in [
            BackupFormat::Text,
            BackupFormat::Aggregate,
            BackupFormat::Relational,
        ] {
            assert_eq!(f.as_str().parse::<BackupFormat>().expect("parse"), f);
        }
        assert_eq!("sqlite".parse::<BackupFormat>().expect("alias"), BackupFormat::Relational);
        assert!("xml".parse::<BackupFormat>().is_err());
    }
}
