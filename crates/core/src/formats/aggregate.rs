use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ArchiveChannel, BackendSummary, MessageBackend};
use crate::Result;
use crate::bundle::{BundleLayout, DATA_FILE, load_document, write_json};
use crate::model::{AttachmentOutcome, AttachmentRecord, Embed, Id, MessageRecord};
use crate::remote::RemoteFuture;

pub const AGGREGATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveError {
    #[serde(default)]
    pub message_id: Option<Id>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelArchive {
    pub channel_id: Id,
    pub channel_name: String,
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub errors: Vec<ArchiveError>,
}

/// `backup_data.json`: every channel with its full message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDocument {
    pub version: u32,
    pub channels: Vec<ChannelArchive>,
}

impl AggregateDocument {
    pub fn load(path: &Path) -> Result<Self> {
        load_document(path, "aggregate data file")
    }

    pub fn channel(&self, channel_id: Id) -> Option<&ChannelArchive> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }
}

/// Collects the whole document in memory and writes it once on `finish`.
pub struct AggregateBackend {
    path: PathBuf,
    doc: AggregateDocument,
}

impl AggregateBackend {
    pub fn new(layout: &BundleLayout) -> Self {
        Self {
            path: layout.data_path(),
            doc: AggregateDocument {
                version: AGGREGATE_VERSION,
                channels: Vec::new(),
            },
        }
    }

    fn message_mut(&mut self, message_id: Id) -> Option<&mut MessageRecord> {
        self.doc
            .channels
            .last_mut()?
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.id == message_id)
    }

    fn channel_mut(&mut self, channel: &ArchiveChannel) -> &mut ChannelArchive {
        let idx = match self
            .doc
            .channels
            .iter()
            .rposition(|c| c.channel_id == channel.id)
        {
            Some(idx) => idx,
            None => {
                self.doc.channels.push(ChannelArchive {
                    channel_id: channel.id,
                    channel_name: channel.name.clone(),
                    messages: Vec::new(),
                    errors: Vec::new(),
                });
                self.doc.channels.len() - 1
            }
        };
        &mut self.doc.channels[idx]
    }
}

impl MessageBackend for AggregateBackend {
    fn begin_channel<'a>(&'a mut self, channel: &'a ArchiveChannel) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.channel_mut(channel);
            Ok(())
        })
    }

    fn append_message<'a>(&'a mut self, message: &'a MessageRecord) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            if let Some(channel) = self.doc.channels.last_mut() {
                let mut record = message.clone();
                record.embeds.clear();
                record.attachments.clear();
                channel.messages.push(record);
            }
            Ok(())
        })
    }

    fn append_embeds<'a>(
        &'a mut self,
        message_id: Id,
        embeds: &'a [Embed],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            if let Some(m) = self.message_mut(message_id) {
                m.embeds.extend_from_slice(embeds);
            }
            Ok(())
        })
    }

    fn append_attachment<'a>(
        &'a mut self,
        message_id: Id,
        attachment: &'a AttachmentRecord,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            if let Some(m) = self.message_mut(message_id) {
                m.attachments.push(attachment.clone());
            }
            Ok(())
        })
    }

    fn record_error<'a>(
        &'a mut self,
        channel: &'a ArchiveChannel,
        message_id: Option<Id>,
        error: &'a str,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.channel_mut(channel).errors.push(ArchiveError {
                message_id,
                error: error.to_string(),
            });
            Ok(())
        })
    }

    fn end_channel(&mut self) -> RemoteFuture<'_, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn finish(&mut self) -> RemoteFuture<'_, Option<String>> {
        Box::pin(async move {
            write_json(&self.path, &self.doc)?;
            Ok(Some(DATA_FILE.to_string()))
        })
    }
}

pub fn summarize(path: &Path) -> Result<BackendSummary> {
    let doc = AggregateDocument::load(path)?;
    let mut summary = BackendSummary {
        channels: doc.channels.len() as u64,
        ..BackendSummary::default()
    };
    for channel in &doc.channels {
        summary.errors += channel.errors.len() as u64;
        for m in &channel.messages {
            summary.messages += 1;
            summary.embeds += m.embeds.len() as u64;
            for a in &m.attachments {
                match a.outcome {
                    AttachmentOutcome::Saved { .. } => summary.attachments_saved += 1,
                    AttachmentOutcome::Failed { .. } => summary.attachments_failed += 1,
                    AttachmentOutcome::NotDownloaded => summary.attachments_not_downloaded += 1,
                }
            }
        }
    }
    Ok(summary)
}
