use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{ArchiveChannel, BackendSummary, MessageBackend};
use crate::Result;
use crate::bundle::{BundleLayout, append_error_line};
use crate::model::{AttachmentOutcome, AttachmentRecord, Embed, Id, MessageRecord};
use crate::remote::RemoteFuture;

const EMBED_PREFIX: &str = "[EMBED] ";
const ATTACHMENT_PREFIX: &str = "[ATTACHMENT] ";
const ATTACHMENT_ERROR_PREFIX: &str = "[ATTACHMENT ERROR] ";
const ATTACHMENT_SKIPPED_PREFIX: &str = "[ATTACHMENT SKIPPED] ";
const CHANNEL_ERROR_PREFIX: &str = "[CHANNEL ERROR] ";
const MESSAGE_ERROR_PREFIX: &str = "[MESSAGE ERROR] ";

/// One `logs/<channel>.txt` per channel, one line per record. Errors are
/// written in-band and also collected in `errors.txt`.
pub struct TextBackend {
    logs_dir: PathBuf,
    errors_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl TextBackend {
    pub fn create(layout: &BundleLayout) -> Result<Self> {
        let logs_dir = layout.logs_dir();
        fs::create_dir_all(&logs_dir)?;
        Ok(Self {
            logs_dir,
            errors_path: layout.errors_path(),
            writer: None,
        })
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        if let Some(w) = self.writer.as_mut() {
            writeln!(w, "{line}")?;
        }
        Ok(())
    }
}

/// Keeps every record on one line.
fn escape_line(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn message_line(m: &MessageRecord) -> String {
    format!(
        "[{}] {} ({}): {}",
        m.created_at.to_rfc3339(),
        escape_line(&m.author_display),
        m.author_id,
        escape_line(&m.content)
    )
}

fn attachment_line(a: &AttachmentRecord) -> String {
    match &a.outcome {
        AttachmentOutcome::Saved { path } => {
            format!(
                "{ATTACHMENT_PREFIX}{} -> {path} <{}>",
                escape_line(&a.filename),
                a.url
            )
        }
        AttachmentOutcome::Failed { error } => format!(
            "{ATTACHMENT_ERROR_PREFIX}{} - {}",
            escape_line(&a.filename),
            escape_line(error)
        ),
        AttachmentOutcome::NotDownloaded => format!(
            "{ATTACHMENT_SKIPPED_PREFIX}{} <{}>",
            escape_line(&a.filename),
            a.url
        ),
    }
}

impl MessageBackend for TextBackend {
    fn begin_channel<'a>(&'a mut self, channel: &'a ArchiveChannel) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            if let Some(mut w) = self.writer.take() {
                w.flush()?;
            }
            let path = self.logs_dir.join(format!("{}.txt", channel.dir_name));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.writer = Some(BufWriter::new(file));
            Ok(())
        })
    }

    fn append_message<'a>(&'a mut self, message: &'a MessageRecord) -> RemoteFuture<'a, ()> {
        Box::pin(async move { self.write_line(&message_line(message)) })
    }

    fn append_embeds<'a>(
        &'a mut self,
        _message_id: Id,
        embeds: &'a [Embed],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            for embed in embeds {
                let json = serde_json::to_string(embed)?;
                self.write_line(&format!("{EMBED_PREFIX}{json}"))?;
            }
            Ok(())
        })
    }

    fn append_attachment<'a>(
        &'a mut self,
        _message_id: Id,
        attachment: &'a AttachmentRecord,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move { self.write_line(&attachment_line(attachment)) })
    }

    fn record_error<'a>(
        &'a mut self,
        channel: &'a ArchiveChannel,
        message_id: Option<Id>,
        error: &'a str,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let line = match message_id {
                Some(id) => format!("{MESSAGE_ERROR_PREFIX}{id} - {}", escape_line(error)),
                None => format!("{CHANNEL_ERROR_PREFIX}{}", escape_line(error)),
            };
            self.write_line(&line)?;
            append_error_line(
                &self.errors_path,
                &format!("#{} ({}): {line}", channel.name, channel.id),
            )?;
            Ok(())
        })
    }

    fn end_channel(&mut self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut w) = self.writer.take() {
                w.flush()?;
            }
            Ok(())
        })
    }

    fn finish(&mut self) -> RemoteFuture<'_, Option<String>> {
        Box::pin(async move {
            self.end_channel().await?;
            Ok(None)
        })
    }
}

pub fn summarize(logs_dir: &Path) -> Result<BackendSummary> {
    let mut summary = BackendSummary::default();
    for entry in fs::read_dir(logs_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        summary.channels += 1;
        let reader = BufReader::new(File::open(&path)?);
        for line in reader.lines() {
            let line = line?;
            if line.starts_with(EMBED_PREFIX) {
                summary.embeds += 1;
            } else if line.starts_with(ATTACHMENT_PREFIX) {
                summary.attachments_saved += 1;
            } else if line.starts_with(ATTACHMENT_ERROR_PREFIX) {
                summary.attachments_failed += 1;
            } else if line.starts_with(ATTACHMENT_SKIPPED_PREFIX) {
                summary.attachments_not_downloaded += 1;
            } else if line.starts_with(CHANNEL_ERROR_PREFIX)
                || line.starts_with(MESSAGE_ERROR_PREFIX)
            {
                summary.errors += 1;
            } else if line.starts_with('[')
                && line[1..].starts_with(|c: char| c.is_ascii_digit())
            {
                summary.messages += 1;
            }
        }
    }
    Ok(summary)
}
