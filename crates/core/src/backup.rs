use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::archive::{ArchiveOptions, ArchiveResult, DepthMode, archive_messages, plan_channels};
use crate::bundle::{
    BackupMetadata, BundleLayout, METADATA_VERSION, MEMBERS_FILE, STRUCTURE_FILE, write_json,
};
use crate::formats::{BackupFormat, open_backend};
use crate::model::Id;
use crate::progress::{ProgressCounter, ProgressOptions, ProgressReporter, render_progress_bar};
use crate::remote::{SpaceReader, StatusSink};
use crate::snapshot::{
    build_structural_snapshot, capture_members, save_emoji_assets, write_structural_snapshot,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Parent directory; each run creates its own bundle directory inside.
    pub output_dir: PathBuf,
    pub format: BackupFormat,
    pub archive: ArchiveOptions,
    pub progress: ProgressOptions,
}

impl BackupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.archive.mode == DepthMode::Rapid && self.archive.rapid_message_limit == 0 {
            return Err(Error::InvalidConfig {
                message: "rapid_message_limit must be > 0".to_string(),
            });
        }
        if self.progress.bar_length == 0 {
            return Err(Error::InvalidConfig {
                message: "progress bar_length must be > 0".to_string(),
            });
        }
        if self.progress.interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "progress interval must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
    pub metadata_path: PathBuf,
    pub bundle_dir: PathBuf,
    pub space_id: Id,
    pub space_name: String,
    pub format: BackupFormat,
    pub mode: DepthMode,
    pub roles: u64,
    pub categories: u64,
    pub channels: u64,
    pub member_overwrites_omitted: u64,
    pub members: Option<u64>,
    pub emojis_saved: u64,
    pub emojis_failed: u64,
    pub archive: ArchiveResult,
}

#[derive(Default)]
pub struct BackupOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
}

pub async fn run_backup<R: SpaceReader + ?Sized>(
    reader: &R,
    status: Arc<dyn StatusSink>,
    config: BackupConfig,
) -> Result<BackupResult> {
    run_backup_with(reader, status, config, BackupOptions::default()).await
}

/// Status edits are best-effort; a sink that cannot be updated never fails
/// the run.
async fn post_status(status: &dyn StatusSink, text: &str) {
    if let Err(e) = status.set_status(text).await {
        warn!(event = "status.update_failed", error = %e, "status.update_failed");
    }
}

fn check_cancel(cancel: Option<&CancellationToken>) -> Result<()> {
    if let Some(cancel) = cancel
        && cancel.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Bundle directory, structural document, message archive, then the
/// metadata pointer. The returned `metadata_path` is what a restore names.
pub async fn run_backup_with<R: SpaceReader + ?Sized>(
    reader: &R,
    status: Arc<dyn StatusSink>,
    config: BackupConfig,
    options: BackupOptions<'_>,
) -> Result<BackupResult> {
    debug!(
        event = "backup.prepare",
        output_dir = %config.output_dir.display(),
        format = %config.format,
        mode = %config.archive.mode,
        "backup.prepare"
    );
    config.validate()?;
    let started_at = Utc::now();

    let structure_started = Instant::now();
    debug!(event = "phase.start", phase = "structure", "phase.start");
    post_status(
        status.as_ref(),
        "Saving server structure (roles, categories, channels, emoji)...",
    )
    .await;
    let snapshot = build_structural_snapshot(reader).await.map_err(|e| {
        error!(event = "snapshot.failed", error = %e, "snapshot.failed");
        e
    })?;
    let info = &snapshot.info;
    let layout = BundleLayout::create(&config.output_dir, &info.name, info.id, started_at)?;
    debug!(
        event = "backup.bundle_created",
        bundle_dir = %layout.dir().display(),
        "backup.bundle_created"
    );
    write_structural_snapshot(&layout, &snapshot)?;

    let (members, members_error) = match capture_members(reader, &layout).await {
        Ok(n) => (Some(n), None),
        Err(e) => {
            warn!(event = "snapshot.members_failed", error = %e, "snapshot.members_failed");
            (None, Some(e.to_string()))
        }
    };
    let emojis = save_emoji_assets(reader, &layout, &snapshot.emojis).await?;
    debug!(
        event = "phase.finish",
        phase = "structure",
        duration_ms = structure_started.elapsed().as_millis() as u64,
        roles = snapshot.roles.len(),
        categories = snapshot.categories.len(),
        channels = snapshot.channels.len(),
        "phase.finish"
    );

    check_cancel(options.cancel)?;

    let archive_started = Instant::now();
    debug!(event = "phase.start", phase = "archive", "phase.start");
    let planned = plan_channels(&snapshot.channels);
    let total = planned.len() as u64;
    post_status(
        status.as_ref(),
        &format!(
            "Archiving messages from {total} channels ({} format, {} mode)...",
            config.format, config.archive.mode
        ),
    )
    .await;

    let mut backend = open_backend(config.format, &layout).await?;
    let counter = ProgressCounter::new();
    let mut reporter = ProgressReporter::start(
        status.clone(),
        counter.clone(),
        total,
        "Archiving messages: ".to_string(),
        config.progress,
    );
    let archived = archive_messages(
        reader,
        &layout,
        &planned,
        backend.as_mut(),
        &config.archive,
        &counter,
        options.cancel,
    )
    .await;
    reporter.stop().await;
    let archived = archived?;
    let data_file = backend.finish().await?;
    debug!(
        event = "phase.finish",
        phase = "archive",
        duration_ms = archive_started.elapsed().as_millis() as u64,
        channels = archived.channels,
        messages = archived.messages,
        channel_errors = archived.channel_errors,
        "phase.finish"
    );

    post_status(status.as_ref(), "Writing backup metadata...").await;
    let metadata = BackupMetadata {
        version: METADATA_VERSION,
        space_id: info.id,
        space_name: info.name.clone(),
        created_at: started_at,
        format: config.format,
        mode: config.archive.mode,
        structural_file: STRUCTURE_FILE.to_string(),
        data_file,
        members_file: members.map(|_| MEMBERS_FILE.to_string()),
        members_error,
    };
    let metadata_path = layout.metadata_path();
    write_json(&metadata_path, &metadata)?;

    post_status(
        status.as_ref(),
        &completion_summary(&archived, total, config.progress.bar_length),
    )
    .await;
    debug!(
        event = "backup.finished",
        metadata_path = %metadata_path.display(),
        "backup.finished"
    );

    Ok(BackupResult {
        metadata_path,
        bundle_dir: layout.dir().to_path_buf(),
        space_id: info.id,
        space_name: info.name.clone(),
        format: config.format,
        mode: config.archive.mode,
        roles: snapshot.roles.len() as u64,
        categories: snapshot.categories.len() as u64,
        channels: snapshot.channels.len() as u64,
        member_overwrites_omitted: snapshot.member_overwrites_omitted,
        members,
        emojis_saved: emojis.saved,
        emojis_failed: emojis.failed,
        archive: archived,
    })
}

fn completion_summary(archived: &ArchiveResult, total: u64, bar_length: usize) -> String {
    format!(
        "Backup complete: {}\nchannels: {}, messages: {}, attachments saved: {}, attachments failed: {}, channel errors: {}",
        render_progress_bar(archived.channels, total, bar_length),
        archived.channels,
        archived.messages,
        archived.attachments_saved,
        archived.attachments_failed,
        archived.channel_errors,
    )
}
