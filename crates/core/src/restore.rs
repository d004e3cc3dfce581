use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bundle::{
    BackupMetadata, BundleLayout, load_metadata, load_structure, resolve_metadata_path,
};
use crate::confirm::{ConfirmationGate, GateOutcome};
use crate::formats::{AggregateDocument, BackupFormat, ChannelArchive};
use crate::model::{AttachmentOutcome, Embed, Id, MessageRecord, Overwrites, StructuralSnapshot};
use crate::progress::{ProgressCounter, ProgressOptions, ProgressReporter};
use crate::remote::{
    NewCategory, NewChannel, NewOverwrite, NewRole, OutgoingFile, OutgoingMessage, ReplySource,
    SpaceReader, SpaceWriter, StatusSink,
};
use crate::{Error, Result};

/// Longest message body the remote accepts.
pub const MAX_MESSAGE_CHARS: usize = 2000;
const MAX_EMBEDS_PER_MESSAGE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    AwaitingConfirmation,
    Clearing,
    RebuildingRoles,
    RebuildingCategories,
    RebuildingChannels,
    ReplayingMessages,
    Completed,
    PartiallyCompleted,
    Aborted,
}

/// Result of one create or send inside a rebuild loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Done(Id),
    Skipped { reason: String },
}

impl From<Result<Id>> for ItemOutcome {
    fn from(result: Result<Id>) -> Self {
        match result {
            Ok(id) => Self::Done(id),
            Err(e) => Self::Skipped {
                reason: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounts {
    pub done: u64,
    pub skipped: u64,
}

impl PhaseCounts {
    fn record(&mut self, kind: &str, name: &str, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Done(_) => self.done += 1,
            ItemOutcome::Skipped { reason } => {
                self.skipped += 1;
                warn!(
                    event = "restore.item_skipped",
                    kind,
                    name,
                    reason = %reason,
                    "restore.item_skipped"
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub state: RestoreState,
    pub metadata_path: PathBuf,
    pub source_space_id: Id,
    pub source_space_name: String,
    pub backup_created_at: DateTime<Utc>,
    pub format: BackupFormat,
    /// Deletion failures are counted but never stop the clear.
    pub deleted: PhaseCounts,
    pub roles: PhaseCounts,
    pub categories: PhaseCounts,
    pub channels: PhaseCounts,
    pub messages: PhaseCounts,
    pub overwrites_dropped: u64,
    pub attachments_missing: u64,
    pub replay_skipped_reason: Option<String>,
    /// Where status updates went after the clear.
    pub status_channel_id: Option<Id>,
}

impl RestoreReport {
    fn new(metadata_path: PathBuf, metadata: &BackupMetadata) -> Self {
        Self {
            state: RestoreState::AwaitingConfirmation,
            metadata_path,
            source_space_id: metadata.space_id,
            source_space_name: metadata.space_name.clone(),
            backup_created_at: metadata.created_at,
            format: metadata.format,
            deleted: PhaseCounts::default(),
            roles: PhaseCounts::default(),
            categories: PhaseCounts::default(),
            channels: PhaseCounts::default(),
            messages: PhaseCounts::default(),
            overwrites_dropped: 0,
            attachments_missing: 0,
            replay_skipped_reason: None,
            status_channel_id: None,
        }
    }

    pub fn skipped_items(&self) -> u64 {
        self.roles.skipped + self.categories.skipped + self.channels.skipped + self.messages.skipped
    }

    fn enter(&mut self, state: RestoreState) {
        debug!(
            event = "restore.state",
            from = ?self.state,
            to = ?state,
            "restore.state"
        );
        self.state = state;
    }
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// As typed by the operator: a metadata file, a bare name, or a bundle
    /// directory.
    pub metadata_path: PathBuf,
    pub target_space_id: Id,
    /// Who issued the restore and where; only their reply counts.
    pub actor_id: Id,
    pub channel_id: Id,
    pub gate: ConfirmationGate,
    pub replay_messages: bool,
    pub progress: ProgressOptions,
}

/// Capability objects for the target space.
#[derive(Clone, Copy)]
pub struct RestoreContext<'a> {
    pub reader: &'a dyn SpaceReader,
    pub writer: &'a dyn SpaceWriter,
    pub replies: &'a dyn ReplySource,
}

/// Everything read from disk before any remote mutation.
#[derive(Debug)]
pub struct LoadedBackup {
    pub metadata_path: PathBuf,
    pub layout: BundleLayout,
    pub metadata: BackupMetadata,
    pub structure: StructuralSnapshot,
    /// Present only for aggregate bundles whose data file loaded.
    pub messages: Option<AggregateDocument>,
    pub replay_skipped_reason: Option<String>,
}

/// The only validation gate. Fails on a missing or unreadable metadata or
/// structural file, and on a backup taken from another space.
pub fn load_backup(input: &Path, target_space_id: Id, replay: bool) -> Result<LoadedBackup> {
    let metadata_path = resolve_metadata_path(input)?;
    let metadata = load_metadata(&metadata_path)?;
    if metadata.space_id != target_space_id {
        return Err(Error::SpaceMismatch {
            expected: metadata.space_id,
            actual: target_space_id,
        });
    }

    let layout = BundleLayout::from_metadata_path(&metadata_path)?;
    let structure = load_structure(&layout.resolve(&metadata.structural_file))?;
    if structure.info.id != metadata.space_id {
        return Err(Error::FatalLoad {
            message: format!(
                "structural document describes space {}, metadata names {}",
                structure.info.id, metadata.space_id
            ),
        });
    }

    let (messages, replay_skipped_reason) = match (replay, metadata.format, &metadata.data_file) {
        (false, _, _) => (None, Some("message replay disabled".to_string())),
        (true, BackupFormat::Aggregate, Some(data_file)) => {
            match AggregateDocument::load(&layout.resolve(data_file)) {
                Ok(doc) => (Some(doc), None),
                Err(e) => {
                    warn!(event = "restore.data_unreadable", error = %e, "restore.data_unreadable");
                    (None, Some(e.to_string()))
                }
            }
        }
        (true, BackupFormat::Aggregate, None) => {
            (None, Some("backup has no message data file".to_string()))
        }
        (true, format, _) => (
            None,
            Some(format!("message replay is not supported for {format} backups")),
        ),
    };

    Ok(LoadedBackup {
        metadata_path,
        layout,
        metadata,
        structure,
        messages,
        replay_skipped_reason,
    })
}

/// Old id to new id, per kind. Lives only for one restore.
#[derive(Debug, Default)]
struct IdentityRemap {
    roles: HashMap<Id, Id>,
    categories: HashMap<Id, Id>,
    channels: HashMap<Id, Id>,
}

impl IdentityRemap {
    /// Unresolvable role ids are dropped, not errors.
    fn translate(&self, overwrites: &Overwrites, dropped: &mut u64) -> Vec<NewOverwrite> {
        let mut out = Vec::with_capacity(overwrites.len());
        for (old_role, pair) in overwrites {
            match self.roles.get(old_role) {
                Some(&role_id) => out.push(NewOverwrite {
                    role_id,
                    allow_bits: pair.allow_bits,
                    deny_bits: pair.deny_bits,
                }),
                None => *dropped += 1,
            }
        }
        out
    }
}

async fn post_status(status: &dyn StatusSink, text: &str) {
    if let Err(e) = status.set_status(text).await {
        warn!(event = "status.update_failed", error = %e, "status.update_failed");
    }
}

fn warning_text(metadata: &BackupMetadata, gate: &ConfirmationGate) -> String {
    format!(
        "WARNING: restoring the backup of {} ({}) taken {}.\n\
         Every channel and role in this server will be deleted and rebuilt from the backup. \
         Replayed messages are posted by this bot with the original author and time as text; \
         original authorship and timestamps cannot be restored.\n\
         Type {} within {} seconds to continue.",
        metadata.space_name,
        metadata.space_id,
        metadata.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        gate.token(),
        gate.timeout().as_secs()
    )
}

/// Loads and validates the bundle, asks for confirmation, then clears the
/// target and rebuilds roles, categories, channels and (for aggregate
/// bundles) messages. Nothing is mutated unless the gate confirms.
pub async fn run_restore(
    ctx: RestoreContext<'_>,
    status: Arc<dyn StatusSink>,
    config: RestoreConfig,
) -> Result<RestoreReport> {
    debug!(
        event = "restore.prepare",
        metadata_path = %config.metadata_path.display(),
        target_space_id = config.target_space_id,
        "restore.prepare"
    );
    let loaded = load_backup(
        &config.metadata_path,
        config.target_space_id,
        config.replay_messages,
    )?;
    let mut report = RestoreReport::new(loaded.metadata_path.clone(), &loaded.metadata);
    report.replay_skipped_reason = loaded.replay_skipped_reason.clone();

    post_status(status.as_ref(), &warning_text(&loaded.metadata, &config.gate)).await;
    let outcome = config
        .gate
        .wait(ctx.replies, config.actor_id, config.channel_id)
        .await;
    match outcome {
        Ok(GateOutcome::Confirmed) => {}
        Ok(GateOutcome::Declined) => {
            report.enter(RestoreState::Aborted);
            post_status(status.as_ref(), "Restore cancelled. No changes were made.").await;
            return Err(Error::ConfirmationDeclined);
        }
        Ok(GateOutcome::TimedOut) => {
            report.enter(RestoreState::Aborted);
            post_status(status.as_ref(), "Restore timed out. No changes were made.").await;
            return Err(Error::ConfirmationTimeout);
        }
        Err(e) => {
            report.enter(RestoreState::Aborted);
            return Err(e);
        }
    }

    report.enter(RestoreState::Clearing);
    post_status(status.as_ref(), "Clearing existing channels and roles...").await;
    let default_role = clear_target(ctx, config.target_space_id, &mut report).await?;

    let mut remap = IdentityRemap::default();

    report.enter(RestoreState::RebuildingRoles);
    post_status(status.as_ref(), "Rebuilding roles...").await;
    rebuild_roles(ctx, &loaded.structure, default_role, &mut remap, &mut report).await;

    report.enter(RestoreState::RebuildingCategories);
    post_status(status.as_ref(), "Rebuilding categories...").await;
    rebuild_categories(ctx, &loaded.structure, &mut remap, &mut report).await;

    report.enter(RestoreState::RebuildingChannels);
    post_status(status.as_ref(), "Rebuilding channels...").await;
    rebuild_channels(ctx, &loaded.structure, &mut remap, &mut report).await;
    relocate_status(status.as_ref(), &loaded.structure, &remap, config.channel_id, &mut report)
        .await;

    if let Some(doc) = &loaded.messages {
        report.enter(RestoreState::ReplayingMessages);
        post_status(status.as_ref(), "Replaying messages...").await;
        replay_messages(
            ctx,
            status.clone(),
            &loaded.layout,
            doc,
            &remap,
            config.progress,
            &mut report,
        )
        .await;
    } else if let Some(reason) = &report.replay_skipped_reason {
        debug!(event = "restore.replay_skipped", reason = %reason, "restore.replay_skipped");
    }

    if report.skipped_items() == 0 {
        report.enter(RestoreState::Completed);
    } else {
        report.enter(RestoreState::PartiallyCompleted);
    }
    post_status(status.as_ref(), &final_text(&report)).await;
    debug!(
        event = "restore.finished",
        state = ?report.state,
        skipped = report.skipped_items(),
        "restore.finished"
    );
    Ok(report)
}

/// The clear deleted the channel the status message lived in. Later
/// updates go to the rebuilt copy of that channel, or else to the first
/// rebuilt text channel.
async fn relocate_status(
    status: &dyn StatusSink,
    structure: &StructuralSnapshot,
    remap: &IdentityRemap,
    command_channel: Id,
    report: &mut RestoreReport,
) {
    let rebuilt = remap.channels.get(&command_channel).copied().or_else(|| {
        let mut text: Vec<_> = structure
            .channels
            .iter()
            .filter(|c| c.kind.is_text_capable())
            .collect();
        text.sort_by_key(|c| (c.position, c.id));
        text.iter().find_map(|c| remap.channels.get(&c.id).copied())
    });
    let Some(channel_id) = rebuilt else {
        debug!(event = "status.no_channel", "status.no_channel");
        return;
    };
    match status.relocate(channel_id).await {
        Ok(()) => report.status_channel_id = Some(channel_id),
        Err(e) => warn!(event = "status.relocate_failed", error = %e, "status.relocate_failed"),
    }
}

fn final_text(report: &RestoreReport) -> String {
    let head = match report.state {
        RestoreState::Completed => "Restore complete.".to_string(),
        _ => format!(
            "Restore finished with {} skipped items.",
            report.skipped_items()
        ),
    };
    format!(
        "{head}\nroles: {}/{}, categories: {}/{}, channels: {}/{}, messages: {}/{}",
        report.roles.done,
        report.roles.done + report.roles.skipped,
        report.categories.done,
        report.categories.done + report.categories.skipped,
        report.channels.done,
        report.channels.done + report.channels.skipped,
        report.messages.done,
        report.messages.done + report.messages.skipped,
    )
}

/// Deletes every channel, then every role except the default one. Returns
/// the target's default role id.
async fn clear_target(
    ctx: RestoreContext<'_>,
    target_space_id: Id,
    report: &mut RestoreReport,
) -> Result<Id> {
    let channels = ctx.reader.list_channels().await?;
    let roles = ctx.reader.list_roles().await?;

    for channel in &channels {
        match ctx.writer.delete_channel(channel.id).await {
            Ok(()) => report.deleted.done += 1,
            Err(e) => {
                report.deleted.skipped += 1;
                warn!(
                    event = "restore.delete_failed",
                    kind = "channel",
                    id = channel.id,
                    error = %e,
                    "restore.delete_failed"
                );
            }
        }
    }

    let mut default_role = target_space_id;
    for role in &roles {
        if role.is_default || role.id == target_space_id {
            default_role = role.id;
            continue;
        }
        match ctx.writer.delete_role(role.id).await {
            Ok(()) => report.deleted.done += 1,
            Err(e) => {
                report.deleted.skipped += 1;
                warn!(
                    event = "restore.delete_failed",
                    kind = "role",
                    id = role.id,
                    error = %e,
                    "restore.delete_failed"
                );
            }
        }
    }
    Ok(default_role)
}

async fn rebuild_roles(
    ctx: RestoreContext<'_>,
    structure: &StructuralSnapshot,
    default_role: Id,
    remap: &mut IdentityRemap,
    report: &mut RestoreReport,
) {
    let mut roles: Vec<_> = structure.roles.iter().collect();
    roles.sort_by_key(|r| (r.position, r.id));
    for role in roles {
        if role.is_default || role.id == structure.info.id {
            remap.roles.insert(role.id, default_role);
            continue;
        }
        let new_role = NewRole {
            name: role.name.clone(),
            permission_bits: role.permission_bits,
            color: role.color,
            hoist: role.hoist,
            mentionable: role.mentionable,
        };
        let outcome = ItemOutcome::from(ctx.writer.create_role(&new_role).await);
        report.roles.record("role", &role.name, &outcome);
        if let ItemOutcome::Done(id) = outcome {
            remap.roles.insert(role.id, id);
        }
    }
}

async fn rebuild_categories(
    ctx: RestoreContext<'_>,
    structure: &StructuralSnapshot,
    remap: &mut IdentityRemap,
    report: &mut RestoreReport,
) {
    let mut categories: Vec<_> = structure.categories.iter().collect();
    categories.sort_by_key(|c| (c.position, c.id));
    for category in categories {
        let new_category = NewCategory {
            name: category.name.clone(),
            position: category.position,
            overwrites: remap.translate(&category.overwrites, &mut report.overwrites_dropped),
        };
        let outcome = ItemOutcome::from(ctx.writer.create_category(&new_category).await);
        report.categories.record("category", &category.name, &outcome);
        if let ItemOutcome::Done(id) = outcome {
            remap.categories.insert(category.id, id);
        }
    }
}

async fn rebuild_channels(
    ctx: RestoreContext<'_>,
    structure: &StructuralSnapshot,
    remap: &mut IdentityRemap,
    report: &mut RestoreReport,
) {
    let mut channels: Vec<_> = structure.channels.iter().collect();
    channels.sort_by_key(|c| (c.position, c.id));
    for channel in channels {
        let new_channel = NewChannel {
            name: channel.name.clone(),
            kind: channel.kind,
            parent_id: channel
                .category_id
                .and_then(|old| remap.categories.get(&old).copied()),
            position: channel.position,
            topic: channel.topic.clone(),
            nsfw: channel.nsfw,
            slowmode: channel.slowmode,
            overwrites: remap.translate(&channel.overwrites, &mut report.overwrites_dropped),
        };
        let outcome = ItemOutcome::from(ctx.writer.create_channel(&new_channel).await);
        report.channels.record("channel", &channel.name, &outcome);
        if let ItemOutcome::Done(id) = outcome {
            remap.channels.insert(channel.id, id);
        }
    }
}

/// Header line with the original author and time, then the original
/// content, cut to the remote's length limit.
pub fn replay_body(message: &MessageRecord) -> String {
    let header = format!(
        "**{}** ({})",
        message.author_display,
        message.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let body = if message.content.is_empty() {
        header
    } else {
        format!("{header}\n{}", message.content)
    };
    match body.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => body[..cut].to_string(),
        None => body,
    }
}

fn replay_embeds(message: &MessageRecord) -> Vec<Embed> {
    message
        .embeds
        .iter()
        .take(MAX_EMBEDS_PER_MESSAGE)
        .cloned()
        .collect()
}

/// Saved media that still exists on disk. Anything else is counted and
/// left out.
fn replay_files(
    layout: &BundleLayout,
    message: &MessageRecord,
    missing: &mut u64,
) -> Vec<OutgoingFile> {
    let mut files = Vec::new();
    for attachment in &message.attachments {
        let AttachmentOutcome::Saved { path } = &attachment.outcome else {
            continue;
        };
        match std::fs::read(layout.resolve(path)) {
            Ok(bytes) => files.push(OutgoingFile {
                filename: attachment.filename.clone(),
                bytes,
            }),
            Err(e) => {
                *missing += 1;
                debug!(
                    event = "restore.attachment_missing",
                    path = %path,
                    error = %e,
                    "restore.attachment_missing"
                );
            }
        }
    }
    files
}

async fn replay_messages(
    ctx: RestoreContext<'_>,
    status: Arc<dyn StatusSink>,
    layout: &BundleLayout,
    doc: &AggregateDocument,
    remap: &IdentityRemap,
    progress: ProgressOptions,
    report: &mut RestoreReport,
) {
    let targets: Vec<(&ChannelArchive, Id)> = doc
        .channels
        .iter()
        .filter_map(|c| remap.channels.get(&c.channel_id).map(|&id| (c, id)))
        .collect();
    let total: u64 = targets.iter().map(|(c, _)| c.messages.len() as u64).sum();

    let counter = ProgressCounter::new();
    let mut reporter = ProgressReporter::start(
        status,
        counter.clone(),
        total,
        "Replaying messages: ".to_string(),
        progress,
    );

    for (archive, new_channel) in targets {
        for message in &archive.messages {
            let outgoing = OutgoingMessage {
                content: replay_body(message),
                embeds: replay_embeds(message),
                files: replay_files(layout, message, &mut report.attachments_missing),
            };
            let outcome = ItemOutcome::from(ctx.writer.send_message(new_channel, outgoing).await);
            report
                .messages
                .record("message", &archive.channel_name, &outcome);
            counter.increment();
        }
    }

    reporter.stop().await;
}
