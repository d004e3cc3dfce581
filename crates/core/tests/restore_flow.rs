mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use space_vault_core::bundle::{BundleLayout, load_structure, write_json};
use space_vault_core::model::PermissionPair;
use space_vault_core::remote::{RemoteChannelKind, StatusSink};
use space_vault_core::{
    BackupFormat, DepthMode, Error, InMemorySpace, RecordingStatus, RestoreContext,
    RestoreState, ScriptedReplies, SpaceState, run_backup, run_restore,
};
use tempfile::TempDir;

use common::*;

async fn backed_up(temp: &TempDir, format: BackupFormat) -> (InMemorySpace, PathBuf) {
    let space = fixture_space();
    let res = run_backup(
        &space,
        Arc::new(RecordingStatus::new()),
        backup_config(temp.path(), format, DepthMode::Full),
    )
    .await
    .unwrap();
    (space, res.metadata_path)
}

/// Role names and channel names, each sorted by position.
fn by_position(state: &SpaceState) -> (Vec<String>, Vec<(i64, String)>) {
    let mut roles: Vec<_> = state.roles.iter().collect();
    roles.sort_by_key(|r| r.position);
    let mut channels: Vec<_> = state
        .channels
        .iter()
        .map(|c| (c.position, c.name.clone()))
        .collect();
    channels.sort();
    (roles.iter().map(|r| r.name.clone()).collect(), channels)
}

fn context<'a>(space: &'a InMemorySpace, replies: &'a ScriptedReplies) -> RestoreContext<'a> {
    RestoreContext {
        reader: space,
        writer: space,
        replies,
    }
}

#[tokio::test]
async fn restore_rebuilds_structure_with_new_ids() {
    let temp = TempDir::new().unwrap();
    let (space, metadata_path) = backed_up(&temp, BackupFormat::Aggregate).await;
    let before = space.state().await;

    let replies = confirming();
    let status = Arc::new(RecordingStatus::new());
    let report = run_restore(
        context(&space, &replies),
        status.clone(),
        restore_config(&metadata_path, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(report.state, RestoreState::Completed);
    assert_eq!(report.deleted.done, 6);
    assert_eq!(report.roles.done, 2);
    assert_eq!(report.categories.done, 1);
    assert_eq!(report.channels.done, 3);
    assert_eq!(report.messages.done, 3);
    assert_eq!(report.skipped_items(), 0);
    assert!(report.replay_skipped_reason.is_none());

    let after = space.state().await;
    let mut role_names: Vec<_> = after.roles.iter().map(|r| r.name.clone()).collect();
    role_names.sort();
    assert_eq!(role_names, vec!["@everyone", "Members", "Mods"]);
    assert!(after.roles.iter().any(|r| r.id == SPACE_ID && r.is_default));
    assert!(after.roles.iter().all(|r| r.id != MODS_ROLE && r.id != MEMBERS_ROLE));

    let find = |name: &str| after.channels.iter().find(|c| c.name == name).unwrap();
    let category = find("Text Channels");
    assert_eq!(category.kind, RemoteChannelKind::Category);
    assert_ne!(category.id, CATEGORY);
    assert_eq!(
        named_overwrites(&after.roles, &category.overwrites),
        named_overwrites(&before.roles, &before.channels[0].overwrites)
    );

    let general = find("general");
    assert_eq!(general.parent_id, Some(category.id));
    assert_eq!(general.topic.as_deref(), Some("talk here"));
    let old_general = before.channels.iter().find(|c| c.id == GENERAL).unwrap();
    assert_eq!(
        named_overwrites(&after.roles, &general.overwrites),
        named_overwrites(&before.roles, &old_general.overwrites)
    );
    assert_eq!(find("quiet").parent_id, Some(category.id));
    assert_eq!(find("Lounge").parent_id, None);

    // The in-memory space keeps records in creation order.
    let role_order: Vec<_> = after.roles.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(role_order, vec!["@everyone", "Members", "Mods"]);
    let channel_order: Vec<_> = after.channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(channel_order, vec!["Text Channels", "general", "quiet", "Lounge"]);
    assert_eq!(by_position(&after), by_position(&before));

    assert_eq!(report.status_channel_id, Some(general.id));
    assert_eq!(status.relocations().await, vec![general.id]);

    assert_eq!(after.sent.len(), 3);
    assert!(after.sent.iter().all(|(channel, _)| *channel == general.id));
    assert_eq!(after.sent[0].1.content, "**alice** (2023-11-14 22:30:01 UTC)\nhello");
    assert_eq!(after.sent[1].1.embeds.len(), 1);
    let file = &after.sent[2].1.files[0];
    assert_eq!(file.filename, "a.png");
    assert_eq!(file.bytes, b"\x89PNG fake");

    let history = status.history().await;
    assert!(history[0].starts_with("WARNING: restoring the backup of Test Guild (100)"));
    assert!(history[0].contains("Type CONFIRM within 5 seconds"));
    assert!(history.last().unwrap().starts_with("Restore complete."));
}

#[tokio::test]
async fn declined_confirmation_changes_nothing() {
    let temp = TempDir::new().unwrap();
    let (space, metadata_path) = backed_up(&temp, BackupFormat::Aggregate).await;
    let before = space.state().await;

    let replies = ScriptedReplies::new([(Duration::ZERO, reply("confirm"))]);
    let status = Arc::new(RecordingStatus::new());
    let err = run_restore(
        context(&space, &replies),
        status.clone(),
        restore_config(&metadata_path, Duration::from_secs(5)),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::ConfirmationDeclined));
    assert_eq!(space.mutations(), 0);
    assert_eq!(space.state().await.channels, before.channels);
    assert_eq!(
        status.current().await.as_deref(),
        Some("Restore cancelled. No changes were made.")
    );
}

#[tokio::test]
async fn silence_times_out_without_changes() {
    let temp = TempDir::new().unwrap();
    let (space, metadata_path) = backed_up(&temp, BackupFormat::Aggregate).await;

    let replies = ScriptedReplies::new([
        (
            Duration::ZERO,
            space_vault_core::remote::IncomingMessage {
                author_id: 12345,
                channel_id: COMMAND_CHANNEL,
                content: "CONFIRM".to_string(),
            },
        ),
        (Duration::from_millis(500), reply("CONFIRM")),
    ]);
    let status = Arc::new(RecordingStatus::new());
    let err = run_restore(
        context(&space, &replies),
        status.clone(),
        restore_config(&metadata_path, Duration::from_millis(30)),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::ConfirmationTimeout));
    assert_eq!(space.mutations(), 0);
    assert_eq!(
        status.current().await.as_deref(),
        Some("Restore timed out. No changes were made.")
    );
}

#[tokio::test]
async fn backup_from_another_space_is_refused_before_prompting() {
    let temp = TempDir::new().unwrap();
    let (space, metadata_path) = backed_up(&temp, BackupFormat::Aggregate).await;

    let replies = confirming();
    let status = Arc::new(RecordingStatus::new());
    let mut config = restore_config(&metadata_path, Duration::from_secs(5));
    config.target_space_id = 555;
    let err = run_restore(context(&space, &replies), status.clone(), config)
        .await
        .unwrap_err();

    match err {
        Error::SpaceMismatch { expected, actual } => {
            assert_eq!(expected, SPACE_ID);
            assert_eq!(actual, 555);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(space.mutations(), 0);
    assert!(status.history().await.is_empty());
}

#[tokio::test]
async fn metadata_lookup_errors_are_distinct() {
    let temp = TempDir::new().unwrap();
    let space = fixture_space();
    let replies = confirming();
    let status: Arc<dyn StatusSink> = Arc::new(RecordingStatus::new());

    let missing = temp.path().join("backup_nothing_here");
    let err = run_restore(
        context(&space, &replies),
        status.clone(),
        restore_config(&missing, Duration::from_secs(5)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::MetadataNotFound { .. }));

    let dir = temp.path().join("not_a_bundle");
    std::fs::create_dir_all(&dir).unwrap();
    let err = run_restore(
        context(&space, &replies),
        status,
        restore_config(&dir, Duration::from_secs(5)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::MetadataIsDirectory { .. }));
    assert_eq!(space.mutations(), 0);
}

#[tokio::test]
async fn rejected_items_are_skipped_and_reported() {
    let temp = TempDir::new().unwrap();
    let (space, metadata_path) = backed_up(&temp, BackupFormat::Aggregate).await;
    space
        .update(|s| {
            s.failing_role_names.insert("Mods".to_string());
            s.rejected_content = Some("look".to_string());
        })
        .await;

    let replies = confirming();
    let status = Arc::new(RecordingStatus::new());
    let report = run_restore(
        context(&space, &replies),
        status.clone(),
        restore_config(&metadata_path, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(report.state, RestoreState::PartiallyCompleted);
    assert_eq!(report.roles.done, 1);
    assert_eq!(report.roles.skipped, 1);
    assert_eq!(report.categories.done, 1);
    assert_eq!(report.channels.done, 3);
    // The category's overwrite targeted the role that failed to come back.
    assert_eq!(report.overwrites_dropped, 1);
    assert_eq!(report.messages.done, 2);
    assert_eq!(report.messages.skipped, 1);
    assert_eq!(report.skipped_items(), 2);

    let after = space.state().await;
    let category = after
        .channels
        .iter()
        .find(|c| c.name == "Text Channels")
        .unwrap();
    assert!(category.overwrites.is_empty());
    assert!(
        status
            .current()
            .await
            .unwrap()
            .starts_with("Restore finished with 2 skipped items.")
    );
}

#[tokio::test]
async fn relational_bundle_restores_structure_only() {
    let temp = TempDir::new().unwrap();
    let (space, metadata_path) = backed_up(&temp, BackupFormat::Relational).await;

    let replies = confirming();
    let report = run_restore(
        context(&space, &replies),
        Arc::new(RecordingStatus::new()),
        restore_config(&metadata_path, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(report.state, RestoreState::Completed);
    assert_eq!(report.channels.done, 3);
    assert_eq!(report.messages.done, 0);
    assert!(
        report
            .replay_skipped_reason
            .as_deref()
            .unwrap()
            .contains("not supported for relational")
    );
    assert!(space.state().await.sent.is_empty());
}

#[tokio::test]
async fn bundle_directory_names_its_own_metadata() {
    let temp = TempDir::new().unwrap();
    let (space, metadata_path) = backed_up(&temp, BackupFormat::Aggregate).await;
    let bundle_dir = metadata_path.parent().unwrap().to_path_buf();

    let replies = confirming();
    let mut config = restore_config(&bundle_dir, Duration::from_secs(5));
    config.replay_messages = false;
    let report = run_restore(
        context(&space, &replies),
        Arc::new(RecordingStatus::new()),
        config,
    )
    .await
    .unwrap();

    assert_eq!(report.metadata_path, metadata_path);
    assert_eq!(
        report.replay_skipped_reason.as_deref(),
        Some("message replay disabled")
    );
    assert_eq!(report.messages.done, 0);
}

#[tokio::test]
async fn missing_media_is_counted_not_fatal() {
    let temp = TempDir::new().unwrap();
    let (space, metadata_path) = backed_up(&temp, BackupFormat::Aggregate).await;
    let bundle_dir = metadata_path.parent().unwrap();
    std::fs::remove_file(bundle_dir.join("media").join("general").join("a.png")).unwrap();

    let replies = confirming();
    let report = run_restore(
        context(&space, &replies),
        Arc::new(RecordingStatus::new()),
        restore_config(&metadata_path, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(report.state, RestoreState::Completed);
    assert_eq!(report.messages.done, 3);
    assert_eq!(report.attachments_missing, 1);
    assert!(space.state().await.sent[2].1.files.is_empty());
}

#[tokio::test]
async fn dangling_references_in_the_structure_are_tolerated() {
    let temp = TempDir::new().unwrap();
    let (space, metadata_path) = backed_up(&temp, BackupFormat::Aggregate).await;
    let layout = BundleLayout::from_metadata_path(&metadata_path).unwrap();
    let mut structure = load_structure(&layout.structure_path()).unwrap();
    for channel in &mut structure.channels {
        if channel.id == QUIET {
            channel.category_id = Some(777);
        }
        if channel.id == GENERAL {
            channel.overwrites.insert(
                888,
                PermissionPair {
                    allow_bits: 1,
                    deny_bits: 0,
                },
            );
        }
    }
    write_json(&layout.structure_path(), &structure).unwrap();

    let replies = confirming();
    let mut config = restore_config(&metadata_path, Duration::from_secs(5));
    config.replay_messages = false;
    let report = run_restore(
        context(&space, &replies),
        Arc::new(RecordingStatus::new()),
        config,
    )
    .await
    .unwrap();

    assert_eq!(report.state, RestoreState::Completed);
    assert_eq!(report.channels.done, 3);
    assert_eq!(report.overwrites_dropped, 1);

    let after = space.state().await;
    let find = |name: &str| after.channels.iter().find(|c| c.name == name).unwrap();
    let category = find("Text Channels");
    assert_eq!(find("quiet").parent_id, None);
    assert_eq!(find("general").parent_id, Some(category.id));
    // Only the Members overwrite survives on general.
    assert_eq!(find("general").overwrites.len(), 1);
}
