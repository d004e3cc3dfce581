mod common;

use std::sync::Arc;

use space_vault_core::bundle::{BundleLayout, load_metadata, load_structure};
use space_vault_core::formats::{AggregateDocument, read_summary};
use space_vault_core::model::{AttachmentOutcome, MemberRecord};
use space_vault_core::remote::RemoteAttachment;
use space_vault_core::{BackupFormat, DepthMode, RecordingStatus, run_backup};
use sqlx::Row;
use tempfile::TempDir;

use common::*;

#[tokio::test]
async fn aggregate_full_backup_writes_a_complete_bundle() {
    let temp = TempDir::new().unwrap();
    let space = fixture_space();
    let status = Arc::new(RecordingStatus::new());

    let res = run_backup(
        &space,
        status.clone(),
        backup_config(temp.path(), BackupFormat::Aggregate, DepthMode::Full),
    )
    .await
    .unwrap();

    assert_eq!(res.roles, 3);
    assert_eq!(res.categories, 1);
    assert_eq!(res.channels, 3);
    assert_eq!(res.member_overwrites_omitted, 1);
    assert_eq!(res.members, Some(1));
    assert_eq!(res.emojis_saved, 1);
    assert_eq!(res.archive.channels, 2);
    assert_eq!(res.archive.messages, 3);
    assert_eq!(res.archive.embeds, 1);
    assert_eq!(res.archive.attachments_saved, 1);
    assert_eq!(res.archive.channel_errors, 0);

    let metadata = load_metadata(&res.metadata_path).unwrap();
    assert_eq!(metadata.space_id, SPACE_ID);
    assert_eq!(metadata.format, BackupFormat::Aggregate);
    assert_eq!(metadata.data_file.as_deref(), Some("backup_data.json"));
    assert_eq!(metadata.members_file.as_deref(), Some("members.json"));
    assert!(metadata.members_error.is_none());

    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    let structure = load_structure(&layout.structure_path()).unwrap();
    assert_eq!(structure.info.name, "Test Guild");
    let category = &structure.categories[0];
    assert_eq!(category.overwrites.len(), 1);
    assert!(category.overwrites.contains_key(&MODS_ROLE));
    let general = structure.channels.iter().find(|c| c.id == GENERAL).unwrap();
    assert_eq!(general.category_id, Some(CATEGORY));
    assert_eq!(general.topic.as_deref(), Some("talk here"));

    let members: Vec<MemberRecord> =
        serde_json::from_slice(&std::fs::read(layout.members_path()).unwrap()).unwrap();
    assert_eq!(members.len(), 1);
    assert!(layout.emoji_dir().join("party.png").is_file());

    let doc = AggregateDocument::load(&layout.data_path()).unwrap();
    let archived = doc.channel(GENERAL).unwrap();
    let ids: Vec<_> = archived.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1001, 1002, 1003]);
    assert_eq!(archived.messages[1].embeds.len(), 1);
    let attachment = &archived.messages[2].attachments[0];
    assert_eq!(
        attachment.outcome,
        AttachmentOutcome::Saved {
            path: "media/general/a.png".to_string()
        }
    );
    assert_eq!(
        std::fs::read(layout.resolve("media/general/a.png")).unwrap(),
        b"\x89PNG fake"
    );
    assert!(doc.channel(QUIET).unwrap().messages.is_empty());
    assert!(doc.channel(VOICE).is_none());
    // Media directories exist even for channels without attachments.
    assert!(layout.media_dir().join("quiet").is_dir());

    let history = status.history().await;
    assert_eq!(
        history[0],
        "Saving server structure (roles, categories, channels, emoji)..."
    );
    // Bundle name, metadata and structure all come from one read.
    assert_eq!(space.info_reads(), 1);
    assert_eq!(metadata.space_name, structure.info.name);
    let last = history.last().unwrap();
    assert!(last.starts_with("Backup complete: [██████████] 2/2 (100%)"));
    assert!(last.contains("messages: 3"));
}

#[tokio::test]
async fn every_backend_reports_the_same_content() {
    let mut summaries = Vec::new();
    for format in [
        BackupFormat::Text,
        BackupFormat::Aggregate,
        BackupFormat::Relational,
    ] {
        let temp = TempDir::new().unwrap();
        let space = fixture_space();
        let res = run_backup(
            &space,
            Arc::new(RecordingStatus::new()),
            backup_config(temp.path(), format, DepthMode::Full),
        )
        .await
        .unwrap();
        let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
        let summary = read_summary(format, &layout).await.unwrap();
        assert_eq!(summary.channels, 2, "{format}");
        assert_eq!(summary.messages, 3, "{format}");
        assert_eq!(summary.embeds, 1, "{format}");
        assert_eq!(summary.attachments_saved, 1, "{format}");
        assert_eq!(summary.errors, 0, "{format}");
        summaries.push(summary);
    }
    assert_eq!(summaries[0], summaries[1]);
    assert_eq!(summaries[1], summaries[2]);
}

#[tokio::test]
async fn relational_backup_is_queryable() {
    let temp = TempDir::new().unwrap();
    let space = fixture_space();
    let res = run_backup(
        &space,
        Arc::new(RecordingStatus::new()),
        backup_config(temp.path(), BackupFormat::Relational, DepthMode::Full),
    )
    .await
    .unwrap();
    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    let metadata = load_metadata(&res.metadata_path).unwrap();
    assert_eq!(metadata.data_file.as_deref(), Some("backup.db"));

    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}", layout.db_path().display()))
        .await
        .unwrap();

    let rows = sqlx::query(
        "SELECT message_id, content FROM messages WHERE channel_id = ? ORDER BY seq",
    )
    .bind(GENERAL as i64)
    .fetch_all(&pool)
    .await
    .unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>("message_id")).collect();
    assert_eq!(ids, vec![1001, 1002, 1003]);
    assert_eq!(rows[0].get::<String, _>("content"), "hello");

    let saved: String =
        sqlx::query("SELECT saved_path FROM attachments WHERE message_id = 1003")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("saved_path");
    assert_eq!(saved, "media/general/a.png");

    let channels: i64 = sqlx::query("SELECT COUNT(*) as n FROM channels")
        .fetch_one(&pool)
        .await
        .unwrap()
        .get("n");
    assert_eq!(channels, 2);
}

#[tokio::test]
async fn one_broken_channel_does_not_stop_the_others() {
    let temp = TempDir::new().unwrap();
    let mut state = fixture_state();
    state.failing_history.insert(GENERAL);
    state.history.insert(
        QUIET,
        vec![message(QUIET, 2001, "carol", "still here")],
    );
    let space = space_vault_core::InMemorySpace::new(state);

    let res = run_backup(
        &space,
        Arc::new(RecordingStatus::new()),
        backup_config(temp.path(), BackupFormat::Aggregate, DepthMode::Full),
    )
    .await
    .unwrap();
    assert_eq!(res.archive.channels, 2);
    assert_eq!(res.archive.channel_errors, 1);
    assert_eq!(res.archive.messages, 1);

    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    let doc = AggregateDocument::load(&layout.data_path()).unwrap();
    let broken = doc.channel(GENERAL).unwrap();
    assert!(broken.messages.is_empty());
    assert_eq!(broken.errors.len(), 1);
    assert!(broken.errors[0].error.starts_with("history fetch failed"));
    assert_eq!(doc.channel(QUIET).unwrap().messages[0].content, "still here");
}

#[tokio::test]
async fn failed_download_keeps_the_message() {
    let temp = TempDir::new().unwrap();
    let mut state = fixture_state();
    state.blobs.remove(ATTACHMENT_URL);
    let space = space_vault_core::InMemorySpace::new(state);

    let res = run_backup(
        &space,
        Arc::new(RecordingStatus::new()),
        backup_config(temp.path(), BackupFormat::Text, DepthMode::Full),
    )
    .await
    .unwrap();
    assert_eq!(res.archive.messages, 3);
    assert_eq!(res.archive.attachments_saved, 0);
    assert_eq!(res.archive.attachments_failed, 1);

    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    let log = std::fs::read_to_string(layout.logs_dir().join("general.txt")).unwrap();
    assert!(log.contains("[ATTACHMENT ERROR] a.png"));
    let summary = read_summary(BackupFormat::Text, &layout).await.unwrap();
    assert_eq!(summary.messages, 3);
    assert_eq!(summary.attachments_failed, 1);
}

#[tokio::test]
async fn member_listing_failure_is_recorded_not_fatal() {
    let temp = TempDir::new().unwrap();
    let mut state = fixture_state();
    state.failing_members = true;
    let space = space_vault_core::InMemorySpace::new(state);

    let res = run_backup(
        &space,
        Arc::new(RecordingStatus::new()),
        backup_config(temp.path(), BackupFormat::Aggregate, DepthMode::Full),
    )
    .await
    .unwrap();
    assert_eq!(res.members, None);

    let metadata = load_metadata(&res.metadata_path).unwrap();
    assert!(metadata.members_file.is_none());
    assert!(
        metadata
            .members_error
            .as_deref()
            .unwrap()
            .contains("member listing unavailable")
    );
    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    assert!(!layout.members_path().exists());
}

#[tokio::test]
async fn failed_emoji_is_listed_in_errors_file() {
    let temp = TempDir::new().unwrap();
    let mut state = fixture_state();
    state.blobs.remove(EMOJI_URL);
    let space = space_vault_core::InMemorySpace::new(state);

    let res = run_backup(
        &space,
        Arc::new(RecordingStatus::new()),
        backup_config(temp.path(), BackupFormat::Aggregate, DepthMode::Full),
    )
    .await
    .unwrap();
    assert_eq!(res.emojis_saved, 0);
    assert_eq!(res.emojis_failed, 1);

    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    let errors = std::fs::read_to_string(layout.errors_path()).unwrap();
    assert!(errors.contains("[EMOJI ERROR] party"));
}

#[tokio::test]
async fn rapid_mode_caps_history_and_skips_downloads() {
    let temp = TempDir::new().unwrap();
    let space = fixture_space();
    let mut config = backup_config(temp.path(), BackupFormat::Aggregate, DepthMode::Rapid);
    config.archive.rapid_message_limit = 2;

    let res = run_backup(&space, Arc::new(RecordingStatus::new()), config)
        .await
        .unwrap();
    assert_eq!(res.archive.messages, 2);
    assert_eq!(res.archive.truncated_channels, 1);
    assert_eq!(res.archive.attachments_saved, 0);

    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    let doc = AggregateDocument::load(&layout.data_path()).unwrap();
    let ids: Vec<_> = doc
        .channel(GENERAL)
        .unwrap()
        .messages
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![1001, 1002]);

    let temp = TempDir::new().unwrap();
    let config = backup_config(temp.path(), BackupFormat::Aggregate, DepthMode::Rapid);
    let res = run_backup(&space, Arc::new(RecordingStatus::new()), config)
        .await
        .unwrap();
    assert_eq!(res.archive.messages, 3);
    assert_eq!(res.archive.truncated_channels, 0);
    assert_eq!(res.archive.attachments_not_downloaded, 1);
    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    assert!(!layout.media_dir().join("general").join("a.png").exists());
}

#[tokio::test]
async fn long_history_is_paged_in_order() {
    let temp = TempDir::new().unwrap();
    let mut state = fixture_state();
    state.history.insert(
        QUIET,
        (0..250)
            .map(|i| message(QUIET, 5000 + i, "bot", &format!("m{i}")))
            .collect(),
    );
    let space = space_vault_core::InMemorySpace::new(state);

    let res = run_backup(
        &space,
        Arc::new(RecordingStatus::new()),
        backup_config(temp.path(), BackupFormat::Aggregate, DepthMode::Full),
    )
    .await
    .unwrap();
    assert_eq!(res.archive.messages, 253);

    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    let doc = AggregateDocument::load(&layout.data_path()).unwrap();
    let quiet = &doc.channel(QUIET).unwrap().messages;
    assert_eq!(quiet.len(), 250);
    assert!(quiet.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(quiet[249].content, "m249");
}

#[tokio::test]
async fn cancelled_backup_writes_no_metadata() {
    let temp = TempDir::new().unwrap();
    let space = fixture_space();
    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();

    let err = space_vault_core::run_backup_with(
        &space,
        Arc::new(RecordingStatus::new()),
        backup_config(temp.path(), BackupFormat::Aggregate, DepthMode::Full),
        space_vault_core::BackupOptions {
            cancel: Some(&cancel),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, space_vault_core::Error::Cancelled));

    let bundle = std::fs::read_dir(temp.path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let stem = bundle.file_name().unwrap().to_string_lossy().into_owned();
    assert!(bundle.join("backup_structure.json").is_file());
    assert!(!bundle.join(format!("{stem}.json")).exists());
}

#[tokio::test]
async fn repeated_attachment_names_get_distinct_files() {
    let temp = TempDir::new().unwrap();
    let space = fixture_space();
    space
        .update(|s| {
            let mut pasted = message(QUIET, 2001, "alice", "screenshots");
            for i in 0..3 {
                let url = format!("https://cdn.test/attachments/{i}/image.png");
                s.blobs.insert(url.clone(), format!("bytes{i}").into_bytes());
                pasted.attachments.push(RemoteAttachment {
                    filename: "image.png".to_string(),
                    url,
                });
            }
            s.history.insert(QUIET, vec![pasted]);
        })
        .await;

    let res = run_backup(
        &space,
        Arc::new(RecordingStatus::new()),
        backup_config(temp.path(), BackupFormat::Aggregate, DepthMode::Full),
    )
    .await
    .unwrap();
    assert_eq!(res.archive.attachments_saved, 4);

    let layout = BundleLayout::from_metadata_path(&res.metadata_path).unwrap();
    let doc = AggregateDocument::load(&layout.data_path()).unwrap();
    let attachments = &doc.channel(QUIET).unwrap().messages[0].attachments;
    let paths: Vec<_> = attachments
        .iter()
        .map(|a| match &a.outcome {
            AttachmentOutcome::Saved { path } => path.clone(),
            other => panic!("unexpected outcome: {other:?}"),
        })
        .collect();
    assert_eq!(
        paths,
        vec![
            "media/quiet/image.png",
            "media/quiet/2001_image.png",
            "media/quiet/2001_2_image.png",
        ]
    );
    for (i, path) in paths.iter().enumerate() {
        assert_eq!(
            std::fs::read(layout.resolve(path)).unwrap(),
            format!("bytes{i}").into_bytes()
        );
    }
}
