use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, error};

use super::{ArchiveChannel, BackendSummary, MessageBackend};
use crate::bundle::{BundleLayout, DB_FILE};
use crate::model::{AttachmentOutcome, AttachmentRecord, Embed, Id, MessageRecord};
use crate::remote::RemoteFuture;
use crate::{Error, Result};

pub async fn open_archive_db(path: &Path) -> Result<SqlitePool> {
    debug!(
        event = "sqlite.open",
        db_path = %path.display(),
        create_if_missing = true,
        "sqlite.open"
    );
    let pool = connect(path, true).await?;

    sqlx::migrate!().run(&pool).await.map_err(|e| {
        error!(
            event = "io.sqlite.migrate_failed",
            db_path = %path.display(),
            error = %e,
            "io.sqlite.migrate_failed"
        );
        e
    })?;
    Ok(pool)
}

pub async fn open_existing_archive_db(path: &Path) -> Result<SqlitePool> {
    debug!(
        event = "sqlite.open",
        db_path = %path.display(),
        create_if_missing = false,
        "sqlite.open"
    );
    connect(path, false).await
}

async fn connect(path: &Path, create_if_missing: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create_if_missing)
        .journal_mode(SqliteJournalMode::Delete)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| {
            error!(
                event = "io.sqlite.connect_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.connect_failed"
            );
            e
        })?;
    Ok(pool)
}

/// `backup.db`: channels, messages, embeds and attachments as tables keyed
/// by their ids, plus in-band error rows. Each channel is one transaction.
pub struct RelationalBackend {
    path: PathBuf,
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    channel_seq: i64,
    message_seq: i64,
}

impl RelationalBackend {
    pub async fn create(layout: &BundleLayout) -> Result<Self> {
        let path = layout.db_path();
        let pool = open_archive_db(&path).await?;
        Ok(Self {
            path,
            pool,
            tx: None,
            channel_seq: 0,
            message_seq: 0,
        })
    }

    fn open_tx(&mut self) -> Result<&mut Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or_else(|| Error::InvalidConfig {
            message: "relational backend has no open channel".to_string(),
        })
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}

fn attachment_status(outcome: &AttachmentOutcome) -> (&'static str, Option<&str>, Option<&str>) {
    match outcome {
        AttachmentOutcome::Saved { path } => ("saved", Some(path.as_str()), None),
        AttachmentOutcome::Failed { error } => ("failed", None, Some(error.as_str())),
        AttachmentOutcome::NotDownloaded => ("not_downloaded", None, None),
    }
}

impl MessageBackend for RelationalBackend {
    fn begin_channel<'a>(&'a mut self, channel: &'a ArchiveChannel) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.commit().await?;
            let mut tx = self.pool.begin().await?;
            self.channel_seq += 1;
            sqlx::query("INSERT OR IGNORE INTO channels (channel_id, name, seq) VALUES (?, ?, ?)")
                .bind(channel.id as i64)
                .bind(&channel.name)
                .bind(self.channel_seq)
                .execute(&mut *tx)
                .await?;
            self.tx = Some(tx);
            Ok(())
        })
    }

    fn append_message<'a>(&'a mut self, message: &'a MessageRecord) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.message_seq += 1;
            let seq = self.message_seq;
            let tx = self.open_tx()?;
            sqlx::query(
                r#"
                INSERT INTO messages (message_id, channel_id, seq, author_id, author_display, content, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(message.id as i64)
            .bind(message.channel_id as i64)
            .bind(seq)
            .bind(message.author_id as i64)
            .bind(&message.author_display)
            .bind(&message.content)
            .bind(message.created_at.to_rfc3339())
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
    }

    fn append_embeds<'a>(
        &'a mut self,
        message_id: Id,
        embeds: &'a [Embed],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let tx = self.open_tx()?;
            for (seq, embed) in embeds.iter().enumerate() {
                let body = serde_json::to_string(embed)?;
                sqlx::query("INSERT INTO embeds (message_id, seq, body) VALUES (?, ?, ?)")
                    .bind(message_id as i64)
                    .bind(seq as i64)
                    .bind(body)
                    .execute(&mut **tx)
                    .await?;
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
            let tx = self.open_tx()?;
            let (status, saved_path, err) = attachment_status(&attachment.outcome);
            sqlx::query(
                r#"
                INSERT INTO attachments (message_id, filename, url, status, saved_path, error)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(message_id as i64)
            .bind(&attachment.filename)
            .bind(&attachment.url)
            .bind(status)
            .bind(saved_path)
            .bind(err)
            .execute(&mut **tx)
            .await?;
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
            let query = sqlx::query(
                "INSERT INTO archive_errors (channel_id, message_id, error) VALUES (?, ?, ?)",
            )
            .bind(channel.id as i64)
            .bind(message_id.map(|id| id as i64))
            .bind(error);
            match self.tx.as_mut() {
                Some(tx) => query.execute(&mut **tx).await?,
                None => query.execute(&self.pool).await?,
            };
            Ok(())
        })
    }

    fn end_channel(&mut self) -> RemoteFuture<'_, ()> {
        Box::pin(async move { self.commit().await })
    }

    fn finish(&mut self) -> RemoteFuture<'_, Option<String>> {
        Box::pin(async move {
            self.commit().await?;
            self.pool.close().await;
            debug!(
                event = "sqlite.closed",
                db_path = %self.path.display(),
                "sqlite.closed"
            );
            Ok(Some(DB_FILE.to_string()))
        })
    }
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<u64> {
    let n: i64 = sqlx::query(sql).fetch_one(pool).await?.get("n");
    Ok(n.max(0) as u64)
}

pub async fn summarize(path: &Path) -> Result<BackendSummary> {
    let pool = open_existing_archive_db(path).await?;
    let summary = BackendSummary {
        channels: count(&pool, "SELECT COUNT(*) as n FROM channels").await?,
        messages: count(&pool, "SELECT COUNT(*) as n FROM messages").await?,
        embeds: count(&pool, "SELECT COUNT(*) as n FROM embeds").await?,
        attachments_saved: count(
            &pool,
            "SELECT COUNT(*) as n FROM attachments WHERE status = 'saved'",
        )
        .await?,
        attachments_failed: count(
            &pool,
            "SELECT COUNT(*) as n FROM attachments WHERE status = 'failed'",
        )
        .await?,
        attachments_not_downloaded: count(
            &pool,
            "SELECT COUNT(*) as n FROM attachments WHERE status = 'not_downloaded'",
        )
        .await?,
        errors: count(&pool, "SELECT COUNT(*) as n FROM archive_errors").await?,
    };
    pool.close().await;
    Ok(summary)
}
