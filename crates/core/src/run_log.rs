use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "SPACEVAULT_LOG";
pub const LOG_DIR_ENV: &str = "SPACEVAULT_LOG_DIR";
const DEFAULT_FILTER: &str = "info";

static ACTIVE_LOG: OnceLock<ActiveLog> = OnceLock::new();
static SUBSCRIBER: OnceLock<()> = OnceLock::new();

/// The per-run NDJSON file, if one is open. Events emitted with no run
/// active are discarded.
#[derive(Debug, Default)]
struct ActiveLog {
    file: Mutex<Option<BufWriter<File>>>,
}

impl ActiveLog {
    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, path: &Path) -> io::Result<()> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a run log is already open",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *slot = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

struct LogLine<'a>(MutexGuard<'a, Option<BufWriter<File>>>);

impl Write for LogLine<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for ActiveLog {
    type Writer = LogLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogLine(self.lock())
    }
}

impl<'a> MakeWriter<'a> for &ActiveLog {
    type Writer = LogLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn env_filter_from(spacevault_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    spacevault_log
        .or(rust_log)
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber once: `SPACEVAULT_LOG`, then `RUST_LOG`,
/// then `info`; JSON lines with RFC 3339 UTC timestamps.
pub fn init_logging() {
    SUBSCRIBER.get_or_init(|| {
        let log = ACTIVE_LOG.get_or_init(ActiveLog::default);
        let filter = env_filter_from(
            std::env::var(LOG_ENV).ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(log);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}

/// Closes the run log (flush + fsync) when dropped.
#[derive(Debug)]
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(log) = ACTIVE_LOG.get()
            && let Err(e) = log.close()
        {
            eprintln!("run log close failed: {}: {e}", self.path.display());
        }
    }
}

/// Opens `<logs>/<kind>-<YYYYmmddTHHMMSSZ>-<run_id>.ndjson`. Only `backup`
/// and `restore` runs are logged.
pub fn start_run_log(kind: &str, run_id: &str, data_dir: &Path) -> io::Result<RunLogGuard> {
    if !matches!(kind, "backup" | "restore") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported run kind: {kind}"),
        ));
    }
    init_logging();

    let dir = match std::env::var_os(LOG_DIR_ENV) {
        Some(v) => PathBuf::from(v),
        None => data_dir.join("logs"),
    };
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(format!(
        "{kind}-{}-{}.ndjson",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        file_component(run_id)
    ));
    ACTIVE_LOG.get_or_init(ActiveLog::default).open(&path)?;
    Ok(RunLogGuard { path })
}

fn file_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_precedence_is_spacevault_then_rust_log_then_info() {
        assert_eq!(env_filter_from(Some("warn"), Some("debug")).to_string(), "warn");
        assert_eq!(env_filter_from(None, Some("debug")).to_string(), "debug");
        assert_eq!(env_filter_from(None, None).to_string(), "info");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = start_run_log("verify", "run_1", temp.path()).expect_err("kind");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn run_log_lines_are_json_and_flushed_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let guard = start_run_log("restore", "run/42", temp.path()).expect("start_run_log");
        let path = guard.path().to_path_buf();
        assert_eq!(path.parent(), Some(temp.path().join("logs").as_path()));
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("restore-"));
        assert!(name.ends_with("-run_42.ndjson"));

        tracing::info!(event = "run.start", kind = "restore", "run.start");
        tracing::warn!(event = "restore.item_skipped", kind = "role", "restore.item_skipped");
        drop(guard);

        let text = std::fs::read_to_string(&path).expect("read run log");
        let mut saw_start = false;
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("json line");
            assert!(v.get("timestamp").is_some());
            assert!(v.get("level").is_some());
            saw_start |= v.pointer("/fields/event").and_then(|e| e.as_str()) == Some("run.start");
        }
        assert!(saw_start, "run.start missing from {text}");
    }
}
