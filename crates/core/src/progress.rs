use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::remote::StatusSink;

pub const DEFAULT_BAR_LENGTH: usize = 20;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// `[████----] current/total (pct%)`. A zero total renders an empty bar
/// with `0/0 (0%)`.
pub fn render_progress_bar(current: u64, total: u64, length: usize) -> String {
    if total == 0 {
        return format!("[{}] 0/0 (0%)", "-".repeat(length));
    }
    let current = current.min(total);
    let filled = (length as u128 * current as u128 / total as u128) as usize;
    let percent = 100 * current as u128 / total as u128;
    format!(
        "[{}{}] {current}/{total} ({percent}%)",
        "█".repeat(filled),
        "-".repeat(length - filled)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressOptions {
    pub interval: Duration,
    pub bar_length: usize,
}

impl Default for ProgressOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            bar_length: DEFAULT_BAR_LENGTH,
        }
    }
}

/// Single-writer counter shared with the reporter task.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter(Arc<AtomicU64>);

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Periodically republishes the bar to the status sink while
/// `counter < total`. The owner never writes progress itself; it only bumps
/// the counter and calls [`ProgressReporter::stop`] when its loop is done.
pub struct ProgressReporter {
    done: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn start(
        sink: Arc<dyn StatusSink>,
        counter: ProgressCounter,
        total: u64,
        label: String,
        options: ProgressOptions,
    ) -> Self {
        let done = CancellationToken::new();
        let token = done.clone();
        let handle = tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                let current = counter.get();
                if current >= total {
                    break;
                }
                let text = format!(
                    "{label}{}",
                    render_progress_bar(current, total, options.bar_length)
                );
                if let Err(e) = sink.set_status(&text).await {
                    warn!(event = "progress.update_failed", error = %e, "progress.update_failed");
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(options.interval) => {}
                }
            }
            debug!(event = "progress.stopped", "progress.stopped");
        });
        Self {
            done,
            handle: Some(handle),
        }
    }

    /// Signals the task and waits for it, so no edit from the reporter can
    /// land after this returns. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.done.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(event = "progress.join_failed", error = %e, "progress.join_failed");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.done.cancel();
    }
}
