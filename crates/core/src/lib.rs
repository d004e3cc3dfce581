mod archive;
mod backup;
pub mod bundle;
pub mod config;
mod confirm;
mod error;
pub mod formats;
pub mod model;
pub mod progress;
pub mod remote;
mod restore;
pub mod run_log;
mod snapshot;

pub const APP_NAME: &str = "SpaceVault";

pub use archive::{
    ArchiveOptions, ArchiveResult, DEFAULT_RAPID_MESSAGE_LIMIT, DepthMode, archive_messages,
    plan_channels,
};
pub use backup::{BackupConfig, BackupOptions, BackupResult, run_backup, run_backup_with};
pub use confirm::{ConfirmationGate, DEFAULT_CONFIRM_TIMEOUT, DEFAULT_CONFIRM_TOKEN, GateOutcome};
pub use error::{Error, Result};
pub use formats::{BackendSummary, BackupFormat, MessageBackend};
pub use remote::discord::{DiscordConfig, DiscordReplies, DiscordSpace, DiscordStatus};
pub use remote::memory::{InMemorySpace, RecordingStatus, ScriptedReplies, SpaceState};
pub use remote::{ReplySource, SpaceReader, SpaceWriter, StatusSink};
pub use restore::{
    ItemOutcome, LoadedBackup, MAX_MESSAGE_CHARS, PhaseCounts, RestoreConfig, RestoreContext,
    RestoreReport, RestoreState, load_backup, replay_body, run_restore,
};
pub use snapshot::{
    EmojiAssets, build_structural_snapshot, capture_members, save_emoji_assets,
    write_structural_snapshot,
};
