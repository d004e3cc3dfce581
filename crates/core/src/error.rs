use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("remote error: {message}")]
    Remote { message: String },

    #[error("backup could not be loaded: {message}")]
    FatalLoad { message: String },

    #[error("backup belongs to space {expected}, target space is {actual}")]
    SpaceMismatch { expected: u64, actual: u64 },

    #[error("backup metadata not found: {path:?}")]
    MetadataNotFound { path: PathBuf },

    #[error("backup metadata path is a directory: {path:?}")]
    MetadataIsDirectory { path: PathBuf },

    #[error("cancelled")]
    Cancelled,

    #[error("restore declined")]
    ConfirmationDeclined,

    #[error("restore confirmation timed out")]
    ConfirmationTimeout,

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}

impl Error {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }
}
