use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::archive::DepthMode;
use crate::formats::BackupFormat;
use crate::model::{Id, StructuralSnapshot};
use crate::{Error, Result};

pub const METADATA_VERSION: u32 = 1;

pub const STRUCTURE_FILE: &str = "backup_structure.json";
pub const DATA_FILE: &str = "backup_data.json";
pub const DB_FILE: &str = "backup.db";
pub const MEMBERS_FILE: &str = "members.json";
pub const ERRORS_FILE: &str = "errors.txt";
pub const LOGS_DIR: &str = "logs";
pub const MEDIA_DIR: &str = "media";
pub const EMOJI_DIR: &str = "emoji";

/// The pointer document. Restore is invoked by naming this file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: u32,
    pub space_id: Id,
    pub space_name: String,
    pub created_at: DateTime<Utc>,
    pub format: BackupFormat,
    pub mode: DepthMode,
    pub structural_file: String,
    #[serde(default)]
    pub data_file: Option<String>,
    #[serde(default)]
    pub members_file: Option<String>,
    #[serde(default)]
    pub members_error: Option<String>,
}

/// Keeps letters, digits, spaces, hyphens and underscores. A name with
/// nothing usable left becomes the numeric `fallback`.
pub fn sanitize_name(name: &str, fallback: Id) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    if cleaned.trim().is_empty() {
        return fallback.to_string();
    }
    cleaned
}

/// Strips any directory components so a remote filename cannot escape the
/// media tree.
pub fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match base {
        "" | "." | ".." => "attachment".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    dir: PathBuf,
    stem: String,
}

impl BundleLayout {
    /// Creates `backup_<name>_<timestamp>/` under `output_root`. Fails if the
    /// directory already exists so two runs never share a bundle.
    pub fn create(
        output_root: &Path,
        space_name: &str,
        space_id: Id,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let stem = format!(
            "backup_{}_{}",
            sanitize_name(space_name, space_id),
            now.format("%Y%m%d_%H%M%S")
        );
        fs::create_dir_all(output_root)?;
        let dir = output_root.join(&stem);
        fs::create_dir(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::InvalidConfig {
                    message: format!("backup directory already exists: {}", dir.display()),
                }
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Self { dir, stem })
    }

    /// Layout of an existing bundle, derived from its metadata file.
    pub fn from_metadata_path(metadata_path: &Path) -> Result<Self> {
        let dir = metadata_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let stem = metadata_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::NonUtf8Path {
                path: metadata_path.to_path_buf(),
            })?
            .to_string();
        Ok(Self { dir, stem })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.stem))
    }

    pub fn structure_path(&self) -> PathBuf {
        self.dir.join(STRUCTURE_FILE)
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join(DB_FILE)
    }

    pub fn members_path(&self) -> PathBuf {
        self.dir.join(MEMBERS_FILE)
    }

    pub fn errors_path(&self) -> PathBuf {
        self.dir.join(ERRORS_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join(LOGS_DIR)
    }

    pub fn emoji_dir(&self) -> PathBuf {
        self.dir.join(EMOJI_DIR)
    }

    pub fn media_dir(&self) -> PathBuf {
        self.dir.join(MEDIA_DIR)
    }

    /// Relative path (always `/`-separated) of a saved attachment.
    pub fn media_relative(channel_dir: &str, filename: &str) -> String {
        format!("{MEDIA_DIR}/{channel_dir}/{filename}")
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.dir.clone(), |acc, part| acc.join(part))
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)?;
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(tmp, path)?;
    Ok(())
}

pub(crate) fn append_error_line(path: &Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{line}")
}

/// Turns what the operator typed into the metadata file to load. A bundle
/// directory resolves to the pointer file inside it; a bare name gets `.json`.
pub fn resolve_metadata_path(input: &Path) -> Result<PathBuf> {
    if input.is_dir() {
        let inner = input
            .file_name()
            .and_then(|n| n.to_str())
            .map(|stem| input.join(format!("{stem}.json")));
        return match inner {
            Some(p) if p.is_file() => Ok(p),
            _ => Err(Error::MetadataIsDirectory {
                path: input.to_path_buf(),
            }),
        };
    }

    let mut path = input.to_path_buf();
    if path.extension().is_none() {
        path.set_extension("json");
    }
    if path.is_dir() {
        return Err(Error::MetadataIsDirectory { path });
    }
    if !path.is_file() {
        return Err(Error::MetadataNotFound { path });
    }
    Ok(path)
}

pub(crate) fn load_document<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| Error::FatalLoad {
        message: format!("{what} unreadable: {}: {e}", path.display()),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| Error::FatalLoad {
        message: format!("{what} invalid: {}: {e}", path.display()),
    })
}

pub fn load_metadata(path: &Path) -> Result<BackupMetadata> {
    let meta: BackupMetadata = load_document(path, "backup metadata")?;
    if meta.version != METADATA_VERSION {
        return Err(Error::FatalLoad {
            message: format!("unsupported metadata version: {}", meta.version),
        });
    }
    Ok(meta)
}

pub fn load_structure(path: &Path) -> Result<StructuralSnapshot> {
    load_document(path, "structural document")
}
