use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveOptions, DEFAULT_RAPID_MESSAGE_LIMIT, DepthMode};
use crate::backup::BackupConfig;
use crate::confirm::{ConfirmationGate, DEFAULT_CONFIRM_TOKEN};
use crate::formats::BackupFormat;
use crate::progress::{DEFAULT_BAR_LENGTH, ProgressOptions};
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;
pub const CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
pub const DEFAULT_TOKEN_ENV: &str = "SPACEVAULT_DISCORD_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub progress: ProgressSettings,
    #[serde(default)]
    pub restore: RestoreSettings,
    #[serde(default)]
    pub discord: DiscordSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub output_dir: String,
    pub format: BackupFormat,
    pub mode: DepthMode,
    pub rapid_message_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    pub interval_ms: u64,
    pub bar_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSettings {
    pub confirm_token: String,
    pub confirm_timeout_secs: u64,
    pub replay_messages: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordSettings {
    pub api_base: String,
    /// Name of the environment variable holding the bot token. The token
    /// itself is never written to the settings file.
    pub token_env: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            backup: BackupSettings::default(),
            progress: ProgressSettings::default(),
            restore: RestoreSettings::default(),
            discord: DiscordSettings::default(),
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            output_dir: ".".to_string(),
            format: BackupFormat::Aggregate,
            mode: DepthMode::Full,
            rapid_message_limit: DEFAULT_RAPID_MESSAGE_LIMIT,
        }
    }
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            bar_length: DEFAULT_BAR_LENGTH,
        }
    }
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            confirm_token: DEFAULT_CONFIRM_TOKEN.to_string(),
            confirm_timeout_secs: 60,
            replay_messages: true,
        }
    }
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token_env: DEFAULT_TOKEN_ENV.to_string(),
        }
    }
}

impl Settings {
    pub fn progress_options(&self) -> ProgressOptions {
        ProgressOptions {
            interval: Duration::from_millis(self.progress.interval_ms),
            bar_length: self.progress.bar_length,
        }
    }

    pub fn confirmation_gate(&self) -> ConfirmationGate {
        ConfirmationGate::new(
            self.restore.confirm_token.clone(),
            Duration::from_secs(self.restore.confirm_timeout_secs),
        )
    }

    /// Backup settings with per-run overrides applied.
    pub fn backup_config(
        &self,
        output_dir: Option<PathBuf>,
        format: Option<BackupFormat>,
        mode: Option<DepthMode>,
    ) -> BackupConfig {
        BackupConfig {
            output_dir: output_dir.unwrap_or_else(|| PathBuf::from(&self.backup.output_dir)),
            format: format.unwrap_or(self.backup.format),
            archive: ArchiveOptions {
                mode: mode.unwrap_or(self.backup.mode),
                rapid_message_limit: self.backup.rapid_message_limit,
            },
            progress: self.progress_options(),
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE)
}

/// A missing file yields defaults.
pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    toml::from_str(text)
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = to_toml(settings)?;
    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    if settings.backup.rapid_message_limit == 0 {
        return Err(Error::InvalidConfig {
            message: "backup.rapid_message_limit must be > 0".to_string(),
        });
    }
    if settings.progress.interval_ms == 0 {
        return Err(Error::InvalidConfig {
            message: "progress.interval_ms must be > 0".to_string(),
        });
    }
    if settings.progress.bar_length == 0 {
        return Err(Error::InvalidConfig {
            message: "progress.bar_length must be > 0".to_string(),
        });
    }
    if settings.restore.confirm_token.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "restore.confirm_token must not be empty".to_string(),
        });
    }
    if settings.restore.confirm_timeout_secs == 0 {
        return Err(Error::InvalidConfig {
            message: "restore.confirm_timeout_secs must be > 0".to_string(),
        });
    }
    if settings.discord.token_env.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "discord.token_env must not be empty".to_string(),
        });
    }
    if !settings.discord.api_base.starts_with("http://")
        && !settings.discord.api_base.starts_with("https://")
    {
        return Err(Error::InvalidConfig {
            message: "discord.api_base must be an http(s) URL".to_string(),
        });
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
