use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use space_vault_core::config::{Settings, load_settings, parse_settings, save_settings, to_toml};
use space_vault_core::model::Id;
use space_vault_core::run_log::start_run_log;
use space_vault_core::{
    APP_NAME, BackupFormat, BackupOptions, DepthMode, DiscordConfig, DiscordSpace, RestoreConfig,
    RestoreContext, RestoreState, run_backup_with, run_restore,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "spacevault")]
#[command(about = "SpaceVault CLI (backup and restore of a Discord server)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    Backup {
        /// Server to back up.
        #[arg(long)]
        space: Id,
        /// Channel that receives the progress message.
        #[arg(long)]
        status_channel: Id,
        #[arg(long)]
        format: Option<BackupFormat>,
        #[arg(long)]
        mode: Option<DepthMode>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Restore {
        /// Server to restore into. Must be the server the backup was taken from.
        #[arg(long)]
        space: Id,
        /// Channel where the warning is posted and the confirmation is read.
        #[arg(long)]
        channel: Id,
        /// User whose confirmation counts.
        #[arg(long)]
        actor: Id,
        #[arg(long)]
        no_replay: bool,
        /// Metadata file, bundle directory, or metadata file name.
        metadata: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    Get,
    Set,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| {
            std::env::var("SPACEVAULT_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("SPACEVAULT_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| config_dir.clone());

    match cli.cmd {
        Command::Config { cmd } => match cmd {
            ConfigCmd::Get => config_get(&config_dir, cli.json),
            ConfigCmd::Set => config_set(&config_dir, cli.json),
        },
        Command::Backup {
            space,
            status_channel,
            format,
            mode,
            out,
        } => {
            let settings = load_settings(&config_dir).map_err(map_core_err)?;
            let args = BackupArgs {
                space,
                status_channel,
                format,
                mode,
                out,
            };
            backup_run(&settings, &data_dir, args, cli.json).await
        }
        Command::Restore {
            space,
            channel,
            actor,
            no_replay,
            metadata,
        } => {
            let settings = load_settings(&config_dir).map_err(map_core_err)?;
            let args = RestoreArgs {
                space,
                channel,
                actor,
                replay: !no_replay,
                metadata,
            };
            restore_run(&settings, &data_dir, args, cli.json).await
        }
    }
}

fn config_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    let token_present = std::env::var(&settings.discord.token_env)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "settings": settings,
                "secrets": { "discordTokenPresent": token_present }
            })
        );
    } else {
        let text = to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        println!();
        println!("discordTokenPresent={token_present}");
    }
    Ok(())
}

fn config_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.invalid", format!("stdin read failed: {e}")))?;
    let settings =
        parse_settings(&input).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

fn discord_space(settings: &Settings, guild_id: Id) -> Result<DiscordSpace, CliError> {
    let token = std::env::var(&settings.discord.token_env)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            CliError::new(
                "config.invalid",
                format!("bot token missing (set {})", settings.discord.token_env),
            )
        })?;
    Ok(DiscordSpace::new(DiscordConfig {
        api_base: settings.discord.api_base.clone(),
        bot_token: token,
        guild_id,
    }))
}

struct BackupArgs {
    space: Id,
    status_channel: Id,
    format: Option<BackupFormat>,
    mode: Option<DepthMode>,
    out: Option<PathBuf>,
}

async fn backup_run(
    settings: &Settings,
    data_dir: &Path,
    args: BackupArgs,
    json: bool,
) -> Result<(), CliError> {
    let space = discord_space(settings, args.space)?;
    let config = settings.backup_config(args.out, args.format, args.mode);

    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _log = start_run_log("backup", &run_id, data_dir)
        .map_err(|e| CliError::new("io.failed", format!("run log open failed: {e}")))?;
    info!(
        event = "run.start",
        kind = "backup",
        run_id = %run_id,
        space_id = args.space,
        "run.start"
    );

    let status = Arc::new(space.status_message(args.status_channel));
    let res = run_backup_with(&space, status, config, BackupOptions::default())
        .await
        .map_err(|e| {
            error!(event = "run.failed", kind = "backup", error = %e, "run.failed");
            map_core_err(e)
        })?;
    info!(
        event = "run.finish",
        kind = "backup",
        run_id = %run_id,
        messages = res.archive.messages,
        "run.finish"
    );

    if json {
        println!(
            "{}",
            serde_json::to_string(&res).map_err(|e| CliError::new("unknown", e.to_string()))?
        );
    } else {
        println!("metadata={}", res.metadata_path.display());
        println!(
            "channels={} messages={} attachmentsSaved={} attachmentsFailed={} channelErrors={}",
            res.archive.channels,
            res.archive.messages,
            res.archive.attachments_saved,
            res.archive.attachments_failed,
            res.archive.channel_errors
        );
    }
    Ok(())
}

struct RestoreArgs {
    space: Id,
    channel: Id,
    actor: Id,
    replay: bool,
    metadata: PathBuf,
}

async fn restore_run(
    settings: &Settings,
    data_dir: &Path,
    args: RestoreArgs,
    json: bool,
) -> Result<(), CliError> {
    let space = discord_space(settings, args.space)?;

    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _log = start_run_log("restore", &run_id, data_dir)
        .map_err(|e| CliError::new("io.failed", format!("run log open failed: {e}")))?;
    info!(
        event = "run.start",
        kind = "restore",
        run_id = %run_id,
        space_id = args.space,
        "run.start"
    );

    // Replies are watched from before the warning goes out.
    let replies = space.replies(args.channel);
    let status = Arc::new(space.status_message(args.channel));
    let ctx = RestoreContext {
        reader: &space,
        writer: &space,
        replies: &replies,
    };
    let config = RestoreConfig {
        metadata_path: args.metadata,
        target_space_id: space.guild_id(),
        actor_id: args.actor,
        channel_id: args.channel,
        gate: settings.confirmation_gate(),
        replay_messages: args.replay && settings.restore.replay_messages,
        progress: settings.progress_options(),
    };
    let report = run_restore(ctx, status, config).await.map_err(|e| {
        error!(event = "run.failed", kind = "restore", error = %e, "run.failed");
        map_core_err(e)
    })?;
    info!(
        event = "run.finish",
        kind = "restore",
        run_id = %run_id,
        state = ?report.state,
        skipped = report.skipped_items(),
        "run.finish"
    );

    if json {
        println!(
            "{}",
            serde_json::to_string(&report).map_err(|e| CliError::new("unknown", e.to_string()))?
        );
    } else {
        let state = match report.state {
            RestoreState::Completed => "completed",
            RestoreState::PartiallyCompleted => "partially_completed",
            _ => "aborted",
        };
        println!("state={state}");
        println!(
            "roles={}/{} categories={}/{} channels={}/{} messages={}/{}",
            report.roles.done,
            report.roles.done + report.roles.skipped,
            report.categories.done,
            report.categories.done + report.categories.skipped,
            report.channels.done,
            report.channels.done + report.channels.skipped,
            report.messages.done,
            report.messages.done + report.messages.skipped
        );
        if let Some(reason) = &report.replay_skipped_reason {
            println!("replaySkipped={reason}");
        }
    }
    Ok(())
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".config")
        .join(APP_NAME.to_lowercase())
}

fn map_core_err(e: space_vault_core::Error) -> CliError {
    use space_vault_core::Error;
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::Remote { message } => CliError::retryable("remote.unavailable", message),
        Error::FatalLoad { message } => CliError::new("restore.load_failed", message),
        Error::SpaceMismatch { expected, actual } => CliError::new(
            "restore.space_mismatch",
            format!("backup belongs to space {expected}, target space is {actual}"),
        )
        .with_details(serde_json::json!({ "expected": expected, "actual": actual })),
        Error::MetadataNotFound { path } => CliError::new(
            "restore.metadata_not_found",
            format!("backup metadata not found: {}", path.display()),
        ),
        Error::MetadataIsDirectory { path } => CliError::new(
            "restore.metadata_is_directory",
            format!("backup metadata path is a directory: {}", path.display()),
        ),
        Error::ConfirmationDeclined => CliError::new("restore.declined", "restore declined"),
        Error::ConfirmationTimeout => {
            CliError::retryable("restore.timeout", "restore confirmation timed out")
        }
        Error::Cancelled => CliError::new("run.cancelled", "cancelled"),
        Error::Io(e) => CliError::new("io.failed", e.to_string()),
        Error::Sqlite(e) => CliError::new("db.failed", e.to_string()),
        Error::SqliteMigrate(e) => CliError::new("db.failed", e.to_string()),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
