//! # Ingest Relay CLI (`relay`)
//!
//! ## Usage
//!
//! ```bash
//! relay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay init` | Write a starter configuration file |
//! | `relay serve` | Start the relay (HTTP API + `/ws/import` socket) |
//! | `relay upload <files>...` | Stream files to a relay and follow their progress |
//! | `relay stages` | List the stages a server with this config would register |
//!
//! ## Examples
//!
//! ```bash
//! relay init --config ./config/relay.toml
//! relay serve --config ./config/relay.toml
//! relay upload docs/*.md --splitter token --label Docs
//! RUST_LOG=ingest_relay=debug relay serve --log-format json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ingest_relay::channel::{ResilientChannel, WebSocketTransport};
use ingest_relay::config::{load_config, Config};
use ingest_relay::progress::ProgressMode;
use ingest_relay::server;
use ingest_relay::stages;
use ingest_relay::upload::{self, UploadOptions};
use ingest_relay_core::models::{StageKind, StageSelection};
use ingest_relay_core::stage::StageRegistry;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Ingest Relay: chunked uploads over a reconnecting WebSocket, driven
/// through a pluggable load/split/vectorize/store pipeline.
#[derive(Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// Path to configuration file (TOML). Missing files fall back to
    /// built-in defaults.
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    /// Log output format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file to `--config`.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Start the relay server.
    Serve,
    /// Upload files and wait until each is DONE or ERROR.
    Upload {
        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Relay socket URL; defaults to `[channel].url`.
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        loader: Option<String>,
        #[arg(long)]
        splitter: Option<String>,
        #[arg(long)]
        vectorizer: Option<String>,
        #[arg(long)]
        sink: Option<String>,
        /// Label attached to every file (repeatable).
        #[arg(long = "label")]
        labels: Vec<String>,
        /// Replace documents that already exist in the sink.
        #[arg(long)]
        overwrite: bool,
        /// Give up after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Progress output on stderr; defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
    /// List registered stages and their config schemas.
    Stages {
        /// Only stages of this kind (loader, splitter, vectorizer, sink).
        #[arg(long)]
        kind: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

const STARTER_CONFIG: &str = r#"[server]
bind = "127.0.0.1:8000"

[transfer]
fragment_size = 2000
session_max_age_secs = 300
sweep_interval_secs = 30

[channel]
url = "ws://127.0.0.1:8000/ws/import"
base_delay_ms = 500
max_delay_ms = 30000
jitter_ms = 250
max_retries = 8
heartbeat_interval_secs = 30
heartbeat_timeout_secs = 10
queue_capacity = 1024

[pipeline]
loader = "basic"
splitter = "paragraph"
vectorizer = "hashing"
sink = "memory"
embed_batch_size = 64

[embedding]
# Used by the "openai" vectorizer.
endpoint = "https://api.openai.com/v1/embeddings"
model = "text-embedding-3-small"
api_key_env = "OPENAI_API_KEY"

# [sqlite]
# path = "./data/relay.db"
"#;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match cli.command {
        Commands::Serve => "info",
        _ => "warn",
    };
    init_logging(cli.log_format, default_level)?;

    match cli.command {
        Commands::Init { force } => init_config(&cli.config, force)?,
        Commands::Serve => {
            let cfg = config_or_default(&cli.config)?;
            server::run_server(cfg).await?;
        }
        Commands::Upload {
            files,
            url,
            loader,
            splitter,
            vectorizer,
            sink,
            labels,
            overwrite,
            timeout,
            progress,
        } => {
            let cfg = config_or_default(&cli.config)?;
            let mut options = UploadOptions {
                labels,
                overwrite,
                ..Default::default()
            };
            options.pipeline.loader = loader.map(StageSelection::new);
            options.pipeline.splitter = splitter.map(StageSelection::new);
            options.pipeline.vectorizer = vectorizer.map(StageSelection::new);
            options.pipeline.sink = sink.map(StageSelection::new);

            let transfers = files
                .iter()
                .map(|path| upload::build_transfer(path, &options))
                .collect::<Result<Vec<_>>>()?;

            let url = url.unwrap_or_else(|| cfg.channel.url.clone());
            let channel = ResilientChannel::new(
                Arc::new(WebSocketTransport::new(url)),
                cfg.channel.options(),
            );
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let run = upload::upload(&channel, transfers, cfg.transfer.fragment_size, reporter.as_ref());
            let summary = match timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                    .await
                    .with_context(|| format!("upload did not finish within {}s", secs))??,
                None => run.await?,
            };
            channel.disconnect("upload finished");

            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.failed() > 0 {
                bail!("{} of {} files failed", summary.failed(), summary.files.len());
            }
        }
        Commands::Stages { kind, json } => {
            let cfg = config_or_default(&cli.config)?;
            let mut registry = StageRegistry::new();
            stages::register_builtin_stages(&mut registry, &cfg).await?;
            let list = match kind {
                Some(kind) => {
                    let kind: StageKind = kind.parse().map_err(anyhow::Error::msg)?;
                    registry.list_available(kind)
                }
                None => registry.list_all(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                println!("{:<12} {:<12} DESCRIPTION", "KIND", "NAME");
                for stage in list {
                    println!("{:<12} {:<12} {}", stage.kind.as_str(), stage.name, stage.description);
                }
            }
        }
    }

    Ok(())
}

fn init_logging(format: LogFormat, default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Failed to create log filter")?;
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Plain => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
    Ok(())
}

/// Use the config file if present, otherwise the built-in defaults.
fn config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::minimal())
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, STARTER_CONFIG)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starter_config_is_valid() {
        let cfg: Config = toml::from_str(STARTER_CONFIG).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.pipeline.splitter, "paragraph");
    }
}
