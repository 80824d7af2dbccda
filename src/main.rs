mod config;
mod logging;
mod proxy;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{
    config_file_path, default_config_path, init_config_toml, load_config, parse_config,
    save_config,
};
use crate::proxy::{ProxyService, build_client, router as proxy_router};

#[derive(Parser, Debug)]
#[command(name = "copilot-relay")]
#[command(about = "Local relay for code-assistant chat and completion requests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the relay server (default)
    Serve {
        /// Config file; defaults to the usual lookup order
        #[arg(long)]
        config: Option<PathBuf>,
        /// Listen address, overrides `bind` from the config
        #[arg(long)]
        bind: Option<String>,
    },
    /// Manage the relay config file
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write a commented config.toml template
    Init {
        /// Target file; defaults to ~/.copilot-relay/config.toml
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config (file plus OVERRIDE_* variables), secrets masked
    Show {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print which config file would be loaded
    Path {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Rewrite the current config file into another format or location (e.g. JSON to TOML)
    Migrate {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Destination; the format follows its extension
        #[arg(long)]
        to: PathBuf,
    },
}

/// stdout plus a daily file under ~/.copilot-relay/logs. The guard must live until exit
/// so buffered file lines are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    // 默认启用 info 级别日志，若用户设置了 RUST_LOG 则按其配置。
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer();

    let log_dir = logging::log_dir();
    let appender = std::fs::create_dir_all(&log_dir)
        .map_err(anyhow::Error::from)
        .and_then(|()| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("relay")
                .filename_suffix("log")
                .build(&log_dir)
                .map_err(anyhow::Error::from)
        });
    let (file_layer, guard) = match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(err) => {
            eprintln!("file logging disabled for {:?}: {}", log_dir, err);
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve {
        config: None,
        bind: None,
    }) {
        Command::Serve { config, bind } => {
            let _guard = init_tracing();
            run_server(config.as_deref(), bind).await
        }
        Command::Config { cmd } => {
            // One-shot commands only log to stderr; stdout carries their output.
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .with_writer(std::io::stderr)
                .init();
            handle_config_cmd(cmd).await
        }
    }
}

async fn run_server(config: Option<&Path>, bind: Option<String>) -> Result<()> {
    let (mut cfg, source) = load_config(config).await?;
    match source {
        Some(path) => tracing::info!("loaded config from {:?}", path),
        None => tracing::info!("no config file found, using defaults"),
    }
    if let Some(bind) = bind {
        cfg.bind = bind;
    }
    if cfg.chat_api_key.is_empty() {
        tracing::warn!("chat_api_key is empty; upstream chat calls will be unauthenticated");
    }
    if cfg.codex_api_key.is_empty() {
        tracing::warn!("codex_api_key is empty; upstream completion calls will be unauthenticated");
    }

    let addr: SocketAddr = cfg
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", cfg.bind))?;
    let client = build_client(&cfg)?;
    let proxy = ProxyService::new(client, Arc::new(cfg));
    let shutdown = proxy.shutdown_token();
    let gated = proxy.is_gated();
    let app = proxy_router(proxy);

    tracing::info!(
        "copilot-relay listening on http://{} (path token {})",
        addr,
        if gated { "required" } else { "off" }
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("copilot-relay stopped");
    Ok(())
}

async fn handle_config_cmd(cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Init { path, force } => {
            let path = path.unwrap_or_else(default_config_path);
            let written = init_config_toml(&path, force).await?;
            println!("Wrote config template to {:?}", written);
        }
        ConfigCommand::Show { config } => {
            let (cfg, source) = load_config(config.as_deref()).await?;
            match source {
                Some(path) => eprintln!("# from {:?}", path),
                None => eprintln!("# no config file found, showing defaults"),
            }
            println!("{}", serde_json::to_string_pretty(&cfg.redacted())?);
        }
        ConfigCommand::Path { config } => match config_file_path(config.as_deref()) {
            Some(path) => println!("{}", path.display()),
            None => println!(
                "no config file found; `config init` writes {}",
                default_config_path().display()
            ),
        },
        ConfigCommand::Migrate { config, to } => {
            let Some(from) = config_file_path(config.as_deref()) else {
                anyhow::bail!("no config file found to migrate");
            };
            // Read the file itself, not the effective config: env overrides stay out of it.
            let text = tokio::fs::read_to_string(&from)
                .await
                .with_context(|| format!("failed to read {:?}", from))?;
            let cfg = parse_config(&from, &text)?;
            save_config(&cfg, &to).await?;
            println!("Migrated {:?} -> {:?}", from, to);
        }
    }
    Ok(())
}

/// Resolves on SIGINT/SIGTERM (Ctrl-C elsewhere) and cancels every in-flight request.
async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                tracing::warn!("failed to install signal handlers, falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutting down, cancelling in-flight requests");
    shutdown.cancel();
}
