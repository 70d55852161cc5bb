//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommands:
//! - `serve` (default) -- start the HTTP server
//! - `regenerate-previews` -- rebuild every image preview and exit
//! - `prune --max <N>` -- keep at most N media-bearing slots
//! - `check-config` -- load and validate the configuration
//! - `version` -- print build/version info

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{self, Settings};
use crate::ingest::Ingestor;
use crate::logging::{self, LogConfig};
use crate::media::MediaFetcher;
use crate::server;
use crate::store::MetadataStore;

/// Named media slots with a hardened ingestion pipeline.
#[derive(Parser, Debug)]
#[command(
    name = "linkwall",
    version = env!("CARGO_PKG_VERSION"),
    about = "linkwall - named media slots served from short links"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server (default when no subcommand is given).
    Serve {
        /// Override the bind address from the configuration.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Rebuild every image preview from its stored original.
    RegeneratePreviews,

    /// Empty the oldest slots until at most `max` still hold media.
    Prune {
        /// Number of media-bearing slots to keep.
        #[arg(long)]
        max: usize,
    },

    /// Load and validate the configuration, then print where it came from.
    CheckConfig,

    /// Print version information.
    Version,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> CliResult {
    match cli.command {
        None => handle_serve(None).await,
        Some(Command::Serve { bind }) => handle_serve(bind).await,
        Some(Command::RegeneratePreviews) => handle_regenerate_previews().await,
        Some(Command::Prune { max }) => handle_prune(max).await,
        Some(Command::CheckConfig) => handle_check_config(),
        Some(Command::Version) => {
            handle_version();
            Ok(())
        }
    }
}

/// Load settings and start logging from the `logging` section.
fn bootstrap() -> Result<Settings, Box<dyn std::error::Error>> {
    let settings = config::load_settings()?;
    logging::init_logging(LogConfig::from_settings(&settings.logging)?)?;
    info!(
        target: "config",
        path = %config::get_config_path().display(),
        data_dir = %settings.storage.data_dir.display(),
        "Configuration loaded"
    );
    Ok(settings)
}

fn build_ingestor(settings: Settings) -> Result<Arc<Ingestor>, Box<dyn std::error::Error>> {
    let store = Arc::new(MetadataStore::open(settings.layout())?);
    info!(target: "store", slots = store.len(), "Metadata loaded");
    Ok(Arc::new(Ingestor::new(
        store,
        Arc::new(MediaFetcher::new()),
        Arc::new(RwLock::new(settings)),
    )))
}

/// Run the `serve` subcommand.
pub async fn handle_serve(bind_override: Option<String>) -> CliResult {
    let settings = bootstrap()?;
    let bind = bind_override.unwrap_or_else(|| settings.server.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| format!("invalid bind address {:?}: {}", bind, e))?;

    let ingestor = build_ingestor(settings)?;
    let cancel = CancellationToken::new();

    #[cfg(unix)]
    let _reload =
        config::spawn_reload_on_sighup(ingestor.settings().clone(), cancel.child_token())?;

    let trigger = cancel.clone();
    tokio::spawn(async move {
        let reason = await_shutdown_trigger().await;
        info!(target: "http", reason, "Shutdown requested");
        trigger.cancel();
    });

    server::serve(ingestor, addr, cancel).await?;
    Ok(())
}

/// Run the `regenerate-previews` subcommand.
pub async fn handle_regenerate_previews() -> CliResult {
    let settings = bootstrap()?;
    let ingestor = build_ingestor(settings)?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        await_shutdown_trigger().await;
        trigger.cancel();
    });

    let report = ingestor.regenerate_previews(&cancel).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.errors > 0 || report.cancelled {
        return Err(format!(
            "{} preview(s) failed{}",
            report.errors,
            if report.cancelled { ", run cancelled" } else { "" }
        )
        .into());
    }
    Ok(())
}

/// Run the `prune` subcommand.
pub async fn handle_prune(max: usize) -> CliResult {
    if max == 0 {
        return Err("--max must be greater than 0".into());
    }
    let settings = bootstrap()?;
    let store = Arc::new(MetadataStore::open(settings.layout())?);
    let pruned = tokio::task::spawn_blocking(move || store.prune_old_images(max)).await??;
    println!("Pruned {} slot(s)", pruned);
    Ok(())
}

/// Run the `check-config` subcommand.
pub fn handle_check_config() -> CliResult {
    let path = config::get_config_path();
    let settings = config::load_settings_from(&path)?;
    if path.exists() {
        println!("Config file: {}", path.display());
    } else {
        println!("Config file: {} (not found, using defaults)", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("linkwall {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

/// Wait for SIGTERM or Ctrl+C.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            ctrl_c_or_never().await
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    ctrl_c_or_never().await
}

async fn ctrl_c_or_never() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending().await
        }
    }
}
