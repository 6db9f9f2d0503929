//! Tool Server Health - daemon entry point.
//!
//! Loads the configuration document, starts the check engine, and serves
//! the read API until interrupted.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tshd::engine::Engine;
use tshd::http_api::{self, ApiState};
use tshd::reload::start_config_watcher;
use tsh_common::config::EngineConfig;

#[derive(Parser)]
#[command(name = "tshd")]
#[command(author, version, about = "Tool server health daemon - dual-path checks")]
struct Cli {
    /// Path to the TOML configuration document
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address for the read API (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Global check interval override (e.g. "30s", "500ms")
    #[arg(long, value_parser = humantime::parse_duration)]
    check_interval: Option<Duration>,

    /// Print the JSON schema for the configuration and exit
    #[arg(long)]
    print_schema: bool,

    /// Disable configuration hot reload
    #[arg(long)]
    no_watch: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn default_config_path() -> PathBuf {
    let local = PathBuf::from("./tshd.toml");
    if local.exists() {
        return local;
    }
    directories::ProjectDirs::from("", "", "tshd")
        .map(|dirs| dirs.config_dir().join("tshd.toml"))
        .unwrap_or(local)
}

fn init_logging(cli: &Cli, config: &EngineConfig) {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if let Some(level) = &config.log_level {
        EnvFilter::new(level.clone())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if config.json_logging {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_schema {
        let schema = schemars::schema_for!(EngineConfig);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = EngineConfig::load_validated(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(interval) = cli.check_interval {
        config.check_interval_ms = interval.as_millis() as u64;
    }

    init_logging(&cli, &config);
    info!(
        config = %config_path.display(),
        servers = config.servers.len(),
        interval_ms = config.check_interval_ms,
        "starting tshd"
    );

    let listen = config.listen.clone();
    let engine = Engine::new(config);
    engine.start().context("starting check engine")?;

    let api_state = ApiState {
        engine: engine.clone(),
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
    };
    let _server = http_api::start_server(&listen, api_state)
        .await
        .with_context(|| format!("binding read API on {listen}"))?;

    let _watcher = if cli.no_watch {
        None
    } else {
        match start_config_watcher(engine.clone(), config_path.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("config watcher unavailable, hot reload disabled: {}", e);
                None
            }
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    engine.shutdown();
    Ok(())
}
