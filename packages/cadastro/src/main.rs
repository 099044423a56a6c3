use anyhow::{Context, Result};
use cadastro_realtime::Resource;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

mod cli;
mod config;

use crate::config::{FileConfig, load_config};

#[derive(Parser)]
#[command(name = "cadastro")]
#[command(about = "Live view of the beneficiary registry's change stream")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding config.toml
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// API base URL (overrides [api] base_url)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Bearer token (overrides [session] token)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Id of the logged-in user (overrides [session] user_id)
    #[arg(long, global = true)]
    user_id: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record event as it arrives
    Watch(WatchArgs),

    /// Open one record and report concurrent edits or deletion
    Follow(FollowArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Parser)]
struct WatchArgs {
    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct FollowArgs {
    /// Resource path, e.g. pessoas or guarauna/alunos
    resource: Resource,

    /// Record id
    id: String,

    /// Re-fetch the record as soon as someone else edits it
    #[arg(long)]
    auto_reload: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "cadastro=debug,cadastro_realtime=debug,info"
    } else {
        "cadastro=info,cadastro_realtime=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = resolve_config(&cli)?;
    debug!(config_dir = %cli.config_dir.display(), "configuration loaded");

    match cli.command {
        Commands::Watch(args) => cli::watch::run(&config, args.json).await,
        Commands::Follow(args) => {
            cli::follow::run(&config, args.resource, args.id, args.auto_reload).await
        }
        Commands::Config => cli::config_command(&config),
    }
}

/// File and env layers first, then command-line overrides.
fn resolve_config(cli: &Cli) -> Result<FileConfig> {
    let mut config: FileConfig = load_config(&cli.config_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", cli.config_dir.display()))?;

    if let Some(base_url) = &cli.base_url {
        config.api.base_url = base_url.clone();
    }
    if let Some(token) = &cli.token {
        config.session.token = Some(token.clone());
    }
    if let Some(user_id) = &cli.user_id {
        config.session.user_id = Some(user_id.clone());
    }
    Ok(config)
}
