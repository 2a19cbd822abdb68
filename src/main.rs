//! meshchat: peer-to-peer chat rooms bridged to the browser

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshchat::{
    config::{Config, LogFormat, LoggingConfig},
    daemon::{run_relay, ChatDaemon},
};
use std::path::{Path, PathBuf};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "meshchat")]
#[command(about = "Peer-to-peer chat node with a local web bridge")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "meshchat.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a chat node
    Start {
        /// Room to join
        #[arg(short, long)]
        room: Option<String>,

        /// Bootstrap peer multiaddrs (replaces configured ones)
        #[arg(short, long)]
        bootstrap: Vec<String>,

        /// Web gateway listen address
        #[arg(short, long)]
        web_addr: Option<String>,

        /// Display name for local messages
        #[arg(short, long)]
        nick: Option<String>,
    },

    /// Run a circuit relay server
    Relay,

    /// Write a default configuration file
    Init {
        /// Output file
        #[arg(default_value = "meshchat.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { path } = &cli.command {
        return init_config(path);
    }

    let mut config = Config::load(&cli.config)?;
    init_logging(&config.logging, cli.verbose)?;
    if cli.config.exists() {
        info!("Loaded configuration from {}", cli.config.display());
    }

    match cli.command {
        Commands::Start {
            room,
            bootstrap,
            web_addr,
            nick,
        } => {
            if let Some(room) = room {
                config.node.room = room;
            }
            if !bootstrap.is_empty() {
                config.node.bootstrap_peers = bootstrap;
            }
            if let Some(addr) = web_addr {
                config.gateway.listen_addr = addr;
            }
            if nick.is_some() {
                config.gateway.nick = nick;
            }
            config.validate()?;

            let daemon = ChatDaemon::start(config).await?;
            info!("Open http://{} to chat", daemon.web_addr());
            daemon.run().await
        }
        Commands::Relay => {
            config.validate()?;
            run_relay(config).await
        }
        Commands::Init { .. } => Ok(()),
    }
}

fn init_logging(logging: &LoggingConfig, verbose: u8) -> Result<()> {
    let level = logging.level.more_verbose(verbose);
    // RUST_LOG directives refine the configured level
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level.to_tracing()).into())
        .from_env_lossy();

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    match logging.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists, not overwriting", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, Config::default_toml()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
