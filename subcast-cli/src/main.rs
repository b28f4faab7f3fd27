use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use subcast_core::config::Config;
use subcast_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use subcast_core::storage::open_store;
use subcast_core::{metrics, CallbackServer};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "subcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML). Without it, SUBCAST_* environment variables are read.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the callback receiving endpoint and capability resources
    Serve {
        /// Address to bind, overriding the configuration
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Validate,
    /// Write the default configuration to a file
    Init { path: PathBuf },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::from_env().context("failed to read configuration from environment")?,
    };
    Ok(config)
}

fn log_config(config: &Config, args: &Args) -> Result<LogConfig> {
    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = &args.log_level {
        let level = LogLevel::parse(level).unwrap_or_else(|| {
            eprintln!("Invalid log level '{}', using '{}'", level, log_config.level);
            log_config.level
        });
        log_config = log_config.with_level(level);
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    Ok(log_config)
}

async fn serve(mut config: Config, bind: Option<SocketAddr>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }
    config.validate()?;

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    let store = open_store(&config.store)?;
    info!(
        actor_id = %config.server.actor_id,
        bind = %config.server.bind_address,
        store = ?config.store.backend,
        "Starting subcast receiver"
    );
    CallbackServer::from_config(&config, store)?.run().await
}

fn run_config_action(config: &Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Validate => {
            config.validate()?;
            println!("configuration is valid");
        }
        ConfigAction::Init { path } => {
            Config::default().save_to_file(&path)?;
            println!("wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    init_logging_with_config(log_config(&config, &args)?)?;

    match args.command {
        Command::Serve { bind } => serve(config, bind).await,
        Command::Config { action } => run_config_action(&config, action),
    }
}
