//! Cinder CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod config;
mod handlers;

use commands::{CacheCommands, Commands, ConfigCommands, RunsCommands};
use config::{CliConfig, LogFormat};

#[derive(Parser)]
#[command(name = "cinder")]
#[command(author, version, about = "Cinder workflow engine", long_about = None)]
struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log format override
    #[arg(long, global = true, value_parser = ["pretty", "json"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();
    let config = CliConfig::load(config_path)?;

    let log_format = match cli.log_format.as_deref() {
        Some("json") => LogFormat::Json,
        Some(_) => LogFormat::Pretty,
        None => config.log_format,
    };
    init_tracing(log_format);

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan { path, format } => handlers::plan(&path, format)?,
        Commands::Run(args) => {
            if !handlers::run(&config, args).await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Schema => handlers::schema()?,
        Commands::Runs { command } => match command {
            RunsCommands::List { limit } => handlers::list_runs(&config, limit).await?,
            RunsCommands::Show { run_id, logs } => {
                handlers::show_run(&config, &run_id, logs).await?
            }
        },
        Commands::Cache { command } => match command {
            CacheCommands::List { prefix } => {
                handlers::list_cache(&config, prefix.as_deref()).await?
            }
            CacheCommands::Clear { prefix, yes } => {
                handlers::clear_cache(&config, prefix.as_deref(), yes).await?
            }
            CacheCommands::Evict => handlers::evict_cache(&config).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => {
                handlers::set_config(config_path, &key, &value)?
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}
