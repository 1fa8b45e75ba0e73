//! Lattice CLI entrypoint.

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod config;
mod executor;
mod handlers;
mod store;

#[cfg(test)]
mod parallel_tests;

use commands::{Commands, ConfigCommands};
use config::{CliConfig, LogFormat};

#[derive(Parser)]
#[command(name = "lattice")]
#[command(author, version, about = "Build-matrix orchestration", long_about = None)]
struct Cli {
    /// Log output format; overrides the configured one
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let loaded = CliConfig::load();
    let config = loaded.as_ref().cloned().unwrap_or_default();
    init_tracing(cli.log_format.unwrap_or(config.log_format));
    if let Err(err) = &loaded {
        tracing::warn!(error = %err, "Falling back to default configuration");
    }

    match cli.command {
        Commands::Validate { source } => handlers::validate(&source).await?,
        Commands::Plan { source, format } => handlers::plan(&source, format).await?,
        Commands::Run(args) => {
            if !handlers::run(&config, &args).await? {
                std::process::exit(1);
            }
        }
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
            ConfigCommands::Path => handlers::config_path()?,
        },
    }

    Ok(())
}
