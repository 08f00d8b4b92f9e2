use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod server;

use cli::install::{handle_install_command, InstallCommands};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Transparent mirroring proxy for container registries",
    long_about = None
)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, default_value = "/etc/regmirror.toml")]
    config: PathBuf,
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the registry proxy
    Proxy,
    /// Check the configuration for errors and unused options
    CheckConfig,
    /// Register the proxy with a container runtime
    #[command(subcommand)]
    Install(InstallCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Proxy => cli::proxy::run_proxy(&cli.config).await,
        Commands::CheckConfig => cli::proxy::check_config(&cli.config),
        Commands::Install(cmd) => {
            let settings = server::settings::Settings::load(&cli.config)?;
            handle_install_command(cmd, &settings)
        }
    }
}
