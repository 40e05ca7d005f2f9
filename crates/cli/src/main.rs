use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tradegate_cli::commands::{self, CalibrationArgs, SimulateArgs, StatusArgs};
use tradegate_core::config::AppConfig;
use tradegate_core::ConfigLoader;

#[derive(Parser)]
#[command(name = "tradegate")]
#[command(about = "Paper/live trade execution core with shadow calibration", long_about = None)]
struct Cli {
    /// Config file path (defaults to config/Config.toml plus env overrides)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Config profile overlay (config/Config.{profile}.toml)
    #[arg(long, global = true, env = "TRADEGATE_PROFILE")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run paper engines over a seeded random walk
    Simulate(SimulateArgs),
    /// Show the persisted ledger, watchers, and recent trades
    Status(StatusArgs),
    /// Replay the shadow-audit log through the calibration loop
    Calibration(CalibrationArgs),
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    match (&cli.config, &cli.profile) {
        (Some(path), _) => ConfigLoader::load_from(path),
        (None, Some(profile)) => ConfigLoader::load_with_profile(profile),
        (None, None) => ConfigLoader::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Simulate(args) => {
            commands::run_simulate(&config, &args).await?;
        }
        Commands::Status(args) => {
            commands::run_status(&config, &args).await?;
        }
        Commands::Calibration(args) => {
            commands::run_calibration(&config, &args).await?;
        }
    }

    Ok(())
}
