//! Trade Lifecycle & Recovery Engine
//!
//! # WARNING
//! - This bot trades with real money. Only use funds you can afford to lose.
//! - Recovery re-entries and pyramids compound exposure; the safety limits
//!   exist for a reason. Do not raise them casually.
//! - Paper-gateway success does NOT equal live-broker success.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, warn};

// Use the library crate
use recovery_bot::cli::commands;
use recovery_bot::config::Config;

/// Autonomous trade lifecycle and recovery engine
#[derive(Parser)]
#[command(name = "recovery-bot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine
    Start {
        /// Run against the in-memory paper gateway (no real orders)
        #[arg(long)]
        dry_run: bool,
    },

    /// Open one dual entry manually
    Enter {
        /// Instrument symbol, e.g. EURUSD
        symbol: String,

        /// buy or sell
        direction: String,

        /// Stop distance override in pips
        #[arg(long)]
        stop_pips: Option<f64>,

        /// Lot override (default: tier-based sizing)
        #[arg(long)]
        lot: Option<f64>,

        /// Simulate against the paper gateway
        #[arg(long)]
        dry_run: bool,
    },

    /// Show persisted chains, shields and counters
    Status,

    /// Show current configuration (secrets masked)
    Config,

    /// Check broker gateway connectivity
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("recovery_bot=info".parse().unwrap()),
        )
        .with_target(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    warn!(
        "Safety limits active: daily_recoveries={}, concurrent={}, daily_loss_limit=${}",
        config.safety.daily_recovery_limit,
        config.safety.concurrent_recovery_limit,
        config.risk.daily_loss_limit
    );

    // Execute command
    let result = match cli.command {
        Commands::Start { dry_run } => commands::start(&config, dry_run).await,
        Commands::Enter {
            symbol,
            direction,
            stop_pips,
            lot,
            dry_run,
        } => commands::enter(&config, &symbol, &direction, stop_pips, lot, dry_run).await,
        Commands::Status => commands::status(&config).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
