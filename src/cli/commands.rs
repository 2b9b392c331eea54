//! CLI command implementations

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::types::EntrySignal;
use crate::engine::Engine;
use crate::gateway::http::HttpGateway;
use crate::gateway::paper::PaperGateway;
use crate::gateway::{BrokerGateway, Direction};
use crate::notify::spawn_log_sink;
use crate::store::TradeStore;

/// Run the engine until Ctrl-C
pub async fn start(config: &Config, dry_run: bool) -> Result<()> {
    if dry_run {
        warn!("Running in DRY-RUN mode - paper gateway, no real orders");
    }

    info!("Starting recovery engine...");
    info!(
        "Stop: {} pips, reward {}x, pyramid levels {:?}",
        config.trading.default_stop_pips, config.trading.reward_ratio, config.pyramid.levels
    );

    let config = Arc::new(config.clone());
    let gateway = build_gateway(&config, dry_run)?;
    let store = Arc::new(TradeStore::open(&config.store.data_dir).await?);

    let engine = Arc::new(Engine::new(config.clone(), gateway, store));
    engine.restore().await?;
    let _sink = spawn_log_sink(engine.events());

    let runner = tokio::spawn(engine.clone().run());
    info!("Engine running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    engine.shutdown().await;
    runner.await??;

    info!("Engine stopped");
    Ok(())
}

/// Open one dual entry and snapshot the resulting chains
pub async fn enter(
    config: &Config,
    symbol: &str,
    direction: &str,
    stop_pips: Option<f64>,
    lot: Option<f64>,
    dry_run: bool,
) -> Result<()> {
    let direction = parse_direction(direction)?;
    let config = Arc::new(config.clone());
    let gateway = build_gateway(&config, dry_run)?;
    let store = Arc::new(TradeStore::open(&config.store.data_dir).await?);

    let engine = Engine::new(config, gateway, store);
    engine.restore().await?;

    let signal = EntrySignal {
        symbol: symbol.to_string(),
        direction,
        stop_pips,
        lot,
    };
    let open = engine.open_entry(&signal).await?;
    engine.snapshot().await?;

    println!("Dual entry opened on {} {}", symbol, direction);
    println!("  chain:        {}", open.chain_id);
    println!(
        "  trend leg:    ticket {} (stop {:.5}, target {:.5})",
        open.trend_trail.ticket, open.trend_trail.stop_price, open.trend_trail.target_price
    );
    println!(
        "  profit leg:   ticket {} (stop {:.5}, target {:.5})",
        open.profit_trail.ticket, open.profit_trail.stop_price, open.profit_trail.target_price
    );
    println!("  lot per leg:  {}", open.lot_per_order);
    Ok(())
}

/// Show persisted live state
pub async fn status(config: &Config) -> Result<()> {
    let store = TradeStore::open(&config.store.data_dir).await?;
    let snapshot = store.load_snapshot().await?;

    match snapshot.taken_at {
        Some(taken_at) => println!("Live state as of {}", taken_at),
        None => {
            println!("No live state recorded yet");
            return Ok(());
        }
    }

    println!("\nRe-entry chains ({}):", snapshot.reentry_chains.len());
    for chain in &snapshot.reentry_chains {
        println!(
            "  {} {} {} level {}/{} [{:?}]",
            chain.id, chain.symbol, chain.direction, chain.current_level, chain.max_level, chain.status
        );
    }

    println!("\nPyramid chains ({}):", snapshot.pyramid_chains.len());
    for chain in &snapshot.pyramid_chains {
        println!(
            "  {} {} level {} ({} orders live, ${:.2} booked) [{:?}]",
            chain.id,
            chain.symbol,
            chain.level,
            chain.level_tickets.len(),
            chain.cumulative_profit,
            chain.status
        );
    }

    println!("\nShields ({}):", snapshot.shields.len());
    for shield in &snapshot.shields {
        println!(
            "  {} protecting ticket {} ({} x2 @ {:.5}) [{:?}]",
            shield.id, shield.protected_ticket, shield.lot_per_leg, shield.recovery_level, shield.state
        );
    }

    Ok(())
}

/// Print the configuration with credentials masked
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check gateway connectivity
pub async fn health(config: &Config) -> Result<()> {
    println!("Checking gateway at {}...", config.gateway.endpoint);
    let gateway = HttpGateway::new(config.gateway.clone())?;

    let symbol = config
        .instruments
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "EURUSD".to_string());

    let started = std::time::Instant::now();
    match gateway.get_price(&symbol).await {
        Ok(quote) => {
            println!(
                "OK: {} bid {:.5} / ask {:.5} ({} ms)",
                symbol,
                quote.bid,
                quote.ask,
                started.elapsed().as_millis()
            );
            Ok(())
        }
        Err(e) => {
            println!("FAILED: {}", e);
            Err(e.into())
        }
    }
}

fn build_gateway(config: &Arc<Config>, dry_run: bool) -> Result<Arc<dyn BrokerGateway>> {
    if dry_run {
        let paper = PaperGateway::new();
        let mut symbols: Vec<String> = config.instruments.keys().cloned().collect();
        if symbols.is_empty() {
            symbols.push("EURUSD".to_string());
        }
        for symbol in &symbols {
            paper.seed_random_walk(symbol, 1.1000, 200);
        }
        info!("Paper gateway seeded for {:?}", symbols);
        Ok(Arc::new(paper))
    } else {
        Ok(Arc::new(HttpGateway::new(config.gateway.clone())?))
    }
}

fn parse_direction(s: &str) -> Result<Direction> {
    match s.to_ascii_lowercase().as_str() {
        "buy" | "long" => Ok(Direction::Buy),
        "sell" | "short" => Ok(Direction::Sell),
        other => anyhow::bail!("unknown direction '{}', expected buy or sell", other),
    }
}
