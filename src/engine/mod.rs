//! Engine wiring and run loop
//!
//! The `Engine` owns every component, routes close events by order role, and
//! drains monitor outcomes from one mpsc channel. Entry points:
//! `open_entry` for fresh signals, `handle_close` for gateway close
//! notifications, `run` for the outcome/snapshot loop, `shutdown` to stop
//! monitors and persist live state.

pub mod dual_order;
pub mod monitor;
pub mod pyramid;
pub mod reentry;
pub mod shield;
pub mod types;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::dual_order::{DualOpen, DualOrderCoordinator};
use crate::engine::monitor::RecoveryWindowMonitor;
use crate::engine::pyramid::ProfitPyramidEngine;
use crate::engine::reentry::ReentryStateMachine;
use crate::engine::shield::ReverseShieldController;
use crate::engine::types::{
    ChainStatus, CloseEvent, CloseReason, EntrySignal, MonitorContext, MonitorOutcome, OrderRole,
    ProfitBookingChain, PyramidStatus, RecoveryMonitorEntry, ReentryChain, ShieldStatus,
};
use crate::error::{Error, Result};
use crate::gateway::BrokerGateway;
use crate::market::TrendScorer;
use crate::notify::{EngineEvent, EventBus};
use crate::risk::safety::SafetyCounters;
use crate::risk::{RiskGovernor, SafetyGuard};
use crate::store::{EngineSnapshot, TradeStore};

/// Point-in-time view of everything live, for the status surface
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub open_trades: usize,
    pub active_monitors: usize,
    pub reentry_chains: Vec<ReentryChain>,
    pub pyramid_chains: Vec<ProfitBookingChain>,
    pub shields: Vec<ShieldStatus>,
    pub counters: SafetyCounters,
}

pub struct Engine {
    config: Arc<Config>,
    store: Arc<TradeStore>,
    safety: Arc<SafetyGuard>,
    coordinator: Arc<DualOrderCoordinator>,
    monitor: Arc<RecoveryWindowMonitor>,
    reentry: ReentryStateMachine,
    pyramid: ProfitPyramidEngine,
    shield: Arc<ReverseShieldController>,
    events: EventBus,
    /// Taken exactly once by `run`
    outcome_rx: Mutex<Option<mpsc::Receiver<MonitorOutcome>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    pub fn new(config: Arc<Config>, gateway: Arc<dyn BrokerGateway>, store: Arc<TradeStore>) -> Self {
        let events = EventBus::default();
        let safety = Arc::new(SafetyGuard::new(config.safety.clone()));
        let (outcome_tx, outcome_rx) = mpsc::channel(128);

        let monitor = Arc::new(RecoveryWindowMonitor::new(
            gateway.clone(),
            outcome_tx,
            config.recovery.poll_interval_ms,
        ));
        let coordinator = Arc::new(DualOrderCoordinator::new(
            gateway.clone(),
            RiskGovernor::new(config.risk.clone()),
            config.clone(),
        ));
        let reentry = ReentryStateMachine::new(
            coordinator.clone(),
            monitor.clone(),
            safety.clone(),
            TrendScorer::new(config.trend.clone()),
            gateway.clone(),
            events.clone(),
            config.clone(),
        );
        let pyramid = ProfitPyramidEngine::new(
            gateway.clone(),
            monitor.clone(),
            safety.clone(),
            events.clone(),
            config.clone(),
        );
        let shield = Arc::new(ReverseShieldController::new(
            gateway,
            safety.clone(),
            events.clone(),
            config.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            store,
            safety,
            coordinator,
            monitor,
            reentry,
            pyramid,
            shield,
            events,
            outcome_rx: Mutex::new(Some(outcome_rx)),
            shutdown_tx,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Open a dual entry for a signal, registering both chain machines
    pub async fn open_entry(&self, signal: &EntrySignal) -> Result<DualOpen> {
        let daily_room = self
            .safety
            .daily_room(self.config.risk.daily_loss_limit)
            .await;
        let open = self.coordinator.open_dual(signal, daily_room).await?;

        self.store.save_trade(open.trend_trail.clone()).await;
        self.store.save_trade(open.profit_trail.clone()).await;
        self.reentry
            .register_chain(
                &open.chain_id,
                &signal.symbol,
                signal.direction,
                open.stop_pips,
                &[open.trend_trail.ticket, open.profit_trail.ticket],
            )
            .await;
        self.pyramid.create_chain(&open.profit_trail).await?;

        self.events.publish(EngineEvent::EntryOpened {
            chain_id: open.chain_id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            trend_ticket: open.trend_trail.ticket,
            profit_ticket: open.profit_trail.ticket,
            lot_per_order: open.lot_per_order,
        });
        Ok(open)
    }

    /// Route a close notification from the gateway feed
    pub async fn handle_close(&self, event: CloseEvent) -> Result<()> {
        let trade = self.store.close_trade(event.ticket).await?;
        self.events.publish(EngineEvent::OrderClosed {
            ticket: event.ticket,
            symbol: trade.symbol.clone(),
            reason: event.reason,
            close_price: event.close_price,
            realized_pnl: event.realized_pnl,
        });

        if event.realized_pnl < 0.0 {
            self.safety.record_loss(event.realized_pnl).await;
        } else if event.realized_pnl > 0.0 {
            self.safety.record_booked_profit(event.realized_pnl).await;
        }

        // A closed protected trade takes its shield with it
        if let Some(shield) = self.shield.shield_for_ticket(event.ticket).await {
            if let Err(e) = self.shield.kill_switch(&shield.id).await {
                warn!(shield = %shield.id, "Shield unwind after protected close failed: {}", e);
            }
        }

        // Pyramid orders route to the pyramid; everything else feeds the
        // re-entry machine
        if trade.order_role == OrderRole::ProfitTrail {
            if let Some(chain_id) = self.pyramid.chain_for_ticket(event.ticket).await {
                match event.reason {
                    CloseReason::TakeProfit => {
                        self.pyramid
                            .on_target_hit(&chain_id, event.ticket, event.realized_pnl)
                            .await?;
                    }
                    CloseReason::StopLoss => {
                        self.pyramid
                            .on_chain_stopped_out(&chain_id, event.close_price)
                            .await?;
                    }
                    CloseReason::Manual => {
                        debug!(ticket = event.ticket, "Manual close of pyramid order, chain untouched");
                    }
                }
                return Ok(());
            }
        }

        match event.reason {
            CloseReason::StopLoss => {
                self.reentry.on_stop_loss(&trade, &event).await?;
            }
            CloseReason::TakeProfit => {
                self.reentry.on_take_profit(&trade, &event).await?;
            }
            CloseReason::Manual => {
                self.reentry.on_manual_exit(&trade, &event).await?;
            }
        }
        Ok(())
    }

    /// Hedge a live trade with a reverse shield
    pub async fn shield_trade(&self, ticket: u64) -> Result<Option<ShieldStatus>> {
        let trade = self
            .store
            .get_trade(ticket)
            .await
            .ok_or(Error::TradeNotFound(ticket))?;
        let daily_room = self
            .safety
            .daily_room(self.config.risk.daily_loss_limit)
            .await;
        self.shield.activate(&trade, daily_room).await
    }

    /// Drain monitor outcomes and snapshot periodically until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut outcome_rx = self
            .outcome_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("engine run loop already started".into()))?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut snapshot_ticker = tokio::time::interval(Duration::from_secs(
            self.config.store.snapshot_interval_secs.max(1),
        ));
        snapshot_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; swallow it
        snapshot_ticker.tick().await;

        info!("Engine run loop started");
        loop {
            tokio::select! {
                outcome = outcome_rx.recv() => match outcome {
                    Some(outcome) => {
                        if let Err(e) = self.dispatch_outcome(outcome).await {
                            error!("Monitor outcome dispatch failed: {}", e);
                        }
                    }
                    None => break,
                },
                _ = snapshot_ticker.tick() => {
                    if let Err(e) = self.snapshot().await {
                        warn!("Periodic snapshot failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Engine run loop stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop monitors and persist live state
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        let _ = self.shutdown_tx.send(());
        self.monitor.stop_all();
        if let Err(e) = self.snapshot().await {
            warn!("Final snapshot failed: {}", e);
        }
    }

    /// Write the live-state snapshot
    pub async fn snapshot(&self) -> Result<()> {
        let snapshot = EngineSnapshot {
            taken_at: Some(chrono::Utc::now()),
            reentry_chains: self.reentry.live_chains().await,
            pyramid_chains: self.pyramid.live_chains().await,
            shields: self.shield.live_shields().await,
        };
        self.store.write_snapshot(&snapshot).await
    }

    /// Restore chain tables from the last snapshot and re-arm monitors for
    /// episodes still inside their window
    pub async fn restore(&self) -> Result<()> {
        let snapshot = self.store.load_snapshot().await?;
        self.pyramid.restore(snapshot.pyramid_chains).await;
        self.shield.restore(snapshot.shields).await;
        self.reentry.restore(snapshot.reentry_chains).await;

        for chain in self.reentry.live_chains().await {
            if chain.status != ChainStatus::RecoveryMode {
                continue;
            }
            if let Some(episode) = &chain.episode {
                let window = self.config.recovery_window_minutes(&chain.symbol);
                self.monitor.start(RecoveryMonitorEntry {
                    target_id: episode.target_ticket,
                    symbol: chain.symbol.clone(),
                    direction: chain.direction,
                    threshold_price: episode.target_price,
                    deadline: episode.started_at + chrono::Duration::minutes(window as i64),
                    context: MonitorContext::Reentry {
                        chain_id: chain.id.clone(),
                        variant: episode.variant,
                    },
                });
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            open_trades: self.store.open_trade_count().await,
            active_monitors: self.monitor.active_count(),
            reentry_chains: self.reentry.live_chains().await,
            pyramid_chains: self.pyramid.live_chains().await,
            shields: self.shield.live_shields().await,
            counters: self.safety.snapshot().await,
        }
    }

    async fn dispatch_outcome(&self, outcome: MonitorOutcome) -> Result<()> {
        match outcome {
            MonitorOutcome::Recovered { entry, price } => match &entry.context {
                MonitorContext::Reentry { .. } => {
                    if let Some(open) = self.reentry.on_recovery_signal(&entry, price).await? {
                        self.store.save_trade(open.trend_trail.clone()).await;
                        self.store.save_trade(open.profit_trail.clone()).await;

                        // The fresh profit leg seeds a pyramid chain under the
                        // preserved id, unless one is still running there
                        let pyramid_live = self
                            .pyramid
                            .get_chain(&open.chain_id)
                            .await
                            .is_some_and(|c| {
                                matches!(c.status, PyramidStatus::Active | PyramidStatus::SlHunt)
                            });
                        if !pyramid_live {
                            self.pyramid.create_chain(&open.profit_trail).await?;
                        }

                        self.events.publish(EngineEvent::EntryOpened {
                            chain_id: open.chain_id.clone(),
                            symbol: open.trend_trail.symbol.clone(),
                            direction: open.trend_trail.direction,
                            trend_ticket: open.trend_trail.ticket,
                            profit_ticket: open.profit_trail.ticket,
                            lot_per_order: open.lot_per_order,
                        });
                    }
                }
                MonitorContext::Pyramid { chain_id } => {
                    self.pyramid.on_recovery(chain_id, price).await?;
                }
            },
            MonitorOutcome::TimedOut { entry } => match &entry.context {
                MonitorContext::Reentry { .. } => {
                    self.reentry.on_recovery_timeout(&entry).await?;
                }
                MonitorContext::Pyramid { chain_id } => {
                    self.pyramid.on_recovery_timeout(chain_id).await?;
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper::PaperGateway;
    use crate::gateway::{Candle, Direction};

    async fn engine_with(config: Config) -> (Arc<Engine>, Arc<PaperGateway>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.1000, 1.1002);
        let store = Arc::new(TradeStore::open(dir.path()).await.unwrap());
        let engine = Arc::new(Engine::new(Arc::new(config), gateway.clone(), store));
        (engine, gateway, dir)
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.recovery.poll_interval_ms = 10;
        config
    }

    fn signal() -> EntrySignal {
        EntrySignal {
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            stop_pips: Some(30.0),
            lot: Some(0.10),
        }
    }

    fn seed_uptrend(gateway: &PaperGateway) {
        for i in 0..50 {
            let open = 1.0900 + i as f64 * 0.0002;
            gateway.push_candle(
                "EURUSD",
                Candle {
                    open,
                    high: open + 0.0004,
                    low: open - 0.0002,
                    close: open + 0.0002,
                    timestamp: chrono::Utc::now() - chrono::Duration::minutes(50 - i),
                },
            );
        }
    }

    #[tokio::test]
    async fn test_open_entry_registers_both_machines() {
        let (engine, gateway, _dir) = engine_with(fast_config()).await;
        let mut events = engine.events().subscribe();

        let open = engine.open_entry(&signal()).await.unwrap();

        assert_eq!(gateway.open_order_count(), 2);
        let status = engine.status().await;
        assert_eq!(status.open_trades, 2);
        assert_eq!(status.reentry_chains.len(), 1);
        assert_eq!(status.pyramid_chains.len(), 1);
        assert_eq!(status.pyramid_chains[0].id, open.chain_id);

        match events.recv().await.unwrap() {
            EngineEvent::EntryOpened { chain_id, .. } => assert_eq!(chain_id, open.chain_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trend_stop_routes_to_reentry() {
        let (engine, _gateway, _dir) = engine_with(fast_config()).await;
        let open = engine.open_entry(&signal()).await.unwrap();

        engine
            .handle_close(CloseEvent {
                ticket: open.trend_trail.ticket,
                reason: CloseReason::StopLoss,
                close_price: open.trend_trail.stop_price,
                realized_pnl: -30.0,
            })
            .await
            .unwrap();

        let status = engine.status().await;
        assert_eq!(status.active_monitors, 1);
        assert_eq!(status.reentry_chains[0].status, ChainStatus::RecoveryMode);
        // The loss feeds the daily budget
        assert!((status.counters.daily_losses - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_profit_target_routes_to_pyramid() {
        let (engine, gateway, _dir) = engine_with(fast_config()).await;
        let open = engine.open_entry(&signal()).await.unwrap();

        gateway.close_order(open.profit_trail.ticket).await.unwrap();
        engine
            .handle_close(CloseEvent {
                ticket: open.profit_trail.ticket,
                reason: CloseReason::TakeProfit,
                close_price: open.profit_trail.target_price,
                realized_pnl: 7.0,
            })
            .await
            .unwrap();

        // Level 0 complete: two level-1 orders placed (trend leg still open)
        let status = engine.status().await;
        let chain = &status.pyramid_chains[0];
        assert_eq!(chain.level, 1);
        assert_eq!(chain.level_tickets.len(), 2);
        assert!((chain.cumulative_profit - 7.0).abs() < 1e-9);
        assert_eq!(gateway.open_order_count(), 3);
    }

    #[tokio::test]
    async fn test_close_unknown_ticket_rejected() {
        let (engine, _gateway, _dir) = engine_with(fast_config()).await;
        let err = engine
            .handle_close(CloseEvent {
                ticket: 999,
                reason: CloseReason::Manual,
                close_price: 1.1,
                realized_pnl: 0.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TradeNotFound(999)));
    }

    #[tokio::test]
    async fn test_run_loop_resolves_recovery_end_to_end() {
        let (engine, gateway, _dir) = engine_with(fast_config()).await;
        seed_uptrend(&gateway);
        let runner = tokio::spawn(engine.clone().run());

        let open = engine.open_entry(&signal()).await.unwrap();
        gateway.close_order(open.trend_trail.ticket).await.unwrap();
        engine
            .handle_close(CloseEvent {
                ticket: open.trend_trail.ticket,
                reason: CloseReason::StopLoss,
                close_price: open.trend_trail.stop_price,
                realized_pnl: -30.0,
            })
            .await
            .unwrap();

        // Price sits past the 70% threshold; the monitor fires, the run loop
        // opens the level-1 re-entry
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = engine.status().await;
        let chain = status
            .reentry_chains
            .iter()
            .find(|c| c.id == open.chain_id)
            .unwrap();
        assert_eq!(chain.status, ChainStatus::Resolved);
        assert_eq!(chain.current_level, 1);
        // Profit leg + two re-entry legs on the book
        assert_eq!(gateway.open_order_count(), 3);

        engine.shutdown().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.1000, 1.1002);
        let config = Arc::new(fast_config());

        let chain_id = {
            let store = Arc::new(TradeStore::open(dir.path()).await.unwrap());
            let engine = Engine::new(config.clone(), gateway.clone(), store);
            let open = engine.open_entry(&signal()).await.unwrap();
            engine.snapshot().await.unwrap();
            open.chain_id
        };

        let store = Arc::new(TradeStore::open(dir.path()).await.unwrap());
        let engine = Engine::new(config, gateway, store);
        engine.restore().await.unwrap();

        let status = engine.status().await;
        assert!(status.reentry_chains.iter().any(|c| c.id == chain_id));
        assert!(status.pyramid_chains.iter().any(|c| c.id == chain_id));
    }

    #[tokio::test]
    async fn test_protected_close_unwinds_shield() {
        let (engine, gateway, _dir) = engine_with(fast_config()).await;
        let open = engine.open_entry(&signal()).await.unwrap();

        let shield = engine
            .shield_trade(open.trend_trail.ticket)
            .await
            .unwrap()
            .expect("shield should activate");
        assert_eq!(gateway.open_order_count(), 4);

        gateway.close_order(open.trend_trail.ticket).await.unwrap();
        engine
            .handle_close(CloseEvent {
                ticket: open.trend_trail.ticket,
                reason: CloseReason::StopLoss,
                close_price: open.trend_trail.stop_price,
                realized_pnl: -30.0,
            })
            .await
            .unwrap();

        let shields = engine.status().await.shields;
        let unwound = shields.iter().find(|s| s.id == shield.id).unwrap();
        assert_ne!(unwound.state, crate::engine::types::ShieldState::Active);
        // Hedge legs gone; only the profit leg remains
        assert_eq!(gateway.open_order_count(), 1);
    }
}
