//! Re-entry state machine
//!
//! General re-entry controller for three episode flavors sharing one chain
//! shape:
//!
//! - SL-Hunt: a stop-out is re-entered once price retraces past the recovery
//!   threshold AND the trend still supports the original direction.
//! - TP-Continuation: a take-profit is re-entered if price keeps running
//!   beyond the exit by the same threshold rule. No trend confirmation.
//! - Exit-Continuation: same rule for manual exits.
//!
//! Chains move Active -> RecoveryMode -> {Resolved, TimedOut, Cancelled}.
//! A Resolved chain is re-armed by the next close event at the next level;
//! `current_level` only ever grows, and a new dual order opens at a stop
//! distance reduced per level, preserving the chain id.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::dual_order::{DualOpen, DualOrderCoordinator};
use crate::engine::monitor::RecoveryWindowMonitor;
use crate::engine::types::{
    ChainStatus, CloseEvent, MonitorContext, RecoveryEpisode, RecoveryMonitorEntry, ReentryChain,
    ReentryVariant, Trade,
};
use crate::error::{Error, Result};
use crate::gateway::BrokerGateway;
use crate::market::TrendScorer;
use crate::notify::{EngineEvent, EventBus};
use crate::risk::{SafetyAction, SafetyGuard};

pub struct ReentryStateMachine {
    chains: RwLock<HashMap<String, ReentryChain>>,
    /// Order ticket -> chain id, so levels can be looked up per order
    tickets: RwLock<HashMap<u64, String>>,
    coordinator: Arc<DualOrderCoordinator>,
    monitor: Arc<RecoveryWindowMonitor>,
    safety: Arc<SafetyGuard>,
    trend: TrendScorer,
    gateway: Arc<dyn BrokerGateway>,
    events: EventBus,
    config: Arc<Config>,
}

impl ReentryStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: Arc<DualOrderCoordinator>,
        monitor: Arc<RecoveryWindowMonitor>,
        safety: Arc<SafetyGuard>,
        trend: TrendScorer,
        gateway: Arc<dyn BrokerGateway>,
        events: EventBus,
        config: Arc<Config>,
    ) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            tickets: RwLock::new(HashMap::new()),
            coordinator,
            monitor,
            safety,
            trend,
            gateway,
            events,
            config,
        }
    }

    /// Register a chain for a freshly opened dual entry
    pub async fn register_chain(
        &self,
        chain_id: &str,
        symbol: &str,
        direction: crate::gateway::Direction,
        stop_pips: f64,
        tickets: &[u64],
    ) {
        let chain = ReentryChain::new(
            chain_id.to_string(),
            symbol.to_string(),
            direction,
            stop_pips,
            self.config.reentry.max_chain_levels,
        );
        {
            let mut chains = self.chains.write().await;
            chains.entry(chain_id.to_string()).or_insert(chain);
        }
        let mut index = self.tickets.write().await;
        for &ticket in tickets {
            index.insert(ticket, chain_id.to_string());
        }
    }

    /// Stop-loss close event. Returns true when a recovery episode started.
    pub async fn on_stop_loss(&self, trade: &Trade, event: &CloseEvent) -> Result<bool> {
        if !self.config.reentry.sl_hunt_enabled {
            return self.cancel_disabled(trade, "sl_hunt").await;
        }
        self.begin_recovery(trade, event, ReentryVariant::SlHunt)
            .await
    }

    /// Take-profit close event
    pub async fn on_take_profit(&self, trade: &Trade, event: &CloseEvent) -> Result<bool> {
        if !self.config.reentry.tp_continuation_enabled {
            return self.cancel_disabled(trade, "tp_continuation").await;
        }
        self.begin_recovery(trade, event, ReentryVariant::TpContinuation)
            .await
    }

    /// Manual exit close event
    pub async fn on_manual_exit(&self, trade: &Trade, event: &CloseEvent) -> Result<bool> {
        if !self.config.reentry.exit_continuation_enabled {
            return self.cancel_disabled(trade, "exit_continuation").await;
        }
        self.begin_recovery(trade, event, ReentryVariant::ExitContinuation)
            .await
    }

    /// Recovery threshold crossed. Returns the freshly opened legs when the
    /// re-entry fired; the caller persists them.
    pub async fn on_recovery_signal(
        &self,
        entry: &RecoveryMonitorEntry,
        price: f64,
    ) -> Result<Option<DualOpen>> {
        let chain_id = match &entry.context {
            MonitorContext::Reentry { chain_id, .. } => chain_id.clone(),
            MonitorContext::Pyramid { .. } => {
                return Err(Error::Internal(
                    "pyramid outcome routed to reentry machine".into(),
                ))
            }
        };

        let (symbol, direction, variant, stop_pips, next_level) = {
            let chains = self.chains.read().await;
            let chain = chains
                .get(&chain_id)
                .ok_or_else(|| Error::ChainNotFound(chain_id.clone()))?;

            if chain.status != ChainStatus::RecoveryMode {
                debug!(chain = %chain_id, status = ?chain.status, "Recovery signal on idle chain ignored");
                return Ok(None);
            }
            let variant = chain
                .episode
                .as_ref()
                .map(|e| e.variant)
                .unwrap_or(ReentryVariant::SlHunt);
            let next_level = chain.current_level + 1;
            let reduction =
                1.0 - next_level as f64 * self.config.reentry.sl_reduction_per_level;
            let stop_pips = (chain.original_stop_pips * reduction)
                .max(self.config.reentry.min_stop_pips);
            (
                chain.symbol.clone(),
                chain.direction,
                variant,
                stop_pips,
                next_level,
            )
        };

        // SL-Hunt re-entries need the trend on their side; if it is not,
        // keep the episode open and let the monitor keep watching until the
        // original deadline.
        if variant == ReentryVariant::SlHunt && self.config.reentry.require_trend_alignment {
            let candles = self
                .gateway
                .get_candles(
                    &symbol,
                    self.config.trend.timeframe_minutes,
                    self.config.trend.candle_count,
                )
                .await?;
            let pip_size = self.config.instrument(&symbol).pip_size;
            if !self.trend.aligned(&candles, pip_size, direction) {
                info!(chain = %chain_id, "Recovery price reached but trend not aligned, still watching");
                self.monitor.start(entry.clone());
                return Ok(None);
            }
        }

        let daily_room = self.safety.daily_room(self.config.risk.daily_loss_limit).await;
        let open = self
            .coordinator
            .open_reentry(&chain_id, &symbol, direction, stop_pips, daily_room)
            .await?;

        {
            let mut chains = self.chains.write().await;
            if let Some(chain) = chains.get_mut(&chain_id) {
                chain.current_level = next_level;
                chain.status = ChainStatus::Resolved;
                chain.episode = None;
            }
        }
        {
            let mut index = self.tickets.write().await;
            index.insert(open.trend_trail.ticket, chain_id.clone());
            index.insert(open.profit_trail.ticket, chain_id.clone());
        }

        self.safety.release_recovery().await;
        info!(
            chain = %chain_id,
            level = next_level,
            stop_pips,
            price,
            "Re-entry opened"
        );
        self.events.publish(EngineEvent::RecoveryResolved {
            chain_id: chain_id.clone(),
            symbol,
            level: next_level,
            price,
        });

        Ok(Some(open))
    }

    /// Recovery window lapsed: terminal for the episode
    pub async fn on_recovery_timeout(&self, entry: &RecoveryMonitorEntry) -> Result<()> {
        let chain_id = match &entry.context {
            MonitorContext::Reentry { chain_id, .. } => chain_id.clone(),
            MonitorContext::Pyramid { .. } => {
                return Err(Error::Internal(
                    "pyramid outcome routed to reentry machine".into(),
                ))
            }
        };

        let mut chains = self.chains.write().await;
        let chain = chains
            .get_mut(&chain_id)
            .ok_or_else(|| Error::ChainNotFound(chain_id.clone()))?;

        if chain.status != ChainStatus::RecoveryMode {
            return Ok(());
        }

        chain.status = ChainStatus::TimedOut;
        chain.episode = None;
        let symbol = chain.symbol.clone();
        drop(chains);

        self.safety.release_recovery().await;
        info!(chain = %chain_id, "Recovery window lapsed");
        self.events.publish(EngineEvent::RecoveryTimedOut {
            chain_id,
            symbol,
        });

        Ok(())
    }

    /// Level of the chain an order belongs to, keyed by ticket
    pub async fn get_chain_level(&self, ticket: u64) -> Option<u32> {
        let chain_id = self.tickets.read().await.get(&ticket).cloned()?;
        self.chains
            .read()
            .await
            .get(&chain_id)
            .map(|c| c.current_level)
    }

    pub async fn get_chain(&self, chain_id: &str) -> Option<ReentryChain> {
        self.chains.read().await.get(chain_id).cloned()
    }

    pub async fn live_chains(&self) -> Vec<ReentryChain> {
        self.chains.read().await.values().cloned().collect()
    }

    /// Restore chains from a snapshot (startup). Chains restored in
    /// RecoveryMode have lost their monitor; time out the ones whose window
    /// already lapsed and re-arm the rest.
    pub async fn restore(&self, restored: Vec<ReentryChain>) {
        let now = chrono::Utc::now();
        let mut timed_out = Vec::new();
        {
            let mut chains = self.chains.write().await;
            let mut index = self.tickets.write().await;
            for mut chain in restored {
                if chain.status == ChainStatus::RecoveryMode {
                    match &chain.episode {
                        Some(episode) => {
                            index.insert(episode.target_ticket, chain.id.clone());
                            let window = self.config.recovery_window_minutes(&chain.symbol);
                            let deadline =
                                episode.started_at + chrono::Duration::minutes(window as i64);
                            if now > deadline {
                                warn!(chain = %chain.id, "Restored episode past deadline, timing out");
                                chain.status = ChainStatus::TimedOut;
                                chain.episode = None;
                                timed_out.push((chain.id.clone(), chain.symbol.clone()));
                            }
                            // In-window episodes are re-armed by the engine after restore
                        }
                        None => {
                            chain.status = ChainStatus::TimedOut;
                            timed_out.push((chain.id.clone(), chain.symbol.clone()));
                        }
                    }
                }
                chains.insert(chain.id.clone(), chain);
            }
        }
        for (chain_id, symbol) in timed_out {
            self.events
                .publish(EngineEvent::RecoveryTimedOut { chain_id, symbol });
        }
    }

    /// Shared entry path for all three variants
    async fn begin_recovery(
        &self,
        trade: &Trade,
        event: &CloseEvent,
        variant: ReentryVariant,
    ) -> Result<bool> {
        let chain_id = trade
            .chain_id
            .clone()
            .ok_or_else(|| Error::Validation(format!("trade {} has no chain id", trade.ticket)))?;

        self.tickets
            .write()
            .await
            .insert(trade.ticket, chain_id.clone());

        let mut chains = self.chains.write().await;
        let instrument = self.config.instrument(&trade.symbol);
        let chain = chains.entry(chain_id.clone()).or_insert_with(|| {
            ReentryChain::new(
                chain_id.clone(),
                trade.symbol.clone(),
                trade.direction,
                trade.stop_distance() / instrument.pip_size,
                self.config.reentry.max_chain_levels,
            )
        });

        // One episode at a time; terminal chains except Resolved stay dead
        match chain.status {
            ChainStatus::Active | ChainStatus::Resolved => {}
            ChainStatus::RecoveryMode => {
                debug!(chain = %chain_id, "Episode already open, event ignored");
                return Ok(false);
            }
            ChainStatus::TimedOut | ChainStatus::Cancelled => {
                debug!(chain = %chain_id, status = ?chain.status, "Event on terminal chain ignored");
                return Ok(false);
            }
        }

        if chain.current_level + 1 > chain.max_level {
            chain.status = ChainStatus::Cancelled;
            let symbol = chain.symbol.clone();
            drop(chains);
            warn!(chain = %chain_id, "Max chain level reached, chain cancelled");
            self.events.publish(EngineEvent::SafetyLimitReached {
                context: format!("reentry chain {} ({})", chain_id, symbol),
                reason: "max chain level reached".into(),
            });
            return Ok(false);
        }

        let check = self.safety.check(SafetyAction::Recovery).await;
        if !check.allowed {
            let symbol = chain.symbol.clone();
            drop(chains);
            let reason = check.reason.unwrap_or_else(|| "denied".into());
            warn!(chain = %chain_id, reason = %reason, "Recovery denied by safety guard");
            self.events.publish(EngineEvent::SafetyLimitReached {
                context: format!("reentry chain {} ({})", chain_id, symbol),
                reason,
            });
            return Ok(false);
        }
        self.safety.record(SafetyAction::Recovery).await;

        // SL-Hunt anchors on the stop price and waits for the retrace;
        // continuations anchor on the exit price and wait for follow-through.
        let anchor = event.close_price;
        let distance = trade.stop_distance();
        let threshold =
            anchor + trade.direction.sign() * distance * self.config.recovery.recovery_fraction;

        chain.status = ChainStatus::RecoveryMode;
        chain.attempts_used += 1;
        chain.episode = Some(RecoveryEpisode {
            variant,
            target_price: threshold,
            started_at: chrono::Utc::now(),
            anchor_price: anchor,
            target_ticket: trade.ticket,
        });
        let symbol = chain.symbol.clone();
        let direction = chain.direction;
        drop(chains);

        let window_minutes = self.config.recovery_window_minutes(&symbol);
        self.monitor.start(RecoveryMonitorEntry {
            target_id: trade.ticket,
            symbol: symbol.clone(),
            direction,
            threshold_price: threshold,
            deadline: chrono::Utc::now() + chrono::Duration::minutes(window_minutes as i64),
            context: MonitorContext::Reentry {
                chain_id: chain_id.clone(),
                variant,
            },
        });

        info!(
            chain = %chain_id,
            ?variant,
            threshold,
            window_minutes,
            "Recovery episode started"
        );
        self.events.publish(EngineEvent::RecoveryStarted {
            chain_id,
            symbol,
            direction,
            variant: Some(variant),
            threshold_price: threshold,
            window_minutes,
        });

        Ok(true)
    }

    /// Feature disabled: terminal cancel with one notification
    async fn cancel_disabled(&self, trade: &Trade, feature: &str) -> Result<bool> {
        if let Some(chain_id) = &trade.chain_id {
            let mut chains = self.chains.write().await;
            if let Some(chain) = chains.get_mut(chain_id) {
                if !chain.status.is_terminal() {
                    chain.status = ChainStatus::Cancelled;
                    self.events.publish(EngineEvent::SafetyLimitReached {
                        context: format!("reentry chain {}", chain_id),
                        reason: format!("{} disabled", feature),
                    });
                }
            }
        }
        Ok(false)
    }
}
