//! Profit pyramid engine
//!
//! The profit-trailing leg of every entry seeds a compounding chain: level L
//! holds a geometric count of parallel orders (default 1,2,4,8,16), each with
//! the same fixed dollar target. A level advances only when every order at
//! that level books individually; a stop-out at any level drops the chain
//! into SL_HUNT with a single recovery attempt - used up, the chain is
//! hard-stopped. That single-attempt cap is deliberately stricter than the
//! general re-entry machine's configurable count.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::monitor::RecoveryWindowMonitor;
use crate::engine::types::{
    MonitorContext, ProfitBookingChain, PyramidStatus, RecoveryMonitorEntry, Trade,
};
use crate::error::{Error, Result};
use crate::gateway::{BrokerGateway, Direction, OrderRequest};
use crate::notify::{EngineEvent, EventBus};
use crate::risk::{SafetyAction, SafetyGuard};

/// Result of booking one profit target
#[derive(Debug, Clone, PartialEq)]
pub struct BookResult {
    pub booked_profit: f64,
    pub advanced: bool,
    pub new_level: u32,
}

pub struct ProfitPyramidEngine {
    chains: RwLock<HashMap<String, ProfitBookingChain>>,
    gateway: Arc<dyn BrokerGateway>,
    monitor: Arc<RecoveryWindowMonitor>,
    safety: Arc<SafetyGuard>,
    events: EventBus,
    config: Arc<Config>,
}

impl ProfitPyramidEngine {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        monitor: Arc<RecoveryWindowMonitor>,
        safety: Arc<SafetyGuard>,
        events: EventBus,
        config: Arc<Config>,
    ) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            gateway,
            monitor,
            safety,
            events,
            config,
        }
    }

    /// Register a new chain seeded by the profit-trailing leg of an entry
    pub async fn create_chain(&self, profit_trail: &Trade) -> Result<String> {
        let chain_id = profit_trail
            .chain_id
            .clone()
            .ok_or_else(|| Error::Validation("profit trail trade has no chain id".into()))?;

        let chain = ProfitBookingChain::new(
            chain_id.clone(),
            profit_trail.symbol.clone(),
            profit_trail.direction,
            profit_trail.ticket,
            profit_trail.lot,
        );

        let mut chains = self.chains.write().await;
        chains.insert(chain_id.clone(), chain);
        info!(chain = %chain_id, symbol = %profit_trail.symbol, "Pyramid chain created");
        Ok(chain_id)
    }

    /// Book one profit-target fill. Duplicate deliveries of the same ticket
    /// are a no-op: the level never advances twice for one order.
    pub async fn on_target_hit(
        &self,
        chain_id: &str,
        ticket: u64,
        realized_pnl: f64,
    ) -> Result<BookResult> {
        let mut chains = self.chains.write().await;
        let chain = chains
            .get_mut(chain_id)
            .ok_or_else(|| Error::ChainNotFound(chain_id.to_string()))?;

        if chain.status != PyramidStatus::Active {
            return Err(Error::Validation(format!(
                "chain {} is {:?}, cannot book",
                chain_id, chain.status
            )));
        }
        if !chain.level_tickets.contains(&ticket) {
            return Err(Error::OrderNotInChain {
                chain_id: chain_id.to_string(),
                ticket,
            });
        }
        if chain.booked_tickets.contains(&ticket) {
            debug!(chain = %chain_id, ticket, "Duplicate target-hit event ignored");
            return Ok(BookResult {
                booked_profit: 0.0,
                advanced: false,
                new_level: chain.level,
            });
        }

        chain.booked_tickets.insert(ticket);
        chain.cumulative_profit += realized_pnl;
        debug!(
            chain = %chain_id,
            ticket,
            booked = chain.booked_tickets.len(),
            of = chain.level_tickets.len(),
            "Pyramid order booked"
        );

        if !chain.level_complete() {
            return Ok(BookResult {
                booked_profit: realized_pnl,
                advanced: false,
                new_level: chain.level,
            });
        }

        // Level complete: top of the pyramid finishes the chain, anything
        // below opens the next level's orders
        if chain.level >= self.config.pyramid.max_level() {
            chain.status = PyramidStatus::Completed;
            info!(
                chain = %chain_id,
                total = chain.cumulative_profit,
                "Pyramid chain completed"
            );
            self.events.publish(EngineEvent::ChainCompleted {
                chain_id: chain_id.to_string(),
                symbol: chain.symbol.clone(),
                total_profit: chain.cumulative_profit,
            });
            return Ok(BookResult {
                booked_profit: realized_pnl,
                advanced: false,
                new_level: chain.level,
            });
        }

        let next_level = chain.level + 1;
        let count = self
            .config
            .pyramid
            .orders_at_level(next_level)
            .ok_or_else(|| Error::Internal(format!("no order count for level {}", next_level)))?;
        let symbol = chain.symbol.clone();
        let direction = chain.direction;
        let lot_per_order = chain.lot_per_order;
        drop(chains);

        // Chain table stays unlocked during the gateway round-trips so
        // unrelated chains keep moving
        let tickets = self
            .place_level_orders(chain_id, &symbol, direction, lot_per_order, next_level, count)
            .await?;

        let mut chains = self.chains.write().await;
        let chain = chains
            .get_mut(chain_id)
            .ok_or_else(|| Error::ChainNotFound(chain_id.to_string()))?;
        chain.level = next_level;
        chain.level_tickets = tickets;
        chain.booked_tickets = BTreeSet::new();
        let cumulative_profit = chain.cumulative_profit;
        drop(chains);

        info!(
            chain = %chain_id,
            level = next_level,
            orders = count,
            cumulative = cumulative_profit,
            "Pyramid advanced"
        );
        self.events.publish(EngineEvent::ChainAdvanced {
            chain_id: chain_id.to_string(),
            symbol,
            level: next_level,
            orders_at_level: count,
            cumulative_profit,
        });

        Ok(BookResult {
            booked_profit: realized_pnl,
            advanced: true,
            new_level: next_level,
        })
    }

    /// Handle an unexpected stop-out of a pyramid order. Returns true when a
    /// recovery episode was started, false when the chain hard-stopped.
    pub async fn on_chain_stopped_out(&self, chain_id: &str, stop_price: f64) -> Result<bool> {
        let mut chains = self.chains.write().await;
        let chain = chains
            .get_mut(chain_id)
            .ok_or_else(|| Error::ChainNotFound(chain_id.to_string()))?;

        if chain.status != PyramidStatus::Active {
            debug!(chain = %chain_id, status = ?chain.status, "Stop-out on non-active chain ignored");
            return Ok(false);
        }

        // One attempt per chain, ever
        if chain.recovery_used {
            chain.status = PyramidStatus::Cancelled;
            warn!(chain = %chain_id, "Pyramid recovery already used, chain cancelled");
            self.events.publish(EngineEvent::SafetyLimitReached {
                context: format!("pyramid chain {}", chain_id),
                reason: "single recovery attempt already used".into(),
            });
            return Ok(false);
        }

        let check = self.safety.check(SafetyAction::Recovery).await;
        if !check.allowed {
            chain.status = PyramidStatus::Cancelled;
            let reason = check.reason.unwrap_or_else(|| "denied".into());
            warn!(chain = %chain_id, reason = %reason, "Pyramid recovery denied by safety guard");
            self.events.publish(EngineEvent::SafetyLimitReached {
                context: format!("pyramid chain {}", chain_id),
                reason,
            });
            return Ok(false);
        }
        self.safety.record(SafetyAction::Recovery).await;

        chain.recovery_used = true;
        chain.status = PyramidStatus::SlHunt;

        let instrument = self.config.instrument(&chain.symbol);
        let risk_pips = self.config.pyramid.order_risk_usd
            / (instrument.pip_value_per_lot * chain.lot_per_order);
        let distance = risk_pips * instrument.pip_size;
        let threshold =
            stop_price + chain.direction.sign() * distance * self.config.recovery.recovery_fraction;

        let window_minutes = self.config.recovery_window_minutes(&chain.symbol);
        let target_id = chain.level_tickets.iter().next().copied().unwrap_or(0);

        self.monitor.start(RecoveryMonitorEntry {
            target_id,
            symbol: chain.symbol.clone(),
            direction: chain.direction,
            threshold_price: threshold,
            deadline: chrono::Utc::now() + chrono::Duration::minutes(window_minutes as i64),
            context: MonitorContext::Pyramid {
                chain_id: chain_id.to_string(),
            },
        });

        info!(chain = %chain_id, threshold, "Pyramid SL-Hunt recovery started");
        self.events.publish(EngineEvent::RecoveryStarted {
            chain_id: chain_id.to_string(),
            symbol: chain.symbol.clone(),
            direction: chain.direction,
            variant: None,
            threshold_price: threshold,
            window_minutes,
        });

        Ok(true)
    }

    /// Recovery threshold crossed: re-open the current level's orders
    pub async fn on_recovery(&self, chain_id: &str, price: f64) -> Result<()> {
        let (symbol, direction, lot_per_order, level) = {
            let chains = self.chains.read().await;
            let chain = chains
                .get(chain_id)
                .ok_or_else(|| Error::ChainNotFound(chain_id.to_string()))?;

            if chain.status != PyramidStatus::SlHunt {
                debug!(chain = %chain_id, status = ?chain.status, "Recovery signal on non-hunting chain ignored");
                return Ok(());
            }
            (
                chain.symbol.clone(),
                chain.direction,
                chain.lot_per_order,
                chain.level,
            )
        };
        let count = self
            .config
            .pyramid
            .orders_at_level(level)
            .ok_or_else(|| Error::Internal(format!("no order count for level {}", level)))?;

        let tickets = self
            .place_level_orders(chain_id, &symbol, direction, lot_per_order, level, count)
            .await?;

        {
            let mut chains = self.chains.write().await;
            let chain = chains
                .get_mut(chain_id)
                .ok_or_else(|| Error::ChainNotFound(chain_id.to_string()))?;
            chain.level_tickets = tickets;
            chain.booked_tickets = BTreeSet::new();
            chain.status = PyramidStatus::Active;
        }

        self.safety.release_recovery().await;
        info!(chain = %chain_id, level, price, "Pyramid chain recovered");
        self.events.publish(EngineEvent::RecoveryResolved {
            chain_id: chain_id.to_string(),
            symbol,
            level,
            price,
        });

        Ok(())
    }

    /// Recovery window lapsed: terminal for the chain
    pub async fn on_recovery_timeout(&self, chain_id: &str) -> Result<()> {
        let mut chains = self.chains.write().await;
        let chain = chains
            .get_mut(chain_id)
            .ok_or_else(|| Error::ChainNotFound(chain_id.to_string()))?;

        if chain.status != PyramidStatus::SlHunt {
            return Ok(());
        }

        chain.status = PyramidStatus::Cancelled;
        self.safety.release_recovery().await;
        info!(chain = %chain_id, "Pyramid recovery window lapsed");
        self.events.publish(EngineEvent::RecoveryTimedOut {
            chain_id: chain_id.to_string(),
            symbol: chain.symbol.clone(),
        });

        Ok(())
    }

    /// Chain lookup by the ticket of any live order
    pub async fn chain_for_ticket(&self, ticket: u64) -> Option<String> {
        let chains = self.chains.read().await;
        chains
            .values()
            .find(|c| c.level_tickets.contains(&ticket))
            .map(|c| c.id.clone())
    }

    pub async fn get_chain(&self, chain_id: &str) -> Option<ProfitBookingChain> {
        self.chains.read().await.get(chain_id).cloned()
    }

    pub async fn live_chains(&self) -> Vec<ProfitBookingChain> {
        self.chains.read().await.values().cloned().collect()
    }

    /// Restore chains from a snapshot (startup). Monitors do not survive a
    /// restart and the hunt window is not persisted, so a chain caught
    /// mid-hunt is cancelled rather than left dangling.
    pub async fn restore(&self, restored: Vec<ProfitBookingChain>) {
        let mut cancelled = Vec::new();
        {
            let mut chains = self.chains.write().await;
            for mut chain in restored {
                if chain.status == PyramidStatus::SlHunt {
                    warn!(chain = %chain.id, "Restored chain mid-hunt, cancelling");
                    chain.status = PyramidStatus::Cancelled;
                    cancelled.push((chain.id.clone(), chain.symbol.clone()));
                }
                chains.insert(chain.id.clone(), chain);
            }
        }
        for (chain_id, symbol) in cancelled {
            self.events
                .publish(EngineEvent::RecoveryTimedOut { chain_id, symbol });
        }
    }

    /// Place `count` parallel orders for one level, chain table unlocked. On
    /// a mid-batch gateway failure the tickets placed so far are recorded on
    /// the chain before the error surfaces, so the operator can reconcile
    /// instead of chasing orphans.
    async fn place_level_orders(
        &self,
        chain_id: &str,
        symbol: &str,
        direction: Direction,
        lot_per_order: f64,
        level: u32,
        count: u32,
    ) -> Result<BTreeSet<u64>> {
        let instrument = self.config.instrument(symbol);
        let quote = self.gateway.get_price(symbol).await?;
        let entry_price = match direction {
            Direction::Buy => quote.ask,
            Direction::Sell => quote.bid,
        };

        let sign = direction.sign();
        let risk_pips =
            self.config.pyramid.order_risk_usd / (instrument.pip_value_per_lot * lot_per_order);
        let profit_pips = self.config.pyramid.profit_target_per_order
            / (instrument.pip_value_per_lot * lot_per_order);
        let stop_price = entry_price - sign * risk_pips * instrument.pip_size;
        let target_price = entry_price + sign * profit_pips * instrument.pip_size;

        let mut tickets = BTreeSet::new();
        for i in 0..count {
            let request = OrderRequest {
                symbol: symbol.to_string(),
                direction,
                lot: lot_per_order,
                stop_price,
                target_price,
                comment: format!("{}:pyramid:L{}:{}", chain_id, level, i),
            };
            match self.gateway.place_order(&request).await {
                Ok(ticket) => {
                    tickets.insert(ticket);
                }
                Err(e) => {
                    warn!(
                        chain = %chain_id,
                        placed = tickets.len(),
                        wanted = count,
                        "Level order placement failed mid-batch: {}",
                        e
                    );
                    let mut chains = self.chains.write().await;
                    if let Some(chain) = chains.get_mut(chain_id) {
                        chain.level_tickets.extend(tickets.iter());
                    }
                    return Err(e);
                }
            }
        }

        Ok(tickets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyConfig;
    use crate::engine::types::{OrderRole, TradeStatus};
    use crate::gateway::paper::PaperGateway;
    use crate::gateway::{Candle, Quote};
    use async_trait::async_trait;
    use tokio::sync::{mpsc, Semaphore};

    struct Fixture {
        monitor: Arc<RecoveryWindowMonitor>,
        safety: Arc<SafetyGuard>,
        events: EventBus,
        engine: ProfitPyramidEngine,
    }

    fn fixture() -> Fixture {
        fixture_with_safety(SafetyConfig::default())
    }

    fn fixture_with_safety(safety_config: SafetyConfig) -> Fixture {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.1000, 1.1002);

        let (tx, _rx) = mpsc::channel(16);
        let monitor = Arc::new(RecoveryWindowMonitor::new(gateway.clone(), tx, 10));
        let safety = Arc::new(SafetyGuard::new(safety_config));
        let config = Arc::new(Config::default());

        let events = EventBus::new(64);
        let engine = ProfitPyramidEngine::new(
            gateway.clone(),
            monitor.clone(),
            safety.clone(),
            events.clone(),
            config,
        );

        Fixture {
            monitor,
            safety,
            events,
            engine,
        }
    }

    fn profit_trade(ticket: u64) -> Trade {
        Trade {
            ticket,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            entry_price: 1.1002,
            stop_price: 1.0992,
            target_price: 1.1009,
            lot: 0.10,
            order_role: OrderRole::ProfitTrail,
            chain_id: Some("chain-1".into()),
            profit_level: Some(0),
            status: TradeStatus::Open,
            opened_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_level_zero_booking_advances_to_level_one() {
        let f = fixture();
        let chain_id = f.engine.create_chain(&profit_trade(1)).await.unwrap();

        // Single level-0 order books its $7 target
        let result = f.engine.on_target_hit(&chain_id, 1, 7.0).await.unwrap();
        assert!(result.advanced);
        assert_eq!(result.new_level, 1);

        let chain = f.engine.get_chain(&chain_id).await.unwrap();
        assert_eq!(chain.id, "chain-1"); // chain id preserved
        assert_eq!(chain.level, 1);
        assert_eq!(chain.level_tickets.len(), 2);
        assert!((chain.cumulative_profit - 7.0).abs() < 1e-9);
        assert_eq!(chain.status, PyramidStatus::Active);
    }

    #[tokio::test]
    async fn test_level_advances_only_when_all_orders_booked() {
        let f = fixture();
        let chain_id = f.engine.create_chain(&profit_trade(1)).await.unwrap();
        f.engine.on_target_hit(&chain_id, 1, 7.0).await.unwrap();

        let tickets: Vec<u64> = f
            .engine
            .get_chain(&chain_id)
            .await
            .unwrap()
            .level_tickets
            .iter()
            .copied()
            .collect();

        // First of two books: no advance yet
        let partial = f
            .engine
            .on_target_hit(&chain_id, tickets[0], 7.0)
            .await
            .unwrap();
        assert!(!partial.advanced);
        assert_eq!(f.engine.get_chain(&chain_id).await.unwrap().level, 1);

        // Second books: level 2 opens with 4 orders
        let full = f
            .engine
            .on_target_hit(&chain_id, tickets[1], 7.0)
            .await
            .unwrap();
        assert!(full.advanced);
        assert_eq!(full.new_level, 2);
        assert_eq!(
            f.engine
                .get_chain(&chain_id)
                .await
                .unwrap()
                .level_tickets
                .len(),
            4
        );
    }

    #[tokio::test]
    async fn test_duplicate_booking_is_idempotent() {
        let f = fixture();
        let chain_id = f.engine.create_chain(&profit_trade(1)).await.unwrap();
        f.engine.on_target_hit(&chain_id, 1, 7.0).await.unwrap();

        let tickets: Vec<u64> = f
            .engine
            .get_chain(&chain_id)
            .await
            .unwrap()
            .level_tickets
            .iter()
            .copied()
            .collect();

        f.engine
            .on_target_hit(&chain_id, tickets[0], 7.0)
            .await
            .unwrap();
        // Same event delivered again
        let dup = f
            .engine
            .on_target_hit(&chain_id, tickets[0], 7.0)
            .await
            .unwrap();
        assert!(!dup.advanced);
        assert_eq!(dup.booked_profit, 0.0);

        let chain = f.engine.get_chain(&chain_id).await.unwrap();
        assert_eq!(chain.level, 1); // no double advance
        assert!((chain.cumulative_profit - 14.0).abs() < 1e-9); // no double book
    }

    #[tokio::test]
    async fn test_full_pyramid_books_31_orders_for_217() {
        let f = fixture();
        let chain_id = f.engine.create_chain(&profit_trade(1)).await.unwrap();

        let mut total_orders = 0u32;
        loop {
            let chain = f.engine.get_chain(&chain_id).await.unwrap();
            if chain.status == PyramidStatus::Completed {
                break;
            }
            let tickets: Vec<u64> = chain.level_tickets.iter().copied().collect();
            for ticket in tickets {
                f.engine.on_target_hit(&chain_id, ticket, 7.0).await.unwrap();
                total_orders += 1;
            }
        }

        let chain = f.engine.get_chain(&chain_id).await.unwrap();
        assert_eq!(total_orders, 31);
        assert!((chain.cumulative_profit - 217.0).abs() < 1e-6);
        assert_eq!(chain.level, 4);
    }

    #[tokio::test]
    async fn test_stop_out_starts_single_recovery() {
        let f = fixture();
        let chain_id = f.engine.create_chain(&profit_trade(1)).await.unwrap();

        let started = f
            .engine
            .on_chain_stopped_out(&chain_id, 1.0992)
            .await
            .unwrap();
        assert!(started);
        assert_eq!(f.monitor.active_count(), 1);
        assert_eq!(
            f.engine.get_chain(&chain_id).await.unwrap().status,
            PyramidStatus::SlHunt
        );
    }

    #[tokio::test]
    async fn test_second_stop_out_hard_stops_chain() {
        let f = fixture();
        let chain_id = f.engine.create_chain(&profit_trade(1)).await.unwrap();

        f.engine.on_chain_stopped_out(&chain_id, 1.0992).await.unwrap();
        f.engine.on_recovery(&chain_id, 1.0999).await.unwrap();

        // Second stop-out: the one recovery attempt is spent
        let started = f
            .engine
            .on_chain_stopped_out(&chain_id, 1.0992)
            .await
            .unwrap();
        assert!(!started);
        assert_eq!(
            f.engine.get_chain(&chain_id).await.unwrap().status,
            PyramidStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_safety_denial_cancels_without_monitor() {
        let f = fixture_with_safety(SafetyConfig {
            daily_recovery_limit: 0,
            ..SafetyConfig::default()
        });
        let chain_id = f.engine.create_chain(&profit_trade(1)).await.unwrap();

        let started = f
            .engine
            .on_chain_stopped_out(&chain_id, 1.0992)
            .await
            .unwrap();
        assert!(!started);
        assert_eq!(f.monitor.active_count(), 0);
        assert_eq!(
            f.engine.get_chain(&chain_id).await.unwrap().status,
            PyramidStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_recovery_reopens_current_level() {
        let f = fixture();
        let chain_id = f.engine.create_chain(&profit_trade(1)).await.unwrap();
        f.engine.on_target_hit(&chain_id, 1, 7.0).await.unwrap(); // level 1, 2 orders

        f.engine.on_chain_stopped_out(&chain_id, 1.0992).await.unwrap();
        f.engine.on_recovery(&chain_id, 1.0999).await.unwrap();

        let chain = f.engine.get_chain(&chain_id).await.unwrap();
        assert_eq!(chain.status, PyramidStatus::Active);
        assert_eq!(chain.level, 1); // recovery re-enters, it does not advance
        assert_eq!(chain.level_tickets.len(), 2);
        assert!(chain.booked_tickets.is_empty());
        // Concurrent slot released
        assert_eq!(f.safety.snapshot().await.concurrent_recoveries, 0);
    }

    #[tokio::test]
    async fn test_recovery_timeout_is_terminal() {
        let f = fixture();
        let chain_id = f.engine.create_chain(&profit_trade(1)).await.unwrap();
        f.engine.on_chain_stopped_out(&chain_id, 1.0992).await.unwrap();

        f.engine.on_recovery_timeout(&chain_id).await.unwrap();
        assert_eq!(
            f.engine.get_chain(&chain_id).await.unwrap().status,
            PyramidStatus::Cancelled
        );
        assert_eq!(f.safety.snapshot().await.concurrent_recoveries, 0);
    }

    #[tokio::test]
    async fn test_chain_for_ticket_lookup() {
        let f = fixture();
        let chain_id = f.engine.create_chain(&profit_trade(42)).await.unwrap();
        assert_eq!(f.engine.chain_for_ticket(42).await, Some(chain_id));
        assert_eq!(f.engine.chain_for_ticket(7).await, None);
    }

    #[tokio::test]
    async fn test_restore_cancels_mid_hunt_chain_with_event() {
        let f = fixture();
        let mut rx = f.events.subscribe();

        // Persisted mid-hunt; the hunt window is gone with the old process
        let mut chain =
            ProfitBookingChain::new("chain-1".into(), "EURUSD".into(), Direction::Buy, 1, 0.10);
        chain.status = PyramidStatus::SlHunt;
        chain.recovery_used = true;
        f.engine.restore(vec![chain]).await;

        assert_eq!(
            f.engine.get_chain("chain-1").await.unwrap().status,
            PyramidStatus::Cancelled
        );
        match rx.recv().await.unwrap() {
            EngineEvent::RecoveryTimedOut { chain_id, .. } => assert_eq!(chain_id, "chain-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    /// Delegates to the paper book but parks `place_order` until permits
    /// arrive, keeping orders in flight as long as the test wants
    struct GatedGateway {
        inner: PaperGateway,
        permits: Arc<Semaphore>,
    }

    #[async_trait]
    impl BrokerGateway for GatedGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<u64> {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| Error::Internal("gate closed".into()))?;
            permit.forget();
            self.inner.place_order(request).await
        }

        async fn close_order(&self, ticket: u64) -> Result<f64> {
            self.inner.close_order(ticket).await
        }

        async fn get_price(&self, symbol: &str) -> Result<Quote> {
            self.inner.get_price(symbol).await
        }

        async fn get_candles(
            &self,
            symbol: &str,
            timeframe_minutes: u32,
            count: usize,
        ) -> Result<Vec<Candle>> {
            self.inner.get_candles(symbol, timeframe_minutes, count).await
        }
    }

    #[tokio::test]
    async fn test_placement_does_not_block_other_chains() {
        let permits = Arc::new(Semaphore::new(0));
        let inner = PaperGateway::new();
        inner.set_price("EURUSD", 1.1000, 1.1002);
        let gateway = Arc::new(GatedGateway {
            inner,
            permits: permits.clone(),
        });

        let (tx, _rx) = mpsc::channel(16);
        let monitor = Arc::new(RecoveryWindowMonitor::new(gateway.clone(), tx, 10));
        let engine = Arc::new(ProfitPyramidEngine::new(
            gateway,
            monitor,
            Arc::new(SafetyGuard::new(SafetyConfig::default())),
            EventBus::new(64),
            Arc::new(Config::default()),
        ));

        engine.create_chain(&profit_trade(1)).await.unwrap();
        let mut other = profit_trade(2);
        other.chain_id = Some("chain-2".into());
        engine.create_chain(&other).await.unwrap();

        // Level-1 placement parks on the gate with its orders in flight
        let advancing = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.on_target_hit("chain-1", 1, 7.0).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // The other chain must keep moving meanwhile
        tokio::time::timeout(
            std::time::Duration::from_millis(100),
            engine.on_chain_stopped_out("chain-2", 1.0992),
        )
        .await
        .expect("chain table held across gateway calls")
        .unwrap();

        permits.add_permits(2);
        let result = advancing.await.unwrap().unwrap();
        assert!(result.advanced);
        assert_eq!(
            engine
                .get_chain("chain-1")
                .await
                .unwrap()
                .level_tickets
                .len(),
            2
        );
    }
}
