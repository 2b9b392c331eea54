//! Reverse shield controller
//!
//! A trade deep in drawdown can be hedged instead of closed: two opposite
//! legs sized from the protected trade's lot neutralize further loss while
//! the position is given a chance to recover. The hedge risk must fit inside
//! the remaining daily budget minus a reserved buffer; when it does not, the
//! shield shrinks proportionally, and below the broker minimum it is not
//! placed at all.
//!
//! Every active shield gets a kill-switch watcher: the hedge is unwound as
//! soon as price recovers past the 70% level, or when the hold ceiling
//! lapses, whichever comes first.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::types::{ShieldState, ShieldStatus, Trade};
use crate::error::{Error, Result};
use crate::gateway::{BrokerGateway, Direction, OrderRequest};
use crate::notify::{EngineEvent, EventBus};
use crate::risk::governor::floor_to_step;
use crate::risk::{SafetyAction, SafetyGuard};

pub struct ReverseShieldController {
    shields: RwLock<HashMap<String, ShieldStatus>>,
    watchers: DashMap<String, JoinHandle<()>>,
    gateway: Arc<dyn BrokerGateway>,
    safety: Arc<SafetyGuard>,
    events: EventBus,
    config: Arc<Config>,
}

impl ReverseShieldController {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        safety: Arc<SafetyGuard>,
        events: EventBus,
        config: Arc<Config>,
    ) -> Self {
        Self {
            shields: RwLock::new(HashMap::new()),
            watchers: DashMap::new(),
            gateway,
            safety,
            events,
            config,
        }
    }

    /// Hedge a losing trade. Returns `None` when the shield is disabled,
    /// denied by the safety guard, or cannot be sized above the broker
    /// minimum within the remaining daily budget.
    pub async fn activate(
        self: &Arc<Self>,
        trade: &Trade,
        daily_room: f64,
    ) -> Result<Option<ShieldStatus>> {
        if !self.config.shield.enabled {
            debug!(ticket = trade.ticket, "Shield disabled, not hedging");
            return Ok(None);
        }

        let check = self.safety.check(SafetyAction::Shield).await;
        if !check.allowed {
            let reason = check.reason.unwrap_or_else(|| "denied".into());
            warn!(ticket = trade.ticket, reason = %reason, "Shield denied by safety guard");
            self.events.publish(EngineEvent::SafetyLimitReached {
                context: format!("shield for ticket {}", trade.ticket),
                reason,
            });
            return Ok(None);
        }

        let instrument = self.config.instrument(&trade.symbol);
        let gap = trade.stop_distance();
        let gap_pips = gap / instrument.pip_size;
        if gap_pips <= 0.0 {
            return Err(Error::Validation(format!(
                "trade {} has zero stop distance, nothing to shield",
                trade.ticket
            )));
        }

        // Two legs at the nominal lot; shrink proportionally if the combined
        // risk does not fit the room left after the reserved buffer
        let nominal_lot = trade.lot * self.config.shield.lot_multiplier;
        let total_risk = gap_pips * instrument.pip_value_per_lot * nominal_lot * 2.0;
        let available = daily_room - self.config.shield.min_daily_buffer;

        let lot_per_leg = if available <= 0.0 {
            0.0
        } else if total_risk > available {
            floor_to_step(nominal_lot * (available / total_risk), instrument.lot_step)
        } else {
            floor_to_step(nominal_lot, instrument.lot_step)
        };

        if lot_per_leg < instrument.min_lot {
            warn!(
                ticket = trade.ticket,
                nominal_lot,
                available,
                "Shield would fall below minimum lot, not placed"
            );
            self.events.publish(EngineEvent::SafetyLimitReached {
                context: format!("shield for ticket {}", trade.ticket),
                reason: format!(
                    "shield lot below broker minimum (${:.2} available after buffer)",
                    available.max(0.0)
                ),
            });
            return Ok(None);
        }

        let hedge_direction = trade.direction.opposite();
        let shield_id = Uuid::new_v4().to_string();

        // Hedge legs: profit as price falls toward the protected stop, exit
        // if it recovers to the protected entry
        let request = OrderRequest {
            symbol: trade.symbol.clone(),
            direction: hedge_direction,
            lot: lot_per_leg,
            stop_price: trade.entry_price,
            target_price: trade.stop_price,
            comment: format!("{}:shield", shield_id),
        };

        let first = self.gateway.place_order(&request).await?;
        let second = match self.gateway.place_order(&request).await {
            Ok(ticket) => ticket,
            Err(e) => {
                // Best-effort unwind of the orphan leg; the original error wins
                if let Err(close_err) = self.gateway.close_order(first).await {
                    warn!(ticket = first, "Orphan shield leg not closed: {}", close_err);
                }
                return Err(e);
            }
        };

        let recovery_level = trade.stop_price
            + trade.direction.sign() * self.config.recovery.recovery_fraction * gap;

        let status = ShieldStatus {
            id: shield_id.clone(),
            protected_ticket: trade.ticket,
            hedge_tickets: [first, second],
            symbol: trade.symbol.clone(),
            direction: hedge_direction,
            lot_per_leg,
            recovery_level,
            activated_at: chrono::Utc::now(),
            state: ShieldState::Active,
        };

        self.safety.record(SafetyAction::Shield).await;
        self.shields
            .write()
            .await
            .insert(shield_id.clone(), status.clone());

        info!(
            shield = %shield_id,
            protected = trade.ticket,
            lot_per_leg,
            recovery_level,
            "Shield active"
        );
        self.events.publish(EngineEvent::ShieldActivated {
            shield_id: shield_id.clone(),
            protected_ticket: trade.ticket,
            symbol: trade.symbol.clone(),
            lot_per_leg,
            recovery_level,
        });

        self.spawn_watcher(&status, trade.direction);
        Ok(Some(status))
    }

    /// Unwind both hedge legs and close the shield. Returns the combined
    /// realized P&L of the legs.
    pub async fn kill_switch(&self, shield_id: &str) -> Result<f64> {
        let shield = {
            let shields = self.shields.read().await;
            shields
                .get(shield_id)
                .cloned()
                .ok_or_else(|| Error::ChainNotFound(shield_id.to_string()))?
        };
        if shield.state != ShieldState::Active {
            debug!(shield = %shield_id, state = ?shield.state, "Kill switch on inactive shield");
            return Ok(0.0);
        }

        if let Some((_, watcher)) = self.watchers.remove(shield_id) {
            watcher.abort();
        }

        let mut pnl = 0.0;
        let mut failed = false;
        for ticket in shield.hedge_tickets {
            match self.gateway.close_order(ticket).await {
                Ok(leg_pnl) => pnl += leg_pnl,
                // Already-closed legs are fine; anything else leaves the
                // shield in a state the operator must inspect
                Err(Error::TradeNotFound(_)) => {}
                Err(e) => {
                    warn!(shield = %shield_id, ticket, "Hedge leg not closed: {}", e);
                    failed = true;
                }
            }
        }

        let final_state = if failed {
            ShieldState::Failed
        } else {
            ShieldState::Closed
        };
        {
            let mut shields = self.shields.write().await;
            if let Some(s) = shields.get_mut(shield_id) {
                s.state = final_state;
            }
        }

        if pnl < 0.0 {
            self.safety.record_loss(pnl).await;
        }

        info!(shield = %shield_id, pnl, state = ?final_state, "Shield unwound");
        self.events.publish(EngineEvent::ShieldClosed {
            shield_id: shield_id.to_string(),
            symbol: shield.symbol,
            realized_pnl: pnl,
        });

        if failed {
            return Err(Error::Gateway(format!(
                "shield {} left a hedge leg on the book",
                shield_id
            )));
        }
        Ok(pnl)
    }

    pub async fn get(&self, shield_id: &str) -> Option<ShieldStatus> {
        self.shields.read().await.get(shield_id).cloned()
    }

    /// Active shield protecting a given ticket, if any
    pub async fn shield_for_ticket(&self, ticket: u64) -> Option<ShieldStatus> {
        self.shields
            .read()
            .await
            .values()
            .find(|s| s.protected_ticket == ticket && s.state == ShieldState::Active)
            .cloned()
    }

    pub async fn live_shields(&self) -> Vec<ShieldStatus> {
        self.shields.read().await.values().cloned().collect()
    }

    /// Restore shields from a snapshot and re-arm watchers for the active ones
    pub async fn restore(self: &Arc<Self>, restored: Vec<ShieldStatus>) {
        let mut active = Vec::new();
        {
            let mut shields = self.shields.write().await;
            for shield in restored {
                if shield.state == ShieldState::Active {
                    active.push(shield.clone());
                }
                shields.insert(shield.id.clone(), shield);
            }
        }
        for shield in active {
            // The protected direction is opposite the hedge legs
            self.spawn_watcher(&shield, shield.direction.opposite());
        }
    }

    /// Kill-switch watcher: fires on the recovery level or the hold ceiling,
    /// whichever comes first
    fn spawn_watcher(self: &Arc<Self>, shield: &ShieldStatus, protected_direction: Direction) {
        let controller = self.clone();
        let shield_id = shield.id.clone();
        let symbol = shield.symbol.clone();
        let recovery_level = shield.recovery_level;
        let activated_at = shield.activated_at;
        let max_hold = Duration::from_secs(self.config.shield.max_hold_secs);
        let poll = Duration::from_millis(self.config.shield.poll_interval_ms);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll);
            loop {
                ticker.tick().await;

                let elapsed = (chrono::Utc::now() - activated_at)
                    .to_std()
                    .unwrap_or_default();
                let expired = elapsed >= max_hold;

                let recovered = match controller.gateway.get_price(&symbol).await {
                    Ok(quote) => {
                        let price = quote.close_price(protected_direction);
                        match protected_direction {
                            Direction::Buy => price >= recovery_level,
                            Direction::Sell => price <= recovery_level,
                        }
                    }
                    Err(e) => {
                        warn!(shield = %shield_id, "Shield price poll failed: {}", e);
                        false
                    }
                };

                if recovered || expired {
                    info!(
                        shield = %shield_id,
                        recovered,
                        expired,
                        "Kill switch firing"
                    );
                    if let Err(e) = controller.kill_switch(&shield_id).await {
                        warn!(shield = %shield_id, "Kill switch failed: {}", e);
                    }
                    break;
                }
            }
        });

        self.watchers.insert(shield.id.clone(), handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyConfig;
    use crate::engine::types::{OrderRole, TradeStatus};
    use crate::gateway::paper::PaperGateway;

    fn protected_trade(lot: f64) -> Trade {
        // BUY at 1.1000, stop 50 pips below
        Trade {
            ticket: 1,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            entry_price: 1.1000,
            stop_price: 1.0950,
            target_price: 1.1090,
            lot,
            order_role: OrderRole::TrendTrail,
            chain_id: Some("chain-1".into()),
            profit_level: None,
            status: TradeStatus::Open,
            opened_at: chrono::Utc::now(),
        }
    }

    fn controller(config: Config, gateway: Arc<PaperGateway>) -> Arc<ReverseShieldController> {
        let config = Arc::new(config);
        Arc::new(ReverseShieldController::new(
            gateway,
            Arc::new(SafetyGuard::new(config.safety.clone())),
            EventBus::new(64),
            config,
        ))
    }

    #[tokio::test]
    async fn test_full_size_shield_when_budget_allows() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0952, 1.0954);
        let controller = controller(Config::default(), gateway.clone());

        // 0.02 lot x 0.5 = 0.01 per leg; risk 50 x $10 x 0.01 x 2 = $10
        // against $100 room - $50 buffer = $50
        let shield = controller
            .activate(&protected_trade(0.02), 100.0)
            .await
            .unwrap()
            .unwrap();

        assert!((shield.lot_per_leg - 0.01).abs() < 1e-9);
        assert_eq!(shield.direction, Direction::Sell);
        assert_eq!(gateway.open_order_count(), 2);
        // 70% of the 50 pip gap above the stop
        assert!((shield.recovery_level - 1.0985).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shield_shrinks_to_fit_budget() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0952, 1.0954);
        let controller = controller(Config::default(), gateway.clone());

        // Nominal 1.0 x 0.5 = 0.5 lot per leg; risk 50 x $10 x 0.5 x 2 = $500.
        // Available = $100 - $50 buffer = $50, so scale by 0.1: 0.05 per leg.
        let shield = controller
            .activate(&protected_trade(1.0), 100.0)
            .await
            .unwrap()
            .unwrap();

        assert!((shield.lot_per_leg - 0.05).abs() < 1e-9);
        assert_eq!(gateway.open_order_count(), 2);
    }

    #[tokio::test]
    async fn test_shield_cancelled_below_min_lot() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0952, 1.0954);
        let controller = controller(Config::default(), gateway.clone());

        // Available = $50.5 - $50 = $0.5; 0.5 lot x 0.5/500 = 0.0005, under min
        let shield = controller
            .activate(&protected_trade(1.0), 50.5)
            .await
            .unwrap();

        assert!(shield.is_none());
        assert_eq!(gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_no_room_after_buffer() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0952, 1.0954);
        let controller = controller(Config::default(), gateway.clone());

        let shield = controller
            .activate(&protected_trade(0.02), 30.0)
            .await
            .unwrap();
        assert!(shield.is_none());
        assert_eq!(gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_shield_is_noop() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0952, 1.0954);
        let mut config = Config::default();
        config.shield.enabled = false;
        let controller = controller(config, gateway.clone());

        let shield = controller
            .activate(&protected_trade(0.02), 100.0)
            .await
            .unwrap();
        assert!(shield.is_none());
    }

    #[tokio::test]
    async fn test_daily_shield_limit_denies() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0952, 1.0954);
        let mut config = Config::default();
        config.safety = SafetyConfig {
            daily_shield_limit: 0,
            ..SafetyConfig::default()
        };
        let controller = controller(config, gateway.clone());

        let shield = controller
            .activate(&protected_trade(0.02), 100.0)
            .await
            .unwrap();
        assert!(shield.is_none());
        assert_eq!(gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_switch_fires_on_recovery_level() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0952, 1.0954);
        let mut config = Config::default();
        config.shield.poll_interval_ms = 10;
        let controller = controller(config, gateway.clone());

        let shield = controller
            .activate(&protected_trade(0.02), 100.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gateway.open_order_count(), 2);

        // Price recovers past 1.0985: watcher must unwind both legs
        gateway.set_price("EURUSD", 1.0990, 1.0992);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(gateway.open_order_count(), 0);
        assert_eq!(
            controller.get(&shield.id).await.unwrap().state,
            ShieldState::Closed
        );
    }

    #[tokio::test]
    async fn test_kill_switch_fires_on_hold_ceiling() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0952, 1.0954);
        let mut config = Config::default();
        config.shield.poll_interval_ms = 10;
        config.shield.max_hold_secs = 0;
        let controller = controller(config, gateway.clone());

        let shield = controller
            .activate(&protected_trade(0.02), 100.0)
            .await
            .unwrap()
            .unwrap();

        // Price stays below the recovery level; the ceiling closes it anyway
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(gateway.open_order_count(), 0);
        assert_eq!(
            controller.get(&shield.id).await.unwrap().state,
            ShieldState::Closed
        );
    }

    #[tokio::test]
    async fn test_manual_kill_switch_is_idempotent() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0952, 1.0954);
        let controller = controller(Config::default(), gateway.clone());

        let shield = controller
            .activate(&protected_trade(0.02), 100.0)
            .await
            .unwrap()
            .unwrap();

        controller.kill_switch(&shield.id).await.unwrap();
        assert_eq!(gateway.open_order_count(), 0);

        // Second call is a no-op, not an error
        let pnl = controller.kill_switch(&shield.id).await.unwrap();
        assert_eq!(pnl, 0.0);
    }
}
