//! Dual-order coordinator
//!
//! Every entry becomes two differently-managed orders sharing one chain id:
//! a trend-trailing leg (distance stop, ratio target) and a profit-trailing
//! leg (fixed dollar risk, fixed dollar profit). Legs are submitted
//! independently; if the second fails after the first fills, the orphan leg
//! is reported as a distinguishable partial-fill condition, never rolled
//! back silently.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::types::{EntrySignal, OrderRole, Trade, TradeStatus};
use crate::error::{Error, Result};
use crate::gateway::{BrokerGateway, OrderRequest};
use crate::risk::RiskGovernor;

/// Outcome of a dual entry: both legs as live trades
#[derive(Debug, Clone)]
pub struct DualOpen {
    pub chain_id: String,
    pub trend_trail: Trade,
    pub profit_trail: Trade,
    pub lot_per_order: f64,
    pub stop_pips: f64,
}

pub struct DualOrderCoordinator {
    gateway: Arc<dyn BrokerGateway>,
    governor: RiskGovernor,
    config: Arc<Config>,
}

impl DualOrderCoordinator {
    pub fn new(gateway: Arc<dyn BrokerGateway>, governor: RiskGovernor, config: Arc<Config>) -> Self {
        Self {
            gateway,
            governor,
            config,
        }
    }

    /// Open a dual entry for a fresh signal, minting a new chain id
    pub async fn open_dual(&self, signal: &EntrySignal, daily_room: f64) -> Result<DualOpen> {
        if signal.symbol.is_empty() {
            return Err(Error::Validation("empty symbol".into()));
        }
        if let Some(pips) = signal.stop_pips {
            if pips <= 0.0 {
                return Err(Error::Validation(format!(
                    "non-positive stop distance: {} pips",
                    pips
                )));
            }
        }

        let stop_pips = signal
            .stop_pips
            .unwrap_or(self.config.trading.default_stop_pips);
        let instrument = self.config.instrument(&signal.symbol);
        let lot = signal.lot.unwrap_or_else(|| {
            self.governor.size_position(
                self.config.risk.account_balance,
                self.config.risk.account_tier,
                &instrument,
            )
        });

        let chain_id = Uuid::new_v4().to_string();
        self.open_with_chain(
            &chain_id,
            &signal.symbol,
            signal.direction,
            stop_pips,
            lot,
            daily_room,
        )
        .await
    }

    /// Open a re-entry under an existing chain id with tier-based sizing
    pub async fn open_reentry(
        &self,
        chain_id: &str,
        symbol: &str,
        direction: crate::gateway::Direction,
        stop_pips: f64,
        daily_room: f64,
    ) -> Result<DualOpen> {
        let instrument = self.config.instrument(symbol);
        let lot = self.governor.size_position(
            self.config.risk.account_balance,
            self.config.risk.account_tier,
            &instrument,
        );
        self.open_with_chain(chain_id, symbol, direction, stop_pips, lot, daily_room)
            .await
    }

    /// Open a dual entry under an existing chain id (re-entries preserve it)
    pub async fn open_with_chain(
        &self,
        chain_id: &str,
        symbol: &str,
        direction: crate::gateway::Direction,
        stop_pips: f64,
        lot: f64,
        daily_room: f64,
    ) -> Result<DualOpen> {
        let instrument = self.config.instrument(symbol);

        // Risk gate: accept the smart-lot suggestion, abandon if there is none
        let check =
            self.governor
                .validate_dual_order_risk(&instrument, lot, 2, daily_room, stop_pips);
        let lot = if check.valid {
            lot
        } else {
            match check.smart_lot {
                Some(smart_lot) => {
                    warn!(
                        symbol,
                        requested = lot,
                        smart_lot,
                        "Risk budget breach, downsizing to smart lot"
                    );
                    smart_lot
                }
                None => {
                    return Err(Error::RiskLimit {
                        reason: check.reason.unwrap_or_else(|| "risk budget exceeded".into()),
                        smart_lot: None,
                    });
                }
            }
        };

        let quote = self.gateway.get_price(symbol).await?;
        let entry_price = match direction {
            crate::gateway::Direction::Buy => quote.ask,
            crate::gateway::Direction::Sell => quote.bid,
        };
        let sign = direction.sign();
        let pip = instrument.pip_size;

        // TREND_TRAIL: distance stop, ratio target (trailing seed at entry stop)
        let trend_stop = entry_price - sign * stop_pips * pip;
        let trend_target =
            entry_price + sign * stop_pips * self.config.trading.reward_ratio * pip;

        // PROFIT_TRAIL: stop and target from fixed dollar amounts
        let risk_pips = self.config.trading.fixed_risk_usd / (instrument.pip_value_per_lot * lot);
        let profit_pips =
            self.config.trading.fixed_profit_usd / (instrument.pip_value_per_lot * lot);
        let profit_stop = entry_price - sign * risk_pips * pip;
        let profit_target = entry_price + sign * profit_pips * pip;

        let trend_request = OrderRequest {
            symbol: symbol.to_string(),
            direction,
            lot,
            stop_price: trend_stop,
            target_price: trend_target,
            comment: format!("{}:trend_trail", chain_id),
        };
        let profit_request = OrderRequest {
            symbol: symbol.to_string(),
            direction,
            lot,
            stop_price: profit_stop,
            target_price: profit_target,
            comment: format!("{}:profit_trail", chain_id),
        };

        // Two independent gateway calls; no rollback of the first on failure
        // of the second (explicit inconsistency window)
        let trend_ticket = self.gateway.place_order(&trend_request).await?;
        let profit_ticket = match self.gateway.place_order(&profit_request).await {
            Ok(ticket) => ticket,
            Err(e) => {
                return Err(Error::PartialFill {
                    filled_ticket: trend_ticket,
                    filled_role: OrderRole::TrendTrail,
                    failed_role: OrderRole::ProfitTrail,
                    source: Box::new(e),
                });
            }
        };

        info!(
            chain = %chain_id,
            symbol,
            %direction,
            lot,
            trend_ticket,
            profit_ticket,
            "Dual entry opened"
        );

        let now = chrono::Utc::now();
        let trend_trail = Trade {
            ticket: trend_ticket,
            symbol: symbol.to_string(),
            direction,
            entry_price,
            stop_price: trend_stop,
            target_price: trend_target,
            lot,
            order_role: OrderRole::TrendTrail,
            chain_id: Some(chain_id.to_string()),
            profit_level: None,
            status: TradeStatus::Open,
            opened_at: now,
        };
        let profit_trail = Trade {
            ticket: profit_ticket,
            symbol: symbol.to_string(),
            direction,
            entry_price,
            stop_price: profit_stop,
            target_price: profit_target,
            lot,
            order_role: OrderRole::ProfitTrail,
            chain_id: Some(chain_id.to_string()),
            profit_level: Some(0),
            status: TradeStatus::Open,
            opened_at: now,
        };

        Ok(DualOpen {
            chain_id: chain_id.to_string(),
            trend_trail,
            profit_trail,
            lot_per_order: lot,
            stop_pips,
        })
    }
}
