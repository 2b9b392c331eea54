//! Core data model: trades, chains, shields and monitor entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::gateway::Direction;

/// Which of the two entry legs an order belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    /// Trailing stop, ratio-based target
    TrendTrail,
    /// Fixed dollar risk and profit, feeds the pyramid
    ProfitTrail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// One live or closed order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub lot: f64,
    pub order_role: OrderRole,
    pub chain_id: Option<String>,
    pub profit_level: Option<u32>,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
}

impl Trade {
    /// Stop distance in price units
    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_price).abs()
    }
}

/// Normalized entry request from the alert-ingestion collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: String,
    pub direction: Direction,
    /// Stop distance override in pips; falls back to the configured default
    pub stop_pips: Option<f64>,
    /// Lot override; falls back to tier-based sizing
    pub lot: Option<f64>,
}

/// Why an order left the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
}

/// Close notification from the gateway feed
#[derive(Debug, Clone)]
pub struct CloseEvent {
    pub ticket: u64,
    pub reason: CloseReason,
    pub close_price: f64,
    pub realized_pnl: f64,
}

/// Which flavor of re-entry a chain runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReentryVariant {
    /// Stop-out, wait for the retrace past the recovery threshold
    SlHunt,
    /// Profit target hit, re-enter if price keeps running
    TpContinuation,
    /// Manual exit, same continuation rule
    ExitContinuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Active,
    RecoveryMode,
    Resolved,
    TimedOut,
    Cancelled,
}

impl ChainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChainStatus::Resolved | ChainStatus::TimedOut | ChainStatus::Cancelled
        )
    }
}

/// Pending recovery episode bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEpisode {
    pub variant: ReentryVariant,
    pub target_price: f64,
    pub started_at: DateTime<Utc>,
    /// Price the episode anchors on (stop price for SL-Hunt, close price
    /// for the continuation variants)
    pub anchor_price: f64,
    /// Ticket of the closed order the monitor is keyed on
    pub target_ticket: u64,
}

/// A linked sequence of re-entries sharing one id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReentryChain {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Stop distance of the original entry (pips)
    pub original_stop_pips: f64,
    /// Monotonically non-decreasing until the chain resolves
    pub current_level: u32,
    pub max_level: u32,
    pub status: ChainStatus,
    pub episode: Option<RecoveryEpisode>,
    pub attempts_used: u32,
}

impl ReentryChain {
    pub fn new(
        id: String,
        symbol: String,
        direction: Direction,
        original_stop_pips: f64,
        max_level: u32,
    ) -> Self {
        Self {
            id,
            symbol,
            direction,
            original_stop_pips,
            current_level: 0,
            max_level,
            status: ChainStatus::Active,
            episode: None,
            attempts_used: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PyramidStatus {
    Active,
    /// Stopped out, single recovery episode pending
    SlHunt,
    Completed,
    Cancelled,
}

/// Profit-booking pyramid state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitBookingChain {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub level: u32,
    /// Tickets live at the current level
    pub level_tickets: BTreeSet<u64>,
    /// Tickets at the current level whose target already booked
    pub booked_tickets: BTreeSet<u64>,
    pub cumulative_profit: f64,
    pub lot_per_order: f64,
    pub status: PyramidStatus,
    /// Pyramid SL-Hunt is hard-capped at one attempt, unlike the general
    /// re-entry machine's configurable count
    pub recovery_used: bool,
}

impl ProfitBookingChain {
    pub fn new(
        id: String,
        symbol: String,
        direction: Direction,
        first_ticket: u64,
        lot_per_order: f64,
    ) -> Self {
        Self {
            id,
            symbol,
            direction,
            level: 0,
            level_tickets: BTreeSet::from([first_ticket]),
            booked_tickets: BTreeSet::new(),
            cumulative_profit: 0.0,
            lot_per_order,
            status: PyramidStatus::Active,
            recovery_used: false,
        }
    }

    /// True once every order at the current level has booked its target
    pub fn level_complete(&self) -> bool {
        !self.level_tickets.is_empty() && self.booked_tickets == self.level_tickets
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShieldState {
    Active,
    Closed,
    Failed,
}

/// Hedge pairing for a protected trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldStatus {
    pub id: String,
    pub protected_ticket: u64,
    pub hedge_tickets: [u64; 2],
    pub symbol: String,
    /// Direction of the hedge legs (opposite the protected trade)
    pub direction: Direction,
    pub lot_per_leg: f64,
    /// Price level at which the kill switch fires
    pub recovery_level: f64,
    pub activated_at: DateTime<Utc>,
    pub state: ShieldState,
}

/// What a recovery monitor watches, and who gets the outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorContext {
    Reentry {
        chain_id: String,
        variant: ReentryVariant,
    },
    Pyramid {
        chain_id: String,
    },
}

/// Ephemeral entry describing one pending recovery watch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryMonitorEntry {
    /// Ticket of the closed order being watched for recovery
    pub target_id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub threshold_price: f64,
    pub deadline: DateTime<Utc>,
    pub context: MonitorContext,
}

/// Result a monitor task reports back over the outcome channel
#[derive(Debug, Clone)]
pub enum MonitorOutcome {
    /// Price crossed the recovery threshold in the favorable direction
    Recovered {
        entry: RecoveryMonitorEntry,
        price: f64,
    },
    /// Window lapsed first
    TimedOut { entry: RecoveryMonitorEntry },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_status_terminal() {
        assert!(ChainStatus::Resolved.is_terminal());
        assert!(ChainStatus::TimedOut.is_terminal());
        assert!(ChainStatus::Cancelled.is_terminal());
        assert!(!ChainStatus::Active.is_terminal());
        assert!(!ChainStatus::RecoveryMode.is_terminal());
    }

    #[test]
    fn test_level_complete_requires_every_ticket() {
        let mut chain = ProfitBookingChain::new(
            "chain-1".into(),
            "EURUSD".into(),
            Direction::Buy,
            10,
            0.10,
        );
        chain.level = 1;
        chain.level_tickets = BTreeSet::from([10, 11]);
        chain.booked_tickets = BTreeSet::from([10]);
        assert!(!chain.level_complete());

        chain.booked_tickets.insert(11);
        assert!(chain.level_complete());
    }

    #[test]
    fn test_trade_stop_distance() {
        let trade = Trade {
            ticket: 1,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            entry_price: 1.1000,
            stop_price: 1.0900,
            target_price: 1.1180,
            lot: 0.10,
            order_role: OrderRole::TrendTrail,
            chain_id: None,
            profit_level: None,
            status: TradeStatus::Open,
            opened_at: Utc::now(),
        };
        assert!((trade.stop_distance() - 0.0100).abs() < 1e-9);
    }
}
