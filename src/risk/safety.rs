//! Safety guard
//!
//! Single choke point for daily/concurrent/profit-protection gating. Every
//! component calls `check` before acting and `record` immediately after
//! commit; counters are day-scoped and reset at the local-day boundary.
//! All mutation goes through the one write lock - this is the only shared
//! mutable state in the engine.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::SafetyConfig;

/// Action classes the guard meters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyAction {
    Recovery,
    Shield,
}

/// Result of a safety check
#[derive(Debug, Clone)]
pub struct SafetyCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl SafetyCheck {
    fn permit() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Day-scoped counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCounters {
    pub date: NaiveDate,
    pub recovery_attempts: u32,
    pub recovery_losses: f64,
    /// All realized losses today, recovery or not
    pub daily_losses: f64,
    pub concurrent_recoveries: u32,
    pub shields_activated: u32,
    pub booked_profit: f64,
}

impl SafetyCounters {
    fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            recovery_attempts: 0,
            recovery_losses: 0.0,
            daily_losses: 0.0,
            concurrent_recoveries: 0,
            shields_activated: 0,
            booked_profit: 0.0,
        }
    }
}

pub struct SafetyGuard {
    config: SafetyConfig,
    counters: RwLock<SafetyCounters>,
}

impl SafetyGuard {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            counters: RwLock::new(SafetyCounters::fresh(today())),
        }
    }

    /// Check whether an action is allowed under the current counters.
    /// Does not reserve anything; call `record` after commit.
    pub async fn check(&self, action: SafetyAction) -> SafetyCheck {
        let mut counters = self.counters.write().await;
        rollover(&mut counters);

        match action {
            SafetyAction::Recovery => {
                if counters.booked_profit >= self.config.profit_protection_threshold {
                    return SafetyCheck::deny(format!(
                        "profit protection: ${:.2} booked today, threshold ${:.2}",
                        counters.booked_profit, self.config.profit_protection_threshold
                    ));
                }
                if counters.recovery_attempts >= self.config.daily_recovery_limit {
                    return SafetyCheck::deny(format!(
                        "daily recovery limit reached ({}/{})",
                        counters.recovery_attempts, self.config.daily_recovery_limit
                    ));
                }
                if counters.concurrent_recoveries >= self.config.concurrent_recovery_limit {
                    return SafetyCheck::deny(format!(
                        "concurrent recovery limit reached ({}/{})",
                        counters.concurrent_recoveries, self.config.concurrent_recovery_limit
                    ));
                }
                SafetyCheck::permit()
            }
            SafetyAction::Shield => {
                if counters.shields_activated >= self.config.daily_shield_limit {
                    return SafetyCheck::deny(format!(
                        "daily shield limit reached ({}/{})",
                        counters.shields_activated, self.config.daily_shield_limit
                    ));
                }
                SafetyCheck::permit()
            }
        }
    }

    /// Record a committed action
    pub async fn record(&self, action: SafetyAction) {
        let mut counters = self.counters.write().await;
        rollover(&mut counters);

        match action {
            SafetyAction::Recovery => {
                counters.recovery_attempts += 1;
                counters.concurrent_recoveries += 1;
                info!(
                    attempts = counters.recovery_attempts,
                    concurrent = counters.concurrent_recoveries,
                    "Recovery recorded"
                );
            }
            SafetyAction::Shield => {
                counters.shields_activated += 1;
                info!(shields = counters.shields_activated, "Shield recorded");
            }
        }
    }

    /// Release one concurrent recovery slot (episode resolved or timed out)
    pub async fn release_recovery(&self) {
        let mut counters = self.counters.write().await;
        rollover(&mut counters);
        if counters.concurrent_recoveries == 0 {
            warn!("release_recovery with no recovery in flight");
            return;
        }
        counters.concurrent_recoveries -= 1;
    }

    /// Book a loss realized by a recovery re-entry
    pub async fn record_recovery_loss(&self, amount: f64) {
        let mut counters = self.counters.write().await;
        rollover(&mut counters);
        counters.recovery_losses += amount.abs();
        counters.daily_losses += amount.abs();
    }

    /// Book any realized loss (feeds the remaining daily room)
    pub async fn record_loss(&self, amount: f64) {
        let mut counters = self.counters.write().await;
        rollover(&mut counters);
        counters.daily_losses += amount.abs();
    }

    /// Loss budget still available today
    pub async fn daily_room(&self, daily_loss_limit: f64) -> f64 {
        let mut counters = self.counters.write().await;
        rollover(&mut counters);
        (daily_loss_limit - counters.daily_losses).max(0.0)
    }

    /// Book realized profit (feeds the profit-protection threshold)
    pub async fn record_booked_profit(&self, amount: f64) {
        let mut counters = self.counters.write().await;
        rollover(&mut counters);
        counters.booked_profit += amount;
    }

    /// Current counters (for the status surface)
    pub async fn snapshot(&self) -> SafetyCounters {
        let mut counters = self.counters.write().await;
        rollover(&mut counters);
        counters.clone()
    }
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Reset counters on local-day change
fn rollover(counters: &mut SafetyCounters) {
    let now = today();
    if counters.date != now {
        info!(old = %counters.date, new = %now, "Safety counters reset at day boundary");
        *counters = SafetyCounters::fresh(now);
    }
}
