//! Configuration loading and validation
//!
//! Every option the engine recognizes is enumerated here and range-checked at
//! startup. Unknown instrument classes, impossible fractions and empty pyramid
//! sequences are rejected before any order can be placed.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub reentry: ReentryConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub pyramid: PyramidConfig,
    #[serde(default)]
    pub shield: ShieldConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub trend: TrendConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Per-symbol overrides; anything not listed uses `InstrumentConfig::default()`
    #[serde(default)]
    pub instruments: HashMap<String, InstrumentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_gateway_endpoint() -> String {
    "http://127.0.0.1:8787".to_string()
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    250
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_gateway_endpoint(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// Dual-order entry parameters
#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Stop distance for the trend-trailing leg (pips)
    #[serde(default = "default_stop_pips")]
    pub default_stop_pips: f64,
    /// Reward:risk ratio for the trend-trailing leg target
    #[serde(default = "default_reward_ratio")]
    pub reward_ratio: f64,
    /// Fixed dollar risk for the profit-trailing leg stop
    #[serde(default = "default_fixed_risk_usd")]
    pub fixed_risk_usd: f64,
    /// Fixed dollar profit for the profit-trailing leg target
    #[serde(default = "default_fixed_profit_usd")]
    pub fixed_profit_usd: f64,
}

fn default_stop_pips() -> f64 {
    30.0
}
fn default_reward_ratio() -> f64 {
    1.8
}
fn default_fixed_risk_usd() -> f64 {
    10.0
}
fn default_fixed_profit_usd() -> f64 {
    7.0
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_stop_pips: default_stop_pips(),
            reward_ratio: default_reward_ratio(),
            fixed_risk_usd: default_fixed_risk_usd(),
            fixed_profit_usd: default_fixed_profit_usd(),
        }
    }
}

/// Re-entry state machine options
#[derive(Debug, Clone, Deserialize)]
pub struct ReentryConfig {
    #[serde(default = "default_true")]
    pub sl_hunt_enabled: bool,
    #[serde(default = "default_true")]
    pub tp_continuation_enabled: bool,
    #[serde(default = "default_true")]
    pub exit_continuation_enabled: bool,
    /// Maximum re-entries per chain
    #[serde(default = "default_max_chain_levels")]
    pub max_chain_levels: u32,
    /// Stop distance shrinks by this fraction per level
    #[serde(default = "default_sl_reduction")]
    pub sl_reduction_per_level: f64,
    /// Stop distance never shrinks below this (pips)
    #[serde(default = "default_min_stop_pips")]
    pub min_stop_pips: f64,
    /// Require trend alignment before an SL-Hunt re-entry fires
    #[serde(default = "default_true")]
    pub require_trend_alignment: bool,
}

fn default_max_chain_levels() -> u32 {
    5
}
fn default_sl_reduction() -> f64 {
    0.10
}
fn default_min_stop_pips() -> f64 {
    5.0
}

impl Default for ReentryConfig {
    fn default() -> Self {
        Self {
            sl_hunt_enabled: true,
            tp_continuation_enabled: true,
            exit_continuation_enabled: true,
            max_chain_levels: default_max_chain_levels(),
            sl_reduction_per_level: default_sl_reduction(),
            min_stop_pips: default_min_stop_pips(),
            require_trend_alignment: true,
        }
    }
}

/// Recovery window monitoring
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Fraction of the stop distance price must retrace before re-entry
    #[serde(default = "default_recovery_fraction")]
    pub recovery_fraction: f64,
    /// Price poll interval for recovery monitors
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Window length per instrument class (minutes)
    #[serde(default = "default_window_minutes")]
    pub window_minutes: HashMap<String, u64>,
}

fn default_recovery_fraction() -> f64 {
    0.70
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_window_minutes() -> HashMap<String, u64> {
    HashMap::from([
        ("major".to_string(), 30),
        ("cross".to_string(), 45),
        ("exotic".to_string(), 60),
    ])
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recovery_fraction: default_recovery_fraction(),
            poll_interval_ms: default_poll_interval_ms(),
            window_minutes: default_window_minutes(),
        }
    }
}

/// Profit pyramid options
#[derive(Debug, Clone, Deserialize)]
pub struct PyramidConfig {
    /// Parallel orders per level, level 0 first
    #[serde(default = "default_pyramid_levels")]
    pub levels: Vec<u32>,
    /// Fixed dollar profit target per pyramid order
    #[serde(default = "default_fixed_profit_usd")]
    pub profit_target_per_order: f64,
    /// Fixed dollar risk per pyramid order stop
    #[serde(default = "default_fixed_risk_usd")]
    pub order_risk_usd: f64,
}

fn default_pyramid_levels() -> Vec<u32> {
    vec![1, 2, 4, 8, 16]
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            levels: default_pyramid_levels(),
            profit_target_per_order: default_fixed_profit_usd(),
            order_risk_usd: default_fixed_risk_usd(),
        }
    }
}

impl PyramidConfig {
    /// Highest level index
    pub fn max_level(&self) -> u32 {
        self.levels.len().saturating_sub(1) as u32
    }

    /// Orders at a level, None past the top
    pub fn orders_at_level(&self, level: u32) -> Option<u32> {
        self.levels.get(level as usize).copied()
    }

    /// Total profit if every order of every level books its target
    pub fn total_potential_profit(&self) -> f64 {
        self.levels.iter().sum::<u32>() as f64 * self.profit_target_per_order
    }
}

/// Reverse shield options
#[derive(Debug, Clone, Deserialize)]
pub struct ShieldConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Shield lot = protected lot x this multiplier
    #[serde(default = "default_shield_multiplier")]
    pub lot_multiplier: f64,
    /// Daily room that must remain untouched by shield risk
    #[serde(default = "default_shield_buffer")]
    pub min_daily_buffer: f64,
    /// Kill switch elapsed-time ceiling
    #[serde(default = "default_shield_max_hold_secs")]
    pub max_hold_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_shield_multiplier() -> f64 {
    0.5
}
fn default_shield_buffer() -> f64 {
    50.0
}
fn default_shield_max_hold_secs() -> u64 {
    3_600
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lot_multiplier: default_shield_multiplier(),
            min_daily_buffer: default_shield_buffer(),
            max_hold_secs: default_shield_max_hold_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Process-wide safety caps
#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_daily_recovery_limit")]
    pub daily_recovery_limit: u32,
    #[serde(default = "default_concurrent_recovery_limit")]
    pub concurrent_recovery_limit: u32,
    #[serde(default = "default_daily_shield_limit")]
    pub daily_shield_limit: u32,
    /// Once daily booked profit reaches this, recovery actions stop
    #[serde(default = "default_profit_protection")]
    pub profit_protection_threshold: f64,
}

fn default_daily_recovery_limit() -> u32 {
    5
}
fn default_concurrent_recovery_limit() -> u32 {
    3
}
fn default_daily_shield_limit() -> u32 {
    3
}
fn default_profit_protection() -> f64 {
    100.0
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            daily_recovery_limit: default_daily_recovery_limit(),
            concurrent_recovery_limit: default_concurrent_recovery_limit(),
            daily_shield_limit: default_daily_shield_limit(),
            profit_protection_threshold: default_profit_protection(),
        }
    }
}

/// Account tier for position sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    Conservative,
    Balanced,
    Aggressive,
}

impl AccountTier {
    /// Base lot per $1000 of balance
    pub fn lots_per_thousand(&self) -> f64 {
        match self {
            AccountTier::Conservative => 0.01,
            AccountTier::Balanced => 0.02,
            AccountTier::Aggressive => 0.05,
        }
    }
}

/// Risk budget options
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Account balance assumed at startup (overridden by gateway account info
    /// when the bridge exposes it)
    #[serde(default = "default_balance")]
    pub account_balance: f64,
    #[serde(default = "default_account_tier")]
    pub account_tier: AccountTier,
    /// Maximum total loss allowed per day
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,
    /// Fraction of remaining daily room usable by a single dual entry
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

fn default_balance() -> f64 {
    1_000.0
}
fn default_account_tier() -> AccountTier {
    AccountTier::Balanced
}
fn default_daily_loss_limit() -> f64 {
    100.0
}
fn default_safety_margin() -> f64 {
    0.95
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_balance: default_balance(),
            account_tier: default_account_tier(),
            daily_loss_limit: default_daily_loss_limit(),
            safety_margin: default_safety_margin(),
        }
    }
}

/// Trend scoring options
#[derive(Debug, Clone, Deserialize)]
pub struct TrendConfig {
    #[serde(default = "default_trend_timeframe")]
    pub timeframe_minutes: u32,
    #[serde(default = "default_candle_count")]
    pub candle_count: usize,
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,
    #[serde(default = "default_slow_period")]
    pub slow_period: usize,
    /// Net move over the window below this many pips counts as flat
    #[serde(default = "default_momentum_threshold")]
    pub momentum_threshold_pips: f64,
}

fn default_trend_timeframe() -> u32 {
    5
}
fn default_candle_count() -> usize {
    50
}
fn default_fast_period() -> usize {
    10
}
fn default_slow_period() -> usize {
    20
}
fn default_momentum_threshold() -> f64 {
    5.0
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            timeframe_minutes: default_trend_timeframe(),
            candle_count: default_candle_count(),
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
            momentum_threshold_pips: default_momentum_threshold(),
        }
    }
}

/// Persistence options
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Live-chain snapshot cadence
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_data_dir() -> String {
    "data".to_string()
}
fn default_snapshot_interval_secs() -> u64 {
    60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

/// Per-symbol trading parameters
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    #[serde(default = "default_pip_size")]
    pub pip_size: f64,
    /// Account-currency value of one pip for one lot
    #[serde(default = "default_pip_value")]
    pub pip_value_per_lot: f64,
    #[serde(default = "default_min_lot")]
    pub min_lot: f64,
    #[serde(default = "default_lot_step")]
    pub lot_step: f64,
    /// Instrument class, selects the recovery window length
    #[serde(default = "default_instrument_class")]
    pub class: String,
}

fn default_pip_size() -> f64 {
    0.0001
}
fn default_pip_value() -> f64 {
    10.0
}
fn default_min_lot() -> f64 {
    0.01
}
fn default_lot_step() -> f64 {
    0.01
}
fn default_instrument_class() -> String {
    "major".to_string()
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            pip_size: default_pip_size(),
            pip_value_per_lot: default_pip_value(),
            min_lot: default_min_lot(),
            lot_step: default_lot_step(),
            class: default_instrument_class(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file + environment
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix RECOVERY_)
            .add_source(
                config::Environment::with_prefix("RECOVERY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Parameters for a symbol, defaults if not explicitly configured
    pub fn instrument(&self, symbol: &str) -> InstrumentConfig {
        self.instruments
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// Recovery window length for a symbol (minutes)
    pub fn recovery_window_minutes(&self, symbol: &str) -> u64 {
        let class = self.instrument(symbol).class;
        self.recovery
            .window_minutes
            .get(&class)
            .copied()
            .unwrap_or(30)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.recovery.recovery_fraction)
            || self.recovery.recovery_fraction == 0.0
        {
            anyhow::bail!(
                "recovery.recovery_fraction must be in (0, 1], got {}",
                self.recovery.recovery_fraction
            );
        }

        if self.recovery.window_minutes.is_empty() {
            anyhow::bail!("recovery.window_minutes must name at least one instrument class");
        }

        for (symbol, instrument) in &self.instruments {
            if !self.recovery.window_minutes.contains_key(&instrument.class) {
                anyhow::bail!(
                    "instrument {} has unknown class '{}' (no recovery window configured)",
                    symbol,
                    instrument.class
                );
            }
            if instrument.pip_size <= 0.0 || instrument.pip_value_per_lot <= 0.0 {
                anyhow::bail!("instrument {} has non-positive pip parameters", symbol);
            }
            if instrument.lot_step <= 0.0 || instrument.min_lot <= 0.0 {
                anyhow::bail!("instrument {} has non-positive lot parameters", symbol);
            }
        }

        if self.pyramid.levels.is_empty() {
            anyhow::bail!("pyramid.levels must not be empty");
        }
        if self.pyramid.levels.iter().any(|&n| n == 0) {
            anyhow::bail!("pyramid.levels entries must all be >= 1");
        }
        if self.pyramid.profit_target_per_order <= 0.0 {
            anyhow::bail!("pyramid.profit_target_per_order must be positive");
        }

        if self.trading.reward_ratio < 1.0 {
            anyhow::bail!(
                "trading.reward_ratio must be >= 1.0, got {}",
                self.trading.reward_ratio
            );
        }
        if self.trading.default_stop_pips <= 0.0 {
            anyhow::bail!("trading.default_stop_pips must be positive");
        }

        if self.reentry.max_chain_levels == 0 {
            anyhow::bail!("reentry.max_chain_levels must be >= 1");
        }
        let max_reduction =
            self.reentry.sl_reduction_per_level * self.reentry.max_chain_levels as f64;
        if max_reduction >= 1.0 {
            anyhow::bail!(
                "reentry.sl_reduction_per_level x max_chain_levels must stay below 1.0 \
                 (stop distance would reach zero)"
            );
        }

        if !(0.0..=1.0).contains(&self.risk.safety_margin) || self.risk.safety_margin == 0.0 {
            anyhow::bail!(
                "risk.safety_margin must be in (0, 1], got {}",
                self.risk.safety_margin
            );
        }
        if self.risk.daily_loss_limit <= 0.0 {
            anyhow::bail!("risk.daily_loss_limit must be positive");
        }

        if self.shield.lot_multiplier <= 0.0 {
            anyhow::bail!("shield.lot_multiplier must be positive");
        }

        if self.trend.fast_period >= self.trend.slow_period {
            anyhow::bail!(
                "trend.fast_period ({}) must be shorter than trend.slow_period ({})",
                self.trend.fast_period,
                self.trend.slow_period
            );
        }
        if self.trend.candle_count < self.trend.slow_period {
            anyhow::bail!("trend.candle_count must cover trend.slow_period");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide endpoint credentials)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Gateway:
    endpoint: {}
    timeout: {}ms
    max_retries: {}
  Trading:
    stop: {} pips, reward {}x
    profit leg: risk ${} / target ${}
  Re-entry:
    sl_hunt: {}, tp_continuation: {}, exit_continuation: {}
    max levels: {}, reduction/level: {}
  Recovery:
    fraction: {}
    windows: {:?}
  Pyramid:
    levels: {:?} (target ${}/order, potential ${})
  Shield:
    enabled: {}, multiplier: {}, buffer: ${}, max hold: {}s
  Safety:
    daily recovery: {}, concurrent: {}, daily shields: {}
    profit protection: ${}
  Risk:
    balance: ${}, tier: {:?}
    daily loss limit: ${}, margin: {}
"#,
            mask_url(&self.gateway.endpoint),
            self.gateway.timeout_ms,
            self.gateway.max_retries,
            self.trading.default_stop_pips,
            self.trading.reward_ratio,
            self.trading.fixed_risk_usd,
            self.trading.fixed_profit_usd,
            self.reentry.sl_hunt_enabled,
            self.reentry.tp_continuation_enabled,
            self.reentry.exit_continuation_enabled,
            self.reentry.max_chain_levels,
            self.reentry.sl_reduction_per_level,
            self.recovery.recovery_fraction,
            self.recovery.window_minutes,
            self.pyramid.levels,
            self.pyramid.profit_target_per_order,
            self.pyramid.total_potential_profit(),
            self.shield.enabled,
            self.shield.lot_multiplier,
            self.shield.min_daily_buffer,
            self.shield.max_hold_secs,
            self.safety.daily_recovery_limit,
            self.safety.concurrent_recovery_limit,
            self.safety.daily_shield_limit,
            self.safety.profit_protection_threshold,
            self.risk.account_balance,
            self.risk.account_tier,
            self.risk.daily_loss_limit,
            self.risk.safety_margin,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            trading: TradingConfig::default(),
            reentry: ReentryConfig::default(),
            recovery: RecoveryConfig::default(),
            pyramid: PyramidConfig::default(),
            shield: ShieldConfig::default(),
            safety: SafetyConfig::default(),
            risk: RiskConfig::default(),
            trend: TrendConfig::default(),
            store: StoreConfig::default(),
            instruments: HashMap::new(),
        }
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}
