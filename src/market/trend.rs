//! Trend scoring
//!
//! Scores recent price action into BULLISH/BEARISH/NEUTRAL from three votes:
//! net momentum, fast/slow moving-average cross, and higher-high/lower-low
//! structure. Two of three must agree for a directional bias; anything less
//! is NEUTRAL. Used to gate SL-Hunt re-entries: a stopped-out BUY is only
//! re-entered into a market that still looks bullish.

use tracing::debug;

use crate::config::TrendConfig;
use crate::gateway::{Candle, Direction};

/// Directional bias of recent price action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendBias {
    Bullish,
    Bearish,
    Neutral,
}

impl TrendBias {
    /// Whether this bias supports entering in `direction`
    pub fn supports(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (TrendBias::Bullish, Direction::Buy) | (TrendBias::Bearish, Direction::Sell)
        )
    }
}

pub struct TrendScorer {
    config: TrendConfig,
}

impl TrendScorer {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    /// Score a candle window (oldest first) into a bias
    pub fn score(&self, candles: &[Candle], pip_size: f64) -> TrendBias {
        if candles.len() < self.config.slow_period {
            return TrendBias::Neutral;
        }

        let momentum = self.momentum_vote(candles, pip_size);
        let ma_cross = self.ma_cross_vote(candles);
        let structure = self.structure_vote(candles);

        let bullish = [momentum, ma_cross, structure]
            .iter()
            .filter(|v| **v == Some(Direction::Buy))
            .count();
        let bearish = [momentum, ma_cross, structure]
            .iter()
            .filter(|v| **v == Some(Direction::Sell))
            .count();

        let bias = if bullish >= 2 {
            TrendBias::Bullish
        } else if bearish >= 2 {
            TrendBias::Bearish
        } else {
            TrendBias::Neutral
        };

        debug!(
            ?momentum,
            ?ma_cross,
            ?structure,
            ?bias,
            "Trend votes"
        );

        bias
    }

    /// Score and check alignment in one call
    pub fn aligned(&self, candles: &[Candle], pip_size: f64, direction: Direction) -> bool {
        self.score(candles, pip_size).supports(direction)
    }

    /// Net close-to-close move over the window, against a pip threshold
    fn momentum_vote(&self, candles: &[Candle], pip_size: f64) -> Option<Direction> {
        let first = candles[candles.len() - self.config.slow_period].close;
        let last = candles[candles.len() - 1].close;
        let net_pips = (last - first) / pip_size;

        if net_pips >= self.config.momentum_threshold_pips {
            Some(Direction::Buy)
        } else if net_pips <= -self.config.momentum_threshold_pips {
            Some(Direction::Sell)
        } else {
            None
        }
    }

    /// Fast SMA above slow SMA is bullish, below is bearish
    fn ma_cross_vote(&self, candles: &[Candle]) -> Option<Direction> {
        let fast = sma(candles, self.config.fast_period);
        let slow = sma(candles, self.config.slow_period);

        if fast > slow {
            Some(Direction::Buy)
        } else if fast < slow {
            Some(Direction::Sell)
        } else {
            None
        }
    }

    /// Compare the two most recent half-windows: higher highs AND higher
    /// lows vote bullish, lower highs AND lower lows vote bearish
    fn structure_vote(&self, candles: &[Candle]) -> Option<Direction> {
        let window = self.config.slow_period.min(candles.len());
        let recent = &candles[candles.len() - window..];
        let (older, newer) = recent.split_at(window / 2);

        let older_high = older.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let older_low = older.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let newer_high = newer.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let newer_low = newer.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        if newer_high > older_high && newer_low > older_low {
            Some(Direction::Buy)
        } else if newer_high < older_high && newer_low < older_low {
            Some(Direction::Sell)
        } else {
            None
        }
    }
}

/// Simple moving average of the last `period` closes
fn sma(candles: &[Candle], period: usize) -> f64 {
    let window = &candles[candles.len() - period..];
    window.iter().map(|c| c.close).sum::<f64>() / period as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, close: f64) -> Candle {
        Candle {
            open,
            high: open.max(close) + 0.0002,
            low: open.min(close) - 0.0002,
            close,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Steadily rising closes, one pip per candle
    fn rising(count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let open = 1.1000 + i as f64 * 0.0001;
                candle(open, open + 0.0001)
            })
            .collect()
    }

    fn falling(count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let open = 1.1000 - i as f64 * 0.0001;
                candle(open, open - 0.0001)
            })
            .collect()
    }

    fn scorer() -> TrendScorer {
        TrendScorer::new(TrendConfig::default())
    }

    #[test]
    fn test_uptrend_scores_bullish() {
        let bias = scorer().score(&rising(50), 0.0001);
        assert_eq!(bias, TrendBias::Bullish);
        assert!(bias.supports(Direction::Buy));
        assert!(!bias.supports(Direction::Sell));
    }

    #[test]
    fn test_downtrend_scores_bearish() {
        let bias = scorer().score(&falling(50), 0.0001);
        assert_eq!(bias, TrendBias::Bearish);
        assert!(bias.supports(Direction::Sell));
    }

    #[test]
    fn test_flat_market_is_neutral() {
        let candles: Vec<Candle> = (0..50).map(|_| candle(1.1000, 1.1000)).collect();
        assert_eq!(scorer().score(&candles, 0.0001), TrendBias::Neutral);
    }

    #[test]
    fn test_short_history_is_neutral() {
        assert_eq!(scorer().score(&rising(10), 0.0001), TrendBias::Neutral);
    }

    #[test]
    fn test_aligned_gates_direction() {
        let candles = rising(50);
        assert!(scorer().aligned(&candles, 0.0001, Direction::Buy));
        assert!(!scorer().aligned(&candles, 0.0001, Direction::Sell));
    }
}
