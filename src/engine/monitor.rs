//! Recovery window monitor
//!
//! One polling task per pending recovery episode. Each task watches live
//! price until either the recovery threshold is crossed in the favorable
//! direction (emit `Recovered`) or the window deadline lapses (emit
//! `TimedOut`), then removes itself from the registry. Outcomes flow back
//! over an mpsc channel; monitors never touch chain state directly.
//!
//! Exactly one monitor may exist per target id: starting a second replaces
//! the first, and `stop` on an unknown id is a no-op.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::engine::types::{MonitorOutcome, RecoveryMonitorEntry};
use crate::gateway::{BrokerGateway, Direction};

pub struct RecoveryWindowMonitor {
    gateway: Arc<dyn BrokerGateway>,
    outcome_tx: mpsc::Sender<MonitorOutcome>,
    tasks: Arc<DashMap<u64, JoinHandle<()>>>,
    poll_interval: Duration,
}

impl RecoveryWindowMonitor {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        outcome_tx: mpsc::Sender<MonitorOutcome>,
        poll_interval_ms: u64,
    ) -> Self {
        Self {
            gateway,
            outcome_tx,
            tasks: Arc::new(DashMap::new()),
            poll_interval: Duration::from_millis(poll_interval_ms),
        }
    }

    /// Start watching one recovery episode. Replaces any existing monitor
    /// for the same target id.
    pub fn start(&self, entry: RecoveryMonitorEntry) {
        let id = entry.target_id;
        if let Some((_, old)) = self.tasks.remove(&id) {
            warn!(target = id, "Replacing existing recovery monitor");
            old.abort();
        }

        info!(
            target = id,
            symbol = %entry.symbol,
            threshold = entry.threshold_price,
            deadline = %entry.deadline,
            "Recovery monitor started"
        );

        let gateway = self.gateway.clone();
        let outcome_tx = self.outcome_tx.clone();
        let tasks = self.tasks.clone();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);

            let outcome = loop {
                ticker.tick().await;

                // A favorable crossing seen on the last tick of the window
                // still counts; the deadline only wins when price has not
                // crossed by then
                match gateway.get_price(&entry.symbol).await {
                    Ok(quote) => {
                        if threshold_crossed(entry.direction, entry.threshold_price, &quote) {
                            break MonitorOutcome::Recovered {
                                price: quote.close_price(entry.direction),
                                entry: entry.clone(),
                            };
                        }
                    }
                    Err(e) => {
                        // Transient feed failures are tolerated; the deadline bounds them
                        warn!(target = id, "Price poll failed: {}", e);
                    }
                }

                if chrono::Utc::now() > entry.deadline {
                    break MonitorOutcome::TimedOut {
                        entry: entry.clone(),
                    };
                }
            };

            tasks.remove(&id);
            if outcome_tx.send(outcome).await.is_err() {
                debug!(target = id, "Outcome channel closed, monitor result dropped");
            }
        });

        self.tasks.insert(id, handle);
    }

    /// Stop a monitor. Idempotent: unknown or already-stopped ids are a no-op.
    pub fn stop(&self, target_id: u64) {
        if let Some((_, handle)) = self.tasks.remove(&target_id) {
            handle.abort();
            info!(target = target_id, "Recovery monitor stopped");
        }
    }

    /// Abort every active monitor (shutdown path)
    pub fn stop_all(&self) {
        let ids: Vec<u64> = self.tasks.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.stop(id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Favorable crossing test, inclusive at the threshold.
///
/// A stopped-out BUY recovers when price climbs back to the threshold; a
/// SELL when it falls back to it. The comparison uses the side the re-entry
/// would mark against (bid for longs, ask for shorts).
fn threshold_crossed(direction: Direction, threshold: f64, quote: &crate::gateway::Quote) -> bool {
    match direction {
        Direction::Buy => quote.bid >= threshold,
        Direction::Sell => quote.ask <= threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{MonitorContext, ReentryVariant};
    use crate::gateway::paper::PaperGateway;
    use crate::gateway::Quote;

    fn entry(deadline_ms: i64, threshold: f64) -> RecoveryMonitorEntry {
        RecoveryMonitorEntry {
            target_id: 1,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            threshold_price: threshold,
            deadline: chrono::Utc::now() + chrono::Duration::milliseconds(deadline_ms),
            context: MonitorContext::Reentry {
                chain_id: "chain-1".into(),
                variant: ReentryVariant::SlHunt,
            },
        }
    }

    #[test]
    fn test_threshold_inclusive_at_boundary() {
        // Fires at exactly f x D, not below
        let at = Quote { bid: 1.0970, ask: 1.0972 };
        let below = Quote { bid: 1.09699, ask: 1.09719 };
        assert!(threshold_crossed(Direction::Buy, 1.0970, &at));
        assert!(!threshold_crossed(Direction::Buy, 1.0970, &below));

        let sell_at = Quote { bid: 1.1028, ask: 1.1030 };
        let sell_above = Quote { bid: 1.10281, ask: 1.103001 };
        assert!(threshold_crossed(Direction::Sell, 1.1030, &sell_at));
        assert!(!threshold_crossed(Direction::Sell, 1.1030, &sell_above));
    }

    #[tokio::test]
    async fn test_recovery_fires_when_price_crosses() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0910, 1.0912);

        let (tx, mut rx) = mpsc::channel(4);
        let monitor = RecoveryWindowMonitor::new(gateway.clone(), tx, 10);
        monitor.start(entry(5_000, 1.0970));

        // Below threshold: nothing yet
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        gateway.set_price("EURUSD", 1.0970, 1.0972);
        let outcome = rx.recv().await.unwrap();
        match outcome {
            MonitorOutcome::Recovered { price, entry } => {
                assert!((price - 1.0970).abs() < 1e-9);
                assert_eq!(entry.target_id, 1);
            }
            other => panic!("expected Recovered, got {:?}", other),
        }
        assert_eq!(monitor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_when_window_lapses() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0910, 1.0912);

        let (tx, mut rx) = mpsc::channel(4);
        let monitor = RecoveryWindowMonitor::new(gateway, tx, 10);
        monitor.start(entry(60, 1.0970));

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome, MonitorOutcome::TimedOut { .. }));
        assert_eq!(monitor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_crossing_on_final_tick_beats_deadline() {
        // Window already lapsed but price sits past the threshold: the
        // crossing must win on that last look
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0970, 1.0972);

        let (tx, mut rx) = mpsc::channel(4);
        let monitor = RecoveryWindowMonitor::new(gateway, tx, 10);
        monitor.start(entry(-1, 1.0970));

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome, MonitorOutcome::Recovered { .. }));
    }

    #[tokio::test]
    async fn test_second_start_replaces_first() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0910, 1.0912);

        let (tx, _rx) = mpsc::channel(4);
        let monitor = RecoveryWindowMonitor::new(gateway, tx, 10);
        monitor.start(entry(5_000, 1.0970));
        monitor.start(entry(5_000, 1.0980));

        assert_eq!(monitor.active_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("EURUSD", 1.0910, 1.0912);

        let (tx, _rx) = mpsc::channel(4);
        let monitor = RecoveryWindowMonitor::new(gateway, tx, 10);
        monitor.start(entry(5_000, 1.0970));

        monitor.stop(1);
        monitor.stop(1); // already stopped
        monitor.stop(99); // never existed
        assert_eq!(monitor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_price_feed_errors_tolerated() {
        // No quote set: get_price fails every poll; timeout still lands
        let gateway = Arc::new(PaperGateway::new());
        let (tx, mut rx) = mpsc::channel(4);
        let monitor = RecoveryWindowMonitor::new(gateway, tx, 10);
        monitor.start(entry(80, 1.0970));

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome, MonitorOutcome::TimedOut { .. }));
    }
}
