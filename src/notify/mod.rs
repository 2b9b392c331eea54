//! Operator event bus
//!
//! The engine emits one structured event per externally-visible transition;
//! delivery and formatting belong to the messaging collaborator. A broadcast
//! channel lets any number of sinks subscribe; the default sink just logs.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::engine::types::{CloseReason, ReentryVariant};
use crate::gateway::Direction;

/// Structured events exposed to the operator channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    EntryOpened {
        chain_id: String,
        symbol: String,
        direction: Direction,
        trend_ticket: u64,
        profit_ticket: u64,
        lot_per_order: f64,
    },
    OrderClosed {
        ticket: u64,
        symbol: String,
        reason: CloseReason,
        close_price: f64,
        realized_pnl: f64,
    },
    RecoveryStarted {
        chain_id: String,
        symbol: String,
        direction: Direction,
        variant: Option<ReentryVariant>,
        threshold_price: f64,
        window_minutes: u64,
    },
    RecoveryResolved {
        chain_id: String,
        symbol: String,
        level: u32,
        price: f64,
    },
    RecoveryTimedOut {
        chain_id: String,
        symbol: String,
    },
    ChainAdvanced {
        chain_id: String,
        symbol: String,
        level: u32,
        orders_at_level: u32,
        cumulative_profit: f64,
    },
    ChainCompleted {
        chain_id: String,
        symbol: String,
        total_profit: f64,
    },
    ShieldActivated {
        shield_id: String,
        protected_ticket: u64,
        symbol: String,
        lot_per_leg: f64,
        recovery_level: f64,
    },
    ShieldClosed {
        shield_id: String,
        symbol: String,
        realized_pnl: f64,
    },
    SafetyLimitReached {
        context: String,
        reason: String,
    },
}

/// Broadcast fan-out for engine events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Lagging or absent subscribers never block the engine.
    pub fn publish(&self, event: EngineEvent) {
        debug!(?event, "Engine event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Default sink: log every event at info level until the bus closes
pub fn spawn_log_sink(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(?event, "operator event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    info!(skipped, "operator event sink lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::RecoveryTimedOut {
            chain_id: "chain-1".into(),
            symbol: "EURUSD".into(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::RecoveryTimedOut { chain_id, .. } => assert_eq!(chain_id, "chain-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(EngineEvent::SafetyLimitReached {
            context: "recovery".into(),
            reason: "daily cap".into(),
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = EngineEvent::ChainCompleted {
            chain_id: "chain-9".into(),
            symbol: "EURUSD".into(),
            total_profit: 217.0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"chain_completed\""));
    }
}
