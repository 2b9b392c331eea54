//! Trade persistence
//!
//! Closed trades are archived append-only to a JSONL file; live chain and
//! shield state is snapshotted periodically as one JSON document so a crash
//! does not silently lose open recovery state. The store is authoritative
//! for history; live state in memory wins while the process runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::engine::types::{ProfitBookingChain, ReentryChain, ShieldStatus, Trade, TradeStatus};
use crate::error::{Error, Result};

/// Snapshot of everything that must survive a restart
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub reentry_chains: Vec<ReentryChain>,
    pub pyramid_chains: Vec<ProfitBookingChain>,
    pub shields: Vec<ShieldStatus>,
}

pub struct TradeStore {
    trades: RwLock<HashMap<u64, Trade>>,
    archive_path: PathBuf,
    snapshot_path: PathBuf,
}

impl TradeStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| Error::Persistence(format!("create {}: {}", data_dir.display(), e)))?;

        Ok(Self {
            trades: RwLock::new(HashMap::new()),
            archive_path: data_dir.join("trades.jsonl"),
            snapshot_path: data_dir.join("live_state.json"),
        })
    }

    /// Record a newly opened trade
    pub async fn save_trade(&self, trade: Trade) {
        let mut trades = self.trades.write().await;
        debug!(ticket = trade.ticket, symbol = %trade.symbol, "Trade saved");
        trades.insert(trade.ticket, trade);
    }

    /// Apply a field update to a live trade
    pub async fn update_trade<F>(&self, ticket: u64, update: F) -> Result<()>
    where
        F: FnOnce(&mut Trade),
    {
        let mut trades = self.trades.write().await;
        let trade = trades.get_mut(&ticket).ok_or(Error::TradeNotFound(ticket))?;
        update(trade);
        Ok(())
    }

    /// Mark a trade closed and archive it
    pub async fn close_trade(&self, ticket: u64) -> Result<Trade> {
        let mut trades = self.trades.write().await;
        let mut trade = trades.remove(&ticket).ok_or(Error::TradeNotFound(ticket))?;
        trade.status = TradeStatus::Closed;
        drop(trades);

        self.archive(&trade).await?;
        Ok(trade)
    }

    pub async fn get_trade(&self, ticket: u64) -> Option<Trade> {
        self.trades.read().await.get(&ticket).cloned()
    }

    pub async fn open_trades(&self) -> Vec<Trade> {
        self.trades.read().await.values().cloned().collect()
    }

    pub async fn open_trade_count(&self) -> usize {
        self.trades.read().await.len()
    }

    /// Append one closed trade to the JSONL archive
    async fn archive(&self, trade: &Trade) -> Result<()> {
        let mut line = serde_json::to_string(trade)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.archive_path)
            .await
            .map_err(|e| Error::Persistence(format!("open archive: {}", e)))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Persistence(format!("append archive: {}", e)))?;

        debug!(ticket = trade.ticket, "Trade archived");
        Ok(())
    }

    /// Write the live-state snapshot (atomic via temp file + rename)
    pub async fn write_snapshot(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let data = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.snapshot_path.with_extension("json.tmp");

        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Persistence(format!("write snapshot: {}", e)))?;
        tokio::fs::rename(&tmp, &self.snapshot_path)
            .await
            .map_err(|e| Error::Persistence(format!("commit snapshot: {}", e)))?;

        debug!(
            chains = snapshot.reentry_chains.len() + snapshot.pyramid_chains.len(),
            shields = snapshot.shields.len(),
            "Live state snapshot written"
        );
        Ok(())
    }

    /// Load the last snapshot, empty if none exists
    pub async fn load_snapshot(&self) -> Result<EngineSnapshot> {
        if !self.snapshot_path.exists() {
            return Ok(EngineSnapshot::default());
        }

        let data = tokio::fs::read_to_string(&self.snapshot_path)
            .await
            .map_err(|e| Error::Persistence(format!("read snapshot: {}", e)))?;

        let snapshot: EngineSnapshot = serde_json::from_str(&data)?;
        info!(
            reentry = snapshot.reentry_chains.len(),
            pyramid = snapshot.pyramid_chains.len(),
            shields = snapshot.shields.len(),
            "Live state snapshot restored"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::OrderRole;
    use crate::gateway::Direction;

    fn test_trade(ticket: u64) -> Trade {
        Trade {
            ticket,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            entry_price: 1.1000,
            stop_price: 1.0900,
            target_price: 1.1180,
            lot: 0.10,
            order_role: OrderRole::TrendTrail,
            chain_id: Some("chain-1".into()),
            profit_level: None,
            status: TradeStatus::Open,
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_close_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = TradeStore::open(dir.path()).await.unwrap();

        store.save_trade(test_trade(1)).await;
        store.save_trade(test_trade(2)).await;
        assert_eq!(store.open_trade_count().await, 2);

        let closed = store.close_trade(1).await.unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(store.open_trade_count().await, 1);

        let archive = std::fs::read_to_string(dir.path().join("trades.jsonl")).unwrap();
        assert_eq!(archive.lines().count(), 1);
        assert!(archive.contains("\"ticket\":1"));
    }

    #[tokio::test]
    async fn test_close_unknown_trade() {
        let dir = tempfile::tempdir().unwrap();
        let store = TradeStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.close_trade(7).await,
            Err(Error::TradeNotFound(7))
        ));
    }

    #[tokio::test]
    async fn test_update_trade() {
        let dir = tempfile::tempdir().unwrap();
        let store = TradeStore::open(dir.path()).await.unwrap();
        store.save_trade(test_trade(1)).await;

        store
            .update_trade(1, |t| t.stop_price = 1.0950)
            .await
            .unwrap();
        assert_eq!(store.get_trade(1).await.unwrap().stop_price, 1.0950);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TradeStore::open(dir.path()).await.unwrap();

        // Nothing written yet: empty default
        let empty = store.load_snapshot().await.unwrap();
        assert!(empty.reentry_chains.is_empty());

        let snapshot = EngineSnapshot {
            taken_at: Some(Utc::now()),
            reentry_chains: vec![ReentryChain::new(
                "chain-1".into(),
                "EURUSD".into(),
                Direction::Buy,
                100.0,
                5,
            )],
            pyramid_chains: vec![],
            shields: vec![],
        };
        store.write_snapshot(&snapshot).await.unwrap();

        let restored = store.load_snapshot().await.unwrap();
        assert_eq!(restored.reentry_chains.len(), 1);
        assert_eq!(restored.reentry_chains[0].id, "chain-1");
    }
}
