//! In-memory paper gateway
//!
//! Fills every order instantly at the quoted price and marks P&L against
//! whatever quote the test (or the dry-run tick generator) last set. No
//! slippage, no requotes: this simulates the gateway contract, not the market.

use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::gateway::{BrokerGateway, Candle, Direction, OrderRequest, Quote};

/// An order resting on the paper book
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub lot: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub comment: String,
}

/// Simulated broker gateway
pub struct PaperGateway {
    next_ticket: AtomicU64,
    orders: DashMap<u64, PaperOrder>,
    prices: DashMap<String, Quote>,
    candles: DashMap<String, Vec<Candle>>,
    /// Smallest price increment used for P&L conversion
    pip_size: f64,
    /// Account-currency value of one pip for one lot
    pip_value_per_lot: f64,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self {
            next_ticket: AtomicU64::new(1),
            orders: DashMap::new(),
            prices: DashMap::new(),
            candles: DashMap::new(),
            pip_size: 0.0001,
            pip_value_per_lot: 10.0,
        }
    }

    /// Set the current quote for a symbol
    pub fn set_price(&self, symbol: &str, bid: f64, ask: f64) {
        self.prices.insert(symbol.to_string(), Quote { bid, ask });
    }

    /// Append a candle to a symbol's history (oldest first)
    pub fn push_candle(&self, symbol: &str, candle: Candle) {
        self.candles
            .entry(symbol.to_string())
            .or_default()
            .push(candle);
    }

    /// Seed a random-walk candle history for dry-run mode
    pub fn seed_random_walk(&self, symbol: &str, start_price: f64, count: usize) {
        let mut rng = rand::thread_rng();
        let mut price = start_price;
        let mut history = Vec::with_capacity(count);
        let mut timestamp = chrono::Utc::now() - chrono::Duration::minutes(count as i64);

        for _ in 0..count {
            let drift: f64 = rng.gen_range(-10.0..10.0) * self.pip_size;
            let open = price;
            let close = price + drift;
            let high = open.max(close) + rng.gen_range(0.0..3.0) * self.pip_size;
            let low = open.min(close) - rng.gen_range(0.0..3.0) * self.pip_size;
            history.push(Candle {
                open,
                high,
                low,
                close,
                timestamp,
            });
            price = close;
            timestamp += chrono::Duration::minutes(1);
        }

        let spread = 2.0 * self.pip_size;
        self.set_price(symbol, price, price + spread);
        self.candles.insert(symbol.to_string(), history);
    }

    /// Open order by ticket, if still on the book
    pub fn order(&self, ticket: u64) -> Option<PaperOrder> {
        self.orders.get(&ticket).map(|o| o.clone())
    }

    pub fn open_order_count(&self) -> usize {
        self.orders.len()
    }
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<u64> {
        if request.lot <= 0.0 {
            return Err(Error::Validation(format!(
                "non-positive lot {} for {}",
                request.lot, request.symbol
            )));
        }

        let quote = self
            .prices
            .get(request.symbol.as_str())
            .map(|q| *q)
            .ok_or_else(|| Error::Gateway(format!("no quote for {}", request.symbol)))?;

        // Longs fill at ask, shorts at bid
        let entry_price = match request.direction {
            Direction::Buy => quote.ask,
            Direction::Sell => quote.bid,
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.orders.insert(
            ticket,
            PaperOrder {
                ticket,
                symbol: request.symbol.clone(),
                direction: request.direction,
                lot: request.lot,
                entry_price,
                stop_price: request.stop_price,
                target_price: request.target_price,
                comment: request.comment.clone(),
            },
        );

        debug!(
            ticket,
            symbol = %request.symbol,
            direction = %request.direction,
            lot = request.lot,
            "Paper order filled"
        );

        Ok(ticket)
    }

    async fn close_order(&self, ticket: u64) -> Result<f64> {
        let (_, order) = self
            .orders
            .remove(&ticket)
            .ok_or(Error::TradeNotFound(ticket))?;

        let quote = self
            .prices
            .get(order.symbol.as_str())
            .map(|q| *q)
            .ok_or_else(|| Error::Gateway(format!("no quote for {}", order.symbol)))?;

        let close_price = quote.close_price(order.direction);
        let pips = (close_price - order.entry_price) * order.direction.sign() / self.pip_size;
        let pnl = pips * self.pip_value_per_lot * order.lot;

        debug!(ticket, pnl, "Paper order closed");
        Ok(pnl)
    }

    async fn get_price(&self, symbol: &str) -> Result<Quote> {
        self.prices
            .get(symbol)
            .map(|q| *q)
            .ok_or_else(|| Error::Gateway(format!("no quote for {}", symbol)))
    }

    async fn get_candles(
        &self,
        symbol: &str,
        _timeframe_minutes: u32,
        count: usize,
    ) -> Result<Vec<Candle>> {
        let history = self
            .candles
            .get(symbol)
            .map(|c| c.clone())
            .unwrap_or_default();
        let start = history.len().saturating_sub(count);
        Ok(history[start..].to_vec())
    }
}
