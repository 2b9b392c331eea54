//! REST bridge to the broker execution gateway
//!
//! Each call is retried with bounded exponential backoff; transient errors
//! (timeouts, connection drops, 5xx) are retried, everything else is
//! permanent and surfaces immediately.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::gateway::{BrokerGateway, Candle, OrderRequest, Quote};

/// HTTP client for a broker gateway REST bridge
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    config: GatewayConfig,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    ticket: u64,
}

#[derive(Debug, Deserialize)]
struct CloseOrderResponse {
    realized_pnl: f64,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::GatewayConnection(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            config,
        })
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.retry_base_delay_ms),
            max_interval: Duration::from_millis(self.config.retry_base_delay_ms * 4),
            max_elapsed_time: Some(Duration::from_millis(
                self.config.retry_base_delay_ms * 2u64.pow(self.config.max_retries),
            )),
            ..Default::default()
        }
    }

    /// Run one gateway call with the bounded retry policy
    async fn with_retry<T, F, Fut>(&self, what: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let result = retry(self.backoff(), || async {
            match call().await {
                Ok(v) => Ok(v),
                Err(e) if e.is_retryable() => {
                    warn!("Retryable gateway error on {}: {}", what, e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => {
                    error!("Permanent gateway error on {}: {}", what, e);
                    Err(backoff::Error::permanent(e))
                }
            }
        })
        .await?;

        Ok(result)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Gateway(format!("server error {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Validation(format!(
                "gateway rejected request ({}): {}",
                status, body
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl BrokerGateway for HttpGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<u64> {
        let url = format!("{}/orders", self.base_url);
        self.with_retry("place_order", || async {
            let response = self.client.post(&url).json(request).send().await?;
            let response = Self::check_status(response).await?;
            let parsed: PlaceOrderResponse = response.json().await?;
            Ok(parsed.ticket)
        })
        .await
    }

    async fn close_order(&self, ticket: u64) -> Result<f64> {
        let url = format!("{}/orders/{}/close", self.base_url, ticket);
        self.with_retry("close_order", || async {
            let response = self.client.post(&url).send().await?;
            let response = Self::check_status(response).await?;
            let parsed: CloseOrderResponse = response.json().await?;
            Ok(parsed.realized_pnl)
        })
        .await
    }

    async fn get_price(&self, symbol: &str) -> Result<Quote> {
        let url = format!("{}/price/{}", self.base_url, symbol);
        self.with_retry("get_price", || async {
            let response = self.client.get(&url).send().await?;
            let response = Self::check_status(response).await?;
            let quote: Quote = response.json().await?;
            Ok(quote)
        })
        .await
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe_minutes: u32,
        count: usize,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/candles/{}?timeframe={}&count={}",
            self.base_url, symbol, timeframe_minutes, count
        );
        self.with_retry("get_candles", || async {
            let response = self.client.get(&url).send().await?;
            let response = Self::check_status(response).await?;
            let candles: Vec<Candle> = response.json().await?;
            Ok(candles)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let config = GatewayConfig {
            endpoint: "http://localhost:8787/".into(),
            ..GatewayConfig::default()
        };
        let gateway = HttpGateway::new(config).unwrap();
        assert_eq!(gateway.base_url, "http://localhost:8787");
    }

    #[test]
    fn test_backoff_bounded() {
        let gateway = HttpGateway::new(GatewayConfig::default()).unwrap();
        let backoff = gateway.backoff();
        // Retries must give up eventually; unbounded retry would freeze a chain
        assert!(backoff.max_elapsed_time.is_some());
    }
}
