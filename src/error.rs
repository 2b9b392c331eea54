//! Error types for the recovery engine

use thiserror::Error;

use crate::engine::types::OrderRole;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the recovery engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Signal/parameter validation (rejected before any order is placed)
    #[error("Validation error: {0}")]
    Validation(String),

    // Risk governor declined - caller must accept smart_lot or abandon
    #[error("Risk limit exceeded: {reason} (suggested lot: {smart_lot:?})")]
    RiskLimit {
        reason: String,
        smart_lot: Option<f64>,
    },

    // Broker gateway errors (transient, retried with bounded backoff)
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Gateway timeout after {0}ms")]
    GatewayTimeout(u64),

    #[error("Gateway connection failed: {0}")]
    GatewayConnection(String),

    // One leg of a dual order succeeded, the other failed. Requires manual
    // or policy-driven reconciliation; never merged into a generic failure.
    #[error("Partial fill: {filled_role:?} leg open as ticket {filled_ticket}, {failed_role:?} leg failed: {source}")]
    PartialFill {
        filled_ticket: u64,
        filled_role: OrderRole,
        failed_role: OrderRole,
        #[source]
        source: Box<Error>,
    },

    // Safety guard denied an action - hard stop, no retry
    #[error("Safety limit exceeded: {0}")]
    SafetyLimit(String),

    #[error("Daily loss limit reached: lost ${lost:.2}, limit is ${limit:.2}")]
    DailyLossLimitReached { lost: f64, limit: f64 },

    // Chain/trade bookkeeping
    #[error("Chain not found: {0}")]
    ChainNotFound(String),

    #[error("Trade not found: ticket {0}")]
    TradeNotFound(u64),

    #[error("Order not part of chain {chain_id}: ticket {ticket}")]
    OrderNotInChain { chain_id: String, ticket: u64 },

    // Persistence errors
    #[error("Persistence failed: {0}")]
    Persistence(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Gateway(_) | Error::GatewayTimeout(_) | Error::GatewayConnection(_)
        )
    }

    /// Check if this error is a safety violation (terminal, never retried)
    pub fn is_safety_violation(&self) -> bool {
        matches!(
            self,
            Error::SafetyLimit(_) | Error::DailyLossLimitReached { .. } | Error::RiskLimit { .. }
        )
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::GatewayTimeout(0)
        } else if e.is_connect() {
            Error::GatewayConnection(e.to_string())
        } else {
            Error::Gateway(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
