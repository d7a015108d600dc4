use thiserror::Error;

use crate::utils::errors::AppError;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Stale data for {symbol}: last tick {age_ms}ms old")]
    StaleData { symbol: String, age_ms: u64 },

    #[error("Feed unavailable: {0}")]
    Unavailable(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Exchange API error: {0}")]
    ApiError(String),

    #[error("Connection timeout")]
    Timeout,
}

impl From<ExchangeError> for AppError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::StaleData { .. } => AppError::StaleData(err.to_string()),
            ExchangeError::Unavailable(msg) => AppError::Unavailable(msg),
            ExchangeError::InsufficientBalance(msg) => AppError::InsufficientFunds(msg),
            ExchangeError::RateLimitExceeded(msg) => AppError::RateLimited(msg),
            ExchangeError::Rejected(msg) => AppError::Rejected(msg),
            ExchangeError::NetworkError(msg) => AppError::Network(msg),
            ExchangeError::Timeout => AppError::Network("connection timeout".to_string()),
            ExchangeError::SymbolNotFound(msg) => AppError::NotFound(msg),
            other => AppError::Exchange(other.to_string()),
        }
    }
}
