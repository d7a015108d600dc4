use thiserror::Error;
use uuid::Uuid;

/// Application-level error type shared by every engine component.
///
/// Connector-level failures (`ExchangeError`) are converted at the module
/// boundary so the rest of the engine only ever sees these kinds.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Stale market data: {0}")]
    StaleData(String),

    #[error("Feed unavailable: {0}")]
    Unavailable(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Cycle conflict on strategy {strategy_id}: expected {expected}, found {actual}")]
    CycleConflict {
        strategy_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Parameter constraint violated: {0}")]
    Constraint(String),

    #[error("Budget exhausted: {0}")]
    Budget(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable name for per-kind counters in the event log.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::StaleData(_) => "stale_data",
            AppError::Unavailable(_) => "unavailable",
            AppError::InsufficientFunds(_) => "insufficient_funds",
            AppError::RateLimited(_) => "rate_limited",
            AppError::Exchange(_) => "exchange_error",
            AppError::Network(_) => "network",
            AppError::Rejected(_) => "rejected",
            AppError::CycleConflict { .. } => "cycle_conflict",
            AppError::Constraint(_) => "constraint",
            AppError::Budget(_) => "budget",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Database(_) => "database",
            AppError::Parse(_) => "parse",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether the failing operation may be retried locally with backoff.
    ///
    /// Everything else either surfaces as demotion pressure or discards the
    /// work item outright.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Network(_)
                | AppError::RateLimited(_)
                | AppError::StaleData(_)
                | AppError::Budget(_)
        )
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}
