use thiserror::Error;

/// Domain error taxonomy. Only `Config` and `Fatal` stop the process; the
/// rest are retried or surfaced per unit of work.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid settings, missing API keys, unparseable signal spec. Prevents
    /// start.
    #[error("config error: {0}")]
    Config(String),

    /// Exchange or price fetch failure; retried at the fetch layer.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// Order rejected by the exchange (insufficient balance, filters).
    #[error("exchange rejection: {0}")]
    ExchangeRejection(String),

    /// Invariant violation affecting one unit of work; logged, unit aborted.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// Another instance took over the session.
    #[error("leadership lost: {0}")]
    LeadershipLost(String),

    /// Persistence unavailable or all work failed; requires operator restart.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::Fatal(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::TransientNetwork(err.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Fatal(format!("store: {}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Consistency(format!("serialization: {}", err))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
