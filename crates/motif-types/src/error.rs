use thiserror::Error;

/// Closed error taxonomy shared by every engine (spec §7).
///
/// Callers that need to decide whether to retry should match on the
/// variant, not on the message text.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("pricing unavailable for task type {0:?}")]
    PricingUnavailable(String),

    #[error("transient error, retry: {0}")]
    Transient(String),

    #[error("terminal provider error ({kind}): {message}")]
    TerminalProvider { kind: String, message: String },

    #[error("task timed out after its configured budget")]
    Timeout,

    #[error("row is locked, retry: {0}")]
    TransactionBusy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the scheduler should count this against a task's retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_) | EngineError::TransactionBusy(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
