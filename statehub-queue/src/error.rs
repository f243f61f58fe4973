use statehub_types::OperationId;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("update queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("update {0} is not queued")]
    NotFound(OperationId),

    #[error("update {0} is already in flight")]
    InFlight(OperationId),

    #[error("update {id} expired after waiting {age_ms}ms in its batch")]
    OperationExpired { id: OperationId, age_ms: u64 },

    #[error("update {id} failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        id: OperationId,
        attempts: u32,
        last_error: String,
    },

    #[error("update {id} rejected: {reason}")]
    Rejected { id: OperationId, reason: String },
}
