use statehub_types::SubscriptionId;
use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("invalid topic pattern: {0:?}")]
    InvalidPattern(String),

    /// A subscriber callback failed or panicked. Logged, never propagated to
    /// the publisher.
    #[error("delivery to subscription {subscription} failed: {reason}")]
    DeliveryFailed {
        subscription: SubscriptionId,
        reason: String,
    },
}
