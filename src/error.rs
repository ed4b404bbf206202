use crate::message::MessageStatus;
use thiserror::Error;

/// Custom Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error taxonomy surfaced to callers of the broker.
///
/// `NoMessage` is deliberately not a member of this enum: an empty
/// dequeue is a normal outcome (`Ok(None)`), not a failure.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Bad input: missing field, unknown enum, non-positive count.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No record with that id in the main queue.
    #[error("no such message: {0}")]
    NotFound(String),

    /// Ack/Nack called on a message that is not `inflight`.
    #[error("message {id} is {status:?}, not inflight")]
    NotInflight { id: String, status: MessageStatus },

    /// Dequeue was refused because the platform's circuit breaker is open.
    #[error("circuit open for platform {0}")]
    CircuitOpen(String),

    /// The underlying store reported a transient I/O or lock error; the
    /// operation had no effect.
    #[error("storage error: {0}")]
    Storage(String),

    /// The queue is stopping; no new work is accepted.
    #[error("queue is shutting down")]
    Shutdown,

    /// The caller's deadline elapsed before the operation completed.
    #[error("operation cancelled: deadline exceeded")]
    Cancelled,
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for BrokerError {
    fn from(e: bincode::Error) -> Self {
        BrokerError::Storage(format!("codec error: {e}"))
    }
}
