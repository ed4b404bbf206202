//! Durable, at-least-once message broker core for a chat bridge process.
//!
//! Five cooperating pieces, leaves-first: [`backoff`] computes retry
//! delay from attempt count; [`dlq`] holds permanently-failed messages
//! for review; [`circuit_breaker`] sheds load to a misbehaving platform;
//! [`metrics`] exposes counters and a wait-time histogram in a
//! Prometheus-style text format; [`queue`] ties it all together behind a
//! write-ahead [`journal`] and an in-memory [`index`] rebuilt at startup
//! by [`recovery`].
//!
//! ```no_run
//! use bridge_broker::{BrokerConfig, MessageQueue, MessageType, NewMessage};
//!
//! # fn main() -> Result<(), bridge_broker::BrokerError> {
//! let queue = MessageQueue::open(BrokerConfig::new("./data/broker.journal"))?;
//! let new_message = NewMessage::new("slack", "C0123", MessageType::Text, b"hi".to_vec());
//! let enqueued = queue.enqueue(new_message, None)?;
//! if let Some(message) = queue.dequeue(Some("slack"), None)? {
//!     queue.ack(&message.id, None)?;
//! }
//! # let _ = enqueued;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod circuit_breaker;
mod config;
mod dlq;
mod error;
mod index;
mod journal;
mod message;
mod metrics;
mod queue;
mod recovery;
mod sweeper;

pub use backoff::{BackoffStrategy, JitterSource, RandJitter};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use config::BrokerConfig;
pub use dlq::{DeadLetterPage, DeadLetterStore};
pub use error::{BrokerError, Result};
pub use message::{
    generate_message_id, now_millis, Attachment, DeadLetter, ErrorCategory, LastError, Message,
    MessageId, MessageStatus, MessageType, NewMessage, Platform, Priority,
};
pub use metrics::MetricsCollector;
pub use queue::{EnqueueResult, MessageQueue, NackOutcome, QueueStats, ShutdownOutcome};
pub use sweeper::Sweeper;
