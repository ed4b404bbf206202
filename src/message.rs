use std::collections::HashMap;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BrokerError, Result};

/// Opaque unique identifier assigned to a message at enqueue time.
pub type MessageId = String;

/// Opaque tag identifying a downstream adapter family (`slack`, `discord`, ...).
///
/// The broker never interprets this value beyond using it as a grouping
/// key for per-platform circuit breakers and queue depth.
pub type Platform = String;

/// Strict-precedence priority class. `High` sorts before `Normal` before
/// `Low` via the derived `Ord` (declaration order), which is exactly the
/// selection order §4.1 requires when used as a `BTreeSet`/`BTreeMap` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl FromStr for Priority {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(BrokerError::Validation(format!(
                "unknown priority: {other}"
            ))),
        }
    }
}

/// Content kind carried by a message. The broker never inspects `content`
/// itself; this tag is for the adapter's benefit only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
    Notice,
    SystemAlert,
}

/// Current lifecycle position of a message.
///
/// `Acked` and `Failed` are transitional: both are set and then the
/// record is removed from (or moved out of) the main registry within the
/// same atomic operation that set them, so in steady state a `Get` never
/// observes either — they exist so the state machine below is total and
/// so `DeadLetter` can embed a `Message` snapshot whose `status` reads
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Inflight,
    Acked,
    Failed,
}

/// A blob or reference carried alongside a message's primary content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attachment {
    Inline(Vec<u8>),
    Reference(String),
}

/// The last failure recorded against a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub category: ErrorCategory,
    pub message: String,
}

/// Categorization applied to a failure at DLQ-move (or force-open) time.
///
/// The adapter derives this from the downstream protocol; the broker only
/// stores what it is told and maps anything it doesn't recognize to
/// `Unknown` rather than rejecting the `Nack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Timeout,
    RateLimit,
    Auth,
    Network,
    Validation,
    Unknown,
}

impl ErrorCategory {
    /// Maps an adapter-supplied category string, falling back to
    /// `Unknown` for anything unrecognized instead of erroring.
    pub fn from_adapter_str(s: &str) -> Self {
        match s {
            "timeout" => ErrorCategory::Timeout,
            "rate_limit" => ErrorCategory::RateLimit,
            "auth" => ErrorCategory::Auth,
            "network" => ErrorCategory::Network,
            "validation" => ErrorCategory::Validation,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Network => "network",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// The unit of work the broker stores and hands out to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub platform: Platform,
    pub target: String,
    pub message_type: MessageType,
    pub content: Vec<u8>,
    pub attachments: Vec<Attachment>,
    pub metadata: HashMap<String, String>,
    pub priority: Priority,
    pub status: MessageStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: i64,
    pub last_attempt_at: Option<i64>,
    pub next_retry_at: i64,
    pub expires_at: Option<i64>,
    pub error_last: Option<LastError>,
}

/// Fields a caller supplies at enqueue time; everything else is derived.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Option<MessageId>,
    pub platform: Platform,
    pub target: String,
    pub message_type: MessageType,
    pub content: Vec<u8>,
    pub attachments: Vec<Attachment>,
    pub metadata: HashMap<String, String>,
    pub priority: Priority,
    /// `None` means "use the broker's configured default"; `Some` is an
    /// explicit per-message override applied by `with_max_attempts`.
    pub max_attempts: Option<u32>,
    pub expires_at: Option<i64>,
}

impl NewMessage {
    /// Convenience constructor for the common case: no id, default
    /// priority/attempts/expiry.
    pub fn new(platform: impl Into<String>, target: impl Into<String>, message_type: MessageType, content: Vec<u8>) -> Self {
        Self {
            id: None,
            platform: platform.into(),
            target: target.into(),
            message_type,
            content,
            attachments: Vec::new(),
            metadata: HashMap::new(),
            priority: Priority::Normal,
            max_attempts: None,
            expires_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.platform.trim().is_empty() {
            return Err(BrokerError::Validation("platform is required".into()));
        }
        if self.target.trim().is_empty() {
            return Err(BrokerError::Validation("target is required".into()));
        }
        if let Some(max_attempts) = self.max_attempts {
            if max_attempts < 1 {
                return Err(BrokerError::Validation(
                    "max_attempts must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }

    /// `default_max_attempts` is the broker's configured default, applied
    /// when the caller didn't set one via `with_max_attempts`.
    pub(crate) fn into_message(self, now: i64, default_max_attempts: u32) -> Message {
        Message {
            id: self.id.unwrap_or_else(generate_message_id),
            platform: self.platform,
            target: self.target,
            message_type: self.message_type,
            content: self.content,
            attachments: self.attachments,
            metadata: self.metadata,
            priority: self.priority,
            status: MessageStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            created_at: now,
            last_attempt_at: None,
            next_retry_at: now,
            expires_at: self.expires_at,
            error_last: None,
        }
    }
}

/// A snapshot of a message that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub error_category: ErrorCategory,
    pub moved_at: i64,
    pub reviewed: bool,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<i64>,
}

/// Generates a `msg-<uuid4>` identifier, mirroring the id-generation
/// convention of the broker's sibling crates.
pub fn generate_message_id() -> MessageId {
    format!("msg-{}", Uuid::new_v4().simple())
}

/// Current wall-clock time in milliseconds, the broker's one timestamp
/// granularity per §3.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
