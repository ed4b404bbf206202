//! Recognized configuration options and their defaults, per §6.

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::message::ErrorCategory;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub db_path: String,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: f64,
    pub sweeper_interval_ms: u64,
    pub dlq_retention_days: u32,
    pub message_ttl_ms: Option<u64>,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_ms: i64,
    pub circuit_breaker_auth_cooldown_ms: i64,
    pub shutdown_drain_ms: u64,
    pub read_pool_size: usize,
}

impl BrokerConfig {
    /// Creates a config with all defaults except `db_path`, which spec.md
    /// §6 marks required.
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = value;
        self
    }

    pub fn backoff(mut self, base_ms: u64, cap_ms: u64, jitter: f64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self.backoff_jitter = jitter;
        self
    }

    pub fn sweeper_interval_ms(mut self, value: u64) -> Self {
        self.sweeper_interval_ms = value;
        self
    }

    pub fn dlq_retention_days(mut self, value: u32) -> Self {
        self.dlq_retention_days = value;
        self
    }

    pub fn message_ttl_ms(mut self, value: u64) -> Self {
        self.message_ttl_ms = Some(value);
        self
    }

    pub fn shutdown_drain_ms(mut self, value: u64) -> Self {
        self.shutdown_drain_ms = value;
        self
    }

    pub(crate) fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            threshold: self.circuit_breaker_threshold,
            cooldown_ms: self.circuit_breaker_cooldown_ms,
            auth_cooldown_ms: self.circuit_breaker_auth_cooldown_ms,
            force_open_categories: vec![ErrorCategory::Auth],
            exempt_categories: vec![ErrorCategory::Validation],
        }
    }

    pub(crate) fn dlq_retention_ms(&self) -> i64 {
        self.dlq_retention_days as i64 * 24 * 60 * 60 * 1000
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            backoff_jitter: 0.1,
            sweeper_interval_ms: 60_000,
            dlq_retention_days: 90,
            message_ttl_ms: None,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 30_000,
            circuit_breaker_auth_cooldown_ms: 300_000,
            shutdown_drain_ms: 30_000,
            read_pool_size: 10,
        }
    }
}
