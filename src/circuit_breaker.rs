//! Per-platform failure gate, per §4.4.

use serde::{Deserialize, Serialize};

use crate::message::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Encoding used by the `circuit_breaker_state` gauge (§4.5).
    pub fn as_gauge_value(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Durable snapshot of one platform's breaker, persisted in `QueueMeta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_until: Option<i64>,
    pub last_state_change: i64,
    pub half_open_probes_remaining: u32,
}

impl CircuitBreakerSnapshot {
    pub fn closed(now: i64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            last_state_change: now,
            half_open_probes_remaining: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub cooldown_ms: i64,
    pub auth_cooldown_ms: i64,
    /// Categories that force an immediate open regardless of `threshold`.
    pub force_open_categories: Vec<ErrorCategory>,
    /// Categories that never count toward the breaker (message-specific,
    /// not platform-wide).
    pub exempt_categories: Vec<ErrorCategory>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_ms: 30_000,
            auth_cooldown_ms: 300_000,
            force_open_categories: vec![ErrorCategory::Auth],
            exempt_categories: vec![ErrorCategory::Validation],
        }
    }
}

/// A state transition worth logging/emitting a metric for.
pub type Transition = (CircuitState, CircuitState);

/// Per-platform circuit breaker. Pure state machine, no I/O — the owning
/// [`crate::MessageQueue`] is responsible for persisting the snapshot.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    snapshot: CircuitBreakerSnapshot,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, now: i64) -> Self {
        Self {
            config,
            snapshot: CircuitBreakerSnapshot::closed(now),
        }
    }

    /// Restores from a persisted snapshot, applying the restart rule from
    /// §4.4: an `Open` breaker whose cooldown has already elapsed enters
    /// `HalfOpen` immediately rather than waiting for the next check.
    pub fn from_snapshot(config: CircuitBreakerConfig, mut snapshot: CircuitBreakerSnapshot, now: i64) -> Self {
        if matches!(snapshot.state, CircuitState::Open | CircuitState::HalfOpen) {
            if let Some(open_until) = snapshot.open_until {
                if open_until <= now {
                    snapshot.state = CircuitState::HalfOpen;
                    snapshot.half_open_probes_remaining = 1;
                    snapshot.last_state_change = now;
                }
            }
        }
        Self { config, snapshot }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        self.snapshot.clone()
    }

    /// Must be called before evaluating `can_dequeue` so a cooldown that
    /// has elapsed since the last call is observed.
    pub fn refresh(&mut self, now: i64) -> Option<Transition> {
        if self.snapshot.state == CircuitState::Open {
            if let Some(open_until) = self.snapshot.open_until {
                if now >= open_until {
                    let from = self.snapshot.state;
                    self.snapshot.state = CircuitState::HalfOpen;
                    self.snapshot.half_open_probes_remaining = 1;
                    self.snapshot.last_state_change = now;
                    return Some((from, self.snapshot.state));
                }
            }
        }
        None
    }

    /// Whether a new dequeue may be attempted for this platform right now.
    pub fn can_dequeue(&self) -> bool {
        match self.snapshot.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.snapshot.half_open_probes_remaining > 0,
        }
    }

    /// Consumes the single half-open probe slot. No-op outside `HalfOpen`.
    pub fn reserve_probe(&mut self) {
        if self.snapshot.state == CircuitState::HalfOpen {
            self.snapshot.half_open_probes_remaining = 0;
        }
    }

    pub fn record_success(&mut self, now: i64) -> Option<Transition> {
        match self.snapshot.state {
            CircuitState::HalfOpen => {
                let from = self.snapshot.state;
                self.snapshot.state = CircuitState::Closed;
                self.snapshot.consecutive_failures = 0;
                self.snapshot.open_until = None;
                self.snapshot.last_state_change = now;
                Some((from, self.snapshot.state))
            }
            CircuitState::Closed => {
                self.snapshot.consecutive_failures = 0;
                None
            }
            CircuitState::Open => None,
        }
    }

    pub fn record_failure(&mut self, now: i64, category: ErrorCategory) -> Option<Transition> {
        if self.config.exempt_categories.contains(&category) {
            return None;
        }

        let cooldown = if self.config.force_open_categories.contains(&category) {
            self.config.auth_cooldown_ms
        } else {
            self.config.cooldown_ms
        };

        match self.snapshot.state {
            CircuitState::HalfOpen => {
                let from = self.snapshot.state;
                self.snapshot.state = CircuitState::Open;
                self.snapshot.open_until = Some(now + cooldown);
                self.snapshot.half_open_probes_remaining = 0;
                self.snapshot.last_state_change = now;
                Some((from, self.snapshot.state))
            }
            CircuitState::Closed => {
                self.snapshot.consecutive_failures += 1;
                let forced = self.config.force_open_categories.contains(&category);
                if forced || self.snapshot.consecutive_failures >= self.config.threshold {
                    let from = self.snapshot.state;
                    self.snapshot.state = CircuitState::Open;
                    self.snapshot.open_until = Some(now + cooldown);
                    self.snapshot.last_state_change = now;
                    Some((from, self.snapshot.state))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }
}
