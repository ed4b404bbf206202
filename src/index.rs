//! The in-memory index rebuilt by replaying the journal at startup.
//!
//! Pure state, no locking and no I/O — the owning store operates on it
//! sequentially behind its own write lock, the same split this
//! repository's other queue-shaped crates draw between "state" and the
//! actor/store that serializes access to it.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::message::{DeadLetter, Message, MessageId, MessageStatus, Platform, Priority};

#[derive(Default)]
pub(crate) struct Index {
    /// Source of truth for every message still in the main queue
    /// (pending or inflight).
    pub registry: HashMap<MessageId, Message>,
    /// Ready-to-dequeue messages per platform, ordered by
    /// `(priority, created_at, id)` ascending — exactly the selection
    /// order in §4.1 ("precise").
    pub ready: HashMap<Platform, BTreeSet<(Priority, i64, MessageId)>>,
    /// Pending messages whose `next_retry_at` is still in the future,
    /// globally ordered by that timestamp so promotion is a prefix scan.
    pub scheduled: BTreeSet<(i64, Platform, MessageId)>,
    /// Ids currently handed out and awaiting Ack/Nack.
    pub inflight: HashSet<MessageId>,
    /// Dead-lettered records, keyed by id.
    pub dlq: HashMap<MessageId, DeadLetter>,
    /// DLQ ids per platform ordered by `moved_at` ascending (iterate in
    /// reverse for "newest first" per §4.3 `List`).
    pub dlq_by_platform: HashMap<Platform, BTreeSet<(i64, MessageId)>>,
    /// `queue_meta`: key -> (value, updated_at).
    pub meta: HashMap<String, (String, i64)>,
    /// Appends since the last compaction; the sweeper compacts once this
    /// crosses a threshold.
    pub mutations_since_compaction: u64,
    /// One circuit breaker per platform, lazily created on first use and
    /// restored from `meta` at startup.
    pub breakers: HashMap<Platform, CircuitBreaker>,
}

impl Index {
    pub fn insert_pending(&mut self, message: Message, now: i64) {
        let platform = message.platform.clone();
        let id = message.id.clone();
        if message.next_retry_at <= now {
            self.ready
                .entry(platform)
                .or_default()
                .insert((message.priority, message.created_at, id.clone()));
        } else {
            self.scheduled
                .insert((message.next_retry_at, platform, id.clone()));
        }
        self.registry.insert(id, message);
        self.mutations_since_compaction += 1;
    }

    /// Moves any `scheduled` entries whose time has arrived into `ready`.
    pub fn promote_ready(&mut self, now: i64) {
        loop {
            let next = match self.scheduled.iter().next() {
                Some(entry) if entry.0 <= now => entry.clone(),
                _ => break,
            };
            self.scheduled.remove(&next);
            let (_, platform, id) = next;
            if let Some(message) = self.registry.get(&id) {
                if message.status == MessageStatus::Pending {
                    self.ready.entry(platform).or_default().insert((
                        message.priority,
                        message.created_at,
                        id,
                    ));
                }
            }
        }
    }

    /// Picks the best ready candidate for `platform`, or the best across
    /// every platform in `eligible` when `platform` is `None`.
    pub fn peek_candidate(
        &self,
        platform: Option<&str>,
        eligible: impl Fn(&str) -> bool,
    ) -> Option<(Platform, MessageId)> {
        if let Some(platform) = platform {
            if !eligible(platform) {
                return None;
            }
            return self
                .ready
                .get(platform)
                .and_then(|set| set.iter().next())
                .map(|(_, _, id)| (platform.to_string(), id.clone()));
        }

        let mut best: Option<(Platform, MessageId, Priority, i64)> = None;
        for (platform, set) in self.ready.iter() {
            if !eligible(platform) {
                continue;
            }
            if let Some((priority, created_at, id)) = set.iter().next() {
                let candidate = (platform.clone(), id.clone(), *priority, *created_at);
                let is_better = match &best {
                    None => true,
                    Some((_, _, best_priority, best_created_at)) => {
                        (candidate.2, candidate.3) < (*best_priority, *best_created_at)
                    }
                };
                if is_better {
                    best = Some(candidate);
                }
            }
        }
        best.map(|(platform, id, _, _)| (platform, id))
    }

    pub fn mark_inflight(&mut self, platform: &str, id: &str, now: i64) {
        if let Some(set) = self.ready.get_mut(platform) {
            if let Some(message) = self.registry.get(id) {
                set.remove(&(message.priority, message.created_at, id.to_string()));
            }
        }
        self.inflight.insert(id.to_string());
        if let Some(message) = self.registry.get_mut(id) {
            message.status = MessageStatus::Inflight;
            message.last_attempt_at = Some(now);
        }
        self.mutations_since_compaction += 1;
    }

    /// Removes a message from every active structure (used by Ack and by
    /// the DLQ-move path). Does not touch the DLQ tables.
    pub fn remove_active(&mut self, id: &str) -> Option<Message> {
        self.inflight.remove(id);
        if let Some(message) = self.registry.remove(id) {
            if let Some(set) = self.ready.get_mut(&message.platform) {
                set.remove(&(message.priority, message.created_at, id.to_string()));
            }
            self.scheduled
                .retain(|(_, _, scheduled_id)| scheduled_id != id);
            self.mutations_since_compaction += 1;
            Some(message)
        } else {
            None
        }
    }

    pub fn requeue_as_pending(&mut self, mut message: Message, now: i64) {
        message.status = MessageStatus::Pending;
        message.attempts = 0;
        message.next_retry_at = now;
        message.error_last = None;
        self.insert_pending(message, now);
    }

    pub fn insert_dlq(&mut self, dead_letter: DeadLetter) {
        let platform = dead_letter.message.platform.clone();
        let id = dead_letter.message.id.clone();
        self.dlq_by_platform
            .entry(platform)
            .or_default()
            .insert((dead_letter.moved_at, id.clone()));
        self.dlq.insert(id, dead_letter);
        self.mutations_since_compaction += 1;
    }

    pub fn remove_dlq(&mut self, id: &str) -> Option<DeadLetter> {
        let dead_letter = self.dlq.remove(id)?;
        if let Some(set) = self.dlq_by_platform.get_mut(&dead_letter.message.platform) {
            set.remove(&(dead_letter.moved_at, id.to_string()));
        }
        self.mutations_since_compaction += 1;
        Some(dead_letter)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>, updated_at: i64) {
        self.meta.insert(key.into(), (value.into(), updated_at));
        self.mutations_since_compaction += 1;
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(|(value, _)| value.as_str())
    }

    /// Returns the breaker for `platform`, creating a fresh `Closed` one
    /// on first use.
    pub fn breaker_mut(
        &mut self,
        platform: &str,
        config: &CircuitBreakerConfig,
        now: i64,
    ) -> &mut CircuitBreaker {
        self.breakers
            .entry(platform.to_string())
            .or_insert_with(|| CircuitBreaker::new(config.clone(), now))
    }

    /// 1-based rank of `(priority, created_at, id)` among `platform`'s
    /// ready set, for `Enqueue`'s returned `position`.
    pub fn ready_rank(&self, platform: &str, priority: Priority, created_at: i64, id: &str) -> usize {
        let key = (priority, created_at, id.to_string());
        self.ready
            .get(platform)
            .map(|set| set.iter().take_while(|k| **k < key).count() + 1)
            .unwrap_or(1)
    }

    /// Total pending+inflight messages currently registered for `platform`.
    pub fn depth(&self, platform: &str) -> usize {
        self.registry.values().filter(|m| m.platform == platform).count()
    }

    pub fn platforms(&self) -> HashSet<Platform> {
        let mut set: HashSet<Platform> = self.ready.keys().cloned().collect();
        set.extend(self.scheduled.iter().map(|(_, platform, _)| platform.clone()));
        set.extend(self.registry.values().map(|m| m.platform.clone()));
        set.extend(self.breakers.keys().cloned());
        set
    }
}
