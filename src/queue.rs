//! The durable priority queue: storage, transactional dequeue, retry
//! scheduling, DLQ promotion, batch operations, and shutdown draining.
//!
//! Every public method that mutates state acquires `Inner::journal`
//! first — a `parking_lot::Mutex` that both serializes writers and
//! guards the index's write lock, so "append the journal record" and
//! "mutate the index" never observably happen apart. Read-only methods
//! (`peek`, `get`, `stats`) only ever take the index's read lock and
//! never touch the journal file, so they never contend with a writer on
//! I/O.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, warn};

use crate::backoff::BackoffStrategy;
use crate::circuit_breaker::CircuitState;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::index::Index;
use crate::journal::{Journal, JournalRecord};
use crate::message::{
    now_millis, DeadLetter, ErrorCategory, LastError, Message, MessageId, MessageStatus,
    NewMessage, Platform,
};
use crate::metrics::MetricsCollector;
use crate::recovery::{self, breaker_meta_key};

/// Outcome of a successful `Enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueResult {
    pub id: MessageId,
    /// 1-based rank among this platform's currently-ready messages.
    pub position: usize,
    /// Total messages (pending + inflight) on this platform after the insert.
    pub depth: usize,
}

/// Outcome of a `Nack`.
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    Requeued { next_retry_at: i64 },
    DeadLettered(DeadLetter),
}

/// Outcome of `Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Drained,
    TimedOut,
}

/// Aggregate counters returned by `Stats`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub total_pending: u64,
    pub total_inflight: u64,
    pub total_dlq: u64,
    pub wait_avg_ms: f64,
    pub wait_p95_ms: f64,
    pub depth_by_platform: HashMap<Platform, u64>,
}

/// Shared state behind every clone of a [`MessageQueue`], also borrowed
/// by [`crate::dlq::DeadLetterStore`] and the sweeper so every collaborator
/// serializes on the same journal lock.
pub(crate) struct Inner {
    pub(crate) journal: Mutex<Journal>,
    pub(crate) index: RwLock<Index>,
    pub(crate) config: BrokerConfig,
    backoff: BackoffStrategy,
    pub(crate) metrics: MetricsCollector,
    accepting: AtomicBool,
    lock_path: std::path::PathBuf,
    _lock_file: File,
}

/// Handle to the broker's durable queue. Cheaply cloneable — every clone
/// shares the same journal, index, and metrics.
#[derive(Clone)]
pub struct MessageQueue {
    pub(crate) inner: Arc<Inner>,
}

impl MessageQueue {
    /// Opens (or creates) the store at `config.db_path`, replays the
    /// journal, reverts any still-`inflight` message to `pending`, and
    /// restores circuit-breaker snapshots — all before accepting calls.
    pub fn open(config: BrokerConfig) -> Result<Self> {
        let lock_path = std::path::PathBuf::from(format!("{}.lock", config.db_path));
        let lock_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => BrokerError::Storage(format!(
                    "another instance already owns {}",
                    lock_path.display()
                )),
                _ => BrokerError::from(e),
            })?;

        let mut journal = Journal::open(&config.db_path)?;
        let records = journal.replay()?;
        let now = now_millis();
        let index = recovery::rebuild(records, &config, now);

        debug!(
            pending = index.registry.len(),
            dlq = index.dlq.len(),
            "recovered queue state from journal"
        );

        let backoff = BackoffStrategy::new(
            config.backoff_base_ms,
            config.backoff_cap_ms,
            config.backoff_jitter,
        );

        let inner = Inner {
            journal: Mutex::new(journal),
            index: RwLock::new(index),
            config,
            backoff,
            metrics: MetricsCollector::new(),
            accepting: AtomicBool::new(true),
            lock_path,
            _lock_file: lock_file,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// A handle onto the dead-letter records sharing this queue's store.
    pub fn dead_letters(&self) -> crate::dlq::DeadLetterStore {
        crate::dlq::DeadLetterStore::new(self.inner.clone())
    }

    /// Runs one sweeper pass (expiration + DLQ retention + compaction).
    /// Exposed so the sweeper thread and tests can both drive it.
    pub fn run_sweep(&self) -> Result<()> {
        self.sweep_once()
    }

    fn lock_journal(&self, deadline: Option<Duration>) -> Result<MutexGuard<'_, Journal>> {
        match deadline {
            Some(timeout) => self
                .inner
                .journal
                .try_lock_for(timeout)
                .ok_or(BrokerError::Cancelled),
            None => Ok(self.inner.journal.lock()),
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.inner.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Shutdown)
        }
    }

    pub fn enqueue(&self, new_message: NewMessage, deadline: Option<Duration>) -> Result<EnqueueResult> {
        self.ensure_accepting()?;
        new_message.validate()?;
        let now = now_millis();
        let message = new_message.into_message(now, self.inner.config.max_attempts);
        let id = message.id.clone();
        let platform = message.platform.clone();
        let priority = message.priority;
        let created_at = message.created_at;

        let mut journal = self.lock_journal(deadline)?;
        journal.append(&JournalRecord::Enqueued(message.clone()), true)?;

        let mut index = self.inner.index.write();
        index.insert_pending(message, now);
        let position = index.ready_rank(&platform, priority, created_at, &id);
        let depth = index.depth(&platform);
        self.record_depth(&index, &platform);
        drop(index);

        self.inner.metrics.record_enqueued(&platform, priority);
        debug!(message_id = %id, %platform, ?priority, "enqueued");

        Ok(EnqueueResult { id, position, depth })
    }

    pub fn dequeue(&self, platform: Option<&str>, deadline: Option<Duration>) -> Result<Option<Message>> {
        Ok(self.dequeue_batch_inner(platform, 1, deadline)?.into_iter().next())
    }

    pub fn dequeue_batch(
        &self,
        platform: &str,
        n: usize,
        deadline: Option<Duration>,
    ) -> Result<Vec<Message>> {
        self.dequeue_batch_inner(Some(platform), n, deadline)
    }

    /// Shared implementation for `Dequeue` and `DequeueBatch`. A `None`
    /// platform scans every platform's ready set for the single best
    /// candidate (used only by the `n=1` path); batch semantics always
    /// name a platform per §4.1.
    fn dequeue_batch_inner(
        &self,
        platform: Option<&str>,
        n: usize,
        deadline: Option<Duration>,
    ) -> Result<Vec<Message>> {
        self.ensure_accepting()?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let now = now_millis();

        let mut journal = self.lock_journal(deadline)?;
        let mut index = self.inner.index.write();
        index.promote_ready(now);

        let cb_config = self.inner.config.circuit_breaker_config();
        let mut out = Vec::with_capacity(n.min(64));

        for _ in 0..n {
            let eligible_platforms: Vec<Platform> = match platform {
                Some(p) => vec![p.to_string()],
                None => index.platforms().into_iter().collect(),
            };

            let mut eligible_set = std::collections::HashSet::new();
            for p in &eligible_platforms {
                let breaker = index.breaker_mut(p, &cb_config, now);
                if let Some((from, to)) = breaker.refresh(now) {
                    self.on_breaker_transition(&mut journal, &mut index, p, from, to, now)?;
                }
            }
            for p in &eligible_platforms {
                if index.breakers.get(p).map(|b| b.can_dequeue()).unwrap_or(true) {
                    eligible_set.insert(p.clone());
                }
            }

            let candidate = index.peek_candidate(platform, |p| eligible_set.contains(p));
            let (chosen_platform, id) = match candidate {
                Some(c) => c,
                None => break,
            };

            index.mark_inflight(&chosen_platform, &id, now);
            if let Some(breaker) = index.breakers.get_mut(&chosen_platform) {
                breaker.reserve_probe();
            }

            let message = index
                .registry
                .get(&id)
                .cloned()
                .expect("message just marked inflight must exist");

            journal.append(
                &JournalRecord::DequeuedInflight {
                    id: id.clone(),
                    last_attempt_at: now,
                },
                true,
            )?;

            if message.attempts == 0 {
                let wait_seconds = (now - message.created_at).max(0) as f64 / 1000.0;
                self.inner.metrics.observe_wait_seconds(&chosen_platform, wait_seconds);
            }
            self.inner.metrics.record_dequeued(&chosen_platform);
            self.record_depth(&index, &chosen_platform);

            out.push(message);
        }

        debug!(count = out.len(), ?platform, "dequeued batch");
        Ok(out)
    }

    /// Returns the next eligible message without any state change —
    /// unlike `Dequeue`, a stale (not force-refreshed) breaker reading is
    /// acceptable here since nothing is being handed out.
    pub fn peek(&self, platform: Option<&str>) -> Result<Option<Message>> {
        let now = now_millis();
        let mut index = self.inner.index.write();
        index.promote_ready(now);
        let platforms: Vec<Platform> = match platform {
            Some(p) => vec![p.to_string()],
            None => index.platforms().into_iter().collect(),
        };
        let eligible: std::collections::HashSet<Platform> = platforms
            .into_iter()
            .filter(|p| index.breakers.get(p).map(|b| b.can_dequeue()).unwrap_or(true))
            .collect();
        let candidate = index.peek_candidate(platform, |p| eligible.contains(p));
        Ok(candidate.and_then(|(_, id)| index.registry.get(&id).cloned()))
    }

    pub fn ack(&self, id: &str, deadline: Option<Duration>) -> Result<()> {
        self.ensure_accepting()?;
        let now = now_millis();
        let mut journal = self.lock_journal(deadline)?;
        let mut index = self.inner.index.write();

        let status = index.registry.get(id).map(|m| m.status);
        match status {
            None => return Err(BrokerError::NotFound(id.to_string())),
            Some(MessageStatus::Inflight) => {}
            Some(other) => {
                return Err(BrokerError::NotInflight {
                    id: id.to_string(),
                    status: other,
                })
            }
        }

        let platform = index.registry.get(id).unwrap().platform.clone();
        journal.append(&JournalRecord::Acked { id: id.to_string() }, true)?;
        index.remove_active(id);

        let cb_config = self.inner.config.circuit_breaker_config();
        let breaker = index.breaker_mut(&platform, &cb_config, now);
        if let Some((from, to)) = breaker.record_success(now) {
            self.on_breaker_transition(&mut journal, &mut index, &platform, from, to, now)?;
        }

        self.inner.metrics.record_acked(&platform);
        self.record_depth(&index, &platform);
        debug!(message_id = %id, %platform, "acked");
        Ok(())
    }

    pub fn nack(&self, id: &str, error: LastError, deadline: Option<Duration>) -> Result<NackOutcome> {
        self.ensure_accepting()?;
        let now = now_millis();
        let mut journal = self.lock_journal(deadline)?;
        let mut index = self.inner.index.write();

        let status = index.registry.get(id).map(|m| m.status);
        match status {
            None => return Err(BrokerError::NotFound(id.to_string())),
            Some(MessageStatus::Inflight) => {}
            Some(other) => {
                return Err(BrokerError::NotInflight {
                    id: id.to_string(),
                    status: other,
                })
            }
        }

        let platform = index.registry.get(id).unwrap().platform.clone();
        let max_attempts = index.registry.get(id).unwrap().max_attempts;
        let attempts = index.registry.get(id).unwrap().attempts + 1;

        let cb_config = self.inner.config.circuit_breaker_config();
        let breaker = index.breaker_mut(&platform, &cb_config, now);
        if let Some((from, to)) = breaker.record_failure(now, error.category) {
            self.on_breaker_transition(&mut journal, &mut index, &platform, from, to, now)?;
        }

        let outcome = if attempts < max_attempts {
            let delay = self.inner.backoff.delay_ms(attempts);
            let next_retry_at = now + delay as i64;
            journal.append(
                &JournalRecord::Nacked {
                    id: id.to_string(),
                    attempts,
                    next_retry_at,
                    error_last: error.clone(),
                },
                true,
            )?;

            let mut message = index.remove_active(id).expect("checked above");
            message.status = MessageStatus::Pending;
            message.attempts = attempts;
            message.next_retry_at = next_retry_at;
            message.error_last = Some(error.clone());
            index.insert_pending(message, now);

            self.inner.metrics.record_nacked(&platform, error.category);
            NackOutcome::Requeued { next_retry_at }
        } else {
            let mut message = index.remove_active(id).expect("checked above");
            message.status = MessageStatus::Failed;
            message.attempts = attempts;
            message.error_last = Some(error.clone());
            let dead_letter = DeadLetter {
                message,
                error_category: error.category,
                moved_at: now,
                reviewed: false,
                reviewed_by: None,
                reviewed_at: None,
            };
            journal.append(
                &JournalRecord::DlqMoved {
                    dead_letter: dead_letter.clone(),
                },
                true,
            )?;
            index.insert_dlq(dead_letter.clone());

            self.inner.metrics.record_nacked(&platform, error.category);
            self.inner.metrics.record_dlq(&platform, error.category);
            warn!(message_id = %id, %platform, category = error.category.as_str(), "message exhausted retries, moved to DLQ");
            NackOutcome::DeadLettered(dead_letter)
        };

        self.record_depth(&index, &platform);
        Ok(outcome)
    }

    /// Administrative requeue of a message still present in the main
    /// registry (e.g. one observed via `Get` in an unexpected terminal
    /// state). DLQ records use `DeadLetterStore::retry` instead.
    pub fn requeue(&self, id: &str, deadline: Option<Duration>) -> Result<()> {
        self.ensure_accepting()?;
        let now = now_millis();
        let mut journal = self.lock_journal(deadline)?;
        let mut index = self.inner.index.write();

        if let Some(dead_letter) = index.dlq.get(id).cloned() {
            journal.append(
                &JournalRecord::DlqRetried {
                    id: id.to_string(),
                    next_retry_at: now,
                },
                true,
            )?;
            index.remove_dlq(id);
            let platform = dead_letter.message.platform.clone();
            index.requeue_as_pending(dead_letter.message, now);
            self.inner.metrics.record_retried(&platform);
            return Ok(());
        }

        let message = index
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;

        journal.append(
            &JournalRecord::Requeued {
                id: id.to_string(),
                next_retry_at: now,
            },
            true,
        )?;
        index.remove_active(id);
        let platform = message.platform.clone();
        index.requeue_as_pending(message, now);
        self.inner.metrics.record_retried(&platform);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Message> {
        let index = self.inner.index.read();
        index
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))
    }

    pub fn stats(&self) -> QueueStats {
        let index = self.inner.index.read();
        let now = now_millis();
        let mut stats = QueueStats::default();
        let mut waits: Vec<f64> = Vec::new();

        for message in index.registry.values() {
            match message.status {
                MessageStatus::Pending => stats.total_pending += 1,
                MessageStatus::Inflight => {
                    stats.total_inflight += 1;
                    if let Some(last) = message.last_attempt_at {
                        waits.push((last - message.created_at).max(0) as f64);
                    }
                }
                _ => {}
            }
            *stats.depth_by_platform.entry(message.platform.clone()).or_insert(0) += 1;
        }
        for dl in index.dlq.values() {
            waits.push((dl.moved_at - dl.message.created_at).max(0) as f64);
        }
        stats.total_dlq = index.dlq.len() as u64;

        if !waits.is_empty() {
            let sum: f64 = waits.iter().sum();
            stats.wait_avg_ms = sum / waits.len() as f64;
            let mut sorted = waits.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let p95_idx = ((sorted.len() as f64 - 1.0) * 0.95).round() as usize;
            stats.wait_p95_ms = sorted[p95_idx.min(sorted.len() - 1)];
        }

        let _ = now;
        stats
    }

    /// Stops accepting new `Dequeue`/`DequeueBatch` calls, waits for
    /// every `inflight` message to be acked or nacked (polling, since the
    /// index has no wait/notify channel), and on timeout reverts
    /// remaining `inflight` messages to `pending` so a restart re-delivers
    /// them.
    pub fn shutdown(&self, deadline: Duration) -> Result<ShutdownOutcome> {
        self.inner.accepting.store(false, Ordering::Release);
        let start = Instant::now();

        loop {
            let still_inflight = self.inner.index.read().inflight.is_empty();
            if still_inflight {
                let mut journal = self.inner.journal.lock();
                journal.sync()?;
                let _ = fs::remove_file(&self.inner.lock_path);
                return Ok(ShutdownOutcome::Drained);
            }
            if start.elapsed() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(20).min(deadline));
        }

        let now = now_millis();
        let mut journal = self.inner.journal.lock();
        let mut index = self.inner.index.write();
        let inflight_ids: Vec<MessageId> = index.inflight.iter().cloned().collect();
        for id in inflight_ids {
            journal.append(
                &JournalRecord::InflightReverted {
                    id: id.clone(),
                    next_retry_at: now,
                },
                true,
            )?;
            if let Some(message) = index.registry.get_mut(&id) {
                message.status = MessageStatus::Pending;
                message.next_retry_at = now;
            }
            index.inflight.remove(&id);
            if let Some(message) = index.registry.get(&id).cloned() {
                let platform = message.platform.clone();
                index
                    .ready
                    .entry(platform)
                    .or_default()
                    .insert((message.priority, message.created_at, id.clone()));
            }
        }
        journal.sync()?;
        drop(index);
        drop(journal);
        let _ = fs::remove_file(&self.inner.lock_path);
        warn!(deadline_ms = deadline.as_millis() as u64, "shutdown timed out, reverted inflight messages");
        Ok(ShutdownOutcome::TimedOut)
    }

    fn record_depth(&self, index: &Index, platform: &str) {
        let pending = index
            .registry
            .values()
            .filter(|m| m.platform == platform && m.status == MessageStatus::Pending)
            .count();
        let inflight = index
            .registry
            .values()
            .filter(|m| m.platform == platform && m.status == MessageStatus::Inflight)
            .count();
        self.inner.metrics.set_depth(platform, "pending", pending as i64);
        self.inner.metrics.set_depth(platform, "inflight", inflight as i64);
        if let Some(state) = index.breakers.get(platform).map(|b| b.snapshot().state) {
            self.inner.metrics.set_circuit_state(platform, state);
        }
    }

    fn on_breaker_transition(
        &self,
        journal: &mut Journal,
        index: &mut Index,
        platform: &str,
        from: CircuitState,
        to: CircuitState,
        now: i64,
    ) -> Result<()> {
        let snapshot = index
            .breakers
            .get(platform)
            .expect("breaker must exist to have transitioned")
            .snapshot();
        let value = serde_json::to_string(&snapshot).map_err(|e| {
            BrokerError::Storage(format!("failed to serialize circuit breaker snapshot: {e}"))
        })?;
        let key = breaker_meta_key(platform);
        journal.append(
            &JournalRecord::MetaSet {
                key: key.clone(),
                value: value.clone(),
                updated_at: now,
            },
            true,
        )?;
        index.set_meta(key, value, now);
        self.inner
            .metrics
            .record_circuit_transition(platform, from.as_str(), to.as_str());
        self.inner.metrics.set_circuit_state(platform, to);
        if to == CircuitState::Open {
            warn!(%platform, from = from.as_str(), to = to.as_str(), "circuit breaker opened");
        } else {
            debug!(%platform, from = from.as_str(), to = to.as_str(), "circuit breaker transitioned");
        }
        Ok(())
    }

    /// Invoked by the sweeper: removes expired pending messages and
    /// compacts the journal when enough mutations have accumulated.
    pub(crate) fn sweep_once(&self) -> Result<()> {
        let now = now_millis();
        let mut journal = self.inner.journal.lock();
        let mut index = self.inner.index.write();

        let expired: Vec<MessageId> = index
            .registry
            .values()
            .filter(|m| {
                m.status == MessageStatus::Pending
                    && m.expires_at.map(|exp| exp <= now).unwrap_or(false)
            })
            .map(|m| m.id.clone())
            .collect();

        for id in &expired {
            let platform = index.registry.get(id).map(|m| m.platform.clone());
            journal.append(&JournalRecord::Expired { id: id.clone() }, false)?;
            index.remove_active(id);
            if let Some(platform) = platform {
                let cb_config = self.inner.config.circuit_breaker_config();
                let breaker = index.breaker_mut(&platform, &cb_config, now);
                if let Some((from, to)) = breaker.record_failure(now, ErrorCategory::Timeout) {
                    self.on_breaker_transition(&mut journal, &mut index, &platform, from, to, now)?;
                }
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired messages past their ttl");
        }

        let retention_ms = self.inner.config.dlq_retention_ms();
        let purged = purge_reviewed_dlq(&mut journal, &mut index, now, retention_ms, false)?;
        if purged > 0 {
            debug!(count = purged, "purged reviewed dead letters past retention");
        }

        if index.mutations_since_compaction >= 1_000 {
            if let Err(e) = self.compact_locked(&mut journal, &index) {
                error!(error = %e, "journal compaction failed, will retry next tick");
            } else {
                index.mutations_since_compaction = 0;
            }
        }

        journal.sync()?;
        Ok(())
    }

    fn compact_locked(&self, journal: &mut Journal, index: &Index) -> Result<()> {
        let mut records = Vec::new();
        for message in index.registry.values() {
            records.push(JournalRecord::Enqueued(message.clone()));
            if message.status == MessageStatus::Inflight {
                records.push(JournalRecord::DequeuedInflight {
                    id: message.id.clone(),
                    last_attempt_at: message.last_attempt_at.unwrap_or(message.created_at),
                });
            }
        }
        for dead_letter in index.dlq.values() {
            records.push(JournalRecord::DlqMoved {
                dead_letter: dead_letter.clone(),
            });
        }
        for (key, (value, updated_at)) in index.meta.iter() {
            records.push(JournalRecord::MetaSet {
                key: key.clone(),
                value: value.clone(),
                updated_at: *updated_at,
            });
        }
        journal.compact(&records)?;
        debug!(records = records.len(), "compacted journal");
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Shared by [`MessageQueue::sweep_once`] and
/// [`crate::dlq::DeadLetterStore::cleanup`] — both already hold the
/// journal/index locks they need, so this takes the guards directly
/// rather than re-entering `Inner`'s (non-reentrant) mutex.
pub(crate) fn purge_reviewed_dlq(
    journal: &mut Journal,
    index: &mut Index,
    now: i64,
    retention_ms: i64,
    durable: bool,
) -> Result<usize> {
    let purge: Vec<MessageId> = index
        .dlq
        .values()
        .filter(|dl| dl.reviewed && now - dl.moved_at >= retention_ms)
        .map(|dl| dl.message.id.clone())
        .collect();
    for id in &purge {
        journal.append(&JournalRecord::DlqPurged { id: id.clone() }, durable)?;
        index.remove_dlq(id);
    }
    Ok(purge.len())
}
