//! Dead-letter review and manual retry, per §4.3. Backed by the same
//! journal and index as [`crate::MessageQueue`] — a `dead_letter` table
//! in the same store, not a separate file.

use std::sync::Arc;

use crate::error::{BrokerError, Result};
use crate::journal::JournalRecord;
use crate::message::{now_millis, DeadLetter, MessageId, Platform};
use crate::queue::{purge_reviewed_dlq, Inner};

/// One page of `List` results.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterPage {
    pub records: Vec<DeadLetter>,
    pub total: usize,
}

#[derive(Clone)]
pub struct DeadLetterStore {
    inner: Arc<Inner>,
}

impl DeadLetterStore {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Paginated, newest-first. `platform=None` lists across all platforms.
    pub fn list(&self, platform: Option<&str>, offset: usize, limit: usize) -> DeadLetterPage {
        let index = self.inner.index.read();
        let mut ids: Vec<(i64, MessageId)> = match platform {
            Some(p) => index
                .dlq_by_platform
                .get(p)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            None => index
                .dlq
                .values()
                .map(|dl| (dl.moved_at, dl.message.id.clone()))
                .collect(),
        };
        // Ascending by `moved_at` in storage; newest first for callers.
        ids.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        let total = ids.len();
        let records = ids
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|(_, id)| index.dlq.get(&id).cloned())
            .collect();
        DeadLetterPage { records, total }
    }

    pub fn get(&self, id: &str) -> Result<DeadLetter> {
        let index = self.inner.index.read();
        index
            .dlq
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))
    }

    pub fn mark_reviewed(&self, id: &str, reviewer: &str) -> Result<()> {
        let now = now_millis();
        let mut journal = self.inner.journal.lock();
        let mut index = self.inner.index.write();

        if !index.dlq.contains_key(id) {
            return Err(BrokerError::NotFound(id.to_string()));
        }

        journal.append(
            &JournalRecord::DlqReviewed {
                id: id.to_string(),
                reviewed_by: reviewer.to_string(),
                reviewed_at: now,
            },
            true,
        )?;

        let dl = index.dlq.get_mut(id).expect("checked above");
        dl.reviewed = true;
        dl.reviewed_by = Some(reviewer.to_string());
        dl.reviewed_at = Some(now);
        Ok(())
    }

    /// Re-inserts the message into the main queue at its original
    /// priority with `attempts=0`, removing it from the DLQ atomically.
    pub fn retry(&self, id: &str) -> Result<()> {
        let now = now_millis();
        let mut journal = self.inner.journal.lock();
        let mut index = self.inner.index.write();

        let dead_letter = index
            .dlq
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;

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
        Ok(())
    }

    /// Deletes reviewed records older than the configured retention
    /// window. Also invoked by the sweeper on its regular interval.
    pub fn cleanup(&self) -> Result<usize> {
        let now = now_millis();
        let retention_ms = self.inner.config.dlq_retention_ms();
        let mut journal = self.inner.journal.lock();
        let mut index = self.inner.index.write();

        let purged = purge_reviewed_dlq(&mut journal, &mut index, now, retention_ms, true)?;
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.inner.index.read().dlq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.inner.index.read().dlq_by_platform.keys().cloned().collect()
    }
}
