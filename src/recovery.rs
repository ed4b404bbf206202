//! Rebuilds the in-memory [`Index`] by replaying the journal, applying
//! the startup recovery rule from §9: any message still `inflight` after
//! replay belongs to a worker that vanished mid-delivery, so it reverts
//! to `pending` before anything else runs.

use std::collections::HashMap;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::config::BrokerConfig;
use crate::index::Index;
use crate::journal::JournalRecord;
use crate::message::{DeadLetter, Message, MessageId, MessageStatus};

const BREAKER_META_PREFIX: &str = "circuit_breaker:";

pub(crate) fn breaker_meta_key(platform: &str) -> String {
    format!("{BREAKER_META_PREFIX}{platform}")
}

pub(crate) fn rebuild(records: Vec<JournalRecord>, config: &BrokerConfig, now: i64) -> Index {
    let mut registry: HashMap<MessageId, Message> = HashMap::new();
    let mut dlq: HashMap<MessageId, DeadLetter> = HashMap::new();
    let mut meta: HashMap<String, (String, i64)> = HashMap::new();

    for record in records {
        apply(record, &mut registry, &mut dlq, &mut meta);
    }

    for message in registry.values_mut() {
        if message.status == MessageStatus::Inflight {
            message.status = MessageStatus::Pending;
            message.next_retry_at = now;
        }
    }

    let mut index = Index::default();
    for message in registry.into_values() {
        index.insert_pending(message, now);
    }
    for (_, dead_letter) in dlq {
        index.insert_dlq(dead_letter);
    }

    let cb_config = config.circuit_breaker_config();
    for (key, (value, _)) in meta.iter() {
        if let Some(platform) = key.strip_prefix(BREAKER_META_PREFIX) {
            if let Ok(snapshot) = serde_json::from_str::<CircuitBreakerSnapshot>(value) {
                index.breakers.insert(
                    platform.to_string(),
                    CircuitBreaker::from_snapshot(cb_config.clone(), snapshot, now),
                );
            }
        }
    }

    index.meta = meta;
    index
}

fn apply(
    record: JournalRecord,
    registry: &mut HashMap<MessageId, Message>,
    dlq: &mut HashMap<MessageId, DeadLetter>,
    meta: &mut HashMap<String, (String, i64)>,
) {
    match record {
        JournalRecord::Enqueued(msg) => {
            registry.insert(msg.id.clone(), msg);
        }
        JournalRecord::DequeuedInflight { id, last_attempt_at } => {
            if let Some(m) = registry.get_mut(&id) {
                m.status = MessageStatus::Inflight;
                m.last_attempt_at = Some(last_attempt_at);
            }
        }
        JournalRecord::Acked { id } => {
            registry.remove(&id);
        }
        JournalRecord::Nacked {
            id,
            attempts,
            next_retry_at,
            error_last,
        } => {
            if let Some(m) = registry.get_mut(&id) {
                m.status = MessageStatus::Pending;
                m.attempts = attempts;
                m.next_retry_at = next_retry_at;
                m.error_last = Some(error_last);
            }
        }
        JournalRecord::DlqMoved { dead_letter } => {
            registry.remove(&dead_letter.message.id);
            dlq.insert(dead_letter.message.id.clone(), dead_letter);
        }
        JournalRecord::Requeued { id, next_retry_at } => {
            if let Some(m) = registry.get_mut(&id) {
                m.status = MessageStatus::Pending;
                m.attempts = 0;
                m.next_retry_at = next_retry_at;
                m.error_last = None;
            }
        }
        JournalRecord::DlqRetried { id, next_retry_at } => {
            if let Some(dead_letter) = dlq.remove(&id) {
                let mut m = dead_letter.message;
                m.status = MessageStatus::Pending;
                m.attempts = 0;
                m.next_retry_at = next_retry_at;
                m.error_last = None;
                registry.insert(id, m);
            }
        }
        JournalRecord::Expired { id } => {
            registry.remove(&id);
        }
        JournalRecord::DlqReviewed {
            id,
            reviewed_by,
            reviewed_at,
        } => {
            if let Some(dl) = dlq.get_mut(&id) {
                dl.reviewed = true;
                dl.reviewed_by = Some(reviewed_by);
                dl.reviewed_at = Some(reviewed_at);
            }
        }
        JournalRecord::DlqPurged { id } => {
            dlq.remove(&id);
        }
        JournalRecord::MetaSet {
            key,
            value,
            updated_at,
        } => {
            meta.insert(key, (value, updated_at));
        }
        JournalRecord::InflightReverted { id, next_retry_at } => {
            if let Some(m) = registry.get_mut(&id) {
                m.status = MessageStatus::Pending;
                m.next_retry_at = next_retry_at;
            }
        }
    }
}
