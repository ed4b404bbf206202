//! Seed scenario 5: dead-letter review and manual retry, plus List/Get/
//! MarkReviewed/Cleanup coverage.

use bridge_broker::{
    BrokerConfig, BrokerError, ErrorCategory, LastError, MessageQueue, MessageStatus, MessageType,
    NewMessage,
};
use tempfile::TempDir;

fn open_queue(dir: &TempDir) -> MessageQueue {
    let path = dir.path().join("broker.journal");
    MessageQueue::open(BrokerConfig::new(path.to_str().unwrap())).unwrap()
}

fn force_to_dlq(queue: &MessageQueue, platform: &str, target: &str) -> String {
    let new_message =
        NewMessage::new(platform, target, MessageType::Text, b"x".to_vec()).with_max_attempts(1);
    let enqueued = queue.enqueue(new_message, None).unwrap();
    queue.dequeue(Some(platform), None).unwrap();
    queue
        .nack(
            &enqueued.id,
            LastError {
                category: ErrorCategory::Network,
                message: "gave up".into(),
            },
            None,
        )
        .unwrap();
    enqueued.id
}

#[test]
fn forced_dlq_entry_is_listed_retried_and_redelivered() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let id = force_to_dlq(&queue, "slack", "C01");

    let page = queue.dead_letters().list(Some("slack"), 0, 10);
    assert_eq!(page.total, 1);
    assert_eq!(page.records[0].message.id, id);

    queue.dead_letters().retry(&id).unwrap();
    assert_eq!(queue.dead_letters().len(), 0);

    let message = queue.get(&id).unwrap();
    assert_eq!(message.status, MessageStatus::Pending);
    assert_eq!(message.attempts, 0);

    let delivered = queue.dequeue(Some("slack"), None).unwrap().unwrap();
    assert_eq!(delivered.id, id);
    queue.ack(&id, None).unwrap();

    assert!(queue.get(&id).is_err());
    assert!(queue.dead_letters().is_empty());
}

#[test]
fn get_unknown_dlq_id_is_not_found() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let err = queue.dead_letters().get("missing").unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[test]
fn mark_reviewed_records_reviewer_and_timestamp() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let id = force_to_dlq(&queue, "slack", "C01");

    queue.dead_letters().mark_reviewed(&id, "alice").unwrap();

    let dead_letter = queue.dead_letters().get(&id).unwrap();
    assert!(dead_letter.reviewed);
    assert_eq!(dead_letter.reviewed_by.as_deref(), Some("alice"));
    assert!(dead_letter.reviewed_at.is_some());
}

#[test]
fn mark_reviewed_on_unknown_id_is_not_found() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let err = queue
        .dead_letters()
        .mark_reviewed("missing", "alice")
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[test]
fn list_is_newest_first_and_paginates() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(force_to_dlq(&queue, "slack", &format!("C{i}")));
    }

    let page = queue.dead_letters().list(Some("slack"), 0, 2);
    assert_eq!(page.total, 5);
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].message.id, ids[4]);
    assert_eq!(page.records[1].message.id, ids[3]);

    let next_page = queue.dead_letters().list(Some("slack"), 2, 2);
    assert_eq!(next_page.records[0].message.id, ids[2]);
}

#[test]
fn list_across_all_platforms_when_none_is_given() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    force_to_dlq(&queue, "slack", "C1");
    force_to_dlq(&queue, "discord", "C2");

    let page = queue.dead_letters().list(None, 0, 10);
    assert_eq!(page.total, 2);
}

#[test]
fn cleanup_purges_only_reviewed_entries_past_retention() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broker.journal");
    let config = BrokerConfig::new(path.to_str().unwrap()).dlq_retention_days(0);
    let queue = MessageQueue::open(config).unwrap();

    let reviewed_id = force_to_dlq(&queue, "slack", "C1");
    let unreviewed_id = force_to_dlq(&queue, "slack", "C2");
    queue.dead_letters().mark_reviewed(&reviewed_id, "bob").unwrap();

    let purged = queue.dead_letters().cleanup().unwrap();
    assert_eq!(purged, 1);
    assert!(queue.dead_letters().get(&reviewed_id).is_err());
    assert!(queue.dead_letters().get(&unreviewed_id).is_ok());
}
