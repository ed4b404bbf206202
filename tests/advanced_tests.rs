//! Round-trip laws, invariants, and less common edge cases from the
//! testable-properties list that don't fit the seed-scenario files.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use bridge_broker::{
    Attachment, BrokerConfig, ErrorCategory, LastError, MessageQueue, MessageStatus, MessageType,
    NewMessage, ShutdownOutcome,
};
use tempfile::TempDir;

fn open_queue(dir: &TempDir) -> MessageQueue {
    let path = dir.path().join("broker.journal");
    MessageQueue::open(BrokerConfig::new(path.to_str().unwrap())).unwrap()
}

#[test]
fn enqueue_dequeue_ack_is_a_no_op_on_depth() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let before = queue.stats().total_pending;
    let enqueued = queue
        .enqueue(
            NewMessage::new("slack", "C01", MessageType::Text, b"x".to_vec()),
            None,
        )
        .unwrap();
    queue.dequeue(Some("slack"), None).unwrap();
    queue.ack(&enqueued.id, None).unwrap();

    assert_eq!(queue.stats().total_pending, before);
    assert!(queue.get(&enqueued.id).is_err());
}

#[test]
fn dlq_retry_then_ack_matches_ack_of_the_original() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let new_message =
        NewMessage::new("slack", "C01", MessageType::Text, b"x".to_vec()).with_max_attempts(1);
    let enqueued = queue.enqueue(new_message, None).unwrap();
    queue.dequeue(Some("slack"), None).unwrap();
    queue
        .nack(
            &enqueued.id,
            LastError {
                category: ErrorCategory::Network,
                message: "boom".into(),
            },
            None,
        )
        .unwrap();

    queue.dead_letters().retry(&enqueued.id).unwrap();
    let delivered = queue.dequeue(Some("slack"), None).unwrap().unwrap();
    queue.ack(&delivered.id, None).unwrap();

    assert!(queue.get(&enqueued.id).is_err());
    assert!(queue.dead_letters().is_empty());
    assert_eq!(queue.stats().total_pending, 0);
    assert_eq!(queue.stats().total_inflight, 0);
}

#[test]
fn shutdown_then_restart_of_an_empty_queue_is_a_no_op() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broker.journal");
    let path = path.to_str().unwrap();

    {
        let queue = MessageQueue::open(BrokerConfig::new(path)).unwrap();
        let outcome = queue.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(outcome, ShutdownOutcome::Drained);
    }

    let queue = MessageQueue::open(BrokerConfig::new(path)).unwrap();
    let stats = queue.stats();
    assert_eq!(stats.total_pending, 0);
    assert_eq!(stats.total_inflight, 0);
    assert_eq!(stats.total_dlq, 0);
}

#[test]
fn concurrent_dequeues_never_hand_out_the_same_id_twice() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    for i in 0..50 {
        queue
            .enqueue(
                NewMessage::new("slack", format!("C{i}"), MessageType::Text, b"x".to_vec()),
                None,
            )
            .unwrap();
    }

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..5 {
                    if let Some(message) = queue.dequeue(Some("slack"), None).unwrap() {
                        ids.push(message.id);
                    }
                }
                ids
            })
        })
        .collect();

    let mut all_ids = Vec::new();
    for handle in handles {
        all_ids.extend(handle.join().unwrap());
    }

    let unique: HashSet<String> = all_ids.iter().cloned().collect();
    assert_eq!(unique.len(), all_ids.len(), "no id was handed out twice");
    assert_eq!(all_ids.len(), 50);
}

#[test]
fn message_with_attachments_and_metadata_round_trips_through_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broker.journal");
    let path = path.to_str().unwrap();

    let enqueued_id = {
        let queue = MessageQueue::open(BrokerConfig::new(path)).unwrap();
        let mut new_message =
            NewMessage::new("slack", "C01", MessageType::Image, b"binary".to_vec());
        new_message.attachments = vec![
            Attachment::Inline(vec![1, 2, 3]),
            Attachment::Reference("s3://bucket/key".into()),
        ];
        new_message
            .metadata
            .insert("thread_ts".into(), "1234.5678".into());
        let enqueued = queue.enqueue(new_message, None).unwrap();
        enqueued.id
    };

    let queue = MessageQueue::open(BrokerConfig::new(path)).unwrap();
    let message = queue.get(&enqueued_id).unwrap();
    assert_eq!(message.attachments.len(), 2);
    assert_eq!(
        message.metadata.get("thread_ts").map(String::as_str),
        Some("1234.5678")
    );
    assert_eq!(message.status, MessageStatus::Pending);
}

#[test]
fn compaction_preserves_observable_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broker.journal");
    let config = BrokerConfig::new(path.to_str().unwrap());
    let queue = MessageQueue::open(config).unwrap();

    let mut kept = Vec::new();
    for i in 0..5 {
        let enqueued = queue
            .enqueue(
                NewMessage::new("slack", format!("C{i}"), MessageType::Text, b"x".to_vec()),
                None,
            )
            .unwrap();
        kept.push(enqueued.id);
    }
    // Ack a couple so their history is eligible for compaction away.
    for id in &kept[..2] {
        queue.dequeue(Some("slack"), None).unwrap();
        queue.ack(id, None).unwrap();
    }

    queue.run_sweep().unwrap(); // below the 1000-mutation threshold, so a no-op compaction-wise
    let stats = queue.stats();
    assert_eq!(stats.total_pending, 3);
    for id in &kept[2..] {
        assert!(queue.get(id).is_ok());
    }
    for id in &kept[..2] {
        assert!(queue.get(id).is_err());
    }
}

#[test]
fn administrative_requeue_of_a_pending_message_resets_its_scheduling() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let enqueued = queue
        .enqueue(
            NewMessage::new("slack", "C01", MessageType::Text, b"x".to_vec()),
            None,
        )
        .unwrap();
    queue.dequeue(Some("slack"), None).unwrap();
    queue.requeue(&enqueued.id, None).unwrap();

    let message = queue.get(&enqueued.id).unwrap();
    assert_eq!(message.status, MessageStatus::Pending);

    let delivered = queue.dequeue(Some("slack"), None).unwrap().unwrap();
    assert_eq!(delivered.id, enqueued.id);
}

#[test]
fn requeue_of_unknown_id_is_not_found() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let err = queue.requeue("missing", None).unwrap_err();
    assert!(matches!(err, bridge_broker::BrokerError::NotFound(_)));
}
