//! Seed scenario 2: retry with exponential backoff, scaled down to
//! millisecond delays so the test doesn't need to sleep for real seconds.

use std::thread::sleep;
use std::time::Duration;

use bridge_broker::{
    BackoffStrategy, BrokerConfig, ErrorCategory, LastError, MessageQueue, MessageType,
    NackOutcome, NewMessage,
};
use tempfile::TempDir;

fn open_queue(dir: &TempDir, base_ms: u64, cap_ms: u64) -> MessageQueue {
    let path = dir.path().join("broker.journal");
    let config = BrokerConfig::new(path.to_str().unwrap()).backoff(base_ms, cap_ms, 0.0);
    MessageQueue::open(config).unwrap()
}

#[test]
fn nacked_message_is_invisible_until_backoff_elapses_then_dlqs_on_exhaustion() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir, 100, 10_000);

    let new_message =
        NewMessage::new("discord", "C01", MessageType::Text, b"hi".to_vec()).with_max_attempts(3);
    let enqueued = queue.enqueue(new_message, None).unwrap();

    let network_error = || LastError {
        category: ErrorCategory::Network,
        message: "connect timed out".into(),
    };

    // Attempt 1.
    queue.dequeue(Some("discord"), None).unwrap();
    queue.nack(&enqueued.id, network_error(), None).unwrap();
    assert!(
        queue.dequeue(Some("discord"), None).unwrap().is_none(),
        "must stay invisible before its backoff elapses"
    );

    sleep(Duration::from_millis(130));
    let redelivered = queue.dequeue(Some("discord"), None).unwrap();
    assert_eq!(redelivered.unwrap().id, enqueued.id);

    // Attempt 2.
    queue.nack(&enqueued.id, network_error(), None).unwrap();
    assert!(queue.dequeue(Some("discord"), None).unwrap().is_none());
    sleep(Duration::from_millis(230));
    let redelivered = queue.dequeue(Some("discord"), None).unwrap();
    assert_eq!(redelivered.unwrap().id, enqueued.id);

    // Attempt 3 exhausts max_attempts: DLQ instead of requeue.
    let outcome = queue.nack(&enqueued.id, network_error(), None).unwrap();
    match outcome {
        NackOutcome::DeadLettered(dead_letter) => {
            assert_eq!(dead_letter.message.attempts, 3);
            assert_eq!(dead_letter.error_category, ErrorCategory::Network);
        }
        other => panic!("expected DeadLettered, got {other:?}"),
    }
    assert!(queue.get(&enqueued.id).is_err());
    assert_eq!(queue.dead_letters().len(), 1);
}

#[test]
fn nack_at_attempts_one_below_max_requeues_at_max_it_dlqs() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir, 10, 10_000);
    let new_message =
        NewMessage::new("slack", "C01", MessageType::Text, b"hi".to_vec()).with_max_attempts(2);
    let enqueued = queue.enqueue(new_message, None).unwrap();

    let error = LastError {
        category: ErrorCategory::Timeout,
        message: "boom".into(),
    };

    queue.dequeue(Some("slack"), None).unwrap();
    let outcome = queue.nack(&enqueued.id, error.clone(), None).unwrap();
    assert!(matches!(outcome, NackOutcome::Requeued { .. }));

    sleep(Duration::from_millis(20));
    queue.dequeue(Some("slack"), None).unwrap();
    let outcome = queue.nack(&enqueued.id, error, None).unwrap();
    assert!(matches!(outcome, NackOutcome::DeadLettered(_)));
}

#[test]
fn delay_bounds_hold_for_the_configured_strategy() {
    let strategy = BackoffStrategy::new(1_000, 300_000, 0.1);
    for attempt in 1..=10u32 {
        let delay = strategy.delay_ms(attempt) as f64;
        let base = 1_000f64;
        let cap = 300_000f64;
        let lower = (base * 2f64.powi(attempt as i32 - 1)).min(cap) * 0.9;
        assert!(delay <= cap + 1.0);
        assert!(delay >= lower - 1.0);
    }
}
