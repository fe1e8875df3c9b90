//! Producer behaviour against the in-memory store and queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::memory::{MemoryQueue, MemoryStore};
use herald_common::retry::RetryPolicy;
use herald_common::types::{Channel, Notification, NotificationStatus, decode_payload};
use herald_scheduler::{DueItemProducer, PollOutcome, ProducerSettings};

const TOPIC: &str = "notifications";

// ============================================================
// Helpers
// ============================================================

fn settings(batch_size: u32) -> ProducerSettings {
    ProducerSettings {
        topic: TOPIC.to_string(),
        batch_size,
        poll_interval: Duration::from_millis(10),
        due_skew: Duration::from_secs(3),
        processing_lease: None,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), 2.0)
}

fn due_with_id(id: u128) -> Notification {
    let mut n = Notification::new(
        Channel::Email,
        "user@example.com",
        "your report is ready",
        Utc::now() - TimeDelta::seconds(10),
    );
    n.id = Uuid::from_u128(id);
    n
}

fn producer(
    store: &Arc<MemoryStore>,
    queue: &Arc<MemoryQueue>,
    settings: ProducerSettings,
) -> DueItemProducer {
    DueItemProducer::new(store.clone(), queue.clone(), fast_retry(), settings)
}

fn published_ids(queue: &MemoryQueue) -> Vec<Uuid> {
    queue
        .pending(TOPIC)
        .iter()
        .map(|p| decode_payload(p).unwrap().id)
        .collect()
}

// ============================================================
// Polling
// ============================================================

#[tokio::test]
async fn test_batches_follow_id_order_and_cursor() {
    let (a, b, c) = (due_with_id(1), due_with_id(2), due_with_id(3));
    let store = Arc::new(MemoryStore::with_rows([c.clone(), a.clone(), b.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(&store, &queue, settings(2));
    let cancel = CancellationToken::new();
    let mut cursor = Uuid::nil();

    let first = producer.poll_once(&mut cursor, &cancel).await.unwrap();
    assert_eq!(
        first,
        PollOutcome {
            claimed: 2,
            published: 2,
            ..PollOutcome::default()
        }
    );
    assert_eq!(cursor, b.id);

    let second = producer.poll_once(&mut cursor, &cancel).await.unwrap();
    assert_eq!(second.published, 1);
    assert_eq!(cursor, c.id);

    let third = producer.poll_once(&mut cursor, &cancel).await.unwrap();
    assert_eq!(third, PollOutcome::default());
    assert_eq!(cursor, Uuid::nil());

    assert_eq!(published_ids(&queue), vec![a.id, b.id, c.id]);
    assert_eq!(store.count_in(NotificationStatus::Processing), 3);
}

#[tokio::test]
async fn test_zero_batch_size_still_claims() {
    let (a, b) = (due_with_id(1), due_with_id(2));
    let store = Arc::new(MemoryStore::with_rows([a.clone(), b.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(&store, &queue, settings(0));
    let mut cursor = Uuid::nil();

    let outcome = producer
        .poll_once(&mut cursor, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.published, 1);
    assert_eq!(published_ids(&queue), vec![a.id]);
}

#[tokio::test]
async fn test_huge_skew_and_lease_do_not_overflow() {
    let mut far = due_with_id(1);
    far.send_at = Utc::now() + TimeDelta::days(365 * 100);
    let store = Arc::new(MemoryStore::with_rows([far.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(
        &store,
        &queue,
        ProducerSettings {
            due_skew: Duration::MAX,
            processing_lease: Some(Duration::MAX),
            ..settings(10)
        },
    );
    let cancel = CancellationToken::new();

    let outcome = producer.poll_once(&mut Uuid::nil(), &cancel).await.unwrap();
    assert_eq!(outcome.published, 1);
    assert_eq!(producer.reclaim_stale(&cancel).await, 0);
    assert_eq!(store.count_in(NotificationStatus::Processing), 1);
}

#[tokio::test]
async fn test_published_payload_carries_processing_status() {
    let n = due_with_id(7);
    let store = Arc::new(MemoryStore::with_rows([n.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(&store, &queue, settings(10));

    producer
        .poll_once(&mut Uuid::nil(), &CancellationToken::new())
        .await
        .unwrap();

    let payload = decode_payload(&queue.pending(TOPIC)[0]).unwrap();
    assert_eq!(payload.status, NotificationStatus::Processing);
    assert_eq!(payload.recipient, n.recipient);
    assert_eq!(payload.message, n.message);
}

#[tokio::test]
async fn test_future_notifications_wait_past_skew() {
    let mut soon = due_with_id(1);
    soon.send_at = Utc::now() + TimeDelta::seconds(1);
    let mut later = due_with_id(2);
    later.send_at = Utc::now() + TimeDelta::hours(1);

    let store = Arc::new(MemoryStore::with_rows([soon.clone(), later.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(&store, &queue, settings(10));

    let outcome = producer
        .poll_once(&mut Uuid::nil(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.published, 1);
    assert_eq!(published_ids(&queue), vec![soon.id]);
    assert_eq!(
        store.snapshot(later.id).unwrap().status,
        NotificationStatus::Pending
    );
}

#[tokio::test]
async fn test_only_pending_notifications_are_claimed() {
    let pending = due_with_id(1);
    let mut canceled = due_with_id(2);
    canceled.status = NotificationStatus::Canceled;
    let mut sent = due_with_id(3);
    sent.status = NotificationStatus::Sent;

    let store = Arc::new(MemoryStore::with_rows([pending.clone(), canceled, sent]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(&store, &queue, settings(10));

    producer
        .poll_once(&mut Uuid::nil(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(published_ids(&queue), vec![pending.id]);
}

// ============================================================
// Failures
// ============================================================

#[tokio::test]
async fn test_publish_failure_leaves_processing_and_keeps_cursor() {
    let n = due_with_id(5);
    let store = Arc::new(MemoryStore::with_rows([n.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    queue.failures.fail_times("publish", 3);
    let producer = producer(&store, &queue, settings(10));
    let mut cursor = Uuid::nil();

    let outcome = producer
        .poll_once(&mut cursor, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.claimed, 1);
    assert_eq!(outcome.failed, 1);
    assert_eq!(cursor, Uuid::nil());
    assert_eq!(queue.failures.calls("publish"), 3);
    assert!(queue.pending(TOPIC).is_empty());
    assert_eq!(
        store.snapshot(n.id).unwrap().status,
        NotificationStatus::Processing
    );
}

#[tokio::test]
async fn test_failed_publish_does_not_stop_the_batch() {
    let (a, b) = (due_with_id(1), due_with_id(2));
    let store = Arc::new(MemoryStore::with_rows([a.clone(), b.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    queue.failures.fail_times("publish", 3);
    let producer = producer(&store, &queue, settings(10));
    let mut cursor = Uuid::nil();

    let outcome = producer
        .poll_once(&mut cursor, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.published, 1);
    assert_eq!(cursor, b.id);
    assert_eq!(published_ids(&queue), vec![b.id]);
}

#[tokio::test]
async fn test_transient_publish_failure_recovers() {
    let n = due_with_id(1);
    let store = Arc::new(MemoryStore::with_rows([n.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    queue.failures.fail_times("publish", 2);
    let producer = producer(&store, &queue, settings(10));

    let outcome = producer
        .poll_once(&mut Uuid::nil(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.published, 1);
    assert_eq!(published_ids(&queue), vec![n.id]);
}

#[tokio::test]
async fn test_claim_failure_is_reported_and_rows_untouched() {
    let n = due_with_id(1);
    let store = Arc::new(MemoryStore::with_rows([n.clone()]));
    store.failures.fail_times("claim_due", 3);
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(&store, &queue, settings(10));

    let result = producer
        .poll_once(&mut Uuid::nil(), &CancellationToken::new())
        .await;

    assert!(result.is_err());
    assert_eq!(
        store.snapshot(n.id).unwrap().status,
        NotificationStatus::Pending
    );
}

// ============================================================
// Concurrency
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_never_publish_twice() {
    let rows: Vec<_> = (1..=40).map(due_with_id).collect();
    let store = Arc::new(MemoryStore::with_rows(rows));
    let queue = Arc::new(MemoryQueue::new());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let producer = producer(&store, &queue, settings(3));
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut cursor = Uuid::nil();
            loop {
                let outcome = producer.poll_once(&mut cursor, &cancel).await.unwrap();
                if outcome.claimed == 0 {
                    break;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let ids = published_ids(&queue);
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(ids.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(store.count_in(NotificationStatus::Pending), 0);
}

// ============================================================
// Lease reclaim
// ============================================================

#[tokio::test]
async fn test_reclaim_returns_stale_processing_to_pending() {
    let mut stale = due_with_id(1);
    stale.status = NotificationStatus::Processing;
    stale.updated_at = Utc::now() - TimeDelta::minutes(30);
    let mut fresh = due_with_id(2);
    fresh.status = NotificationStatus::Processing;

    let store = Arc::new(MemoryStore::with_rows([stale.clone(), fresh.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(
        &store,
        &queue,
        ProducerSettings {
            processing_lease: Some(Duration::from_secs(600)),
            ..settings(10)
        },
    );

    let reclaimed = producer.reclaim_stale(&CancellationToken::new()).await;
    assert_eq!(reclaimed, 1);
    assert_eq!(
        store.snapshot(stale.id).unwrap().status,
        NotificationStatus::Pending
    );
    assert_eq!(
        store.snapshot(fresh.id).unwrap().status,
        NotificationStatus::Processing
    );
}

#[tokio::test]
async fn test_reclaim_disabled_without_lease() {
    let mut stale = due_with_id(1);
    stale.status = NotificationStatus::Processing;
    stale.updated_at = Utc::now() - TimeDelta::days(1);

    let store = Arc::new(MemoryStore::with_rows([stale.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(&store, &queue, settings(10));

    assert_eq!(producer.reclaim_stale(&CancellationToken::new()).await, 0);
    assert_eq!(store.failures.calls("reclaim_stale"), 0);
}

#[tokio::test]
async fn test_run_republishes_after_lease_expiry() {
    let mut stuck = due_with_id(1);
    stuck.status = NotificationStatus::Processing;
    stuck.updated_at = Utc::now() - TimeDelta::hours(1);

    let store = Arc::new(MemoryStore::with_rows([stuck.clone()]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = Arc::new(producer(
        &store,
        &queue,
        ProducerSettings {
            processing_lease: Some(Duration::from_secs(60)),
            ..settings(10)
        },
    ));
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let producer = producer.clone();
        let cancel = cancel.clone();
        async move { producer.run(&cancel).await }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while queue.pending(TOPIC).is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(published_ids(&queue), vec![stuck.id]);
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn test_cancel_before_publish_skips_rest_of_batch() {
    let store = Arc::new(MemoryStore::with_rows([due_with_id(1), due_with_id(2)]));
    let queue = Arc::new(MemoryQueue::new());
    let producer = producer(&store, &queue, settings(10));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut cursor = Uuid::nil();

    let outcome = producer.poll_once(&mut cursor, &cancel).await.unwrap();

    assert_eq!(outcome.claimed, 2);
    assert_eq!(outcome.skipped, 2);
    assert_eq!(outcome.published, 0);
    assert_eq!(cursor, Uuid::nil());
    assert!(queue.pending(TOPIC).is_empty());
}

#[tokio::test]
async fn test_run_publishes_then_stops_on_cancel() {
    let rows: Vec<_> = (1..=5).map(due_with_id).collect();
    let store = Arc::new(MemoryStore::with_rows(rows));
    let queue = Arc::new(MemoryQueue::new());
    let producer = Arc::new(producer(
        &store,
        &queue,
        ProducerSettings {
            poll_interval: Duration::from_secs(3600),
            ..settings(2)
        },
    ));
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let producer = producer.clone();
        let cancel = cancel.clone();
        async move { producer.run(&cancel).await }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while queue.pending(TOPIC).len() < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The loop is now in its idle sleep; cancellation must cut it short.
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("producer did not stop")
        .unwrap();

    assert_eq!(queue.pending(TOPIC).len(), 5);
}
