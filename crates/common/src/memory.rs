//! In-memory store, cache and queue for tests.
//!
//! Each fake can be told to fail a named operation a number of times
//! (`fail_times("set_status", 2)`), which is how the tests simulate a
//! dependency outage that recovers within the retry budget.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::cache::StatusCache;
use crate::error::AppError;
use crate::queue::{Delivery, MessageQueue};
use crate::store::NotificationStore;
use crate::types::{Notification, NotificationStatus};

/// Injected failures keyed by operation name.
#[derive(Debug, Default)]
pub struct Failures {
    remaining: Mutex<HashMap<&'static str, u32>>,
    calls: Mutex<HashMap<&'static str, u32>>,
}

impl Failures {
    /// Make the next `times` calls of `op` fail.
    pub fn fail_times(&self, op: &'static str, times: u32) {
        self.remaining.lock().unwrap().insert(op, times);
    }

    /// Number of calls of `op` so far, failed ones included.
    pub fn calls(&self, op: &'static str) -> u32 {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    fn check(&self, op: &'static str) -> Result<(), AppError> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;

        let mut remaining = self.remaining.lock().unwrap();
        match remaining.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(AppError::Internal(format!("injected {op} failure")))
            }
            _ => Ok(()),
        }
    }
}

/// Notification store held in a `BTreeMap`, so id order is free.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<Uuid, Notification>>,
    pub failures: Failures,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows directly, bypassing failure injection.
    pub fn with_rows(rows: impl IntoIterator<Item = Notification>) -> Self {
        let store = Self::new();
        {
            let mut map = store.rows.lock().unwrap();
            for row in rows {
                map.insert(row.id, row);
            }
        }
        store
    }

    /// Current copy of a row, bypassing failure injection.
    pub fn snapshot(&self, id: Uuid) -> Option<Notification> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    /// Overwrite a row, bypassing the state machine. Used to age rows.
    pub fn put(&self, row: Notification) {
        self.rows.lock().unwrap().insert(row.id, row);
    }

    pub fn count_in(&self, status: NotificationStatus) -> usize {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.status == status)
            .count()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn claim_due(
        &self,
        status: NotificationStatus,
        batch_size: u32,
        cursor: Uuid,
        due_before: DateTime<Utc>,
    ) -> Result<Vec<Notification>, AppError> {
        self.failures.check("claim_due")?;

        let mut rows = self.rows.lock().unwrap();
        let now = Utc::now();
        let mut claimed = Vec::new();

        for row in rows.values_mut() {
            if claimed.len() >= batch_size as usize {
                break;
            }
            if row.id > cursor && row.status == status && row.send_at <= due_before {
                row.status = NotificationStatus::Processing;
                row.updated_at = now.max(row.updated_at);
                claimed.push(row.clone());
            }
        }

        Ok(claimed)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        self.failures.check("get_by_id")?;
        Ok(self.snapshot(id))
    }

    async fn update_status(&self, id: Uuid, status: NotificationStatus) -> Result<bool, AppError> {
        self.failures.check("update_status")?;

        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) if status.predecessors().contains(&row.status) => {
                row.status = status;
                row.updated_at = Utc::now().max(row.updated_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert(&self, notification: &Notification) -> Result<(), AppError> {
        self.failures.check("insert")?;

        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&notification.id) {
            return Err(AppError::Internal(format!(
                "duplicate notification id {}",
                notification.id
            )));
        }
        rows.insert(notification.id, notification.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        self.failures.check("delete")?;
        Ok(self.rows.lock().unwrap().remove(&id).is_some())
    }

    async fn bulk_load(&self, limit: i64) -> Result<Vec<Notification>, AppError> {
        self.failures.check("bulk_load")?;

        let mut all: Vec<Notification> = self.rows.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit.max(0) as usize);
        Ok(all)
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        self.failures.check("reclaim_stale")?;

        let mut rows = self.rows.lock().unwrap();
        let now = Utc::now();
        let mut reclaimed = 0;
        for row in rows.values_mut() {
            if row.status == NotificationStatus::Processing && row.updated_at < older_than {
                row.status = NotificationStatus::Pending;
                row.updated_at = now.max(row.updated_at);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

/// Status cache held in a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<Uuid, NotificationStatus>>,
    pub failures: Failures,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached status, bypassing failure injection.
    pub fn peek(&self, id: Uuid) -> Option<NotificationStatus> {
        self.entries.lock().unwrap().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StatusCache for MemoryCache {
    async fn set_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), AppError> {
        self.failures.check("set_status")?;
        self.entries.lock().unwrap().insert(id, status);
        Ok(())
    }

    async fn get_status(&self, id: Uuid) -> Result<Option<NotificationStatus>, AppError> {
        self.failures.check("get_status")?;
        Ok(self.peek(id))
    }

    async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        self.failures.check("delete")?;
        self.entries.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Topic {
    ready: VecDeque<(String, String)>,
    inflight: Vec<(String, String)>,
}

/// Reliable queue with the same in-flight semantics as the Redis queue.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, Topic>>,
    arrivals: Notify,
    next_receipt: AtomicU64,
    closed: AtomicBool,
    pub failures: Failures,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads waiting on `topic`, oldest first.
    pub fn pending(&self, topic: &str) -> Vec<String> {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|t| t.ready.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    /// Payloads received from `topic` but not yet acknowledged.
    pub fn inflight(&self, topic: &str) -> Vec<String> {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|t| t.inflight.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::QueueClosed);
        }
        Ok(())
    }

    fn try_take(&self, topic: &str) -> Option<Delivery> {
        let mut topics = self.topics.lock().unwrap();
        let entry = topics.get_mut(topic)?;
        let (receipt, payload) = entry.ready.pop_front()?;
        entry.inflight.push((receipt.clone(), payload.clone()));
        Some(Delivery {
            topic: topic.to_string(),
            payload,
            receipt,
        })
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), AppError> {
        self.ensure_open()?;
        self.failures.check("publish")?;

        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .ready
            .push_back((receipt, payload.to_string()));
        self.arrivals.notify_one();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<u64, AppError> {
        self.ensure_open()?;
        self.failures.check("subscribe")?;

        let mut topics = self.topics.lock().unwrap();
        let entry = topics.entry(topic.to_string()).or_default();
        let requeued = entry.inflight.len() as u64;
        for item in entry.inflight.drain(..).rev() {
            entry.ready.push_front(item);
        }
        if requeued > 0 {
            self.arrivals.notify_one();
        }
        Ok(requeued)
    }

    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>, AppError> {
        self.ensure_open()?;
        self.failures.check("receive")?;

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_take(topic) {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, self.arrivals.notified())
                .await
                .is_err()
            {
                return Ok(self.try_take(topic));
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.ensure_open()?;
        self.failures.check("ack")?;

        if let Some(entry) = self.topics.lock().unwrap().get_mut(&delivery.topic) {
            entry.inflight.retain(|(receipt, _)| receipt != &delivery.receipt);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AppError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
