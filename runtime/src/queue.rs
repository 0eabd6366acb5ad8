//! Concurrency queue — global and per-domain gating between scheduler and
//! engine workers.
//!
//! The queue owns four constraints and nothing else: the global worker
//! bound, the per-domain parallelism bound, per-domain token buckets, and
//! the in-flight URL set that keeps a URL from ever running twice at once.
//! Items are split into three complexity sub-queues; one worker slot is
//! dedicated to expensive items so a burst of heavy pages cannot starve
//! cheap work (and vice versa: expensive items never occupy more than
//! that one slot).

use crate::config::RuntimeConfig;
use crate::cooldown::DomainLedger;
use crate::events::{EventBus, MonitorEvent};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// Engine cost hint, derived from the domain's processing-time ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    Cheap,
    Normal,
    Expensive,
}

impl ComplexityClass {
    fn index(self) -> usize {
        match self {
            ComplexityClass::Cheap => 0,
            ComplexityClass::Normal => 1,
            ComplexityClass::Expensive => 2,
        }
    }
}

/// One unit of work: a single URL attempt.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub url_id: u64,
    pub url: String,
    pub domain: String,
    /// Dispatch score from the scheduler: seconds until (or past) the
    /// scheduled instant. Lower dispatches first.
    pub priority_score: f64,
    /// Explicit URL priority, tie-breaker after the score.
    pub priority: u8,
    pub deadline: DateTime<Utc>,
    pub complexity: ComplexityClass,
    /// Transient-failure retry counter.
    pub attempt: u32,
}

/// Why an enqueue was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue is at capacity")]
    QueueFull,
    #[error("url is already pending or in flight")]
    Duplicate,
    #[error("queue is shut down")]
    Closed,
}

/// Queue observability snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending_cheap: usize,
    pub pending_normal: usize,
    pub pending_expensive: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub in_flight_per_domain: HashMap<String, usize>,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_requeued: u64,
    pub paused: bool,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    fn refill(&mut self, rate: f64, burst: f64, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }

    fn try_take(&mut self, rate: f64, burst: f64, now: Instant) -> bool {
        self.refill(rate, burst, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn has_token(&mut self, rate: f64, burst: f64, now: Instant) -> bool {
        self.refill(rate, burst, now);
        self.tokens >= 1.0
    }

    fn next_token_in(&self, rate: f64) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / rate)
        }
    }
}

struct QueueInner {
    pending: [Vec<WorkItem>; 3],
    /// Backoff-delayed items: `(release_at, item)`.
    delayed: Vec<(Instant, WorkItem)>,
    pending_urls: HashSet<u64>,
    in_flight_urls: HashSet<u64>,
    in_flight_per_domain: HashMap<String, usize>,
    in_flight_total: usize,
    expensive_in_flight: usize,
    buckets: HashMap<String, TokenBucket>,
    paused: bool,
    closed: bool,
    total_enqueued: u64,
    total_completed: u64,
    total_requeued: u64,
}

/// The work queue. One instance per runtime, shared by the scheduler
/// (producer) and the worker pool (consumers).
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    ledger: Arc<DomainLedger>,
    bus: Arc<EventBus>,
    max_pending: usize,
    max_concurrency: usize,
    max_per_domain: usize,
    rate_per_second: f64,
    burst: f64,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl WorkQueue {
    pub fn new(cfg: &RuntimeConfig, ledger: Arc<DomainLedger>, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: [Vec::new(), Vec::new(), Vec::new()],
                delayed: Vec::new(),
                pending_urls: HashSet::new(),
                in_flight_urls: HashSet::new(),
                in_flight_per_domain: HashMap::new(),
                in_flight_total: 0,
                expensive_in_flight: 0,
                buckets: HashMap::new(),
                paused: false,
                closed: false,
                total_enqueued: 0,
                total_completed: 0,
                total_requeued: 0,
            }),
            notify: Notify::new(),
            ledger,
            bus,
            max_pending: cfg.max_pending,
            max_concurrency: cfg.max_concurrency,
            max_per_domain: cfg.max_per_domain,
            rate_per_second: cfg.rate_per_second,
            burst: cfg.burst as f64,
            max_retries: cfg.max_retries,
            backoff_base: cfg.backoff_base(),
            backoff_cap: cfg.backoff_cap(),
        }
    }

    /// Accept a work item. Rejects on capacity, duplicate URL, or shutdown.
    pub async fn enqueue(&self, item: WorkItem) -> Result<(), EnqueueError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(EnqueueError::Closed);
        }
        let pending_total: usize =
            inner.pending.iter().map(Vec::len).sum::<usize>() + inner.delayed.len();
        if pending_total >= self.max_pending {
            return Err(EnqueueError::QueueFull);
        }
        if inner.pending_urls.contains(&item.url_id) || inner.in_flight_urls.contains(&item.url_id)
        {
            return Err(EnqueueError::Duplicate);
        }
        inner.pending_urls.insert(item.url_id);
        inner.pending[item.complexity.index()].push(item);
        inner.total_enqueued += 1;
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Block until an item whose domain constraints permit execution right
    /// now becomes available. Returns `None` once the queue is closed and
    /// fully drained.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();

                // Promote matured backoff items.
                let mut i = 0;
                while i < inner.delayed.len() {
                    if inner.delayed[i].0 <= now {
                        let (_, item) = inner.delayed.swap_remove(i);
                        inner.pending[item.complexity.index()].push(item);
                    } else {
                        i += 1;
                    }
                }

                if inner.closed
                    && inner.delayed.is_empty()
                    && inner.pending.iter().all(Vec::is_empty)
                {
                    return None;
                }

                if !inner.paused {
                    if let Some(item) = self.pick(&mut inner, now).await {
                        return Some(item);
                    }
                }

                self.next_wake(&inner, now)
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Choose the best dispatchable item, consume its domain token, and
    /// mark it in flight.
    async fn pick(&self, inner: &mut QueueInner, now: Instant) -> Option<WorkItem> {
        if inner.in_flight_total >= self.max_concurrency {
            return None;
        }
        let expensive_slot_free = inner.expensive_in_flight == 0;
        let shared_slots_free =
            inner.in_flight_total - inner.expensive_in_flight < self.max_concurrency - 1;

        let mut best: Option<(usize, usize)> = None;
        let mut best_key = (f64::INFINITY, u8::MAX, u64::MAX);

        for class in 0..3 {
            let eligible_class = if class == ComplexityClass::Expensive.index() {
                expensive_slot_free
            } else {
                shared_slots_free
            };
            if !eligible_class {
                continue;
            }
            for (idx, item) in inner.pending[class].iter().enumerate() {
                let key = (item.priority_score, item.priority, item.url_id);
                if key >= best_key {
                    continue;
                }
                // A URL is never concurrently in flight twice.
                if inner.in_flight_urls.contains(&item.url_id) {
                    continue;
                }
                if inner
                    .in_flight_per_domain
                    .get(&item.domain)
                    .copied()
                    .unwrap_or(0)
                    >= self.max_per_domain
                {
                    continue;
                }
                if self.ledger.in_cooldown(&item.domain, Utc::now()).await {
                    continue;
                }
                let bucket = inner
                    .buckets
                    .entry(item.domain.clone())
                    .or_insert_with(|| TokenBucket::new(self.burst, now));
                if !bucket.has_token(self.rate_per_second, self.burst, now) {
                    continue;
                }
                best = Some((class, idx));
                best_key = key;
            }
        }

        let (class, idx) = best?;
        let item = inner.pending[class].swap_remove(idx);

        let bucket = inner
            .buckets
            .get_mut(&item.domain)
            .expect("bucket created during eligibility scan");
        if !bucket.try_take(self.rate_per_second, self.burst, now) {
            // Token vanished between scan and take; the item stays pending.
            inner.pending[class].push(item);
            return None;
        }

        inner.pending_urls.remove(&item.url_id);
        inner.in_flight_urls.insert(item.url_id);
        *inner.in_flight_per_domain.entry(item.domain.clone()).or_insert(0) += 1;
        inner.in_flight_total += 1;
        if item.complexity == ComplexityClass::Expensive {
            inner.expensive_in_flight += 1;
        }
        debug!(url_id = item.url_id, domain = %item.domain, "dequeued");
        Some(item)
    }

    /// How long to sleep when nothing is dispatchable: the soonest token
    /// replenishment or delayed-item release, capped to keep shutdown
    /// responsive.
    fn next_wake(&self, inner: &QueueInner, now: Instant) -> Duration {
        let mut wake = Duration::from_secs(1);
        for bucket in inner.buckets.values() {
            let next = bucket.next_token_in(self.rate_per_second);
            if next > Duration::ZERO && next < wake {
                wake = next;
            }
        }
        for (release_at, _) in &inner.delayed {
            let next = release_at.saturating_duration_since(now);
            if next < wake {
                wake = next;
            }
        }
        wake.max(Duration::from_millis(10))
    }

    /// Release an item's slots after its attempt reached a terminal state.
    pub async fn complete(&self, item: &WorkItem) {
        let mut inner = self.inner.lock().await;
        if !inner.in_flight_urls.remove(&item.url_id) {
            return;
        }
        if let Some(count) = inner.in_flight_per_domain.get_mut(&item.domain) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.in_flight_per_domain.remove(&item.domain);
            }
        }
        inner.in_flight_total = inner.in_flight_total.saturating_sub(1);
        if item.complexity == ComplexityClass::Expensive {
            inner.expensive_in_flight = inner.expensive_in_flight.saturating_sub(1);
        }
        inner.total_completed += 1;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Requeue after a transient failure with exponential backoff and
    /// jitter. Returns the applied delay, or `None` once the retry budget
    /// is exhausted — from there the scheduler owns reassignment.
    pub async fn requeue_with_backoff(&self, mut item: WorkItem) -> Option<Duration> {
        item.attempt += 1;
        if item.attempt > self.max_retries {
            info!(url_id = item.url_id, "retry budget exhausted");
            return None;
        }

        let exp = (self.backoff_base.as_secs_f64() * 2f64.powi(item.attempt as i32))
            .min(self.backoff_cap.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(exp * jitter);

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return None;
        }
        // The scheduler may have re-dispatched the URL in the gap between
        // completion and requeue; its copy wins.
        if inner.pending_urls.contains(&item.url_id) || inner.in_flight_urls.contains(&item.url_id)
        {
            return None;
        }
        inner.pending_urls.insert(item.url_id);
        inner.delayed.push((Instant::now() + delay, item));
        inner.total_requeued += 1;
        drop(inner);
        self.notify.notify_waiters();
        Some(delay)
    }

    /// Gate all dequeues without dropping items.
    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        inner.paused = true;
        drop(inner);
        self.bus.emit(MonitorEvent::QueuePaused);
        info!("queue paused");
    }

    pub async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        inner.paused = false;
        drop(inner);
        self.notify.notify_waiters();
        self.bus.emit(MonitorEvent::QueueResumed);
        info!("queue resumed");
    }

    /// Stop accepting enqueues; dequeues drain what is left.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        QueueStats {
            pending_cheap: inner.pending[0].len(),
            pending_normal: inner.pending[1].len(),
            pending_expensive: inner.pending[2].len(),
            delayed: inner.delayed.len(),
            in_flight: inner.in_flight_total,
            in_flight_per_domain: inner.in_flight_per_domain.clone(),
            total_enqueued: inner.total_enqueued,
            total_completed: inner.total_completed,
            total_requeued: inner.total_requeued,
            paused: inner.paused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_cfg() -> RuntimeConfig {
        RuntimeConfig {
            max_concurrency: 4,
            max_per_domain: 2,
            max_pending: 100,
            rate_per_second: 100.0,
            burst: 10,
            max_retries: 3,
            backoff_base_secs: 1,
            backoff_cap_secs: 600,
            ..Default::default()
        }
    }

    fn queue_with(cfg: RuntimeConfig) -> WorkQueue {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DomainLedger::new(&cfg, store));
        WorkQueue::new(&cfg, ledger, Arc::new(EventBus::new(16)))
    }

    fn item(url_id: u64, domain: &str, score: f64) -> WorkItem {
        WorkItem {
            url_id,
            url: format!("https://{domain}/p/{url_id}"),
            domain: domain.to_string(),
            priority_score: score,
            priority: 5,
            deadline: Utc::now(),
            complexity: ComplexityClass::Normal,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_dispatch_order_by_score() {
        let queue = queue_with(test_cfg());
        queue.enqueue(item(1, "a.example", 5.0)).await.unwrap();
        queue.enqueue(item(2, "b.example", -3.0)).await.unwrap();
        queue.enqueue(item(3, "c.example", 1.0)).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().url_id, 2);
        assert_eq!(queue.dequeue().await.unwrap().url_id, 3);
        assert_eq!(queue.dequeue().await.unwrap().url_id, 1);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let queue = queue_with(test_cfg());
        queue.enqueue(item(1, "a.example", 0.0)).await.unwrap();
        assert_eq!(
            queue.enqueue(item(1, "a.example", 0.0)).await,
            Err(EnqueueError::Duplicate)
        );

        // Still duplicate while in flight.
        let got = queue.dequeue().await.unwrap();
        assert_eq!(
            queue.enqueue(item(1, "a.example", 0.0)).await,
            Err(EnqueueError::Duplicate)
        );

        // Free after completion.
        queue.complete(&got).await;
        assert!(queue.enqueue(item(1, "a.example", 0.0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_full() {
        let cfg = RuntimeConfig {
            max_pending: 2,
            ..test_cfg()
        };
        let queue = queue_with(cfg);
        queue.enqueue(item(1, "a.example", 0.0)).await.unwrap();
        queue.enqueue(item(2, "a.example", 0.0)).await.unwrap();
        assert_eq!(
            queue.enqueue(item(3, "a.example", 0.0)).await,
            Err(EnqueueError::QueueFull)
        );
    }

    #[tokio::test]
    async fn test_per_domain_bound() {
        let queue = queue_with(test_cfg());
        for id in 1..=3 {
            queue.enqueue(item(id, "a.example", id as f64)).await.unwrap();
        }
        let _a = queue.dequeue().await.unwrap();
        let _b = queue.dequeue().await.unwrap();
        // Third item of the same domain must wait.
        let blocked = tokio::time::timeout(Duration::from_millis(80), queue.dequeue()).await;
        assert!(blocked.is_err());
        assert_eq!(queue.stats().await.in_flight, 2);
    }

    #[tokio::test]
    async fn test_expensive_dedicated_slot() {
        let cfg = RuntimeConfig {
            max_concurrency: 3,
            max_per_domain: 10,
            ..test_cfg()
        };
        let queue = queue_with(cfg);

        let expensive = |id: u64, d: &str| WorkItem {
            complexity: ComplexityClass::Expensive,
            ..item(id, d, 0.0)
        };
        queue.enqueue(expensive(1, "a.example")).await.unwrap();
        queue.enqueue(expensive(2, "b.example")).await.unwrap();
        queue.enqueue(item(3, "c.example", 9.0)).await.unwrap();

        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.complexity, ComplexityClass::Expensive);
        // Second expensive item is held back; the normal item runs instead.
        let second = queue.dequeue().await.unwrap();
        assert_eq!(second.url_id, 3);
        let blocked = tokio::time::timeout(Duration::from_millis(80), queue.dequeue()).await;
        assert!(blocked.is_err());

        queue.complete(&first).await;
        assert_eq!(queue.dequeue().await.unwrap().url_id, 2);
    }

    #[tokio::test]
    async fn test_cheap_work_keeps_shared_slots() {
        // With max_concurrency 2, one slot is shared and one is expensive-
        // only: two cheap items cannot run together.
        let cfg = RuntimeConfig {
            max_concurrency: 2,
            max_per_domain: 10,
            ..test_cfg()
        };
        let queue = queue_with(cfg);
        queue.enqueue(item(1, "a.example", 0.0)).await.unwrap();
        queue.enqueue(item(2, "b.example", 1.0)).await.unwrap();

        let _first = queue.dequeue().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(80), queue.dequeue()).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        // rate 1/s, burst 2: at most 2 + elapsed dispatches in any window.
        let cfg = RuntimeConfig {
            rate_per_second: 1.0,
            burst: 2,
            max_per_domain: 10,
            max_concurrency: 10,
            ..test_cfg()
        };
        let queue = queue_with(cfg);
        for id in 1..=5 {
            queue.enqueue(item(id, "a.example", id as f64)).await.unwrap();
        }

        let a = queue.dequeue().await.unwrap();
        queue.complete(&a).await;
        let b = queue.dequeue().await.unwrap();
        queue.complete(&b).await;
        // Burst exhausted; the third dequeue needs a replenished token.
        let start = Instant::now();
        let blocked = tokio::time::timeout(Duration::from_millis(200), queue.dequeue()).await;
        assert!(blocked.is_err());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let cfg = test_cfg();
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DomainLedger::new(&cfg, store));
        let bus = Arc::new(EventBus::new(16));
        let queue = WorkQueue::new(&cfg, ledger, bus.clone());
        let mut rx = bus.subscribe();

        queue.enqueue(item(1, "a.example", 0.0)).await.unwrap();
        queue.pause().await;
        assert!(matches!(rx.try_recv(), Ok(MonitorEvent::QueuePaused)));

        let blocked = tokio::time::timeout(Duration::from_millis(80), queue.dequeue()).await;
        assert!(blocked.is_err());

        queue.resume().await;
        assert!(matches!(rx.try_recv(), Ok(MonitorEvent::QueueResumed)));
        assert_eq!(queue.dequeue().await.unwrap().url_id, 1);
    }

    #[tokio::test]
    async fn test_requeue_backoff_caps_attempts() {
        let queue = queue_with(test_cfg());
        let mut work = item(1, "a.example", 0.0);
        for expected_attempt in 1..=3 {
            let delay = queue.requeue_with_backoff(work.clone()).await;
            assert!(delay.is_some(), "attempt {expected_attempt} within budget");
            work.attempt = expected_attempt;
            // Drain so the next requeue does not trip the duplicate guard.
            let mut inner = queue.inner.lock().await;
            inner.delayed.clear();
            inner.pending_urls.clear();
        }
        assert!(queue.requeue_with_backoff(work).await.is_none());
    }

    #[tokio::test]
    async fn test_requeued_item_redispatches_after_delay() {
        let cfg = RuntimeConfig {
            backoff_base_secs: 0,
            ..test_cfg()
        };
        let queue = queue_with(cfg);
        let work = item(1, "a.example", 0.0);
        queue.requeue_with_backoff(work).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), queue.dequeue())
            .await
            .expect("redispatched")
            .unwrap();
        assert_eq!(got.url_id, 1);
        assert_eq!(got.attempt, 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = queue_with(test_cfg());
        queue.enqueue(item(1, "a.example", 0.0)).await.unwrap();
        queue.close().await;

        assert_eq!(
            queue.enqueue(item(2, "a.example", 0.0)).await,
            Err(EnqueueError::Closed)
        );
        // The pending item still drains…
        let got = queue.dequeue().await.unwrap();
        queue.complete(&got).await;
        // …then the queue reports exhaustion.
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_cooldown_domain_not_dispatched() {
        let cfg = test_cfg();
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DomainLedger::new(&cfg, store));
        let queue = WorkQueue::new(&cfg, ledger.clone(), Arc::new(EventBus::new(16)));

        ledger.record_block("a.example", Utc::now()).await;
        queue.enqueue(item(1, "a.example", 0.0)).await.unwrap();
        queue.enqueue(item(2, "b.example", 5.0)).await.unwrap();

        // Only the non-cooldown domain comes out.
        assert_eq!(queue.dequeue().await.unwrap().url_id, 2);
        let blocked = tokio::time::timeout(Duration::from_millis(80), queue.dequeue()).await;
        assert!(blocked.is_err());
    }
}
