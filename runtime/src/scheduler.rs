//! Scheduler — decides when every monitored URL is visited next.
//!
//! Due times are spread with per-URL jitter so a thousand URLs sharing an
//! interval never hit their sites in one synchronized burst. Dispatch
//! writes `last_check` optimistically (CAS) before enqueueing and rolls
//! back on enqueue rejection, so a missed tick can never double-dispatch.

use crate::config::RuntimeConfig;
use crate::cooldown::{DomainLedger, DomainTransition};
use crate::model::{AttemptOutcome, AttemptResult, MonitoredUrl};
use crate::queue::{ComplexityClass, EnqueueError, WorkItem, WorkQueue};
use crate::store::{StrategyStore, UrlFilter};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Interval multiplier by explicit priority: `f(0) = 1.5`, `f(9) = 0.5`,
/// linear in between. Higher priority → shorter effective interval.
fn priority_factor(priority: u8) -> f64 {
    1.5 - (priority.min(9) as f64) * (1.0 / 9.0)
}

/// Processing-time thresholds for the complexity hint, seconds.
const CHEAP_UNDER_SECS: f64 = 5.0;
const EXPENSIVE_OVER_SECS: f64 = 20.0;

/// Per-URL jitter factor, resampled once per monitoring cycle.
#[derive(Debug, Clone, Copy)]
struct CycleJitter {
    sampled_for: Option<DateTime<Utc>>,
    factor: f64,
}

pub struct Scheduler {
    store: Arc<dyn StrategyStore>,
    queue: Arc<WorkQueue>,
    ledger: Arc<DomainLedger>,
    tick_interval: ChronoDuration,
    jitter_fraction: f64,
    success_floor: f64,
    jitter: Mutex<HashMap<u64, CycleJitter>>,
}

impl Scheduler {
    pub fn new(
        cfg: &RuntimeConfig,
        store: Arc<dyn StrategyStore>,
        queue: Arc<WorkQueue>,
        ledger: Arc<DomainLedger>,
    ) -> Self {
        Self {
            store,
            queue,
            ledger,
            tick_interval: ChronoDuration::seconds(cfg.tick_interval_secs as i64),
            jitter_fraction: cfg.jitter_fraction,
            success_floor: cfg.success_floor,
            jitter: Mutex::new(HashMap::new()),
        }
    }

    /// One scheduling pass: compute due URLs and dispatch them in
    /// deterministic order. Never fails fatally — store errors log and
    /// skip the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let urls = match self
            .store
            .list_urls(UrlFilter {
                active_only: true,
                domain: None,
            })
            .await
        {
            Ok(urls) => urls,
            Err(err) => {
                warn!(error = %err, "store unavailable, skipping tick");
                return 0;
            }
        };

        // Collect due URLs with their dispatch scores.
        let mut due: Vec<(f64, MonitoredUrl, DateTime<Utc>)> = Vec::new();
        for url in urls {
            let scheduled = self.scheduled_at(&url, now).await;
            if now >= scheduled - self.tick_interval / 2 {
                let score = (scheduled - now).num_milliseconds() as f64 / 1000.0;
                due.push((score, url, scheduled));
            }
        }

        // Earliest due first, ties by explicit priority then url id, so
        // dispatch order is deterministic across replicas.
        due.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.priority.cmp(&b.1.priority))
                .then(a.1.id.cmp(&b.1.id))
        });

        let mut dispatched = 0;
        for (score, url, _) in due {
            if self.ledger.in_cooldown(&url.domain, now).await {
                debug!(domain = %url.domain, "domain in cooldown, url stays due");
                continue;
            }
            if self.dispatch(&url, score, now).await {
                dispatched += 1;
            }
        }
        if dispatched > 0 {
            info!(dispatched, "scheduler tick");
        }
        dispatched
    }

    /// The instant this URL should next be visited, with the per-cycle
    /// jitter folded in.
    async fn scheduled_at(&self, url: &MonitoredUrl, now: DateTime<Utc>) -> DateTime<Utc> {
        let Some(last_check) = url.last_check else {
            // Never checked: due immediately.
            return now - self.tick_interval;
        };

        let rate = self.ledger.success_rate(&url.domain).await;
        let stretch = if rate < self.success_floor {
            (1.0 + (self.success_floor - rate)).min(3.0)
        } else {
            1.0
        };

        let base_secs = (url.base_interval_mins * 60) as f64;
        let interval_secs = base_secs * priority_factor(url.priority) * stretch;

        let jitter = self.cycle_jitter(url.id, url.last_check).await;
        let jittered = interval_secs * (1.0 + jitter);
        last_check + ChronoDuration::milliseconds((jittered * 1000.0) as i64)
    }

    /// Jitter factor in `[-jitter_fraction, +jitter_fraction]`, sampled
    /// once per cycle: a new factor is drawn only when `last_check` moves.
    async fn cycle_jitter(&self, url_id: u64, last_check: Option<DateTime<Utc>>) -> f64 {
        let mut jitter = self.jitter.lock().await;
        let entry = jitter.entry(url_id).or_insert(CycleJitter {
            sampled_for: None,
            factor: 0.0,
        });
        if entry.sampled_for != last_check {
            entry.sampled_for = last_check;
            entry.factor =
                rand::thread_rng().gen_range(-self.jitter_fraction..=self.jitter_fraction);
        }
        entry.factor
    }

    /// CAS `last_check`, enqueue, roll back on rejection. Returns whether
    /// the URL was handed to the queue.
    async fn dispatch(&self, url: &MonitoredUrl, score: f64, now: DateTime<Utc>) -> bool {
        let cas = self
            .store
            .update_last_check(url.id, url.last_check, Some(now))
            .await;
        match cas {
            Ok(true) => {}
            Ok(false) => {
                debug!(url_id = url.id, "lost last_check race, skipping");
                return false;
            }
            Err(err) => {
                warn!(url_id = url.id, error = %err, "last_check CAS failed");
                return false;
            }
        }

        let item = WorkItem {
            url_id: url.id,
            url: url.url.clone(),
            domain: url.domain.clone(),
            priority_score: score,
            priority: url.priority,
            deadline: now + self.tick_interval,
            complexity: self.complexity_hint(&url.domain).await,
            attempt: 0,
        };

        match self.queue.enqueue(item).await {
            Ok(()) => true,
            Err(err) => {
                // Optimistic write must not stand without a queued item.
                if !matches!(err, EnqueueError::Duplicate) {
                    warn!(url_id = url.id, error = %err, "enqueue rejected, rolling back");
                }
                let rollback = self
                    .store
                    .update_last_check(url.id, Some(now), url.last_check)
                    .await;
                if let Err(rb) = rollback {
                    warn!(url_id = url.id, error = %rb, "last_check rollback failed");
                }
                false
            }
        }
    }

    /// Complexity class from the domain's processing-time ledger.
    async fn complexity_hint(&self, domain: &str) -> ComplexityClass {
        let avg = self.ledger.avg_processing_secs(domain).await;
        if avg == 0.0 {
            ComplexityClass::Normal
        } else if avg < CHEAP_UNDER_SECS {
            ComplexityClass::Cheap
        } else if avg > EXPENSIVE_OVER_SECS {
            ComplexityClass::Expensive
        } else {
            ComplexityClass::Normal
        }
    }

    /// Feed an attempt outcome back into the domain ledger. Reports the
    /// resulting domain transition: an extended cooldown on a block, a
    /// recovery when a success clears one.
    pub async fn on_outcome(&self, result: &AttemptResult) -> Option<DomainTransition> {
        let processing_secs = (result.finished_at - result.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;

        if result.outcome.is_block() {
            let until = self.ledger.record_block(&result.domain, result.finished_at).await;
            let consecutive_blocks = self
                .ledger
                .state(&result.domain)
                .await
                .map(|s| s.consecutive_blocks)
                .unwrap_or(0);
            Some(DomainTransition::CooldownExtended {
                until,
                consecutive_blocks,
            })
        } else {
            self.ledger
                .record_outcome(&result.domain, result.outcome, processing_secs)
                .await
                .then_some(DomainTransition::Recovered)
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_interval", &self.tick_interval)
            .field("jitter_fraction", &self.jitter_fraction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig {
            tick_interval_secs: 60,
            jitter_fraction: 0.083,
            rate_per_second: 1000.0,
            burst: 1000,
            max_per_domain: 100,
            max_concurrency: 100,
            max_pending: 10_000,
            ..Default::default()
        }
    }

    async fn setup(cfg: &RuntimeConfig) -> (Arc<MemoryStore>, Arc<WorkQueue>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(DomainLedger::new(cfg, store.clone()));
        let bus = Arc::new(crate::events::EventBus::new(16));
        let queue = Arc::new(WorkQueue::new(cfg, ledger.clone(), bus));
        let scheduler = Scheduler::new(cfg, store.clone(), queue.clone(), ledger);
        (store, queue, scheduler)
    }

    fn url(id: u64, domain: &str, priority: u8, last_check: Option<DateTime<Utc>>) -> MonitoredUrl {
        MonitoredUrl {
            id,
            url: format!("https://{domain}/p/{id}"),
            domain: domain.to_string(),
            priority,
            base_interval_mins: 360,
            last_check,
            active: true,
        }
    }

    #[test]
    fn test_priority_factor_endpoints() {
        assert!((priority_factor(0) - 1.5).abs() < 1e-9);
        assert!((priority_factor(9) - 0.5).abs() < 1e-9);
        // Linear midpoint
        assert!((priority_factor(4) - (1.5 - 4.0 / 9.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_never_checked_url_dispatches() {
        let cfg = cfg();
        let (store, queue, scheduler) = setup(&cfg).await;
        store.add_url(url(1, "a.example", 5, None)).await;

        assert_eq!(scheduler.tick(Utc::now()).await, 1);
        assert_eq!(queue.stats().await.pending_normal, 1);
        // last_check written optimistically.
        assert!(store.url(1).await.unwrap().last_check.is_some());
    }

    #[tokio::test]
    async fn test_not_yet_due_url_stays() {
        let cfg = cfg();
        let (store, queue, scheduler) = setup(&cfg).await;
        // Checked just now; 6 h interval means far from due.
        store.add_url(url(1, "a.example", 5, Some(Utc::now()))).await;

        assert_eq!(scheduler.tick(Utc::now()).await, 0);
        assert_eq!(queue.stats().await.pending_normal, 0);
    }

    #[tokio::test]
    async fn test_overdue_url_dispatches() {
        let cfg = cfg();
        let (store, _queue, scheduler) = setup(&cfg).await;
        let long_ago = Utc::now() - ChronoDuration::hours(12);
        store.add_url(url(1, "a.example", 5, Some(long_ago))).await;

        assert_eq!(scheduler.tick(Utc::now()).await, 1);
    }

    #[tokio::test]
    async fn test_inactive_url_excluded() {
        let cfg = cfg();
        let (store, _queue, scheduler) = setup(&cfg).await;
        let mut u = url(1, "a.example", 5, None);
        u.active = false;
        store.add_url(u).await;

        assert_eq!(scheduler.tick(Utc::now()).await, 0);
    }

    #[tokio::test]
    async fn test_cooldown_domain_skipped_but_stays_due() {
        let cfg = cfg();
        let (store, queue, scheduler) = setup(&cfg).await;
        store.add_url(url(1, "a.example", 5, None)).await;

        scheduler.ledger.record_block("a.example", Utc::now()).await;

        assert_eq!(scheduler.tick(Utc::now()).await, 0);
        // Not dispatched, last_check untouched: retried next tick.
        assert!(store.url(1).await.unwrap().last_check.is_none());
        assert_eq!(queue.stats().await.pending_normal, 0);
    }

    #[tokio::test]
    async fn test_double_tick_no_double_dispatch() {
        let cfg = cfg();
        let (store, queue, scheduler) = setup(&cfg).await;
        store.add_url(url(1, "a.example", 5, None)).await;

        assert_eq!(scheduler.tick(Utc::now()).await, 1);
        // Second tick: url freshly checked, nothing due; even if it were,
        // the queue's duplicate guard would reject it.
        assert_eq!(scheduler.tick(Utc::now()).await, 0);
        assert_eq!(queue.stats().await.total_enqueued, 1);
    }

    #[tokio::test]
    async fn test_rollback_on_queue_full() {
        let cfg = RuntimeConfig {
            max_pending: 1,
            ..cfg()
        };
        let (store, _queue, scheduler) = setup(&cfg).await;
        store.add_url(url(1, "a.example", 5, None)).await;
        store.add_url(url(2, "b.example", 5, None)).await;

        // Only one fits; the second's last_check must roll back.
        assert_eq!(scheduler.tick(Utc::now()).await, 1);
        let rolled_back = store.url(2).await.unwrap();
        assert!(rolled_back.last_check.is_none());
    }

    #[tokio::test]
    async fn test_low_success_rate_stretches_interval() {
        let cfg = cfg();
        let (_store, _queue, scheduler) = setup(&cfg).await;

        // Hammer the ledger down to a poor success rate.
        for _ in 0..12 {
            scheduler
                .ledger
                .record_outcome("a.example", AttemptOutcome::NetworkError, 1.0)
                .await;
        }
        let rate = scheduler.ledger.success_rate("a.example").await;
        assert!(rate < 0.5);

        let checked_at = Utc::now() - ChronoDuration::hours(6);
        let u = url(1, "a.example", 5, Some(checked_at));
        let healthy = url(2, "b.example", 5, Some(checked_at));

        let sick_at = scheduler.scheduled_at(&u, Utc::now()).await;
        let healthy_at = scheduler.scheduled_at(&healthy, Utc::now()).await;
        // Jitter is at most ±8.3%; the stretch exceeds it by construction.
        assert!(sick_at > healthy_at);
    }

    #[tokio::test]
    async fn test_jitter_sampled_once_per_cycle() {
        let cfg = cfg();
        let (_store, _queue, scheduler) = setup(&cfg).await;
        let checked_at = Some(Utc::now() - ChronoDuration::hours(3));
        let u = url(1, "a.example", 5, checked_at);

        let first = scheduler.scheduled_at(&u, Utc::now()).await;
        let second = scheduler.scheduled_at(&u, Utc::now()).await;
        // Same cycle → same jitter → same instant.
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_block_outcome_reports_cooldown() {
        let cfg = cfg();
        let (_store, _queue, scheduler) = setup(&cfg).await;
        let now = Utc::now();
        let result = AttemptResult {
            url_id: 1,
            url: "https://a.example/p/1".into(),
            domain: "a.example".into(),
            started_at: now,
            finished_at: now,
            outcome: AttemptOutcome::Captcha,
            strategies_tried: Vec::new(),
            record: None,
            signals: Vec::new(),
        };
        match scheduler.on_outcome(&result).await.expect("cooldown set") {
            DomainTransition::CooldownExtended {
                until,
                consecutive_blocks,
            } => {
                assert!(until > now);
                assert_eq!(consecutive_blocks, 1);
            }
            other => panic!("expected cooldown extension, got {other:?}"),
        }

        // A later success clears the cooldown and reports the recovery.
        let ok = AttemptResult {
            outcome: AttemptOutcome::Ok,
            started_at: now + ChronoDuration::seconds(1),
            finished_at: now + ChronoDuration::seconds(2),
            ..result.clone()
        };
        assert_eq!(
            scheduler.on_outcome(&ok).await,
            Some(DomainTransition::Recovered)
        );
        // No active cooldown left: further successes report nothing.
        assert_eq!(scheduler.on_outcome(&ok).await, None);
    }
}
