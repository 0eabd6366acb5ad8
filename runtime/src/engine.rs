//! Extraction engine — one URL attempt end-to-end.
//!
//! The engine drives a single attempt through its state machine:
//!
//! `Init → AcquiringSession → Navigating → WaitingReady → Interacting →
//! Snapshotting → Extracting → Validating → {Ok | Partial | Failed}`
//!
//! with short-circuit transitions to `Captcha`, `Blocked`, and
//! `NetworkError` from any pre-Extracting state. The engine never retries:
//! transient errors surface to the queue so fingerprint and proxy rotation
//! stay centralized there.

use crate::browser::pool::SessionPool;
use crate::browser::{detect_block_in_document, BlockSignal, DomSnapshot, ReadySpec};
use crate::config::RuntimeConfig;
use crate::model::{
    AttemptOutcome, AttemptResult, AttemptSignal, Availability, PriceRecord, RecordViolation,
    StrategyTrace,
};
use crate::proxy::ProxyPool;
use crate::queue::WorkItem;
use crate::stealth::{self, FingerprintProfile};
use crate::strategy::evaluator::{self, Extraction};
use crate::strategy::{Strategy, StrategyKind, TargetField};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// What one attempt produced before the envelope is stamped.
struct InnerOutcome {
    outcome: AttemptOutcome,
    traces: Vec<StrategyTrace>,
    record: Option<PriceRecord>,
    signals: Vec<AttemptSignal>,
}

impl InnerOutcome {
    fn bare(outcome: AttemptOutcome, signals: Vec<AttemptSignal>) -> Self {
        Self {
            outcome,
            traces: Vec::new(),
            record: None,
            signals,
        }
    }
}

pub struct ExtractionEngine {
    pool: Arc<SessionPool>,
    proxies: Arc<dyn ProxyPool>,
    profiles: Vec<FingerprintProfile>,
    /// Per-domain navigation budget EMA, seconds.
    nav_budget: Mutex<HashMap<String, f64>>,
    navigation_timeout: Duration,
    navigation_timeout_max: Duration,
    attempt_deadline: Duration,
    ready_floor_ms: u64,
    network_idle_ms: u64,
}

impl ExtractionEngine {
    pub fn new(
        cfg: &RuntimeConfig,
        pool: Arc<SessionPool>,
        proxies: Arc<dyn ProxyPool>,
    ) -> Self {
        Self {
            pool,
            proxies,
            profiles: stealth::builtin_profiles().to_vec(),
            nav_budget: Mutex::new(HashMap::new()),
            navigation_timeout: cfg.navigation_timeout(),
            navigation_timeout_max: Duration::from_secs(cfg.navigation_timeout_max_secs),
            attempt_deadline: cfg.attempt_deadline(),
            ready_floor_ms: cfg.ready_floor_ms,
            network_idle_ms: cfg.network_idle_ms,
        }
    }

    /// Run one attempt under the whole-attempt deadline. Deadline expiry
    /// cancels the session (the lease drops with the future) and reports
    /// `network_error` with a timeout signal.
    pub async fn run_attempt(&self, item: &WorkItem, portfolio: &[Strategy]) -> AttemptResult {
        let started_at = Utc::now();
        let inner = match tokio::time::timeout(
            self.attempt_deadline,
            self.attempt_inner(item, portfolio),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => {
                warn!(url_id = item.url_id, "attempt deadline expired");
                InnerOutcome::bare(AttemptOutcome::NetworkError, vec![AttemptSignal::Timeout])
            }
        };

        AttemptResult {
            url_id: item.url_id,
            url: item.url.clone(),
            domain: item.domain.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome: inner.outcome,
            strategies_tried: inner.traces,
            record: inner.record,
            signals: inner.signals,
        }
    }

    async fn attempt_inner(&self, item: &WorkItem, portfolio: &[Strategy]) -> InnerOutcome {
        // AcquiringSession: fingerprint and proxy are rotated per attempt.
        let profile = {
            let mut rng = rand::thread_rng();
            stealth::pick_for_domain(&mut rng, &[], &self.profiles).clone()
        };
        let proxy = self.proxies.select(&item.domain);
        let proxy_id = proxy.as_ref().map(|p| p.id.clone());

        let mut lease = match self.pool.acquire(&profile, proxy.as_ref()).await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(url_id = item.url_id, error = %err, "session acquisition failed");
                return InnerOutcome::bare(
                    AttemptOutcome::NetworkError,
                    vec![AttemptSignal::BrowserCrash],
                );
            }
        };

        let nav_timeout = self.navigation_budget(&item.domain).await;
        let nav_started = Instant::now();

        // Navigating
        let nav = match lease.session().navigate(&item.url, nav_timeout).await {
            Ok(nav) => nav,
            Err(err) => {
                debug!(url_id = item.url_id, error = %err, "navigation failed");
                self.report_proxy(&proxy_id, false);
                lease.close().await;
                return InnerOutcome::bare(
                    AttemptOutcome::NetworkError,
                    vec![AttemptSignal::ProxyFailure {
                        endpoint: proxy_id.unwrap_or_else(|| "direct".into()),
                    }],
                );
            }
        };
        self.update_navigation_budget(&item.domain, nav_started.elapsed())
            .await;

        if let Some(signal) = status_block(nav.status) {
            self.report_proxy(&proxy_id, false);
            lease.close().await;
            return self.blocked_outcome(signal);
        }

        // WaitingReady
        let ready = ReadySpec {
            network_idle_ms: self.network_idle_ms,
            predicate_selector: readiness_predicate(portfolio),
            floor: Duration::from_millis(self.ready_floor_ms),
            timeout: nav_timeout,
        };
        if let Err(err) = lease.session().wait_ready(&ready).await {
            debug!(url_id = item.url_id, error = %err, "readiness wait failed");
            lease.close().await;
            return InnerOutcome::bare(AttemptOutcome::NetworkError, Vec::new());
        }

        // Block probe before spending interaction time.
        match lease.session().detect_block().await {
            Ok(Some(signal)) => {
                self.report_proxy(&proxy_id, false);
                lease.close().await;
                return self.blocked_outcome(signal);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(url_id = item.url_id, error = %err, "block probe failed");
                lease.close().await;
                return InnerOutcome::bare(
                    AttemptOutcome::NetworkError,
                    vec![AttemptSignal::BrowserCrash],
                );
            }
        }

        // Interacting: triggers lazy-loaded price blocks.
        let script = {
            let mut rng = rand::thread_rng();
            profile.interaction_script(&mut rng)
        };
        if let Err(err) = lease.session().interact(&script).await {
            // Interaction failure is survivable; the snapshot may still
            // carry the price.
            debug!(url_id = item.url_id, error = %err, "interaction failed");
        }

        // Snapshotting
        let snapshot = match lease.session().snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(url_id = item.url_id, error = %err, "snapshot failed");
                lease.close().await;
                return InnerOutcome::bare(
                    AttemptOutcome::NetworkError,
                    vec![AttemptSignal::BrowserCrash],
                );
            }
        };
        lease.close().await;

        // A block page can also materialize after readiness (late
        // challenge injection); check the snapshot too.
        if let Some(signal) = detect_block_in_document(&snapshot.html, &snapshot.url, nav.status) {
            self.report_proxy(&proxy_id, false);
            return self.blocked_outcome(signal);
        }

        self.report_proxy(&proxy_id, true);

        // Extracting: the evaluator is synchronous (`scraper` types are
        // `!Send`), so it runs on the blocking pool.
        let portfolio_owned: Vec<Strategy> = portfolio.to_vec();
        let extraction = run_evaluation(snapshot, portfolio_owned).await;

        // Validating
        self.assemble(item, extraction)
    }

    /// Turn an extraction into the final outcome, enforcing the record
    /// invariants.
    fn assemble(&self, item: &WorkItem, extraction: Extraction) -> InnerOutcome {
        let traces = extraction.traces.clone();

        let Some((price, price_fv)) = extraction.price.clone() else {
            // strategies_tried stays populated for the learning layer.
            return InnerOutcome {
                outcome: AttemptOutcome::ExtractionFailed,
                traces,
                record: None,
                signals: Vec::new(),
            };
        };

        let mut record = PriceRecord {
            url_id: item.url_id,
            checked_at: Utc::now(),
            price,
            old_price: extraction.old_price.as_ref().map(|(v, _)| *v),
            pix_price: extraction.pix_price.as_ref().map(|(v, _)| *v),
            installment: extraction
                .installment
                .as_ref()
                .map(|(plans, _)| plans.clone())
                .unwrap_or_default(),
            availability: extraction
                .availability
                .as_ref()
                .map(|(a, _)| *a)
                .unwrap_or(Availability::Unknown),
            availability_text: extraction
                .availability
                .as_ref()
                .map(|(_, fv)| fv.raw.clone()),
            seller: None,
            promotion_labels: extraction.promotion_labels.clone(),
            promotion_end: None,
            extraction_strategy_id: price_fv.strategy_id.clone(),
            extraction_confidence: extraction.required_confidence(),
        };

        let mut degraded = extraction.degraded;

        // Invariant violations surviving the evaluator's cross-field pass
        // drop the offending optional field rather than the record.
        for _ in 0..2 {
            match record.validate() {
                Ok(()) => break,
                Err(RecordViolation::PixAbovePrice) => {
                    record.pix_price = None;
                    degraded = true;
                }
                Err(RecordViolation::OldBelowPrice) => {
                    record.old_price = None;
                    degraded = true;
                }
                Err(violation) => {
                    warn!(url_id = item.url_id, ?violation, "unrecoverable record violation");
                    return InnerOutcome {
                        outcome: AttemptOutcome::Partial,
                        traces,
                        record: None,
                        signals: Vec::new(),
                    };
                }
            }
        }
        if record.validate().is_err() {
            return InnerOutcome {
                outcome: AttemptOutcome::Partial,
                traces,
                record: None,
                signals: Vec::new(),
            };
        }

        let outcome = if degraded {
            AttemptOutcome::Partial
        } else {
            AttemptOutcome::Ok
        };
        InnerOutcome {
            outcome,
            traces,
            record: Some(record),
            signals: Vec::new(),
        }
    }

    fn blocked_outcome(&self, signal: BlockSignal) -> InnerOutcome {
        let outcome = if signal.is_captcha() {
            AttemptOutcome::Captcha
        } else {
            AttemptOutcome::Blocked
        };
        InnerOutcome::bare(
            outcome,
            vec![AttemptSignal::Block {
                evidence: signal.evidence,
            }],
        )
    }

    fn report_proxy(&self, proxy_id: &Option<String>, ok: bool) {
        if let Some(id) = proxy_id {
            self.proxies.report(id, ok);
        }
    }

    /// Adaptive navigation budget: the configured hard timeout, extended
    /// by the domain's observed pace up to the ceiling.
    async fn navigation_budget(&self, domain: &str) -> Duration {
        let budget = self.nav_budget.lock().await;
        match budget.get(domain) {
            Some(secs) => Duration::from_secs_f64(
                secs.max(self.navigation_timeout.as_secs_f64())
                    .min(self.navigation_timeout_max.as_secs_f64()),
            ),
            None => self.navigation_timeout,
        }
    }

    async fn update_navigation_budget(&self, domain: &str, observed: Duration) {
        let observed_scaled = observed.as_secs_f64() * 1.5;
        let mut budget = self.nav_budget.lock().await;
        let entry = budget
            .entry(domain.to_string())
            .or_insert_with(|| self.navigation_timeout.as_secs_f64());
        *entry = (*entry * 0.7 + observed_scaled * 0.3)
            .min(self.navigation_timeout_max.as_secs_f64());
    }
}

/// Pick the readiness predicate from strategy data: the top-priority CSS
/// price strategy's selector marks the page ready for extraction.
fn readiness_predicate(portfolio: &[Strategy]) -> Option<String> {
    portfolio
        .iter()
        .filter(|s| s.target_field == TargetField::Price)
        .filter_map(|s| match &s.kind {
            StrategyKind::Css { selector, .. } => Some((s.priority, selector.clone())),
            _ => None,
        })
        .min_by_key(|(priority, _)| *priority)
        .map(|(_, selector)| selector)
}

fn status_block(status: u16) -> Option<BlockSignal> {
    detect_block_in_document("<html><body>placeholder</body></html>", "", status)
}

/// Evaluate on the blocking pool (`scraper` types are `!Send`). An empty
/// extraction comes back if the runtime refuses the task during shutdown.
async fn run_evaluation(snapshot: DomSnapshot, portfolio: Vec<Strategy>) -> Extraction {
    tokio::task::spawn_blocking(move || {
        let rendered = if snapshot.rendered_text.is_empty() {
            None
        } else {
            Some(snapshot.rendered_text.as_str())
        };
        evaluator::evaluate(&snapshot.html, rendered, &portfolio)
    })
    .await
    .unwrap_or_default()
}
