//! Adaptive learning layer — expected-utility bookkeeping over every
//! strategy, plus portfolio evolution.
//!
//! Strategy mutations for one domain are serialized through a stripe of
//! 256 shard locks, so a reprioritization is atomic with respect to the
//! confidence updates feeding it. Attempts are deduplicated by
//! `(url_id, started_at)` before any metric moves, making event processing
//! idempotent. Generic (`*`) strategies are read-only: the first success
//! for a concrete domain clones them into that domain and credit flows to
//! the copy from then on.

use crate::config::RuntimeConfig;
use crate::events::{EventBus, MonitorEvent};
use crate::model::AttemptResult;
use crate::store::StrategyStore;
use crate::strategy::{
    rank, seeds, variants, Strategy, StrategyId, FALLBACK_ID_PREFIX, GENERIC_DOMAIN,
};
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Number of shard locks serializing per-domain mutations.
const STRIPES: usize = 256;

/// Dedup window for replayed attempt events.
const DEDUP_WINDOW: usize = 4096;

/// Confidence EMA step. Half-life ≈ 7 attempts.
const EMA_STEP: f64 = 0.1;

/// How many sample URLs a strategy keeps.
const SAMPLE_URLS_KEPT: usize = 5;

/// High-confidence variant trigger: `c > 0.8` after ≥ 10 attempts.
const VARIANT_CONFIDENCE: f64 = 0.8;
const VARIANT_MIN_ATTEMPTS: u64 = 10;

#[derive(Default)]
struct DomainPortfolio {
    loaded: bool,
    strategies: Vec<Strategy>,
    attempts_since_reprioritize: u64,
    attempts_since_variants: u64,
    /// Parents that already produced a generation of variants.
    spawned_parents: HashSet<StrategyId>,
    dirty: bool,
}

struct DedupSet {
    seen: HashSet<(u64, DateTime<Utc>)>,
    order: VecDeque<(u64, DateTime<Utc>)>,
}

impl DedupSet {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true the first time a key is seen.
    fn insert(&mut self, key: (u64, DateTime<Utc>)) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > DEDUP_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

pub struct LearningLayer {
    store: Arc<dyn StrategyStore>,
    bus: Arc<EventBus>,
    shards: Vec<Mutex<HashMap<String, DomainPortfolio>>>,
    generics: Mutex<Option<Arc<Vec<Strategy>>>>,
    dedup: Mutex<DedupSet>,
    reprioritize_every: u64,
    variant_every: u64,
    variant_fanout: usize,
    retire_confidence: f64,
    retire_min_attempts: u64,
    probation_attempts: u64,
    probation_confidence: f64,
}

impl LearningLayer {
    pub fn new(cfg: &RuntimeConfig, store: Arc<dyn StrategyStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            shards: (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
            generics: Mutex::new(None),
            dedup: Mutex::new(DedupSet::new()),
            reprioritize_every: cfg.reprioritize_every,
            variant_every: cfg.variant_every,
            variant_fanout: cfg.variant_fanout,
            retire_confidence: cfg.retire_confidence,
            retire_min_attempts: cfg.retire_min_attempts,
            probation_attempts: cfg.probation_attempts,
            probation_confidence: cfg.probation_confidence,
        }
    }

    fn shard_for(&self, domain: &str) -> &Mutex<HashMap<String, DomainPortfolio>> {
        let mut hasher = DefaultHasher::new();
        domain.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % STRIPES]
    }

    /// Load (or seed) the read-only generic strategies.
    async fn generics(&self) -> Arc<Vec<Strategy>> {
        let mut slot = self.generics.lock().await;
        if let Some(generics) = slot.as_ref() {
            return generics.clone();
        }
        let stored = self
            .store
            .list_strategies(GENERIC_DOMAIN)
            .await
            .unwrap_or_default();
        let generics = if stored.is_empty() {
            let seeded = seeds::generic_portfolio();
            if let Err(err) = self
                .store
                .upsert_strategies(GENERIC_DOMAIN, seeded.clone())
                .await
            {
                warn!(error = %err, "failed to persist generic seeds");
            }
            seeded
        } else {
            stored
        };
        let generics = Arc::new(generics);
        *slot = Some(generics.clone());
        generics
    }

    /// The evaluation portfolio for a domain: its own strategies plus the
    /// generics not yet shadowed by a domain copy, in rank order.
    pub async fn portfolio_for(&self, domain: &str) -> Vec<Strategy> {
        let generics = self.generics().await;
        let mut shard = self.shard_for(domain).lock().await;
        let portfolio = shard.entry(domain.to_string()).or_default();
        self.ensure_loaded(domain, portfolio).await;

        let mut combined = portfolio.strategies.clone();
        let shadowed: HashSet<StrategyId> = combined
            .iter()
            .filter_map(|s| s.parent_id.clone())
            .collect();
        combined.extend(
            generics
                .iter()
                .filter(|g| !shadowed.contains(&g.id))
                .cloned(),
        );
        rank(&mut combined);
        combined
    }

    async fn ensure_loaded(&self, domain: &str, portfolio: &mut DomainPortfolio) {
        if portfolio.loaded {
            return;
        }
        match self.store.list_strategies(domain).await {
            Ok(stored) if !stored.is_empty() => {
                portfolio.strategies = stored;
            }
            Ok(_) => {
                // Unseen domain: static seeds (generics stay separate).
                let seeded = seeds::domain_seeds(domain);
                if !seeded.is_empty() {
                    if let Err(err) = self.store.upsert_strategies(domain, seeded.clone()).await {
                        warn!(domain, error = %err, "failed to persist domain seeds");
                    }
                }
                portfolio.strategies = seeded;
            }
            Err(err) => {
                // Skip this cycle; a later call retries the load.
                warn!(domain, error = %err, "strategy load failed");
                return;
            }
        }
        portfolio.spawned_parents = portfolio
            .strategies
            .iter()
            .filter_map(|s| s.parent_id.clone())
            .collect();
        portfolio.loaded = true;
    }

    /// Apply one attempt result. Idempotent per `(url_id, started_at)`.
    pub async fn on_attempt(&self, result: &AttemptResult) {
        if result.cancelled_by_shutdown() {
            debug!(url_id = result.url_id, "shutdown-cancelled attempt ignored");
            return;
        }
        if !self.dedup.lock().await.insert(result.dedup_key()) {
            debug!(url_id = result.url_id, "duplicate attempt event ignored");
            return;
        }
        if result.strategies_tried.is_empty() {
            // Block/network outcomes carry no extraction signal.
            return;
        }

        let domain = result.domain.as_str();
        let generics = self.generics().await;
        let mut shard = self.shard_for(domain).lock().await;
        let portfolio = shard.entry(domain.to_string()).or_default();
        self.ensure_loaded(domain, portfolio).await;

        let now = result.finished_at;
        let mut archived: Vec<Strategy> = Vec::new();

        for trace in &result.strategies_tried {
            if trace.strategy_id.starts_with(FALLBACK_ID_PREFIX) {
                continue;
            }

            let idx = match portfolio
                .strategies
                .iter()
                .position(|s| s.id == trace.strategy_id)
            {
                Some(idx) => idx,
                None => {
                    let Some(generic) = generics.iter().find(|g| g.id == trace.strategy_id) else {
                        debug!(id = %trace.strategy_id, "trace for unknown strategy");
                        continue;
                    };
                    if !trace.success {
                        // Generic strategies are read-only; failures leave
                        // them untouched.
                        continue;
                    }
                    // First successful use: domain-scoped copy shadows the
                    // generic from now on.
                    let copy = Strategy {
                        id: format!("{}@{domain}", generic.id),
                        domain: domain.to_string(),
                        parent_id: Some(generic.id.clone()),
                        ..generic.clone()
                    };
                    info!(domain, id = %copy.id, "generic strategy copied into domain");
                    portfolio.strategies.push(copy);
                    portfolio.strategies.len() - 1
                }
            };

            update_metrics(
                &mut portfolio.strategies[idx],
                trace.success,
                &result.url,
                now,
            );
            portfolio.dirty = true;
        }

        // Probation and retirement sweep.
        let mut kept = Vec::with_capacity(portfolio.strategies.len());
        for strategy in portfolio.strategies.drain(..) {
            let on_probation = strategy.parent_id.is_some()
                && strategy.attempts >= self.probation_attempts
                && strategy.confidence < self.probation_confidence;
            let worn_out = strategy.confidence < self.retire_confidence
                && strategy.attempts > self.retire_min_attempts;
            if on_probation || worn_out {
                self.bus.emit(MonitorEvent::StrategyRetired {
                    domain: domain.to_string(),
                    strategy_id: strategy.id.clone(),
                });
                archived.push(strategy);
            } else {
                kept.push(strategy);
            }
        }
        portfolio.strategies = kept;

        portfolio.attempts_since_reprioritize += 1;
        portfolio.attempts_since_variants += 1;

        if portfolio.attempts_since_reprioritize >= self.reprioritize_every {
            self.reprioritize(domain, portfolio);
        }

        self.maybe_spawn_variants(domain, portfolio);

        // Write-back: archives flush immediately (they leave the active
        // set), metric updates flush with the periodic reprioritization.
        if !archived.is_empty() {
            if let Err(err) = self.store.archive_strategies(domain, archived).await {
                warn!(domain, error = %err, "archive write failed");
            }
        }
        if portfolio.dirty && portfolio.attempts_since_reprioritize == 0 {
            self.flush_portfolio(domain, portfolio).await;
        }
    }

    /// Rank by `score = confidence × success_rate`, descending; priorities
    /// become exactly `0..n`. Ties break by most recent success, then id.
    fn reprioritize(&self, domain: &str, portfolio: &mut DomainPortfolio) {
        let mut order: Vec<usize> = (0..portfolio.strategies.len()).collect();
        order.sort_by(|&a, &b| {
            let sa = &portfolio.strategies[a];
            let sb = &portfolio.strategies[b];
            let score_a = sa.confidence * sa.success_rate();
            let score_b = sb.confidence * sb.success_rate();
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(sb.last_success.cmp(&sa.last_success))
                .then(sa.id.cmp(&sb.id))
        });
        for (new_priority, idx) in order.into_iter().enumerate() {
            portfolio.strategies[idx].priority = new_priority as i32;
        }
        portfolio.attempts_since_reprioritize = 0;
        portfolio.dirty = true;
        self.bus.emit(MonitorEvent::PortfolioReprioritized {
            domain: domain.to_string(),
            portfolio_size: portfolio.strategies.len(),
        });
        debug!(domain, size = portfolio.strategies.len(), "reprioritized");
    }

    /// Variant triggers: a strategy crossing the confidence bar with no
    /// derived children yet, or the periodic cadence on the current best.
    fn maybe_spawn_variants(&self, domain: &str, portfolio: &mut DomainPortfolio) {
        let mut parents: Vec<Strategy> = Vec::new();

        for s in &portfolio.strategies {
            if s.confidence > VARIANT_CONFIDENCE
                && s.attempts >= VARIANT_MIN_ATTEMPTS
                && !portfolio.spawned_parents.contains(&s.id)
            {
                parents.push(s.clone());
            }
        }

        if portfolio.attempts_since_variants >= self.variant_every {
            portfolio.attempts_since_variants = 0;
            if let Some(best) = portfolio
                .strategies
                .iter()
                .filter(|s| !portfolio.spawned_parents.contains(&s.id))
                .max_by(|a, b| {
                    (a.confidence * a.success_rate())
                        .partial_cmp(&(b.confidence * b.success_rate()))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
            {
                if !parents.iter().any(|p| p.id == best.id) {
                    parents.push(best.clone());
                }
            }
        }

        for parent in parents {
            let existing_children = portfolio
                .strategies
                .iter()
                .filter(|s| s.parent_id.as_deref() == Some(parent.id.as_str()))
                .count();
            let children = variants::spawn_variants(&parent, self.variant_fanout, existing_children);
            if children.is_empty() {
                continue;
            }
            info!(domain, parent = %parent.id, count = children.len(), "variants spawned");
            self.bus.emit(MonitorEvent::VariantsSpawned {
                domain: domain.to_string(),
                parent_id: parent.id.clone(),
                count: children.len(),
            });
            portfolio.spawned_parents.insert(parent.id.clone());
            portfolio.strategies.extend(children);
            portfolio.dirty = true;
        }
    }

    async fn flush_portfolio(&self, domain: &str, portfolio: &mut DomainPortfolio) {
        if let Err(err) = self
            .store
            .upsert_strategies(domain, portfolio.strategies.clone())
            .await
        {
            warn!(domain, error = %err, "portfolio write-back failed");
            return;
        }
        portfolio.dirty = false;
    }

    /// Persist every dirty portfolio (shutdown path).
    pub async fn flush_all(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            for (domain, portfolio) in shard.iter_mut() {
                if portfolio.dirty {
                    let domain = domain.clone();
                    self.flush_portfolio(&domain, portfolio).await;
                }
            }
        }
    }

    /// Snapshot of one strategy's metrics (test/inspection helper).
    pub async fn strategy_metrics(&self, domain: &str, id: &str) -> Option<Strategy> {
        let mut shard = self.shard_for(domain).lock().await;
        let portfolio = shard.entry(domain.to_string()).or_default();
        self.ensure_loaded(domain, portfolio).await;
        portfolio.strategies.iter().find(|s| s.id == id).cloned()
    }
}

/// Confidence EMA: `0.9·c + 0.1` on success, `0.9·c` on failure. Bounded
/// in `[0, 1]` by construction.
fn update_metrics(strategy: &mut Strategy, success: bool, url: &str, now: DateTime<Utc>) {
    strategy.attempts += 1;
    if success {
        strategy.confidence = (1.0 - EMA_STEP) * strategy.confidence + EMA_STEP;
        strategy.successes += 1;
        strategy.last_success = Some(now);
        if !strategy.sample_urls.iter().any(|u| u == url) {
            strategy.sample_urls.push(url.to_string());
            while strategy.sample_urls.len() > SAMPLE_URLS_KEPT {
                strategy.sample_urls.remove(0);
            }
        }
    } else {
        strategy.confidence = (1.0 - EMA_STEP) * strategy.confidence;
    }
}
