//! Store capability — the persistence seam.
//!
//! The transactional record store is an external collaborator; the core
//! only depends on this trait. [`MemoryStore`] is the in-process
//! implementation used by tests and by bootstrap before a backend is
//! wired up.

use crate::cooldown::DomainState;
use crate::error::StoreError;
use crate::model::{AttemptSummary, MonitoredUrl, PriceRecord};
use crate::strategy::Strategy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Filter for [`StrategyStore::list_urls`].
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    /// Only URLs with `active = true`.
    pub active_only: bool,
    /// Restrict to one domain.
    pub domain: Option<String>,
}

/// The persistence capability required by the core.
#[async_trait]
pub trait StrategyStore: Send + Sync {
    async fn list_urls(&self, filter: UrlFilter) -> Result<Vec<MonitoredUrl>, StoreError>;

    /// Compare-and-set `last_check`. Returns `false` when `prev` no longer
    /// matches — the caller lost the race and must not dispatch.
    async fn update_last_check(
        &self,
        url_id: u64,
        prev: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Strategies scoped to exactly this domain (pass `"*"` for generics).
    async fn list_strategies(&self, domain: &str) -> Result<Vec<Strategy>, StoreError>;

    /// Bulk upsert, keyed by strategy id.
    async fn upsert_strategies(
        &self,
        domain: &str,
        strategies: Vec<Strategy>,
    ) -> Result<(), StoreError>;

    /// Move strategies to the archive. Archived strategies are excluded
    /// from selection but never deleted.
    async fn archive_strategies(
        &self,
        domain: &str,
        strategies: Vec<Strategy>,
    ) -> Result<(), StoreError>;

    async fn insert_price_record(&self, record: PriceRecord) -> Result<(), StoreError>;

    async fn insert_attempt_log(&self, summary: AttemptSummary) -> Result<(), StoreError>;

    async fn load_domain_states(&self) -> Result<Vec<DomainState>, StoreError>;

    async fn save_domain_state(&self, state: DomainState) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    urls: HashMap<u64, MonitoredUrl>,
    strategies: HashMap<String, Vec<Strategy>>,
    archived: HashMap<String, Vec<Strategy>>,
    records: Vec<PriceRecord>,
    attempts: Vec<AttemptSummary>,
    domain_states: HashMap<String, DomainState>,
}

/// In-memory store. Every operation is atomic under one lock, which is
/// exactly the transactional behavior the real backend guarantees.
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
        }
    }

    /// Seed a monitored URL (test/bootstrap helper).
    pub async fn add_url(&self, url: MonitoredUrl) {
        let mut inner = self.inner.write().await;
        inner.urls.insert(url.id, url);
    }

    /// All persisted price records, oldest first.
    pub async fn price_records(&self) -> Vec<PriceRecord> {
        self.inner.read().await.records.clone()
    }

    pub async fn attempt_log(&self) -> Vec<AttemptSummary> {
        self.inner.read().await.attempts.clone()
    }

    pub async fn archived(&self, domain: &str) -> Vec<Strategy> {
        self.inner
            .read()
            .await
            .archived
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn url(&self, url_id: u64) -> Option<MonitoredUrl> {
        self.inner.read().await.urls.get(&url_id).cloned()
    }
}

#[async_trait]
impl StrategyStore for MemoryStore {
    async fn list_urls(&self, filter: UrlFilter) -> Result<Vec<MonitoredUrl>, StoreError> {
        let inner = self.inner.read().await;
        let mut urls: Vec<MonitoredUrl> = inner
            .urls
            .values()
            .filter(|u| !filter.active_only || u.active)
            .filter(|u| filter.domain.as_deref().map_or(true, |d| u.domain == d))
            .cloned()
            .collect();
        urls.sort_by_key(|u| u.id);
        Ok(urls)
    }

    async fn update_last_check(
        &self,
        url_id: u64,
        prev: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(url) = inner.urls.get_mut(&url_id) else {
            return Err(StoreError::Conflict {
                entity: "monitored_url",
                detail: format!("unknown url_id {url_id}"),
            });
        };
        if url.last_check != prev {
            return Ok(false);
        }
        url.last_check = new;
        Ok(true)
    }

    async fn list_strategies(&self, domain: &str) -> Result<Vec<Strategy>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.strategies.get(domain).cloned().unwrap_or_default())
    }

    async fn upsert_strategies(
        &self,
        domain: &str,
        strategies: Vec<Strategy>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let bucket = inner.strategies.entry(domain.to_string()).or_default();
        for strategy in strategies {
            match bucket.iter_mut().find(|s| s.id == strategy.id) {
                Some(existing) => *existing = strategy,
                None => bucket.push(strategy),
            }
        }
        Ok(())
    }

    async fn archive_strategies(
        &self,
        domain: &str,
        strategies: Vec<Strategy>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let ids: Vec<_> = strategies.iter().map(|s| s.id.clone()).collect();
        if let Some(bucket) = inner.strategies.get_mut(domain) {
            bucket.retain(|s| !ids.contains(&s.id));
        }
        inner
            .archived
            .entry(domain.to_string())
            .or_default()
            .extend(strategies);
        Ok(())
    }

    async fn insert_price_record(&self, record: PriceRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.records.push(record);
        Ok(())
    }

    async fn insert_attempt_log(&self, summary: AttemptSummary) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.attempts.push(summary);
        Ok(())
    }

    async fn load_domain_states(&self) -> Result<Vec<DomainState>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.domain_states.values().cloned().collect())
    }

    async fn save_domain_state(&self, state: DomainState) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.domain_states.insert(state.domain.clone(), state);
        Ok(())
    }
}
