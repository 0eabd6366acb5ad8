//! Proxy capability — endpoint selection with health tracking.
//!
//! Selection sits on the engine's hot path, so it reads an immutable
//! snapshot (`Arc<[…]>` behind an `RwLock` that is only write-locked on
//! refresh) and per-endpoint health lives in atomics. `report` never
//! blocks a selector.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// One upstream proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub region: String,
}

/// Proxy provider capability.
#[async_trait]
pub trait ProxyPool: Send + Sync {
    /// Pick an endpoint for a domain. `None` means direct connection.
    fn select(&self, domain: &str) -> Option<ProxyEndpoint>;

    /// Report the outcome of an attempt through an endpoint.
    fn report(&self, endpoint_id: &str, ok: bool);

    /// Re-read the upstream endpoint list (periodic, off the hot path).
    async fn refresh(&self) -> anyhow::Result<()>;
}

/// Consecutive failures after which an endpoint is skipped until refresh.
const FAILURE_STREAK_LIMIT: u32 = 3;

struct EndpointHealth {
    endpoint: ProxyEndpoint,
    consecutive_failures: AtomicU32,
}

/// A fixed-list pool with round-robin selection and failure-streak
/// eviction. Production deployments wrap a provider API behind the same
/// trait; this one also serves the tests.
pub struct StaticProxyPool {
    snapshot: RwLock<Arc<Vec<EndpointHealth>>>,
    cursor: AtomicUsize,
}

impl StaticProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        let healths = endpoints
            .into_iter()
            .map(|endpoint| EndpointHealth {
                endpoint,
                consecutive_failures: AtomicU32::new(0),
            })
            .collect();
        Self {
            snapshot: RwLock::new(Arc::new(healths)),
            cursor: AtomicUsize::new(0),
        }
    }

    /// An empty pool: every selection is a direct connection.
    pub fn direct() -> Self {
        Self::new(Vec::new())
    }

    fn load(&self) -> Arc<Vec<EndpointHealth>> {
        self.snapshot.read().expect("proxy snapshot poisoned").clone()
    }
}

#[async_trait]
impl ProxyPool for StaticProxyPool {
    fn select(&self, _domain: &str) -> Option<ProxyEndpoint> {
        let snapshot = self.load();
        if snapshot.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..snapshot.len() {
            let health = &snapshot[(start + offset) % snapshot.len()];
            if health.consecutive_failures.load(Ordering::Relaxed) < FAILURE_STREAK_LIMIT {
                return Some(health.endpoint.clone());
            }
        }
        // Every endpoint is failing; hand out the nominal pick anyway so
        // attempts keep probing for recovery.
        Some(snapshot[start % snapshot.len()].endpoint.clone())
    }

    fn report(&self, endpoint_id: &str, ok: bool) {
        let snapshot = self.load();
        if let Some(health) = snapshot.iter().find(|h| h.endpoint.id == endpoint_id) {
            if ok {
                health.consecutive_failures.store(0, Ordering::Relaxed);
            } else {
                health.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        // Static list: refresh just clears failure streaks.
        let snapshot = self.load();
        for health in snapshot.iter() {
            health.consecutive_failures.store(0, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> ProxyEndpoint {
        ProxyEndpoint {
            id: id.to_string(),
            host: format!("{id}.proxy.example"),
            port: 22225,
            username: None,
            password: None,
            region: "br".to_string(),
        }
    }

    #[test]
    fn test_round_robin() {
        let pool = StaticProxyPool::new(vec![endpoint("a"), endpoint("b")]);
        let first = pool.select("shop.example").unwrap();
        let second = pool.select("shop.example").unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_direct_pool_selects_nothing() {
        let pool = StaticProxyPool::direct();
        assert!(pool.select("shop.example").is_none());
    }

    #[test]
    fn test_failing_endpoint_skipped() {
        let pool = StaticProxyPool::new(vec![endpoint("a"), endpoint("b")]);
        for _ in 0..FAILURE_STREAK_LIMIT {
            pool.report("a", false);
        }
        for _ in 0..4 {
            assert_eq!(pool.select("shop.example").unwrap().id, "b");
        }
    }

    #[test]
    fn test_success_resets_streak() {
        let pool = StaticProxyPool::new(vec![endpoint("a")]);
        pool.report("a", false);
        pool.report("a", false);
        pool.report("a", true);
        // Streak cleared; endpoint stays eligible.
        assert_eq!(pool.select("x").unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_refresh_revives_endpoints() {
        let pool = StaticProxyPool::new(vec![endpoint("a")]);
        for _ in 0..FAILURE_STREAK_LIMIT {
            pool.report("a", false);
        }
        pool.refresh().await.unwrap();
        assert_eq!(pool.select("x").unwrap().id, "a");
    }

    #[test]
    fn test_all_failing_still_selects() {
        let pool = StaticProxyPool::new(vec![endpoint("a"), endpoint("b")]);
        for id in ["a", "b"] {
            for _ in 0..FAILURE_STREAK_LIMIT {
                pool.report(id, false);
            }
        }
        assert!(pool.select("x").is_some());
    }
}
