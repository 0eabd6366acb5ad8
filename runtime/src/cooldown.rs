//! Per-domain state: cooldowns, block streaks, and success ledgers.
//!
//! Cooldown is monotonic under a block streak — later block events extend
//! `cooldown_until` but never shorten it — and resets only when a
//! successful attempt lands. The state is persisted on every mutation so
//! an operator restart cannot erase an active cooldown.

use crate::config::RuntimeConfig;
use crate::model::AttemptOutcome;
use crate::store::StrategyStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Persistent per-domain state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainState {
    pub domain: String,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub consecutive_blocks: u32,
    pub last_outcome: Option<AttemptOutcome>,
    /// EMA of attempt success (1.0 on success, decayed on failure).
    pub success_rate: f64,
    /// EMA of attempt processing time, seconds. Drives the complexity
    /// class hint and the adaptive navigation budget.
    pub avg_processing_secs: f64,
}

impl DomainState {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            cooldown_until: None,
            consecutive_blocks: 0,
            last_outcome: None,
            success_rate: 1.0,
            avg_processing_secs: 0.0,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }
}

/// Domain-level transition caused by an attempt outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainTransition {
    /// A block signal extended the cooldown window.
    CooldownExtended {
        until: DateTime<Utc>,
        consecutive_blocks: u32,
    },
    /// A successful attempt cleared an active cooldown or block streak.
    Recovered,
}

/// Shared ledger of [`DomainState`], consulted by the scheduler and queue
/// and mutated by attempt outcomes.
pub struct DomainLedger {
    states: Mutex<HashMap<String, DomainState>>,
    store: Arc<dyn StrategyStore>,
    base: ChronoDuration,
    max: ChronoDuration,
    multiplier: f64,
}

impl DomainLedger {
    pub fn new(cfg: &RuntimeConfig, store: Arc<dyn StrategyStore>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            store,
            base: ChronoDuration::seconds(cfg.cooldown_base_secs as i64),
            max: ChronoDuration::seconds(cfg.cooldown_max_secs as i64),
            multiplier: cfg.cooldown_block_multiplier,
        }
    }

    /// Load persisted domain states (cooldowns survive restart).
    pub async fn restore(&self) -> anyhow::Result<()> {
        let persisted = self.store.load_domain_states().await?;
        let mut states = self.states.lock().await;
        for state in persisted {
            debug!(domain = %state.domain, "restored domain state");
            states.insert(state.domain.clone(), state);
        }
        Ok(())
    }

    /// Record a block signal: extends the cooldown, never shortens it.
    /// Returns the new `cooldown_until`.
    pub async fn record_block(&self, domain: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let snapshot = {
            let mut states = self.states.lock().await;
            let state = states
                .entry(domain.to_string())
                .or_insert_with(|| DomainState::new(domain));

            state.consecutive_blocks += 1;
            // First block sits at the base; each further block multiplies.
            let exp = self
                .multiplier
                .powi((state.consecutive_blocks.min(16) - 1) as i32);
            let span_secs =
                ((self.base.num_seconds() as f64) * exp).min(self.max.num_seconds() as f64);
            let candidate = now + ChronoDuration::seconds(span_secs as i64);

            state.cooldown_until = Some(match state.cooldown_until {
                Some(existing) if existing > candidate => existing,
                _ => candidate,
            });
            state.last_outcome = Some(AttemptOutcome::Blocked);
            state.success_rate *= 0.9;
            state.clone()
        };

        let until = snapshot.cooldown_until.expect("just set");
        warn!(
            domain,
            blocks = snapshot.consecutive_blocks,
            until = %until,
            "domain cooldown extended"
        );
        self.persist(snapshot).await;
        until
    }

    /// Record a terminal outcome that is not a block. Returns true when a
    /// successful attempt cleared an active cooldown or block streak (the
    /// domain recovered).
    pub async fn record_outcome(
        &self,
        domain: &str,
        outcome: AttemptOutcome,
        processing_secs: f64,
    ) -> bool {
        let (snapshot, recovered) = {
            let mut states = self.states.lock().await;
            let state = states
                .entry(domain.to_string())
                .or_insert_with(|| DomainState::new(domain));

            state.last_outcome = Some(outcome);
            let mut recovered = false;
            match outcome {
                AttemptOutcome::Ok => {
                    recovered = state.cooldown_until.is_some() || state.consecutive_blocks > 0;
                    state.consecutive_blocks = 0;
                    state.cooldown_until = None;
                    state.success_rate = state.success_rate * 0.9 + 0.1;
                }
                AttemptOutcome::Partial => {
                    // A partial record still proves the domain is reachable.
                    state.consecutive_blocks = 0;
                    state.success_rate = state.success_rate * 0.9 + 0.1;
                }
                _ => {
                    state.success_rate *= 0.9;
                }
            }
            if processing_secs > 0.0 {
                state.avg_processing_secs = if state.avg_processing_secs == 0.0 {
                    processing_secs
                } else {
                    state.avg_processing_secs * 0.7 + processing_secs * 0.3
                };
            }
            (state.clone(), recovered)
        };
        if recovered {
            debug!(domain, "domain recovered from cooldown");
        }
        self.persist(snapshot).await;
        recovered
    }

    /// Whether the domain is excluded from dispatch right now.
    pub async fn in_cooldown(&self, domain: &str, now: DateTime<Utc>) -> bool {
        let states = self.states.lock().await;
        states
            .get(domain)
            .map(|s| s.in_cooldown(now))
            .unwrap_or(false)
    }

    /// Success-rate EMA for the scheduler's adaptive-interval rule.
    pub async fn success_rate(&self, domain: &str) -> f64 {
        let states = self.states.lock().await;
        states.get(domain).map(|s| s.success_rate).unwrap_or(1.0)
    }

    /// Processing-time EMA in seconds; 0 when unobserved.
    pub async fn avg_processing_secs(&self, domain: &str) -> f64 {
        let states = self.states.lock().await;
        states
            .get(domain)
            .map(|s| s.avg_processing_secs)
            .unwrap_or(0.0)
    }

    pub async fn state(&self, domain: &str) -> Option<DomainState> {
        let states = self.states.lock().await;
        states.get(domain).cloned()
    }

    async fn persist(&self, state: DomainState) {
        if let Err(err) = self.store.save_domain_state(state).await {
            // The in-memory ledger stays authoritative; persistence catches
            // up on the next mutation.
            warn!(error = %err, "failed to persist domain state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ledger() -> DomainLedger {
        let cfg = RuntimeConfig {
            cooldown_base_secs: 60,
            cooldown_max_secs: 600,
            cooldown_block_multiplier: 2.0,
            ..Default::default()
        };
        DomainLedger::new(&cfg, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_cooldown_grows_exponentially() {
        let ledger = ledger();
        let now = Utc::now();

        let first = ledger.record_block("x.example", now).await;
        assert_eq!((first - now).num_seconds(), 60);

        let second = ledger.record_block("x.example", now).await;
        // Two consecutive blocks with base 60 s and multiplier 2 → 120 s
        assert_eq!((second - now).num_seconds(), 120);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_cooldown_monotonic() {
        let ledger = ledger();
        let now = Utc::now();
        let mut last = now;
        for _ in 0..8 {
            let until = ledger.record_block("x.example", now).await;
            assert!(until >= last, "cooldown must never shorten");
            last = until;
        }
        // Capped at cooldown_max
        assert!((last - now).num_seconds() <= 600);
    }

    #[tokio::test]
    async fn test_success_resets_streak_and_cooldown() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.record_block("x.example", now).await;
        assert!(ledger.in_cooldown("x.example", now).await);

        let recovered = ledger
            .record_outcome("x.example", AttemptOutcome::Ok, 3.0)
            .await;
        assert!(recovered, "clearing an active cooldown reports recovery");
        assert!(!ledger.in_cooldown("x.example", now).await);
        let state = ledger.state("x.example").await.unwrap();
        assert_eq!(state.consecutive_blocks, 0);

        // Nothing left to clear: the next success is not a recovery.
        let recovered = ledger
            .record_outcome("x.example", AttemptOutcome::Ok, 3.0)
            .await;
        assert!(!recovered);
    }

    #[tokio::test]
    async fn test_success_rate_ema() {
        let ledger = ledger();
        ledger
            .record_outcome("x.example", AttemptOutcome::NetworkError, 0.0)
            .await;
        let after_fail = ledger.success_rate("x.example").await;
        assert!((after_fail - 0.9).abs() < 1e-9);

        ledger
            .record_outcome("x.example", AttemptOutcome::Ok, 0.0)
            .await;
        let after_ok = ledger.success_rate("x.example").await;
        assert!((after_ok - (0.9 * 0.9 + 0.1)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store: Arc<dyn StrategyStore> = Arc::new(MemoryStore::new());
        let cfg = RuntimeConfig {
            cooldown_base_secs: 60,
            cooldown_max_secs: 600,
            cooldown_block_multiplier: 2.0,
            ..Default::default()
        };
        let now = Utc::now();
        {
            let ledger = DomainLedger::new(&cfg, store.clone());
            ledger.record_block("x.example", now).await;
        }
        // A fresh ledger over the same store sees the cooldown.
        let reborn = DomainLedger::new(&cfg, store);
        reborn.restore().await.unwrap();
        assert!(reborn.in_cooldown("x.example", now).await);
    }
}
