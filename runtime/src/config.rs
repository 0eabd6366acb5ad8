//! Runtime configuration — every tunable knob of the scraping core.
//!
//! A `RuntimeConfig` is built once at startup (from defaults, a JSON file,
//! or env overrides), validated, and passed into [`crate::runtime::Runtime`].
//! There are no ambient configuration globals.

use crate::error::ScrapeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Full configuration for the scraping runtime.
///
/// All durations are stored as plain seconds so the struct stays trivially
/// serializable; accessor methods hand out `Duration` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    // ── Scheduler ─────────────────────────
    /// Scheduling cadence in seconds.
    pub tick_interval_secs: u64,
    /// Uniform jitter applied to each URL's due time, as a fraction of the
    /// effective interval (±). 0.083 ≈ ±30 min on a 6 h interval.
    pub jitter_fraction: f64,
    /// 24 h success rate below which a domain's interval is stretched.
    pub success_floor: f64,

    // ── Queue ─────────────────────────────
    /// Global worker pool size.
    pub max_concurrency: usize,
    /// Per-domain concurrent extraction bound.
    pub max_per_domain: usize,
    /// Pending items beyond which `enqueue` fails with `QueueFull`.
    pub max_pending: usize,
    /// Per-domain token bucket fill rate (tokens per second).
    pub rate_per_second: f64,
    /// Per-domain token bucket burst capacity.
    pub burst: u32,
    /// Transient-failure requeue cap before the scheduler takes over.
    pub max_retries: u32,
    /// Backoff base for requeues, seconds.
    pub backoff_base_secs: u64,
    /// Backoff cap for requeues, seconds.
    pub backoff_cap_secs: u64,

    // ── Engine ────────────────────────────
    /// Hard navigation timeout, seconds.
    pub navigation_timeout_secs: u64,
    /// Ceiling for the adaptive per-domain navigation timeout, seconds.
    pub navigation_timeout_max_secs: u64,
    /// Whole-attempt deadline (navigate + wait + interact + extract), seconds.
    pub attempt_deadline_secs: u64,
    /// Browser pool size (concurrent page sessions).
    pub max_browsers: usize,
    /// Readiness floor in milliseconds, allowing lazy price renders.
    pub ready_floor_ms: u64,
    /// Network-idle window for page readiness, milliseconds.
    pub network_idle_ms: u64,

    // ── Learning ──────────────────────────
    /// Reprioritize a domain's portfolio every this many attempts.
    pub reprioritize_every: u64,
    /// Generate variants every this many attempts (besides the
    /// high-confidence trigger).
    pub variant_every: u64,
    /// Maximum children per variant generation.
    pub variant_fanout: usize,
    /// Confidence below which a strategy is retired…
    pub retire_confidence: f64,
    /// …provided it has at least this many attempts.
    pub retire_min_attempts: u64,
    /// Probation window for freshly spawned variants, attempts.
    pub probation_attempts: u64,
    /// Probation confidence floor; below it the child is retired.
    pub probation_confidence: f64,

    // ── Cooldown ──────────────────────────
    /// Base cooldown after the first block signal, seconds.
    pub cooldown_base_secs: u64,
    /// Cooldown ceiling, seconds.
    pub cooldown_max_secs: u64,
    /// Exponential growth factor per consecutive block.
    pub cooldown_block_multiplier: f64,

    // ── Shutdown ──────────────────────────
    /// Grace window for draining in-flight attempts on shutdown, seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            jitter_fraction: 0.083,
            success_floor: 0.5,
            max_concurrency: 10,
            max_per_domain: 2,
            max_pending: 10_000,
            rate_per_second: 0.2,
            burst: 3,
            max_retries: 3,
            backoff_base_secs: 5,
            backoff_cap_secs: 600,
            navigation_timeout_secs: 30,
            navigation_timeout_max_secs: 60,
            attempt_deadline_secs: 90,
            max_browsers: 10,
            ready_floor_ms: 1_500,
            network_idle_ms: 500,
            reprioritize_every: 50,
            variant_every: 200,
            variant_fanout: 3,
            retire_confidence: 0.1,
            retire_min_attempts: 20,
            probation_attempts: 5,
            probation_confidence: 0.2,
            cooldown_base_secs: 3_600,
            cooldown_max_secs: 6 * 3_600,
            cooldown_block_multiplier: 2.0,
            shutdown_grace_secs: 60,
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn read_env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

impl RuntimeConfig {
    /// Defaults with the common deployment knobs overridable from the
    /// environment. File-based configuration deserializes the struct
    /// directly; env overrides cover container deployments.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            tick_interval_secs: read_env_u64("VIGIA_TICK_INTERVAL_SECS", d.tick_interval_secs),
            max_concurrency: read_env_u64("VIGIA_MAX_CONCURRENCY", d.max_concurrency as u64)
                as usize,
            max_per_domain: read_env_u64("VIGIA_MAX_PER_DOMAIN", d.max_per_domain as u64) as usize,
            rate_per_second: read_env_f64("VIGIA_RATE_PER_SECOND", d.rate_per_second),
            navigation_timeout_secs: read_env_u64(
                "VIGIA_NAVIGATION_TIMEOUT_SECS",
                d.navigation_timeout_secs,
            ),
            attempt_deadline_secs: read_env_u64(
                "VIGIA_ATTEMPT_DEADLINE_SECS",
                d.attempt_deadline_secs,
            ),
            max_browsers: read_env_u64("VIGIA_MAX_BROWSERS", d.max_browsers as u64) as usize,
            cooldown_base_secs: read_env_u64("VIGIA_COOLDOWN_BASE_SECS", d.cooldown_base_secs),
            ..d
        }
    }

    /// Validate the configuration. A failure here is fatal: the process
    /// refuses to start rather than run with a nonsensical setup.
    pub fn validate(&self) -> Result<(), ScrapeError> {
        if self.max_concurrency < 2 {
            // One slot is reserved for expensive items; at least one more
            // must remain for cheap/normal work.
            return Err(ScrapeError::Config(
                "max_concurrency must be at least 2".into(),
            ));
        }
        if self.max_per_domain == 0 {
            return Err(ScrapeError::Config("max_per_domain must be positive".into()));
        }
        if self.rate_per_second <= 0.0 {
            return Err(ScrapeError::Config("rate_per_second must be positive".into()));
        }
        if self.burst == 0 {
            return Err(ScrapeError::Config("burst must be positive".into()));
        }
        if !(0.0..=0.5).contains(&self.jitter_fraction) {
            return Err(ScrapeError::Config(
                "jitter_fraction must be within [0, 0.5]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.success_floor) {
            return Err(ScrapeError::Config(
                "success_floor must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retire_confidence)
            || !(0.0..=1.0).contains(&self.probation_confidence)
        {
            return Err(ScrapeError::Config(
                "confidence thresholds must be within [0, 1]".into(),
            ));
        }
        if self.cooldown_block_multiplier < 1.0 {
            return Err(ScrapeError::Config(
                "cooldown_block_multiplier must be >= 1".into(),
            ));
        }
        if self.navigation_timeout_secs > self.attempt_deadline_secs {
            return Err(ScrapeError::Config(
                "navigation_timeout must not exceed attempt_deadline".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn attempt_deadline(&self) -> Duration {
        Duration::from_secs(self.attempt_deadline_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn cooldown_base(&self) -> Duration {
        Duration::from_secs(self.cooldown_base_secs)
    }

    pub fn cooldown_max(&self) -> Duration {
        Duration::from_secs(self.cooldown_max_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
