//! Core data model: monitored URLs, price records, and attempt results.
//!
//! `PriceRecord` is written once per successful attempt and never mutated;
//! `AttemptResult` is emitted once per engine invocation and is immutable
//! after emission. Both are plain serde types so any store backend can
//! persist them as-is.

use crate::strategy::{StrategyId, TargetField};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// PIX prices occasionally display marginally above the card price due to
/// rounding on the site; tolerate up to 5%.
pub const PIX_TOLERANCE: f64 = 1.05;

/// A URL under monitoring. Owned by the external store; the scheduler only
/// advances `last_check` (via CAS) and reads the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredUrl {
    pub id: u64,
    pub url: String,
    /// Registrable host, derivable from `url`.
    pub domain: String,
    /// Explicit priority in `0..=9`; higher means checked more often.
    pub priority: u8,
    /// Base monitoring interval in minutes.
    pub base_interval_mins: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub active: bool,
}

impl MonitoredUrl {
    /// Extract the host portion of a URL, used to key per-domain state.
    pub fn domain_of(url: &str) -> Option<String> {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

/// Product availability as displayed on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    InStock,
    LowStock,
    OutOfStock,
    PreOrder,
    Unknown,
}

/// One installment plan as advertised, kept verbatim: `12x de R$ 108,33`
/// becomes `{ value: 108.33, times: 12, interest_flag: false }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallmentPlan {
    pub value: f64,
    pub times: u32,
    pub interest_flag: bool,
}

/// A validated price observation. Written once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecord {
    pub url_id: u64,
    pub checked_at: DateTime<Utc>,
    pub price: f64,
    pub old_price: Option<f64>,
    pub pix_price: Option<f64>,
    /// Ordered list of advertised installment plans.
    pub installment: Vec<InstallmentPlan>,
    pub availability: Availability,
    pub availability_text: Option<String>,
    pub seller: Option<String>,
    pub promotion_labels: Vec<String>,
    pub promotion_end: Option<DateTime<Utc>>,
    /// Strategy that produced the required `price` field.
    pub extraction_strategy_id: StrategyId,
    /// Minimum field-level confidence among required fields.
    pub extraction_confidence: f64,
}

/// A record invariant violation, reported with the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordViolation {
    NegativePrice,
    PixAbovePrice,
    OldBelowPrice,
    ConfidenceOutOfRange,
}

impl PriceRecord {
    /// Check the invariants every persisted record must satisfy:
    /// `price ≥ 0`, `pix_price ≤ price × 1.05`, `old_price ≥ price`,
    /// confidence in `[0, 1]`.
    pub fn validate(&self) -> Result<(), RecordViolation> {
        if self.price < 0.0 {
            return Err(RecordViolation::NegativePrice);
        }
        if let Some(pix) = self.pix_price {
            if pix > self.price * PIX_TOLERANCE {
                return Err(RecordViolation::PixAbovePrice);
            }
        }
        if let Some(old) = self.old_price {
            if old < self.price {
                return Err(RecordViolation::OldBelowPrice);
            }
        }
        if !(0.0..=1.0).contains(&self.extraction_confidence) {
            return Err(RecordViolation::ConfidenceOutOfRange);
        }
        Ok(())
    }
}

/// Terminal classification of one extraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    Partial,
    Captcha,
    Blocked,
    NetworkError,
    ExtractionFailed,
}

impl AttemptOutcome {
    /// Block outcomes trigger the domain cooldown policy.
    pub fn is_block(self) -> bool {
        matches!(self, AttemptOutcome::Captcha | AttemptOutcome::Blocked)
    }
}

/// Side-channel indicators attached to an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "signal")]
pub enum AttemptSignal {
    /// The whole-attempt deadline expired.
    Timeout,
    /// Cancelled by runtime shutdown; excluded from learning.
    Shutdown,
    /// A block indicator fired, with the matched evidence.
    Block { evidence: String },
    /// HTTP status class observed on navigation.
    HttpStatus { status: u16 },
    /// The session crashed or desynced mid-attempt.
    BrowserCrash,
    /// The proxy endpoint failed and was reported unhealthy.
    ProxyFailure { endpoint: String },
}

/// Per-(field, strategy) outcome of one evaluation pass. Every attempted
/// pair is recorded, success or not — the learning layer credits strategies
/// independently of whether an earlier field already resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyTrace {
    pub strategy_id: StrategyId,
    pub field: TargetField,
    pub success: bool,
    pub confidence: f64,
    pub elapsed_ms: u64,
}

/// The result of one engine invocation for one URL. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    pub url_id: u64,
    pub url: String,
    pub domain: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub strategies_tried: Vec<StrategyTrace>,
    pub record: Option<PriceRecord>,
    pub signals: Vec<AttemptSignal>,
}

impl AttemptResult {
    /// Key used to deduplicate replayed events in the learning layer.
    pub fn dedup_key(&self) -> (u64, DateTime<Utc>) {
        (self.url_id, self.started_at)
    }

    /// Whether this attempt was cancelled by shutdown and must not count
    /// against strategy confidence.
    pub fn cancelled_by_shutdown(&self) -> bool {
        self.signals.contains(&AttemptSignal::Shutdown)
    }

    /// Compact summary persisted in the attempt log.
    pub fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            url_id: self.url_id,
            domain: self.domain.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: self.outcome,
            strategies_tried: self.strategies_tried.len(),
            price: self.record.as_ref().map(|r| r.price),
        }
    }
}

/// What the store keeps about an attempt; the full trace stays in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub url_id: u64,
    pub domain: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub strategies_tried: usize,
    pub price: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(price: f64) -> PriceRecord {
        PriceRecord {
            url_id: 1,
            checked_at: Utc::now(),
            price,
            old_price: None,
            pix_price: None,
            installment: Vec::new(),
            availability: Availability::InStock,
            availability_text: None,
            seller: None,
            promotion_labels: Vec::new(),
            promotion_end: None,
            extraction_strategy_id: "s1".into(),
            extraction_confidence: 0.9,
        }
    }

    #[test]
    fn test_valid_record() {
        assert!(record(1299.90).validate().is_ok());
    }

    #[test]
    fn test_pix_above_price_rejected() {
        let mut r = record(100.0);
        r.pix_price = Some(110.0);
        assert_eq!(r.validate(), Err(RecordViolation::PixAbovePrice));
        // Within the 5% display tolerance is fine
        r.pix_price = Some(104.0);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_old_price_below_current_rejected() {
        let mut r = record(100.0);
        r.old_price = Some(90.0);
        assert_eq!(r.validate(), Err(RecordViolation::OldBelowPrice));
        r.old_price = Some(150.0);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_negative_price_rejected() {
        assert_eq!(record(-1.0).validate(), Err(RecordViolation::NegativePrice));
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(
            MonitoredUrl::domain_of("https://www.americanas.com.br/produto/123"),
            Some("www.americanas.com.br".to_string())
        );
        assert_eq!(MonitoredUrl::domain_of("not a url"), None);
    }

    #[test]
    fn test_attempt_serialization_roundtrip() {
        let attempt = AttemptResult {
            url_id: 7,
            url: "https://kabum.com.br/p/7".into(),
            domain: "kabum.com.br".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: AttemptOutcome::Captcha,
            strategies_tried: Vec::new(),
            record: None,
            signals: vec![AttemptSignal::Block {
                evidence: "iframe[src*='recaptcha']".into(),
            }],
        };
        let json = serde_json::to_string(&attempt).unwrap();
        let parsed: AttemptResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.outcome, AttemptOutcome::Captcha);
        assert_eq!(parsed.dedup_key(), attempt.dedup_key());
    }
}
