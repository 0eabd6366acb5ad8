//! Browser capability — the seam between the engine and a real headless
//! driver.
//!
//! Defines the [`Browser`] and [`PageSession`] traits that abstract over
//! the browser engine. The core never talks to a driver directly; a
//! production deployment plugs a CDP-backed implementation in here, tests
//! plug in scripted fakes.

pub mod pool;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of navigating to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationSummary {
    /// The final URL after any redirects.
    pub final_url: String,
    /// HTTP status code of the main document.
    pub status: u16,
    /// Time taken to reach DOMContentLoaded, in milliseconds.
    pub load_time_ms: u64,
}

/// Serialized page state handed to the strategy evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomSnapshot {
    /// Full serialized HTML.
    pub html: String,
    /// Visible-text rendering, when the driver can provide one. Empty
    /// otherwise; the evaluator derives text from `html` in that case.
    pub rendered_text: String,
    /// URL the snapshot was taken at.
    pub url: String,
    pub captured_at: DateTime<Utc>,
}

/// Page readiness condition: DOMContentLoaded AND (network idle OR the
/// domain-specific predicate selector), whichever first, never before the
/// floor elapses.
#[derive(Debug, Clone)]
pub struct ReadySpec {
    /// Network-idle window in milliseconds.
    pub network_idle_ms: u64,
    /// Optional selector that marks the page usable for extraction.
    pub predicate_selector: Option<String>,
    /// Minimum wait, allowing lazy price renders to land.
    pub floor: Duration,
    /// Hard cap on the whole readiness wait.
    pub timeout: Duration,
}

/// One step of simulated human interaction. The pacing is not cosmetic:
/// several monitored sites only render their price block after scroll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum InteractionStep {
    /// Scroll to a fraction of the page height, then pause.
    Scroll { to_fraction: f64, pause_ms: u64 },
    /// Hover a candidate element and dwell on it.
    Hover { selector: String, dwell_ms: u64 },
    /// Plain dwell with no input.
    Dwell { ms: u64 },
}

/// A full interaction script for one attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InteractionScript {
    pub steps: Vec<InteractionStep>,
}

/// Classified anti-automation indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// CAPTCHA iframe or widget present.
    CaptchaIframe,
    /// Navigation landed on a known challenge URL.
    ChallengeUrl,
    /// Blocking HTTP status class (403, 429, …).
    HttpStatus,
    /// Suspiciously empty body on a page that should have content.
    EmptyBody,
    /// Anti-bot vendor markup in the document.
    AntiBotMarkup,
}

/// A positive block detection with the evidence that fired it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSignal {
    pub kind: BlockKind,
    pub evidence: String,
}

impl BlockSignal {
    /// CAPTCHAs get their own outcome; everything else reports `blocked`.
    pub fn is_captcha(&self) -> bool {
        self.kind == BlockKind::CaptchaIframe
    }
}

/// A browser engine that can open page sessions.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Open a fresh session (tab/context) configured with a fingerprint
    /// profile and proxy endpoint.
    async fn open_session(
        &self,
        profile: &crate::stealth::FingerprintProfile,
        proxy: Option<&crate::proxy::ProxyEndpoint>,
    ) -> Result<Box<dyn PageSession>>;

    /// Number of currently active sessions.
    fn active_sessions(&self) -> usize;

    /// Shut down the browser engine.
    async fn shutdown(&self) -> Result<()>;
}

/// A single page session for one extraction attempt.
#[async_trait]
pub trait PageSession: Send {
    /// Navigate to a URL with a hard timeout.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<NavigationSummary>;

    /// Wait for the page to become extraction-ready.
    async fn wait_ready(&mut self, spec: &ReadySpec) -> Result<()>;

    /// Run a simulated-interaction script.
    async fn interact(&mut self, script: &InteractionScript) -> Result<()>;

    /// Serialize the current DOM.
    async fn snapshot(&mut self) -> Result<DomSnapshot>;

    /// Probe for anti-automation indicators.
    async fn detect_block(&mut self) -> Result<Option<BlockSignal>>;

    /// Close the session. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// A no-op browser used when no driver is wired up. Scheduling and
/// learning still function; attempts fail as browser errors.
pub struct NoopBrowser;

#[async_trait]
impl Browser for NoopBrowser {
    async fn open_session(
        &self,
        _profile: &crate::stealth::FingerprintProfile,
        _proxy: Option<&crate::proxy::ProxyEndpoint>,
    ) -> Result<Box<dyn PageSession>> {
        Err(anyhow::anyhow!("no browser driver configured"))
    }

    fn active_sessions(&self) -> usize {
        0
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// ── Block detection over HTML ────────────────────────────────────────────────

/// CAPTCHA widget indicators, checked against the raw HTML.
const CAPTCHA_MARKERS: &[&str] = &[
    "iframe[src*='captcha'",
    "g-recaptcha",
    "h-captcha",
    "cf-turnstile",
    "recaptcha/api",
    "hcaptcha.com",
];

/// Challenge-page URL fragments used by anti-bot vendors.
const CHALLENGE_URL_MARKERS: &[&str] = &[
    "/cdn-cgi/challenge-platform",
    "geo.captcha-delivery.com",
    "validate.perfdrive.com",
    "distil_r_captcha",
];

/// Anti-bot vendor markup worth treating as a block even without a CAPTCHA.
const ANTIBOT_MARKUP: &[&str] = &[
    "datadome",
    "px-captcha",
    "_incapsula_",
    "akamai-bot",
];

/// Inspect a fetched document for block indicators. Shared by driver
/// implementations and used directly on snapshots in tests.
pub fn detect_block_in_document(html: &str, final_url: &str, status: u16) -> Option<BlockSignal> {
    if status == 403 || status == 429 || status == 503 {
        return Some(BlockSignal {
            kind: BlockKind::HttpStatus,
            evidence: format!("status {status}"),
        });
    }

    let lower = html.to_lowercase();
    for marker in CAPTCHA_MARKERS {
        if lower.contains(marker) {
            return Some(BlockSignal {
                kind: BlockKind::CaptchaIframe,
                evidence: (*marker).to_string(),
            });
        }
    }
    // Challenge text in Portuguese marketplaces
    if lower.contains("verificação de segurança") || lower.contains("confirme que você não é um robô")
    {
        return Some(BlockSignal {
            kind: BlockKind::CaptchaIframe,
            evidence: "challenge text".to_string(),
        });
    }

    for marker in CHALLENGE_URL_MARKERS {
        if final_url.contains(marker) || lower.contains(marker) {
            return Some(BlockSignal {
                kind: BlockKind::ChallengeUrl,
                evidence: (*marker).to_string(),
            });
        }
    }

    for marker in ANTIBOT_MARKUP {
        if lower.contains(marker) {
            return Some(BlockSignal {
                kind: BlockKind::AntiBotMarkup,
                evidence: (*marker).to_string(),
            });
        }
    }

    // Empty-body heuristic: a 200 with almost no markup is a soft block.
    if status == 200 && html.trim().len() < 512 && !html.contains("<body") {
        return Some(BlockSignal {
            kind: BlockKind::EmptyBody,
            evidence: format!("{} bytes", html.trim().len()),
        });
    }

    None
}
