//! Error taxonomy for the scraping core.
//!
//! Transient kinds stay inside the queue (backoff requeue); persistent
//! extraction kinds flow to the learning layer as signal; `Config` is fatal
//! at startup; `Store` errors are surfaced to the caller of the store
//! operation, which skips its cycle.

use crate::browser::BlockKind;

/// Errors raised by store capability implementations.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict on {entity}: {detail}")]
    Conflict { entity: &'static str, detail: String },

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// All errors the scraping core can produce.
#[derive(thiserror::Error, Debug)]
pub enum ScrapeError {
    /// Transport, DNS, or timeout failure. Retried with backoff; the proxy
    /// is rotated on the next attempt.
    #[error("network error: {0}")]
    Network(String),

    /// Browser session crash or protocol desync. The session is retired
    /// from the pool; the item retries on a fresh session.
    #[error("browser error: {0}")]
    Browser(String),

    /// Positive CAPTCHA/anti-bot detection. Never retried immediately; the
    /// domain cools down and the next attempt rotates fingerprint + proxy.
    #[error("block signal: {0:?}")]
    Blocked(BlockKind),

    /// No strategy produced a validated record. Not retried — the learning
    /// layer reprioritizes instead.
    #[error("no strategy produced a validated record")]
    ExtractionFailed,

    /// Cross-field invariants failed after best effort.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Fatal configuration problem; the process refuses to start.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ScrapeError {
    /// Whether the queue should requeue the item with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScrapeError::Network(_) | ScrapeError::Browser(_))
    }
}

pub type ScrapeResult<T> = Result<T, ScrapeError>;
