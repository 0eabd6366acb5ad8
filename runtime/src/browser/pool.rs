//! Bounded session pool — scoped acquisition over the browser capability.
//!
//! A [`SessionLease`] couples a page session with a pool permit; dropping
//! the lease frees the slot on every exit path, which is what lets the
//! engine guarantee "session returned to the pool on all exit paths"
//! without defensive bookkeeping.

use crate::browser::{Browser, PageSession};
use crate::proxy::ProxyEndpoint;
use crate::stealth::FingerprintProfile;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of page sessions on top of a [`Browser`].
pub struct SessionPool {
    browser: Arc<dyn Browser>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl SessionPool {
    pub fn new(browser: Arc<dyn Browser>, capacity: usize) -> Self {
        Self {
            browser,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Acquire a fresh session, blocking while the pool is exhausted.
    ///
    /// Sessions are never reused across attempts: fingerprint and proxy
    /// rotation happen per acquisition, so a stale context would leak the
    /// previous identity.
    pub async fn acquire(
        &self,
        profile: &FingerprintProfile,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<SessionLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("session pool closed")?;
        let session = self.browser.open_session(profile, proxy).await?;
        Ok(SessionLease {
            session,
            _permit: permit,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.browser.shutdown().await
    }
}

/// A leased session. The pool slot frees when the lease drops; callers
/// that can still await should prefer [`SessionLease::close`] so the
/// underlying tab shuts down cleanly.
pub struct SessionLease {
    session: Box<dyn PageSession>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn session(&mut self) -> &mut dyn PageSession {
        self.session.as_mut()
    }

    /// Close the underlying session and free the slot.
    pub async fn close(mut self) {
        // Close errors are unactionable here; the session is gone either way.
        let _ = self.session.close().await;
    }
}
