// Copyright 2026 Vigia Contributors
// SPDX-License-Identifier: Apache-2.0

//! Vigia event bus — typed events from every component.
//!
//! The bus is a `tokio::sync::broadcast` channel carrying [`MonitorEvent`]
//! values. The learning layer is the primary consumer
//! ([`MonitorEvent::AttemptFinished`]); log sinks and future dashboards can
//! subscribe independently. When no subscribers exist, events are silently
//! dropped (zero overhead).

use crate::model::AttemptResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event the runtime emits. Serialized to JSON for log shipping.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MonitorEvent {
    // ── Attempt events ────────────────────
    /// An extraction attempt finished with a terminal outcome.
    AttemptFinished { result: AttemptResult },

    // ── Domain events ─────────────────────
    /// A domain entered (or extended) cooldown after a block signal.
    DomainCooldown {
        domain: String,
        until: DateTime<Utc>,
        consecutive_blocks: u32,
    },
    /// A domain's cooldown cleared after a successful attempt.
    DomainRecovered { domain: String },

    // ── Portfolio events ──────────────────
    /// A domain's strategies were re-ranked by expected utility.
    PortfolioReprioritized { domain: String, portfolio_size: usize },
    /// Variants were derived from a proven strategy.
    VariantsSpawned {
        domain: String,
        parent_id: String,
        count: usize,
    },
    /// A strategy moved to the archive.
    StrategyRetired { domain: String, strategy_id: String },

    // ── Queue events ──────────────────────
    /// The queue stopped handing out work.
    QueuePaused,
    /// The queue resumed.
    QueueResumed,
    /// An item was requeued with backoff after a transient failure.
    ItemRequeued {
        url_id: u64,
        domain: String,
        attempt: u32,
        delay_ms: u64,
    },

    // ── Runtime events ────────────────────
    /// The runtime started its loops.
    RuntimeStarted { workers: usize },
    /// Shutdown began; in-flight attempts are draining.
    ShutdownStarted { in_flight: usize },
}

/// The central event bus.
///
/// All components emit events through this bus. Consumers subscribe to
/// receive a stream of all events.
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }
}

/// Check if an event concerns a specific domain. Runtime-wide events match
/// every domain so they reach all subscribers.
pub fn event_matches_domain(event: &MonitorEvent, domain: &str) -> bool {
    match event {
        MonitorEvent::AttemptFinished { result } => result.domain == domain,
        MonitorEvent::DomainCooldown { domain: d, .. }
        | MonitorEvent::DomainRecovered { domain: d }
        | MonitorEvent::PortfolioReprioritized { domain: d, .. }
        | MonitorEvent::VariantsSpawned { domain: d, .. }
        | MonitorEvent::StrategyRetired { domain: d, .. }
        | MonitorEvent::ItemRequeued { domain: d, .. } => d == domain,
        MonitorEvent::QueuePaused
        | MonitorEvent::QueueResumed
        | MonitorEvent::RuntimeStarted { .. }
        | MonitorEvent::ShutdownStarted { .. } => true,
    }
}
