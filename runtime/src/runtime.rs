//! Runtime — explicit wiring of every subsystem, no ambient globals.
//!
//! A `Runtime` value owns the configuration, pools, bus, and loops. The
//! worker pool runs `max_concurrency` identical workers; the scheduler and
//! the learning consumer are single loops. Shutdown stops enqueues, drains
//! in-flight attempts inside a grace window, then cancels stragglers —
//! attempts cancelled that way never reach the learning layer.

use crate::browser::pool::SessionPool;
use crate::browser::Browser;
use crate::config::RuntimeConfig;
use crate::cooldown::{DomainLedger, DomainTransition};
use crate::engine::ExtractionEngine;
use crate::error::ScrapeResult;
use crate::events::{EventBus, MonitorEvent};
use crate::learning::LearningLayer;
use crate::model::AttemptOutcome;
use crate::proxy::ProxyPool;
use crate::queue::{WorkItem, WorkQueue};
use crate::scheduler::Scheduler;
use crate::store::StrategyStore;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Buffer size of the event bus; slow subscribers lag rather than block.
const EVENT_BUS_CAPACITY: usize = 1024;

pub struct Runtime {
    cfg: RuntimeConfig,
    store: Arc<dyn StrategyStore>,
    bus: Arc<EventBus>,
    ledger: Arc<DomainLedger>,
    queue: Arc<WorkQueue>,
    scheduler: Arc<Scheduler>,
    engine: Arc<ExtractionEngine>,
    learning: Arc<LearningLayer>,
    pool: Arc<SessionPool>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Wire up a runtime. Fails fast on configuration errors.
    pub fn new(
        cfg: RuntimeConfig,
        store: Arc<dyn StrategyStore>,
        browser: Arc<dyn Browser>,
        proxies: Arc<dyn ProxyPool>,
    ) -> ScrapeResult<Arc<Self>> {
        cfg.validate()?;

        let bus = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));
        let ledger = Arc::new(DomainLedger::new(&cfg, store.clone()));
        let queue = Arc::new(WorkQueue::new(&cfg, ledger.clone(), bus.clone()));
        let scheduler = Arc::new(Scheduler::new(
            &cfg,
            store.clone(),
            queue.clone(),
            ledger.clone(),
        ));
        let pool = Arc::new(SessionPool::new(browser, cfg.max_browsers));
        let engine = Arc::new(ExtractionEngine::new(&cfg, pool.clone(), proxies));
        let learning = Arc::new(LearningLayer::new(&cfg, store.clone(), bus.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            cfg,
            store,
            bus,
            ledger,
            queue,
            scheduler,
            engine,
            learning,
            pool,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }))
    }

    /// Start every loop: one scheduler, one learning consumer, and
    /// `max_concurrency` workers.
    pub async fn start(self: &Arc<Self>) {
        if let Err(err) = self.ledger.restore().await {
            warn!(error = %err, "domain state restore failed, starting cold");
        }

        let mut handles = self.handles.lock().await;

        handles.push(tokio::spawn(scheduler_loop(
            self.clone(),
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(learning_loop(
            self.clone(),
            self.shutdown_tx.subscribe(),
        )));
        for worker_id in 0..self.cfg.max_concurrency {
            handles.push(tokio::spawn(worker_loop(self.clone(), worker_id)));
        }

        self.bus.emit(MonitorEvent::RuntimeStarted {
            workers: self.cfg.max_concurrency,
        });
        info!(workers = self.cfg.max_concurrency, "runtime started");
    }

    /// Graceful shutdown: stop enqueues, drain within the grace window,
    /// cancel stragglers, flush learning state.
    pub async fn shutdown(&self) {
        let in_flight = self.queue.stats().await.in_flight;
        self.bus.emit(MonitorEvent::ShutdownStarted { in_flight });
        info!(in_flight, "shutdown started");

        let _ = self.shutdown_tx.send(true);
        self.queue.close().await;

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        let drain = join_all(handles.iter().map(|h| wait_handle(h)));
        if tokio::time::timeout(self.cfg.shutdown_grace(), drain)
            .await
            .is_err()
        {
            warn!("grace window expired, cancelling outstanding attempts");
            for handle in &handles {
                handle.abort();
            }
        }

        self.learning.flush_all().await;
        if let Err(err) = self.pool.shutdown().await {
            warn!(error = %err, "browser shutdown failed");
        }
        info!("shutdown complete");
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn learning(&self) -> &Arc<LearningLayer> {
        &self.learning
    }

    pub fn ledger(&self) -> &Arc<DomainLedger> {
        &self.ledger
    }
}

/// Await a handle without consuming it (abort stays possible).
async fn wait_handle(handle: &JoinHandle<()>) {
    while !handle.is_finished() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

async fn scheduler_loop(rt: Arc<Runtime>, mut shutdown: watch::Receiver<bool>) {
    let tick = rt.cfg.tick_interval();
    loop {
        rt.scheduler.tick(Utc::now()).await;
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = shutdown.changed() => {
                info!("scheduler loop stopped");
                return;
            }
        }
    }
}

async fn learning_loop(rt: Arc<Runtime>, mut shutdown: watch::Receiver<bool>) {
    let mut rx = rt.bus.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(MonitorEvent::AttemptFinished { result }) => {
                    rt.learning.on_attempt(&result).await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "learning consumer lagged, events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
            _ = shutdown.changed() => {
                // Drain whatever is already buffered before stopping.
                while let Ok(MonitorEvent::AttemptFinished { result }) = rx.try_recv() {
                    rt.learning.on_attempt(&result).await;
                }
                info!("learning loop stopped");
                return;
            }
        }
    }
}

async fn worker_loop(rt: Arc<Runtime>, worker_id: usize) {
    while let Some(item) = rt.queue.dequeue().await {
        run_one(&rt, &item).await;
    }
    info!(worker_id, "worker drained");
}

async fn run_one(rt: &Arc<Runtime>, item: &WorkItem) {
    let portfolio = rt.learning.portfolio_for(&item.domain).await;
    let result = rt.engine.run_attempt(item, &portfolio).await;
    rt.queue.complete(item).await;

    if let Some(record) = &result.record {
        if let Err(err) = rt.store.insert_price_record(record.clone()).await {
            warn!(url_id = item.url_id, error = %err, "price record write failed");
        }
    }
    if let Err(err) = rt.store.insert_attempt_log(result.summary()).await {
        warn!(url_id = item.url_id, error = %err, "attempt log write failed");
    }

    match rt.scheduler.on_outcome(&result).await {
        Some(DomainTransition::CooldownExtended {
            until,
            consecutive_blocks,
        }) => {
            rt.bus.emit(MonitorEvent::DomainCooldown {
                domain: item.domain.clone(),
                until,
                consecutive_blocks,
            });
        }
        Some(DomainTransition::Recovered) => {
            rt.bus.emit(MonitorEvent::DomainRecovered {
                domain: item.domain.clone(),
            });
        }
        None => {}
    }

    rt.bus.emit(MonitorEvent::AttemptFinished {
        result: result.clone(),
    });

    // Transient failures go back through the queue with backoff; the
    // engine itself never retries.
    if result.outcome == AttemptOutcome::NetworkError {
        if let Some(delay) = rt.queue.requeue_with_backoff(item.clone()).await {
            rt.bus.emit(MonitorEvent::ItemRequeued {
                url_id: item.url_id,
                domain: item.domain.clone(),
                attempt: item.attempt + 1,
                delay_ms: delay.as_millis() as u64,
            });
        }
    }
}
