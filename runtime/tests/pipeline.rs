//! End-to-end pipeline tests: scheduler → queue → engine → learning,
//! driven through the public `Runtime` API with a scripted browser and the
//! in-memory store.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use vigia_runtime::browser::{
    detect_block_in_document, BlockSignal, Browser, DomSnapshot, InteractionScript,
    NavigationSummary, PageSession, ReadySpec,
};
use vigia_runtime::config::RuntimeConfig;
use vigia_runtime::events::MonitorEvent;
use vigia_runtime::model::{AttemptOutcome, Availability, MonitoredUrl};
use vigia_runtime::proxy::StaticProxyPool;
use vigia_runtime::runtime::Runtime;
use vigia_runtime::stealth::FingerprintProfile;
use vigia_runtime::store::{MemoryStore, StrategyStore};
use vigia_runtime::strategy::{
    RegexScope, Strategy, StrategyKind, TargetField, TextMode,
};

// ── Scripted browser ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct ScriptedBrowser {
    pages: Arc<HashMap<String, (String, u16)>>,
}

impl ScriptedBrowser {
    fn new(pages: Vec<(&str, String, u16)>) -> Arc<Self> {
        Arc::new(Self {
            pages: Arc::new(
                pages
                    .into_iter()
                    .map(|(url, html, status)| (url.to_string(), (html, status)))
                    .collect(),
            ),
        })
    }
}

struct ScriptedSession {
    pages: Arc<HashMap<String, (String, u16)>>,
    current: Option<(String, u16, String)>,
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn open_session(
        &self,
        _profile: &FingerprintProfile,
        _proxy: Option<&vigia_runtime::proxy::ProxyEndpoint>,
    ) -> Result<Box<dyn PageSession>> {
        Ok(Box::new(ScriptedSession {
            pages: self.pages.clone(),
            current: None,
        }))
    }

    fn active_sessions(&self) -> usize {
        0
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PageSession for ScriptedSession {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<NavigationSummary> {
        let (html, status) = self
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("dns resolution failed for {url}"))?;
        self.current = Some((html, status, url.to_string()));
        Ok(NavigationSummary {
            final_url: url.to_string(),
            status,
            load_time_ms: 8,
        })
    }

    async fn wait_ready(&mut self, _spec: &ReadySpec) -> Result<()> {
        Ok(())
    }

    async fn interact(&mut self, _script: &InteractionScript) -> Result<()> {
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<DomSnapshot> {
        let (html, _, url) = self.current.clone().expect("navigate first");
        Ok(DomSnapshot {
            html,
            rendered_text: String::new(),
            url,
            captured_at: Utc::now(),
        })
    }

    async fn detect_block(&mut self) -> Result<Option<BlockSignal>> {
        let (html, status, url) = self.current.as_ref().expect("navigate first");
        Ok(detect_block_in_document(html, url, *status))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        tick_interval_secs: 60,
        max_concurrency: 4,
        max_per_domain: 2,
        rate_per_second: 100.0,
        burst: 50,
        cooldown_base_secs: 60,
        cooldown_max_secs: 600,
        cooldown_block_multiplier: 2.0,
        shutdown_grace_secs: 5,
        ..Default::default()
    }
}

fn monitored(id: u64, url: &str, domain: &str) -> MonitoredUrl {
    MonitoredUrl {
        id,
        url: url.to_string(),
        domain: domain.to_string(),
        priority: 5,
        base_interval_mins: 360,
        last_check: None,
        active: true,
    }
}

fn css(id: &str, domain: &str, field: TargetField, selector: &str, conf: f64, prio: i32) -> Strategy {
    Strategy {
        id: id.into(),
        domain: domain.into(),
        target_field: field,
        kind: StrategyKind::Css {
            selector: selector.into(),
            attribute: None,
            text_mode: TextMode::InnerText,
            context_terms: Vec::new(),
        },
        confidence: conf,
        priority: prio,
        attempts: 0,
        successes: 0,
        last_success: None,
        sample_urls: Vec::new(),
        parent_id: None,
    }
}

fn regex(id: &str, domain: &str, field: TargetField, pattern: &str, conf: f64, prio: i32) -> Strategy {
    Strategy {
        kind: StrategyKind::Regex {
            pattern: pattern.into(),
            flags: String::new(),
            group_index: 1,
            scope: RegexScope::WholeDocument,
        },
        ..css(id, domain, field, "unused", conf, prio)
    }
}

fn product_page(body: &str) -> String {
    format!(
        "<html><body><h1>Produto monitorado</h1>{body}\
         <p>{}</p></body></html>",
        "descrição detalhada do produto, avaliações e entrega. ".repeat(20)
    )
}

/// Wait until the bus delivers an `AttemptFinished` for the given URL.
async fn await_attempt(
    rx: &mut tokio::sync::broadcast::Receiver<MonitorEvent>,
    url_id: u64,
) -> vigia_runtime::model::AttemptResult {
    let deadline = Duration::from_secs(10);
    tokio::time::timeout(deadline, async {
        loop {
            if let Ok(MonitorEvent::AttemptFinished { result }) = rx.recv().await {
                if result.url_id == url_id {
                    return result;
                }
            }
        }
    })
    .await
    .expect("attempt did not finish in time")
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_produces_record_and_reinforces_strategy() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_url(monitored(1, "https://shop.example/p/1", "shop.example"))
        .await;
    store
        .upsert_strategies(
            "shop.example",
            vec![css("s1", "shop.example", TargetField::Price, ".price-current", 0.9, 0)],
        )
        .await
        .unwrap();

    let browser = ScriptedBrowser::new(vec![(
        "https://shop.example/p/1",
        product_page(r#"<span class="price-current">R$ 1.299,90</span>"#),
        200,
    )]);
    let rt = Runtime::new(
        fast_config(),
        store.clone(),
        browser,
        Arc::new(StaticProxyPool::direct()),
    )
    .unwrap();

    let mut rx = rt.events().subscribe();
    rt.start().await;

    let result = await_attempt(&mut rx, 1).await;
    assert_eq!(result.outcome, AttemptOutcome::Ok);
    let record = result.record.as_ref().expect("validated record");
    assert!((record.price - 1299.90).abs() < 0.001);
    assert_eq!(record.extraction_strategy_id, "s1");

    // Give the learning consumer a beat to apply the event.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let s1 = rt
        .learning()
        .strategy_metrics("shop.example", "s1")
        .await
        .expect("strategy still active");
    assert!((s1.confidence - 0.91).abs() < 1e-9, "0.9·0.9 + 0.1 = 0.91");
    assert_eq!(s1.attempts, 1);
    assert_eq!(s1.successes, 1);

    rt.shutdown().await;

    // The record reached the store exactly once.
    let records = store.price_records().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].validate().is_ok());
    assert_eq!(store.attempt_log().await.len(), 1);
}

#[tokio::test]
async fn first_fail_falls_back_and_updates_both_strategies() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_url(monitored(1, "https://shop.example/p/1", "shop.example"))
        .await;
    store
        .upsert_strategies(
            "shop.example",
            vec![
                css("css0", "shop.example", TargetField::Price, ".price-current", 0.9, 0),
                regex(
                    "rx1",
                    "shop.example",
                    TargetField::Price,
                    r"R\$\s*(\d+[.,]\d{2})",
                    0.5,
                    1,
                ),
            ],
        )
        .await
        .unwrap();

    // No `.price-current` element; the regex finds the plain text price.
    let browser = ScriptedBrowser::new(vec![(
        "https://shop.example/p/1",
        product_page("<p>por apenas R$ 99,00 à vista</p>"),
        200,
    )]);
    let rt = Runtime::new(
        fast_config(),
        store,
        browser,
        Arc::new(StaticProxyPool::direct()),
    )
    .unwrap();

    let mut rx = rt.events().subscribe();
    rt.start().await;

    let result = await_attempt(&mut rx, 1).await;
    assert_eq!(result.outcome, AttemptOutcome::Ok);
    assert!((result.record.as_ref().unwrap().price - 99.0).abs() < 0.001);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let css0 = rt
        .learning()
        .strategy_metrics("shop.example", "css0")
        .await
        .unwrap();
    let rx1 = rt
        .learning()
        .strategy_metrics("shop.example", "rx1")
        .await
        .unwrap();
    assert!((css0.confidence - 0.81).abs() < 1e-9, "decayed 0.9×");
    assert!((rx1.confidence - 0.55).abs() < 1e-9, "0.9·0.5 + 0.1");
    assert_eq!(css0.successes, 0);
    assert_eq!(rx1.successes, 1);

    rt.shutdown().await;
}

#[tokio::test]
async fn cross_field_violation_persists_partial_and_penalizes_pix() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_url(monitored(1, "https://shop.example/p/1", "shop.example"))
        .await;
    store
        .upsert_strategies(
            "shop.example",
            vec![
                css("price", "shop.example", TargetField::Price, ".price", 0.9, 0),
                css("pix", "shop.example", TargetField::PixPrice, ".pix", 0.4, 0),
            ],
        )
        .await
        .unwrap();

    let browser = ScriptedBrowser::new(vec![(
        "https://shop.example/p/1",
        product_page(
            r#"<span class="price">R$ 100,00</span><span class="pix">R$ 110,00</span>"#,
        ),
        200,
    )]);
    let rt = Runtime::new(
        fast_config(),
        store.clone(),
        browser,
        Arc::new(StaticProxyPool::direct()),
    )
    .unwrap();

    let mut rx = rt.events().subscribe();
    rt.start().await;

    let result = await_attempt(&mut rx, 1).await;
    assert_eq!(result.outcome, AttemptOutcome::Partial);
    let record = result.record.as_ref().expect("record without pix persists");
    assert!(record.pix_price.is_none());
    assert!((record.price - 100.0).abs() < 0.001);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let pix = rt
        .learning()
        .strategy_metrics("shop.example", "pix")
        .await
        .unwrap();
    // Penalized exactly once: 0.4 × 0.9.
    assert!((pix.confidence - 0.36).abs() < 1e-9);
    assert_eq!(pix.attempts, 1);
    assert_eq!(pix.successes, 0);

    rt.shutdown().await;
    assert_eq!(store.price_records().await.len(), 1);
}

#[tokio::test]
async fn captcha_cooldown_excludes_domain_from_dispatch() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_url(monitored(1, "https://blocked.example/p/1", "blocked.example"))
        .await;

    let browser = ScriptedBrowser::new(vec![(
        "https://blocked.example/p/1",
        r#"<html><body><div class="g-recaptcha" data-sitekey="k"></div></body></html>"#.to_string(),
        200,
    )]);
    let rt = Runtime::new(
        fast_config(),
        store.clone(),
        browser,
        Arc::new(StaticProxyPool::direct()),
    )
    .unwrap();

    let mut rx = rt.events().subscribe();
    rt.start().await;

    let result = await_attempt(&mut rx, 1).await;
    assert_eq!(result.outcome, AttemptOutcome::Captcha);

    // The cooldown event follows, and the domain is excluded.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rt.ledger().in_cooldown("blocked.example", Utc::now()).await);

    // Force the URL due again: the scheduler must skip it.
    store
        .update_last_check(1, store.url(1).await.unwrap().last_check, None)
        .await
        .unwrap();
    let dispatched = rt.scheduler().tick(Utc::now()).await;
    assert_eq!(dispatched, 0, "cooldown domain must not dispatch");

    rt.shutdown().await;
}

#[tokio::test]
async fn consecutive_captchas_grow_cooldown_monotonically() {
    let store = Arc::new(MemoryStore::new());
    let cfg = fast_config();
    let browser = ScriptedBrowser::new(Vec::new());
    let rt = Runtime::new(cfg, store, browser, Arc::new(StaticProxyPool::direct())).unwrap();

    let now = Utc::now();
    let first = rt.ledger().record_block("x.example", now).await;
    let second = rt.ledger().record_block("x.example", now).await;

    // base 60 s, multiplier 2: the second block lands at now + 120 s.
    assert_eq!((first - now).num_seconds(), 60);
    assert_eq!((second - now).num_seconds(), 120);
    assert!(second >= first);
}

#[tokio::test]
async fn availability_and_installments_flow_into_record() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_url(monitored(1, "https://shop.example/p/1", "shop.example"))
        .await;
    store
        .upsert_strategies(
            "shop.example",
            vec![
                css("p", "shop.example", TargetField::Price, ".price", 0.9, 0),
                css("a", "shop.example", TargetField::Availability, ".stock", 0.8, 0),
                css("i", "shop.example", TargetField::Installment, ".parcelas", 0.8, 0),
            ],
        )
        .await
        .unwrap();

    let browser = ScriptedBrowser::new(vec![(
        "https://shop.example/p/1",
        product_page(
            r#"<span class="price">R$ 1.200,00</span>
               <div class="stock">Em estoque</div>
               <div class="parcelas">12x de R$ 100,00 sem juros</div>"#,
        ),
        200,
    )]);
    let rt = Runtime::new(
        fast_config(),
        store,
        browser,
        Arc::new(StaticProxyPool::direct()),
    )
    .unwrap();

    let mut rx = rt.events().subscribe();
    rt.start().await;

    let result = await_attempt(&mut rx, 1).await;
    let record = result.record.as_ref().expect("full record");
    assert_eq!(record.availability, Availability::InStock);
    assert_eq!(record.installment.len(), 1);
    assert_eq!(record.installment[0].times, 12);
    assert!(!record.installment[0].interest_flag);

    rt.shutdown().await;
}

#[tokio::test]
async fn unknown_domain_bootstraps_with_generic_portfolio() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_url(monitored(
            1,
            "https://loja-desconhecida.example/p/1",
            "loja-desconhecida.example",
        ))
        .await;

    // No seeded strategies at all: the generic regex must carry the day.
    let browser = ScriptedBrowser::new(vec![(
        "https://loja-desconhecida.example/p/1",
        product_page("<p>Preço especial: R$ 799,90 somente hoje</p>"),
        200,
    )]);
    let rt = Runtime::new(
        fast_config(),
        store.clone(),
        browser,
        Arc::new(StaticProxyPool::direct()),
    )
    .unwrap();

    let mut rx = rt.events().subscribe();
    rt.start().await;

    let result = await_attempt(&mut rx, 1).await;
    assert_eq!(result.outcome, AttemptOutcome::Ok);
    assert!((result.record.as_ref().unwrap().price - 799.90).abs() < 0.001);

    // First success for the domain clones the generic into it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let copy = rt
        .learning()
        .strategy_metrics(
            "loja-desconhecida.example",
            "generic:price:regex@loja-desconhecida.example",
        )
        .await
        .expect("domain copy created");
    assert_eq!(copy.parent_id.as_deref(), Some("generic:price:regex"));
    assert_eq!(copy.successes, 1);

    rt.shutdown().await;
}
