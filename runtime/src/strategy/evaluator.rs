//! Strategy evaluator — applies a ranked portfolio to a DOM snapshot.
//!
//! All entry points are **synchronous** because the `scraper` crate's types
//! are `!Send`; the engine wraps evaluation in `tokio::task::spawn_blocking`.
//!
//! Per target field, strategies run in `(priority asc, confidence desc, id)`
//! order and the first one whose match survives normalization and
//! field-level validation wins. Strategies are ranked by learned expected
//! utility, so evaluating past the first valid hit buys latency without
//! information. Every attempted `(field, strategy)` pair is recorded with
//! its elapsed time regardless — the learning layer credits strategies
//! independently.

use crate::model::{Availability, InstallmentPlan, StrategyTrace};
use crate::strategy::normalize;
use crate::strategy::{
    RegexScope, Strategy, StrategyId, StrategyKind, TargetField, TextMode, Transformation,
    FALLBACK_ID_PREFIX, MAX_COMPOSITE_DEPTH,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::time::Instant;

/// One resolved field value with its provenance.
#[derive(Debug, Clone)]
pub struct FieldValue {
    pub raw: String,
    pub confidence: f64,
    pub strategy_id: StrategyId,
}

/// Everything the evaluator pulled out of one snapshot.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub price: Option<(f64, FieldValue)>,
    pub old_price: Option<(f64, FieldValue)>,
    pub pix_price: Option<(f64, FieldValue)>,
    pub installment: Option<(Vec<InstallmentPlan>, FieldValue)>,
    pub availability: Option<(Availability, FieldValue)>,
    pub promotion_labels: Vec<String>,
    /// Every attempted (field, strategy) pair, in evaluation order.
    pub traces: Vec<StrategyTrace>,
    /// True when cross-field validation had to drop a field.
    pub degraded: bool,
}

impl Extraction {
    /// Minimum confidence among resolved required fields.
    pub fn required_confidence(&self) -> f64 {
        self.price.as_ref().map(|(_, v)| v.confidence).unwrap_or(0.0)
    }
}

/// Evaluate a portfolio against a snapshot.
///
/// `rendered_text` is the visible-text rendering of the page when the
/// session provides one; otherwise it is derived from the HTML body.
pub fn evaluate(html: &str, rendered_text: Option<&str>, portfolio: &[Strategy]) -> Extraction {
    let document = Html::parse_document(html);
    let body_text = match rendered_text {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => document_text(&document),
    };

    let mut by_field: HashMap<TargetField, Vec<&Strategy>> = HashMap::new();
    for s in portfolio {
        by_field.entry(s.target_field).or_default().push(s);
    }
    for list in by_field.values_mut() {
        list.sort_by_key(|s| s.rank_key());
    }

    let mut out = Extraction {
        promotion_labels: normalize::collect_promotions(&body_text),
        ..Default::default()
    };

    for field in TargetField::ALL {
        let Some(ranked) = by_field.get(&field) else {
            continue;
        };
        resolve_field(&document, html, &body_text, field, ranked, &mut out, None);
    }

    // Last-resort generic sweep for the required field. Reported under a
    // reserved id so portfolio metrics stay untouched.
    if out.price.is_none() {
        fallback_price_sweep(html, &mut out);
    }

    cross_field_validation(&document, html, &body_text, &by_field, &mut out);

    out
}

/// Resolve one field by walking its ranked strategies. `start_after`
/// resumes evaluation past a given strategy id (used by the cross-field
/// retry so already-tried strategies are not re-run).
fn resolve_field(
    document: &Html,
    html: &str,
    body_text: &str,
    field: TargetField,
    ranked: &[&Strategy],
    out: &mut Extraction,
    start_after: Option<&str>,
) {
    let mut skipping = start_after.is_some();
    for strategy in ranked {
        if skipping {
            if Some(strategy.id.as_str()) == start_after {
                skipping = false;
            }
            continue;
        }
        let started = Instant::now();
        let matched = run_kind(&strategy.kind, document, html, body_text, 0);
        let value = matched.and_then(|raw| normalize_field(field, &raw).map(|v| (raw, v)));
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let success = value.is_some();
        out.traces.push(StrategyTrace {
            strategy_id: strategy.id.clone(),
            field,
            success,
            confidence: strategy.confidence,
            elapsed_ms,
        });
        if let Some((raw, normalized)) = value {
            store_field(
                out,
                field,
                normalized,
                FieldValue {
                    raw,
                    confidence: strategy.confidence,
                    strategy_id: strategy.id.clone(),
                },
            );
            return;
        }
    }
}

/// A normalized field value, before being slotted into the extraction.
enum Normalized {
    Money(f64),
    Plans(Vec<InstallmentPlan>),
    Avail(Availability),
}

fn normalize_field(field: TargetField, raw: &str) -> Option<Normalized> {
    match field {
        TargetField::Price | TargetField::OldPrice | TargetField::PixPrice => {
            normalize::parse_money(raw).map(Normalized::Money)
        }
        TargetField::Installment => {
            let plans = normalize::parse_installments(raw);
            (!plans.is_empty()).then_some(Normalized::Plans(plans))
        }
        TargetField::Availability => normalize::parse_availability(raw).map(Normalized::Avail),
    }
}

fn store_field(out: &mut Extraction, field: TargetField, value: Normalized, fv: FieldValue) {
    match (field, value) {
        (TargetField::Price, Normalized::Money(v)) => out.price = Some((v, fv)),
        (TargetField::OldPrice, Normalized::Money(v)) => out.old_price = Some((v, fv)),
        (TargetField::PixPrice, Normalized::Money(v)) => out.pix_price = Some((v, fv)),
        (TargetField::Installment, Normalized::Plans(p)) => out.installment = Some((p, fv)),
        (TargetField::Availability, Normalized::Avail(a)) => out.availability = Some((a, fv)),
        _ => {}
    }
}

// ── Cross-field validation ───────────────────────────────────────────────────

/// Relations checked after all fields resolved: `pix_price ≤ price`,
/// `old_price ≥ price`. On violation the lowest-confidence offender is
/// dropped and re-tried once with its next strategy; a persistent
/// violation degrades the extraction (the offending field is dropped and
/// the overall outcome becomes `partial`).
fn cross_field_validation(
    document: &Html,
    html: &str,
    body_text: &str,
    by_field: &HashMap<TargetField, Vec<&Strategy>>,
    out: &mut Extraction,
) {
    let Some((price, _)) = out.price.clone() else {
        return;
    };

    // The price anchors every relation (re-trying it would invalidate the
    // other fields), so the optional side is the one dropped and re-tried.
    for field in [TargetField::PixPrice, TargetField::OldPrice] {
        let violated = match field {
            TargetField::PixPrice => out.pix_price.as_ref().map(|(v, _)| *v > price),
            TargetField::OldPrice => out.old_price.as_ref().map(|(v, _)| *v < price),
            _ => None,
        }
        .unwrap_or(false);
        if !violated {
            continue;
        }

        let offender_id = match field {
            TargetField::PixPrice => out.pix_price.take().map(|(_, fv)| fv.strategy_id),
            TargetField::OldPrice => out.old_price.take().map(|(_, fv)| fv.strategy_id),
            _ => None,
        };

        // The offender's match was invalid: its success trace flips so the
        // learning layer penalizes it exactly once.
        if let Some(offender_id) = &offender_id {
            if let Some(trace) = out
                .traces
                .iter_mut()
                .rev()
                .find(|t| t.field == field && t.strategy_id == *offender_id)
            {
                trace.success = false;
            }
        }

        if let (Some(ranked), Some(offender_id)) = (by_field.get(&field), offender_id) {
            resolve_field(
                document,
                html,
                body_text,
                field,
                ranked,
                out,
                Some(offender_id.as_str()),
            );
        }

        // One retry only. Anything still violating — or nothing at all —
        // drops the field and degrades the extraction to `partial`.
        let recovered = match field {
            TargetField::PixPrice => out.pix_price.as_ref().map(|(v, _)| *v <= price),
            TargetField::OldPrice => out.old_price.as_ref().map(|(v, _)| *v >= price),
            _ => None,
        }
        .unwrap_or(false);

        if !recovered {
            match field {
                TargetField::PixPrice => out.pix_price = None,
                TargetField::OldPrice => out.old_price = None,
                _ => {}
            }
            out.degraded = true;
        }
    }
}

// ── Kind matchers ────────────────────────────────────────────────────────────

/// Execute one matcher over the snapshot, returning the raw matched text.
fn run_kind(
    kind: &StrategyKind,
    document: &Html,
    html: &str,
    body_text: &str,
    depth: usize,
) -> Option<String> {
    if depth >= MAX_COMPOSITE_DEPTH {
        return None;
    }
    match kind {
        StrategyKind::Regex {
            pattern,
            flags,
            group_index,
            scope,
        } => {
            let haystack = match scope {
                RegexScope::WholeDocument => html.to_string(),
                RegexScope::TextOf { selector } => {
                    let sel = Selector::parse(selector).ok()?;
                    element_text(&document.select(&sel).next()?)
                }
            };
            let full = if flags.is_empty() {
                pattern.clone()
            } else {
                format!("(?{flags}){pattern}")
            };
            let re = Regex::new(&full).ok()?;
            let caps = re.captures(&haystack)?;
            caps.get(*group_index).map(|m| m.as_str().to_string())
        }
        StrategyKind::Css {
            selector,
            attribute,
            text_mode,
            context_terms,
        } => {
            let sel = Selector::parse(selector).ok()?;
            let candidates: Vec<ElementRef<'_>> = document.select(&sel).collect();
            let chosen = pick_by_context(&candidates, context_terms)?;
            read_element(&chosen, attribute.as_deref(), *text_mode)
        }
        StrategyKind::Xpath {
            expression,
            attribute,
        } => {
            let (selector, attr_from_path) = xpath_to_css(expression)?;
            let sel = Selector::parse(&selector).ok()?;
            let el = document.select(&sel).next()?;
            let attr = attribute.as_deref().or(attr_from_path.as_deref());
            read_element(&el, attr, TextMode::InnerText)
        }
        StrategyKind::Semantic {
            attributes,
            context_terms,
            max_distance_chars,
        } => semantic_match(document, body_text, attributes, context_terms, *max_distance_chars),
        StrategyKind::Composite {
            steps,
            transformation,
            validation,
        } => {
            let raw = run_composite(steps, document, html, body_text, depth)?;
            let transformed = match transformation {
                Some(Transformation::ExtractDecimal) => {
                    normalize::parse_money(&raw).map(|v| format!("{v}"))?
                }
                None => raw,
            };
            if let Some(check) = validation {
                let numeric = normalize::parse_money(&transformed)
                    .or_else(|| transformed.parse::<f64>().ok())?;
                if !check.accepts(numeric) {
                    return None;
                }
            }
            Some(transformed)
        }
    }
}

/// Composite pipelines thread a scope through their steps: selector steps
/// (css/xpath) narrow to an element whose HTML becomes the next step's
/// document; text steps (regex/semantic) terminate with a value.
fn run_composite(
    steps: &[StrategyKind],
    document: &Html,
    html: &str,
    body_text: &str,
    depth: usize,
) -> Option<String> {
    let mut scope_doc: Option<Html> = None;
    let mut scope_html: Option<String> = None;
    let mut last_value: Option<String> = None;

    for (i, step) in steps.iter().enumerate() {
        let doc = scope_doc.as_ref().unwrap_or(document);
        let doc_html = scope_html.as_deref().unwrap_or(html);

        match step {
            StrategyKind::Css { selector, .. } | StrategyKind::Xpath { expression: selector, .. }
                if i + 1 < steps.len() =>
            {
                // Narrowing step: the matched element's subtree becomes the
                // scope for every later step.
                let css = match step {
                    StrategyKind::Xpath { .. } => xpath_to_css(selector)?.0,
                    _ => selector.clone(),
                };
                let sel = Selector::parse(&css).ok()?;
                let el = doc.select(&sel).next()?;
                let fragment = el.html();
                scope_doc = Some(Html::parse_fragment(&fragment));
                scope_html = Some(fragment);
            }
            _ => {
                let text = document_text(doc);
                last_value = run_kind(step, doc, doc_html, &text, depth + 1);
                if last_value.is_none() {
                    return None;
                }
            }
        }
    }
    last_value
}

/// When several elements match a selector, prefer the one whose own text
/// carries a context keyword; otherwise take the first match.
fn pick_by_context<'a>(
    candidates: &[ElementRef<'a>],
    context_terms: &[String],
) -> Option<ElementRef<'a>> {
    if candidates.is_empty() {
        return None;
    }
    if !context_terms.is_empty() {
        for el in candidates {
            let text = element_text(el).to_lowercase();
            if context_terms.iter().any(|t| text.contains(&t.to_lowercase())) {
                return Some(*el);
            }
        }
    }
    candidates.first().copied()
}

/// Semantic matching: pick the first node whose semantic markers match AND
/// whose text lies within `max_distance_chars` of a context term in the
/// rendered text. Meta-style nodes are read through `content`.
fn semantic_match(
    document: &Html,
    body_text: &str,
    attributes: &[String],
    context_terms: &[String],
    max_distance_chars: usize,
) -> Option<String> {
    for matcher in attributes {
        let selector = match matcher.split_once('=') {
            Some((name, value)) => format!(r#"[{name}="{value}"]"#),
            None => format!("[{matcher}]"),
        };
        let sel = match Selector::parse(&selector) {
            Ok(s) => s,
            Err(_) => continue,
        };
        for el in document.select(&sel) {
            // Attribute value first (data-price="49.99", meta content=…)
            let attr_name = matcher.split_once('=').map(|(n, _)| n).unwrap_or(matcher);
            let value = el
                .value()
                .attr("content")
                .or_else(|| el.value().attr(attr_name))
                .map(str::to_string)
                .filter(|v| v.chars().any(|c| c.is_ascii_digit()))
                .unwrap_or_else(|| element_text(&el));
            if value.is_empty() {
                continue;
            }
            if within_context(body_text, &element_text(&el), context_terms, max_distance_chars) {
                return Some(value);
            }
        }
    }
    None
}

/// Distance check between a node's text and the nearest context term in the
/// rendered page text. Nodes whose text does not appear in the rendering
/// (meta tags) pass whenever any context term is present at all.
fn within_context(
    body_text: &str,
    node_text: &str,
    context_terms: &[String],
    max_distance_chars: usize,
) -> bool {
    if context_terms.is_empty() {
        return true;
    }
    let lower = body_text.to_lowercase();
    let term_positions: Vec<usize> = context_terms
        .iter()
        .flat_map(|t| {
            let t = t.to_lowercase();
            lower.match_indices(&t).map(|(i, _)| i).collect::<Vec<_>>()
        })
        .collect();
    if term_positions.is_empty() {
        return false;
    }
    let node = node_text.trim().to_lowercase();
    if node.is_empty() {
        return true;
    }
    match lower.find(&node) {
        Some(pos) => term_positions
            .iter()
            .any(|tp| pos.abs_diff(*tp) <= max_distance_chars),
        None => true,
    }
}

fn read_element(el: &ElementRef<'_>, attribute: Option<&str>, mode: TextMode) -> Option<String> {
    let value = match attribute {
        Some(attr) => el.value().attr(attr)?.to_string(),
        None => match mode {
            TextMode::InnerText => element_text(el),
            TextMode::TextContent => el.text().collect::<String>(),
        },
    };
    (!value.trim().is_empty()).then_some(value)
}

/// Whitespace-collapsed visible text of an element.
fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn document_text(document: &Html) -> String {
    if let Ok(sel) = Selector::parse("body") {
        if let Some(body) = document.select(&sel).next() {
            return element_text(&body);
        }
    }
    // Fragments have no <body>; fall back to the root element.
    element_text(&document.root_element())
}

// ── XPath subset translation ─────────────────────────────────────────────────

/// Translate a supported XPath subset to a CSS selector.
///
/// Supported: `//tag`, `/tag` child steps, `[@attr='v']` predicates,
/// wildcard `*`, and a trailing `/@attr` attribute read. Expressions
/// outside the subset are non-matches, which the evaluator treats like any
/// failed strategy.
pub fn xpath_to_css(expression: &str) -> Option<(String, Option<String>)> {
    let mut expr = expression.trim();
    let mut attribute = None;

    if let Some(idx) = expr.rfind("/@") {
        attribute = Some(expr[idx + 2..].to_string());
        expr = &expr[..idx];
    }

    if !expr.starts_with('/') {
        return None;
    }

    let mut css = String::new();
    let mut rest = expr;
    let mut first = true;

    while !rest.is_empty() {
        let descendant = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            true
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            false
        } else {
            return None;
        };

        let end = rest.find('/').unwrap_or(rest.len());
        let step = &rest[..end];
        rest = &rest[end..];
        if step.is_empty() {
            return None;
        }

        // A leading slash anchors at the document root, which CSS cannot
        // express for arbitrary tags; the first step is taken as-is.
        if !first {
            css.push_str(if descendant { " " } else { " > " });
        }
        first = false;

        let (tag, preds) = match step.find('[') {
            Some(i) => (&step[..i], &step[i..]),
            None => (step, ""),
        };
        css.push_str(if tag == "*" { "*" } else { tag });

        let mut preds = preds;
        while let Some(start) = preds.find("[@") {
            let end = preds.find(']')?;
            let pred = &preds[start + 2..end];
            let (name, value) = pred.split_once('=')?;
            let value = value.trim_matches('\'').trim_matches('"');
            css.push_str(&format!(r#"[{name}="{value}"]"#));
            preds = &preds[end + 1..];
        }
    }

    (!css.is_empty()).then_some((css, attribute))
}

// ── Fallback sweep ───────────────────────────────────────────────────────────

/// Generic last-resort regex pass for the required price field, applied
/// when the whole portfolio struck out. Confidence is fixed low and the
/// reserved strategy id keeps the learning layer's hands off it.
fn fallback_price_sweep(html: &str, out: &mut Extraction) {
    const PATTERNS: &[&str] = &[
        r"R\$\s*(\d{1,3}(?:\.\d{3})*,\d{2})",
        r"(\d{1,3}(?:\.\d{3})*,\d{2})\s*R\$",
        r"(?i)preço[:\s]+R\$\s*(\d+[.,]\d{2})",
    ];
    for pattern in PATTERNS {
        let re = Regex::new(pattern).expect("fallback pattern is valid");
        if let Some(caps) = re.captures(html) {
            if let Some(value) = caps.get(1).and_then(|m| normalize::parse_money(m.as_str())) {
                out.price = Some((
                    value,
                    FieldValue {
                        raw: caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
                        confidence: 0.3,
                        strategy_id: format!("{FALLBACK_ID_PREFIX}regex"),
                    },
                ));
                return;
            }
        }
    }
}
