//! Variant generation — small mutations of a proven strategy.
//!
//! Children inherit `parent_id`, start at half the parent's confidence and
//! one priority step behind it, and are on probation: the learning layer
//! retires them quickly if they do not earn their keep.

use crate::strategy::{Strategy, StrategyKind};

/// Produce up to `fanout` children of `parent`. `existing_children` is the
/// number of children already derived from this parent, used to keep child
/// ids unique across generations.
pub fn spawn_variants(parent: &Strategy, fanout: usize, existing_children: usize) -> Vec<Strategy> {
    let mutations = mutate_kind(&parent.kind);

    mutations
        .into_iter()
        .take(fanout)
        .enumerate()
        .map(|(i, kind)| Strategy {
            id: format!("{}.v{}", parent.id, existing_children + i + 1),
            domain: parent.domain.clone(),
            target_field: parent.target_field,
            kind,
            confidence: 0.5 * parent.confidence,
            priority: parent.priority + 1,
            attempts: 0,
            successes: 0,
            last_success: None,
            sample_urls: Vec::new(),
            parent_id: Some(parent.id.clone()),
        })
        .filter(|child| child.kind.is_well_formed())
        .collect()
}

/// Kind-specific mutations, most promising first.
fn mutate_kind(kind: &StrategyKind) -> Vec<StrategyKind> {
    match kind {
        StrategyKind::Css {
            selector,
            attribute,
            text_mode,
            context_terms,
        } => {
            let mut out = Vec::new();
            // Widen: drop the last compound qualifier.
            if let Some(widened) = widen_selector(selector) {
                out.push(StrategyKind::Css {
                    selector: widened,
                    attribute: attribute.clone(),
                    text_mode: *text_mode,
                    context_terms: context_terms.clone(),
                });
            }
            // Tighten: pin the first occurrence.
            out.push(StrategyKind::Css {
                selector: format!("{selector}:first-of-type"),
                attribute: attribute.clone(),
                text_mode: *text_mode,
                context_terms: context_terms.clone(),
            });
            // Alternative ancestor: anchor under the main content area.
            out.push(StrategyKind::Css {
                selector: format!("main {selector}"),
                attribute: attribute.clone(),
                text_mode: *text_mode,
                context_terms: context_terms.clone(),
            });
            out
        }
        StrategyKind::Xpath {
            expression,
            attribute,
        } => {
            let mut out = Vec::new();
            // Widen: drop the last predicate.
            if let (Some(open), Some(close)) = (expression.rfind('['), expression.rfind(']')) {
                if open < close {
                    let mut widened = expression.clone();
                    widened.replace_range(open..=close, "");
                    out.push(StrategyKind::Xpath {
                        expression: widened,
                        attribute: attribute.clone(),
                    });
                }
            }
            // Alternative ancestor: make the first step a descendant of main.
            if let Some(rest) = expression.strip_prefix("//") {
                out.push(StrategyKind::Xpath {
                    expression: format!("//main//{rest}"),
                    attribute: attribute.clone(),
                });
            }
            out
        }
        StrategyKind::Regex {
            pattern,
            flags,
            group_index,
            scope,
        } => {
            let mut out = Vec::new();
            // Relax whitespace handling.
            if pattern.contains(' ') {
                out.push(StrategyKind::Regex {
                    pattern: pattern.replace(' ', r"\s*"),
                    flags: flags.clone(),
                    group_index: *group_index,
                    scope: scope.clone(),
                });
            }
            // Relax the decimal separator.
            if pattern.contains(",") && !pattern.contains("[.,]") {
                out.push(StrategyKind::Regex {
                    pattern: pattern.replace(',', "[.,]"),
                    flags: flags.clone(),
                    group_index: *group_index,
                    scope: scope.clone(),
                });
            }
            // Tighten: require the canonical pt-BR decimal comma.
            if pattern.contains("[.,]") {
                out.push(StrategyKind::Regex {
                    pattern: pattern.replace("[.,]", ","),
                    flags: flags.clone(),
                    group_index: *group_index,
                    scope: scope.clone(),
                });
            }
            out
        }
        StrategyKind::Semantic {
            attributes,
            context_terms,
            max_distance_chars,
        } => {
            // Broaden the attribute candidate set.
            const EXTRA_ATTRS: &[&str] = &["data-value", "data-product-price", "aria-label"];
            EXTRA_ATTRS
                .iter()
                .filter(|a| !attributes.iter().any(|b| b == *a))
                .map(|a| {
                    let mut attrs = attributes.clone();
                    attrs.push(a.to_string());
                    StrategyKind::Semantic {
                        attributes: attrs,
                        context_terms: context_terms.clone(),
                        max_distance_chars: *max_distance_chars,
                    }
                })
                .collect()
        }
        StrategyKind::Composite {
            steps,
            transformation,
            validation,
        } => {
            // Replace one step with a child variant of it, one composite
            // per mutated step.
            let mut out = Vec::new();
            for (i, step) in steps.iter().enumerate() {
                if let Some(mutated) = mutate_kind(step).into_iter().next() {
                    let mut new_steps = steps.clone();
                    new_steps[i] = mutated;
                    out.push(StrategyKind::Composite {
                        steps: new_steps,
                        transformation: *transformation,
                        validation: validation.clone(),
                    });
                }
            }
            out
        }
    }
}

/// Widen a CSS selector by one step: drop the trailing simple selector of
/// a descendant chain (`.a .b` → `.a`), else the last compound qualifier
/// (`div.price` → `div`). Returns `None` when nothing can be dropped.
fn widen_selector(selector: &str) -> Option<String> {
    let trimmed = selector.trim_end();
    // Drop a trailing simple selector in a descendant chain first.
    if let Some(idx) = trimmed.rfind(char::is_whitespace) {
        let head = trimmed[..idx].trim_end();
        if !head.is_empty() {
            return Some(head.to_string());
        }
    }
    // Otherwise drop the last class/attribute qualifier of the compound.
    let cut = trimmed
        .char_indices()
        .filter(|(i, c)| *i >= 1 && (*c == '.' || *c == '[' || *c == ':'))
        .map(|(i, _)| i)
        .last()?;
    let widened = trimmed[..cut].to_string();
    (!widened.is_empty()).then_some(widened)
}
