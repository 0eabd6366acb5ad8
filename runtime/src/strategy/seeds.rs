//! Starter portfolio — what an unseen domain begins with.
//!
//! The generic seeds live under the `*` wildcard domain and are read-only:
//! the learning layer clones them into a concrete domain on first
//! successful use instead of mutating them. Known marketplaces get
//! additional CSS seeds from the static table below.

use crate::strategy::{
    RegexScope, Strategy, StrategyKind, TargetField, TextMode, GENERIC_DOMAIN,
};

/// Generic seeds start behind any domain-specific strategy.
const GENERIC_PRIORITY_BASE: i32 = 100;

fn generic(id: &str, field: TargetField, kind: StrategyKind, offset: i32) -> Strategy {
    Strategy {
        id: id.to_string(),
        domain: GENERIC_DOMAIN.to_string(),
        target_field: field,
        kind,
        confidence: 0.5,
        priority: GENERIC_PRIORITY_BASE + offset,
        attempts: 0,
        successes: 0,
        last_success: None,
        sample_urls: Vec::new(),
        parent_id: None,
    }
}

fn doc_regex(pattern: &str) -> StrategyKind {
    StrategyKind::Regex {
        pattern: pattern.to_string(),
        flags: String::new(),
        group_index: 1,
        scope: RegexScope::WholeDocument,
    }
}

/// The generic starter portfolio: one regex per money-bearing field, one
/// semantic strategy for the price, and keyword matchers for availability.
pub fn generic_portfolio() -> Vec<Strategy> {
    vec![
        generic(
            "generic:price:regex",
            TargetField::Price,
            doc_regex(r"R\$\s*(\d{1,3}(?:\.\d{3})*,\d{2}|\d+[.,]\d{2})"),
            0,
        ),
        generic(
            "generic:price:semantic",
            TargetField::Price,
            StrategyKind::Semantic {
                attributes: vec![
                    "itemprop=price".to_string(),
                    "data-price".to_string(),
                    "property=product:price:amount".to_string(),
                ],
                context_terms: vec!["R$".to_string(), "preço".to_string(), "pix".to_string()],
                max_distance_chars: 400,
            },
            1,
        ),
        generic(
            "generic:old_price:regex",
            TargetField::OldPrice,
            doc_regex(r"(?i)de\s+R\$\s*(\d{1,3}(?:\.\d{3})*,\d{2}|\d+[.,]\d{2})"),
            0,
        ),
        generic(
            "generic:pix_price:regex",
            TargetField::PixPrice,
            doc_regex(r"(?i)pix\s*:?\s*R\$\s*(\d{1,3}(?:\.\d{3})*,\d{2}|\d+[.,]\d{2})"),
            0,
        ),
        generic(
            "generic:installment:regex",
            TargetField::Installment,
            doc_regex(r"(?i)(\d{1,2}\s*x\s*(?:de\s*)?R\$\s*\d{1,3}(?:\.\d{3})*,\d{2}(?:\s*(?:sem|com)\s+juros)?)"),
            0,
        ),
        generic(
            "generic:availability:semantic",
            TargetField::Availability,
            StrategyKind::Semantic {
                attributes: vec!["itemprop=availability".to_string()],
                context_terms: Vec::new(),
                max_distance_chars: 0,
            },
            0,
        ),
        generic(
            "generic:availability:regex",
            TargetField::Availability,
            doc_regex(r"(?i)(esgotado|indispon\S+|em estoque|dispon[íi]vel|pré-venda|últimas unidades)"),
            1,
        ),
    ]
}

/// Static per-domain CSS seeds for marketplaces the monitor ships with.
/// Each entry is `(selector, field)`; seeds rank ahead of the generics.
fn seed_table(domain: &str) -> &'static [(&'static str, TargetField)] {
    let bare = domain.strip_prefix("www.").unwrap_or(domain);
    match bare {
        "americanas.com.br" => &[
            ("[class*='price__SalesPrice']", TargetField::Price),
            ("[class*='price__From']", TargetField::OldPrice),
            ("[class*='pix'] [class*='price']", TargetField::PixPrice),
        ],
        "magazineluiza.com.br" => &[
            ("[data-testid='price-value']", TargetField::Price),
            ("[data-testid='price-original']", TargetField::OldPrice),
            ("[data-testid='installment']", TargetField::Installment),
        ],
        "amazon.com.br" | "amazon.com" => &[
            (".a-price .a-offscreen", TargetField::Price),
            (".basisPrice .a-offscreen", TargetField::OldPrice),
            ("#availability span", TargetField::Availability),
        ],
        "mercadolivre.com.br" => &[
            (".andes-money-amount__fraction", TargetField::Price),
            ("s .andes-money-amount__fraction", TargetField::OldPrice),
        ],
        "kabum.com.br" => &[
            ("h4.finalPrice", TargetField::Price),
            (".oldPrice", TargetField::OldPrice),
            (".priceCard", TargetField::PixPrice),
        ],
        "casasbahia.com.br" | "pontofrio.com.br" | "extra.com.br" => &[
            ("#product-price [data-testid='price-value']", TargetField::Price),
        ],
        _ => &[],
    }
}

/// Domain-specific seeds for a concrete domain, empty for unknown hosts.
pub fn domain_seeds(domain: &str) -> Vec<Strategy> {
    seed_table(domain)
        .iter()
        .enumerate()
        .map(|(i, (selector, field))| Strategy {
            id: format!("seed:{domain}:{}:{i}", field_slug(*field)),
            domain: domain.to_string(),
            target_field: *field,
            kind: StrategyKind::Css {
                selector: selector.to_string(),
                attribute: None,
                text_mode: TextMode::InnerText,
                context_terms: vec!["R$".to_string()],
            },
            confidence: 0.6,
            priority: i as i32,
            attempts: 0,
            successes: 0,
            last_success: None,
            sample_urls: Vec::new(),
            parent_id: None,
        })
        .collect()
}

fn field_slug(field: TargetField) -> &'static str {
    match field {
        TargetField::Price => "price",
        TargetField::OldPrice => "old_price",
        TargetField::PixPrice => "pix_price",
        TargetField::Installment => "installment",
        TargetField::Availability => "availability",
    }
}

/// Full starter portfolio for an unseen domain: specific seeds first, then
/// the read-only generics.
pub fn starter_portfolio(domain: &str) -> Vec<Strategy> {
    let mut portfolio = domain_seeds(domain);
    portfolio.extend(generic_portfolio());
    portfolio
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_seeds_are_wildcard_and_well_formed() {
        for s in generic_portfolio() {
            assert!(s.is_generic(), "{} must be generic", s.id);
            assert!(s.kind.is_well_formed(), "{} malformed", s.id);
            assert!(s.priority >= GENERIC_PRIORITY_BASE);
        }
    }

    #[test]
    fn test_known_marketplace_gets_css_seeds() {
        let seeds = domain_seeds("www.kabum.com.br");
        assert!(!seeds.is_empty());
        assert!(seeds.iter().all(|s| s.domain == "www.kabum.com.br"));
        assert!(seeds.iter().all(|s| !s.is_generic()));
    }

    #[test]
    fn test_unknown_domain_gets_only_generics() {
        let portfolio = starter_portfolio("loja-obscura.example");
        assert!(portfolio.iter().all(|s| s.is_generic()));
    }

    #[test]
    fn test_seeds_rank_ahead_of_generics() {
        let mut portfolio = starter_portfolio("kabum.com.br");
        crate::strategy::rank(&mut portfolio);
        assert!(!portfolio[0].is_generic());
    }

    #[test]
    fn test_generic_price_regex_matches_market_formats() {
        let price = generic_portfolio()
            .into_iter()
            .find(|s| s.id == "generic:price:regex")
            .unwrap();
        if let StrategyKind::Regex { pattern, .. } = &price.kind {
            let re = regex::Regex::new(pattern).unwrap();
            assert_eq!(re.captures("R$ 1.299,90").unwrap().get(1).unwrap().as_str(), "1.299,90");
            assert_eq!(re.captures("R$ 99,00").unwrap().get(1).unwrap().as_str(), "99,00");
        } else {
            panic!("expected regex seed");
        }
    }

    #[test]
    fn test_unique_seed_ids() {
        let portfolio = starter_portfolio("americanas.com.br");
        let mut ids: Vec<_> = portfolio.iter().map(|s| s.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), portfolio.len());
    }
}
