//! Field normalizers — turn matched text into typed record values.
//!
//! Brazilian marketplaces dominate the monitored set, so the money parser
//! must disambiguate `1.234,56` (pt-BR) from `1,234.56` (en-US) and accept
//! bare `29,99` fragments. Normalization failure is a non-match: the
//! evaluator simply moves on to the next strategy.

use crate::model::{Availability, InstallmentPlan};
use regex::Regex;
use std::sync::OnceLock;

/// Parse a price string, stripping currency symbols, thousands separators,
/// and whitespace. Returns `None` for anything that does not contain a
/// positive decimal number.
pub fn parse_money(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();

    if cleaned.is_empty() {
        return None;
    }

    // Both separators present: whichever comes last is the decimal mark.
    let normalized = if cleaned.contains(',') && cleaned.contains('.') {
        if cleaned.rfind(',') > cleaned.rfind('.') {
            // pt-BR: 1.234,56
            cleaned.replace('.', "").replace(',', ".")
        } else {
            // en-US: 1,234.56
            cleaned.replace(',', "")
        }
    } else if cleaned.contains(',') {
        let after_comma = cleaned.split(',').next_back().unwrap_or("");
        if after_comma.len() <= 2 {
            // Decimal comma: 29,99
            cleaned.replace(',', ".")
        } else {
            // Thousands comma: 1,234
            cleaned.replace(',', "")
        }
    } else {
        cleaned
    };

    normalized.parse::<f64>().ok().filter(|v| *v > 0.0 && v.is_finite())
}

/// Availability keyword table. Portuguese terms first (the monitored
/// marketplaces render pt-BR), then English, then schema.org tokens.
/// Ordered so that the more specific phrase wins (`fora de estoque` must
/// not be claimed by a bare `estoque` check).
const AVAILABILITY_TABLE: &[(&str, Availability)] = &[
    ("esgotado", Availability::OutOfStock),
    ("indispon", Availability::OutOfStock),
    ("fora de estoque", Availability::OutOfStock),
    ("sem estoque", Availability::OutOfStock),
    ("outofstock", Availability::OutOfStock),
    ("out_of_stock", Availability::OutOfStock),
    ("out of stock", Availability::OutOfStock),
    ("sold out", Availability::OutOfStock),
    ("soldout", Availability::OutOfStock),
    ("discontinued", Availability::OutOfStock),
    ("unavailable", Availability::OutOfStock),
    ("últimas unidades", Availability::LowStock),
    ("ultimas unidades", Availability::LowStock),
    ("estoque baixo", Availability::LowStock),
    ("limited stock", Availability::LowStock),
    ("limitedavailability", Availability::LowStock),
    ("low stock", Availability::LowStock),
    ("pré-venda", Availability::PreOrder),
    ("pre-venda", Availability::PreOrder),
    ("pré venda", Availability::PreOrder),
    ("encomenda", Availability::PreOrder),
    ("preorder", Availability::PreOrder),
    ("pre-order", Availability::PreOrder),
    ("pre_order", Availability::PreOrder),
    ("backorder", Availability::PreOrder),
    ("em estoque", Availability::InStock),
    ("dispon", Availability::InStock),
    ("instock", Availability::InStock),
    ("in_stock", Availability::InStock),
    ("in stock", Availability::InStock),
    ("available", Availability::InStock),
];

/// Classify an availability string. Accepts both visible text and
/// schema.org URLs (`https://schema.org/InStock`).
pub fn parse_availability(text: &str) -> Option<Availability> {
    let lower = text.to_lowercase();
    AVAILABILITY_TABLE
        .iter()
        .find(|(kw, _)| lower.contains(kw))
        .map(|(_, a)| *a)
}

fn installment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // "12x de R$ 108,33 sem juros", "10 x R$ 99,90", "3x de 33,00 com juros"
        Regex::new(
            r"(?i)(\d{1,2})\s*x\s*(?:de\s*)?(?:R\$\s*)?(\d{1,3}(?:\.\d{3})*,\d{2}|\d+[.,]\d{2})\s*(sem\s+juros|com\s+juros)?",
        )
        .expect("installment regex is valid")
    })
}

/// Parse every advertised installment plan from a text fragment, in
/// document order. Only an explicit "com juros" sets `interest_flag`;
/// sites omit the qualifier both ways, so absence maps to `false`.
pub fn parse_installments(text: &str) -> Vec<InstallmentPlan> {
    installment_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let times: u32 = caps.get(1)?.as_str().parse().ok()?;
            let value = parse_money(caps.get(2)?.as_str())?;
            let interest_flag = caps
                .get(3)
                .map(|m| m.as_str().to_lowercase().starts_with("com"))
                .unwrap_or(false);
            (times >= 2).then_some(InstallmentPlan {
                value,
                times,
                interest_flag,
            })
        })
        .collect()
}

/// Promotion badge phrases worth carrying on the record.
const PROMOTION_TERMS: &[&str] = &[
    "black friday",
    "oferta relâmpago",
    "oferta do dia",
    "frete grátis",
    "cupom",
    "liquidação",
    "promoção",
    "desconto",
];

/// Collect promotion labels present in the rendered text, deduplicated,
/// in table order.
pub fn collect_promotions(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    PROMOTION_TERMS
        .iter()
        .filter(|term| lower.contains(*term))
        .map(|term| term.to_string())
        .collect()
}
