//! Extraction strategies — the tagged variant the whole core revolves
//! around.
//!
//! A [`Strategy`] targets one field of the price record and carries a
//! kind-specific matcher definition. Composite strategies hold a sequence
//! of child definitions (same variant, naturally recursive); nesting is
//! bounded at [`MAX_COMPOSITE_DEPTH`] to keep evaluation predictable.

pub mod evaluator;
pub mod normalize;
pub mod seeds;
pub mod variants;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Strategy identifiers are strings: seeds use stable readable ids
/// (`generic:price:regex`), variants derive from their parent
/// (`<parent>.v3`).
pub type StrategyId = String;

/// Domain wildcard for generic starter strategies. Generic strategies are
/// read-only to the learning layer; a domain-scoped copy is created on
/// first successful use.
pub const GENERIC_DOMAIN: &str = "*";

/// Reserved id prefix for the last-resort fallback sweep. Traces carrying
/// this prefix never mutate portfolio metrics.
pub const FALLBACK_ID_PREFIX: &str = "fallback:";

/// Maximum composite nesting depth.
pub const MAX_COMPOSITE_DEPTH: usize = 4;

/// The record field a strategy extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    Price,
    OldPrice,
    PixPrice,
    Installment,
    Availability,
}

impl TargetField {
    /// Fields that must resolve for an attempt to count as `ok`. Only the
    /// current price is required; everything else enriches the record.
    pub fn is_required(self) -> bool {
        matches!(self, TargetField::Price)
    }

    pub const ALL: [TargetField; 5] = [
        TargetField::Price,
        TargetField::OldPrice,
        TargetField::PixPrice,
        TargetField::Installment,
        TargetField::Availability,
    ];
}

/// Where a regex strategy searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum RegexScope {
    /// The raw serialized HTML of the snapshot.
    WholeDocument,
    /// The visible text of the first element matching `selector`.
    TextOf { selector: String },
}

/// How a CSS strategy reads the matched element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    /// Whitespace-collapsed visible text.
    InnerText,
    /// Raw concatenated text nodes.
    TextContent,
}

/// Final value transformation for composite pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    ExtractDecimal,
}

/// Numeric validation applied to a composite's final value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericValidation {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl NumericValidation {
    pub fn accepts(&self, value: f64) -> bool {
        self.min.map_or(true, |m| value >= m) && self.max.map_or(true, |m| value <= m)
    }
}

/// Kind-specific matcher definition. Serialized with an internal tag so
/// stored strategy data stays self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StrategyKind {
    Regex {
        pattern: String,
        /// Inline flag string, e.g. `"i"` for case-insensitive.
        #[serde(default)]
        flags: String,
        /// Capture group whose text becomes the match value.
        group_index: usize,
        #[serde(flatten)]
        scope: RegexScope,
    },
    Css {
        selector: String,
        /// Read this attribute instead of element text when set.
        #[serde(default)]
        attribute: Option<String>,
        text_mode: TextMode,
        /// When several elements match, prefer the one whose text carries a
        /// context keyword (`R$`, `preço`, `pix`, …).
        #[serde(default)]
        context_terms: Vec<String>,
    },
    Xpath {
        expression: String,
        #[serde(default)]
        attribute: Option<String>,
    },
    Semantic {
        /// Attribute matchers: `data-price` (presence) or
        /// `itemprop=price` (exact value).
        attributes: Vec<String>,
        #[serde(default)]
        context_terms: Vec<String>,
        /// Maximum distance (in rendered-text characters) between the node
        /// and the nearest context term.
        max_distance_chars: usize,
    },
    Composite {
        steps: Vec<StrategyKind>,
        #[serde(default)]
        transformation: Option<Transformation>,
        #[serde(default)]
        validation: Option<NumericValidation>,
    },
}

impl StrategyKind {
    /// Nesting depth; non-composite kinds are depth 1.
    pub fn depth(&self) -> usize {
        match self {
            StrategyKind::Composite { steps, .. } => {
                1 + steps.iter().map(StrategyKind::depth).max().unwrap_or(0)
            }
            _ => 1,
        }
    }

    /// Structural sanity: composite steps non-empty, depth bounded.
    pub fn is_well_formed(&self) -> bool {
        match self {
            StrategyKind::Composite { steps, .. } => {
                !steps.is_empty()
                    && self.depth() <= MAX_COMPOSITE_DEPTH
                    && steps.iter().all(StrategyKind::is_well_formed)
            }
            StrategyKind::Regex { pattern, .. } => !pattern.is_empty(),
            StrategyKind::Css { selector, .. } => !selector.is_empty(),
            StrategyKind::Xpath { expression, .. } => !expression.is_empty(),
            StrategyKind::Semantic { attributes, .. } => !attributes.is_empty(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            StrategyKind::Regex { .. } => "regex",
            StrategyKind::Css { .. } => "css",
            StrategyKind::Xpath { .. } => "xpath",
            StrategyKind::Semantic { .. } => "semantic",
            StrategyKind::Composite { .. } => "composite",
        }
    }
}

/// One extraction strategy with its learned metrics. Mutated only by the
/// learning layer; everything else treats strategies as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: StrategyId,
    /// Concrete domain, or [`GENERIC_DOMAIN`].
    pub domain: String,
    pub target_field: TargetField,
    pub kind: StrategyKind,
    /// Learned confidence in `[0, 1]`.
    pub confidence: f64,
    /// Evaluation order within the portfolio; lower runs earlier.
    pub priority: i32,
    pub attempts: u64,
    pub successes: u64,
    pub last_success: Option<DateTime<Utc>>,
    /// URLs where this strategy recently succeeded, for later inspection.
    pub sample_urls: Vec<String>,
    /// Set on generated variants and on domain copies of generics.
    pub parent_id: Option<StrategyId>,
}

impl Strategy {
    pub fn is_generic(&self) -> bool {
        self.domain == GENERIC_DOMAIN
    }

    /// Observed success rate; 0 until the first attempt lands.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    /// Evaluation order key: `(priority asc, confidence desc, id)`.
    pub fn rank_key(&self) -> (i32, std::cmp::Reverse<ordered::F64>, StrategyId) {
        (
            self.priority,
            std::cmp::Reverse(ordered::F64(self.confidence)),
            self.id.clone(),
        )
    }
}

/// Minimal total-order wrapper for confidence sorting. Confidence is kept
/// in `[0, 1]` by construction, so NaN never occurs in practice; compare
/// falls back to `Equal` defensively.
pub mod ordered {
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct F64(pub f64);

    impl Eq for F64 {}

    impl PartialOrd for F64 {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for F64 {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}

/// Sort a portfolio into evaluation order.
pub fn rank(strategies: &mut [Strategy]) {
    strategies.sort_by_key(Strategy::rank_key);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(id: &str, priority: i32, confidence: f64) -> Strategy {
        Strategy {
            id: id.into(),
            domain: "shop.example".into(),
            target_field: TargetField::Price,
            kind: StrategyKind::Css {
                selector: ".price".into(),
                attribute: None,
                text_mode: TextMode::InnerText,
                context_terms: Vec::new(),
            },
            confidence,
            priority,
            attempts: 0,
            successes: 0,
            last_success: None,
            sample_urls: Vec::new(),
            parent_id: None,
        }
    }

    #[test]
    fn test_rank_order() {
        let mut portfolio = vec![
            strategy("c", 1, 0.9),
            strategy("a", 0, 0.2),
            strategy("b", 1, 0.95),
        ];
        rank(&mut portfolio);
        let ids: Vec<_> = portfolio.iter().map(|s| s.id.as_str()).collect();
        // priority first, then confidence descending
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rank_ties_break_on_id() {
        let mut portfolio = vec![strategy("b", 0, 0.5), strategy("a", 0, 0.5)];
        rank(&mut portfolio);
        assert_eq!(portfolio[0].id, "a");
    }

    #[test]
    fn test_composite_depth() {
        let leaf = StrategyKind::Regex {
            pattern: r"\d+".into(),
            flags: String::new(),
            group_index: 0,
            scope: RegexScope::WholeDocument,
        };
        let two = StrategyKind::Composite {
            steps: vec![leaf.clone()],
            transformation: None,
            validation: None,
        };
        let three = StrategyKind::Composite {
            steps: vec![two.clone()],
            transformation: None,
            validation: None,
        };
        assert_eq!(leaf.depth(), 1);
        assert_eq!(two.depth(), 2);
        assert_eq!(three.depth(), 3);
        assert!(three.is_well_formed());

        let five = StrategyKind::Composite {
            steps: vec![StrategyKind::Composite {
                steps: vec![three],
                transformation: None,
                validation: None,
            }],
            transformation: None,
            validation: None,
        };
        assert_eq!(five.depth(), 5);
        assert!(!five.is_well_formed());
    }

    #[test]
    fn test_empty_composite_rejected() {
        let empty = StrategyKind::Composite {
            steps: Vec::new(),
            transformation: None,
            validation: None,
        };
        assert!(!empty.is_well_formed());
    }

    #[test]
    fn test_kind_serialization_tagged() {
        let kind = StrategyKind::Semantic {
            attributes: vec!["itemprop=price".into(), "data-price".into()],
            context_terms: vec!["pix".into()],
            max_distance_chars: 120,
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert!(json.contains(r#""kind":"semantic"#));
        let parsed: StrategyKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, kind);
    }
}
