//! Entity origin classification.
//!
//! Evaluation order: false-positive exclusions, country code, Taiwan override,
//! name signals, high-value gate. The country code is the primary signal;
//! name rules only decide on their own when no code is recorded, and then
//! never above `NeedsReview`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use tenderwatch_shared::{
    Classification, ClassifyConfig, Confidence, GoodsOriginSignal, Origin, Result,
};

use crate::rules::{Rule, RuleKind, RuleSet};

/// Rule id recorded when the country code alone decided the origin.
const COUNTRY_CODE_RULE: &str = "country_code";

/// Warning prefix marking an ambiguous classification.
pub const AMBIGUOUS_WARNING: &str = "ambiguous name signals";

/// Classifies party names into origins using the rule table.
pub struct Classifier {
    rules: RuleSet,
    high_value_threshold: f64,
}

/// Rationale and warnings gathered while classifying.
#[derive(Default)]
struct Trail {
    fired: Vec<String>,
    warnings: Vec<String>,
}

impl Classifier {
    pub fn new(config: &ClassifyConfig) -> Result<Self> {
        let rules = RuleSet::load(config.rules_path.as_deref().map(Path::new))?;
        Ok(Self::with_rules(rules, config.high_value_threshold))
    }

    pub fn with_rules(rules: RuleSet, high_value_threshold: f64) -> Self {
        Self {
            rules,
            high_value_threshold,
        }
    }

    /// Classify one party.
    pub fn classify(
        &self,
        name: &str,
        country_code: Option<&str>,
        parent_name: Option<&str>,
        value: Option<f64>,
    ) -> Classification {
        let mut trail = Trail::default();
        let code = country_code
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty());

        let (origin, confidence, rule_id, ambiguous) =
            self.decide(name, code.as_deref(), &mut trail);

        if let Some(parent) = parent_name.filter(|p| !p.trim().is_empty()) {
            let parent_origins = self.signal_origins(&self.rules.name_signals(parent));
            if let Some(tracked) = parent_origins.iter().find(|o| o.is_tracked()) {
                if *tracked != origin {
                    trail.fired.push(format!("declared parent '{parent}' signals {tracked}"));
                }
            }
        }

        let verification_required = value.is_some_and(|v| v > self.high_value_threshold);
        if verification_required {
            trail.fired.push(format!(
                "value exceeds {:.0}: verification required",
                self.high_value_threshold
            ));
        }

        Classification {
            origin,
            confidence,
            rationale: trail.fired.join("; "),
            warnings: trail.warnings,
            verification_required,
            rule_id,
            ambiguous,
        }
    }

    fn decide(
        &self,
        name: &str,
        code: Option<&str>,
        trail: &mut Trail,
    ) -> (Origin, Confidence, Option<String>, bool) {
        let code_origin = code.map(|c| Origin::from_country_code(c).unwrap_or(Origin::Other));

        // 1. False-positive exclusions.
        let excluded = self.rules.first_match(RuleKind::Exclusion, name);
        if let Some(rule) = excluded {
            trail.fired.push(format!("exclusion {}", rule.describe()));
            match code_origin {
                None => {
                    trail.fired.push("no country code".into());
                    return (Origin::Unknown, Confidence::NeedsReview, Some(rule.id.clone()), false);
                }
                Some(Origin::Prc) => {}
                Some(origin) => {
                    trail.fired.push(format!("country code {} -> {origin}", code.unwrap_or_default()));
                    return (origin, Confidence::High, Some(rule.id.clone()), false);
                }
            }
        }

        let signals = if excluded.is_some() {
            Vec::new()
        } else {
            self.rules.name_signals(name)
        };
        let name_origins = self.signal_origins(&signals);

        match (code, code_origin) {
            // 2. Country code.
            (Some(code), Some(origin)) => {
                trail.fired.push(format!("country code {code} -> {origin}"));

                // 3. Taiwan override on a PRC code.
                if origin == Origin::Prc {
                    if let Some(rule) = self.rules.first_match(RuleKind::TaiwanOverride, name) {
                        trail.fired.push(format!("override {}", rule.describe()));
                        trail.warnings.push(format!(
                            "country code {code} recorded for a Taiwan-headquartered entity; check source data"
                        ));
                        return (Origin::Taiwan, Confidence::NeedsReview, Some(rule.id.clone()), false);
                    }
                }

                if origin == Origin::Other {
                    let tracked: Vec<Origin> =
                        name_origins.iter().copied().filter(|o| o.is_tracked()).collect();
                    if !tracked.is_empty() {
                        self.note_signals(&signals, trail);
                        trail.warnings.push(format!(
                            "country code {code} contradicts name signals ({})",
                            join_origins(&tracked)
                        ));
                        return (Origin::Other, Confidence::NeedsReview, Some(COUNTRY_CODE_RULE.into()), false);
                    }
                    return (Origin::Other, Confidence::High, Some(COUNTRY_CODE_RULE.into()), false);
                }

                let known = signals
                    .iter()
                    .find(|r| r.kind == RuleKind::KnownEntity && r.origin == Some(origin));
                if let Some(rule) = known {
                    trail.fired.push(format!("known entity {}", rule.describe()));
                    return (origin, Confidence::Verified, Some(rule.id.clone()), false);
                }

                let contradicting: Vec<Origin> =
                    name_origins.iter().copied().filter(|o| *o != origin).collect();
                if !contradicting.is_empty() {
                    self.note_signals(&signals, trail);
                    trail.warnings.push(format!(
                        "country code {code} contradicts name signals ({})",
                        join_origins(&contradicting)
                    ));
                    return (origin, Confidence::NeedsReview, Some(COUNTRY_CODE_RULE.into()), false);
                }

                (origin, Confidence::High, Some(COUNTRY_CODE_RULE.into()), false)
            }

            // 4. No code: name signals only.
            _ => {
                trail.fired.push("no country code".into());
                self.note_signals(&signals, trail);
                match name_origins.len() {
                    0 => (Origin::Unknown, Confidence::NeedsReview, None, false),
                    1 => {
                        let origin = name_origins.iter().next().copied().unwrap_or(Origin::Unknown);
                        let rule_id = signals.first().map(|r| r.id.clone());
                        (origin, Confidence::NeedsReview, rule_id, false)
                    }
                    _ => {
                        let all: Vec<Origin> = name_origins.iter().copied().collect();
                        trail.warnings.push(format!("{AMBIGUOUS_WARNING}: {}", join_origins(&all)));
                        (Origin::Unknown, Confidence::NeedsReview, None, true)
                    }
                }
            }
        }
    }

    fn signal_origins(&self, signals: &[&Rule]) -> BTreeSet<Origin> {
        signals.iter().filter_map(|r| r.origin).collect()
    }

    fn note_signals(&self, signals: &[&Rule], trail: &mut Trail) {
        for rule in signals {
            if let Some(origin) = rule.origin {
                trail.fired.push(format!("name rule {} -> {origin}", rule.describe()));
            }
        }
    }
}

fn join_origins(origins: &[Origin]) -> String {
    origins
        .iter()
        .map(|o| o.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Goods-origin signal
// ---------------------------------------------------------------------------

static GOODS_ORIGIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:made|manufactured|produced|assembled)\s+in\s+(?:the\s+)?(people'?s\s+republic\s+of\s+china|p\.?r\.?c\.?|mainland\s+china|china|taiwan|hong\s*kong|macao|macau)\b|\bcountry\s+of\s+origin\s*[:\-]?\s*(?:the\s+)?(people'?s\s+republic\s+of\s+china|p\.?r\.?c\.?|mainland\s+china|china|taiwan|hong\s*kong|macao|macau|cn|tw|hk|mo)\b",
    )
    .expect("valid regex")
});

/// "Made in X" style statement in free text. Low confidence, never used as
/// the party's primary classification.
pub fn goods_origin_signal(text: &str) -> Option<GoodsOriginSignal> {
    let caps = GOODS_ORIGIN_RE.captures(text)?;
    let place = caps.get(1).or_else(|| caps.get(2))?.as_str().to_ascii_lowercase();
    let place: String = place.chars().filter(|c| c.is_ascii_alphabetic()).collect();

    let origin = match place.as_str() {
        "taiwan" | "tw" => Origin::Taiwan,
        "hongkong" | "hk" => Origin::HongKong,
        "macao" | "macau" | "mo" => Origin::Macao,
        _ => Origin::Prc,
    };

    Some(GoodsOriginSignal {
        origin,
        confidence: Confidence::Low,
        fragment: caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// Entity key
// ---------------------------------------------------------------------------

/// Legal-form tokens dropped from the end of names.
const LEGAL_SUFFIXES: &[&str] = &[
    "LTD", "LIMITED", "CO", "COMPANY", "INC", "INCORPORATED", "CORP", "CORPORATION", "LLC",
    "PLC", "GMBH", "AG", "SA", "SAS", "SARL", "SRL", "SPA", "BV", "NV", "AB", "AS", "OY",
    "KG", "KFT", "SPZOO", "ZOO", "SP", "PTE", "PTY", "HOLDINGS", "HOLDING",
];

/// Normalised identity for grouping party names across records:
/// upper-case, punctuation folded, trailing legal forms removed.
pub fn entity_key(name: &str) -> String {
    let folded: String = name
        .chars()
        .filter(|c| *c != '.' && *c != '\'')
        .map(|c| if c.is_alphanumeric() { c.to_ascii_uppercase() } else { ' ' })
        .collect();
    let mut tokens: Vec<&str> = folded.split_whitespace().collect();
    while tokens.len() > 1 && tokens.last().is_some_and(|t| LEGAL_SUFFIXES.contains(t)) {
        tokens.pop();
    }

    if tokens.is_empty() {
        name.trim().to_uppercase()
    } else {
        tokens.join(" ")
    }
}
