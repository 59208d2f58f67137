//! Declarative entity rule table.
//!
//! Rules are loaded from TOML at startup. The embedded defaults ship with the
//! binary; `classify.rules_path` replaces them with an external table.

use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use tenderwatch_shared::{Origin, Result, TenderwatchError};

/// Rule table shipped with the binary.
const DEFAULT_RULES: &str = include_str!("../rules/default.toml");

/// What a rule contributes to classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Exclusion,
    TaiwanOverride,
    KnownEntity,
    OriginKeyword,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    id: String,
    kind: RuleKind,
    pattern: String,
    #[serde(default)]
    origin: Option<Origin>,
    #[serde(default)]
    note: Option<String>,
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub kind: RuleKind,
    /// Origin asserted by the rule; `None` for exclusions.
    pub origin: Option<Origin>,
    pub note: Option<String>,
    regex: Regex,
}

impl Rule {
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// `id` plus note, for rationales.
    pub fn describe(&self) -> String {
        match &self.note {
            Some(note) => format!("{} ({note})", self.id),
            None => self.id.clone(),
        }
    }
}

/// Ordered, compiled rule table.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// The embedded default table.
    pub fn embedded() -> Result<Self> {
        Self::from_toml(DEFAULT_RULES)
    }

    /// Load an external table, or the embedded one when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|e| TenderwatchError::io(path, e))?;
                let set = Self::from_toml(&content)?;
                debug!(?path, rules = set.len(), "loaded rule table");
                Ok(set)
            }
            None => Self::embedded(),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: RuleFile = toml::from_str(content)
            .map_err(|e| TenderwatchError::parse(format!("rule table: {e}")))?;

        let mut rules = Vec::with_capacity(file.rules.len());
        for spec in file.rules {
            let origin = match spec.kind {
                RuleKind::Exclusion => None,
                RuleKind::TaiwanOverride => Some(Origin::Taiwan),
                RuleKind::KnownEntity | RuleKind::OriginKeyword => {
                    Some(spec.origin.ok_or_else(|| {
                        TenderwatchError::validation(format!("rule '{}' needs an origin", spec.id))
                    })?)
                }
            };
            let regex = Regex::new(&format!("(?i){}", spec.pattern)).map_err(|e| {
                TenderwatchError::validation(format!("rule '{}' has an invalid pattern: {e}", spec.id))
            })?;
            rules.push(Rule {
                id: spec.id,
                kind: spec.kind,
                origin,
                note: spec.note,
                regex,
            });
        }
        Ok(Self { rules })
    }

    /// First rule of `kind` matching `name`.
    pub fn first_match(&self, kind: RuleKind, name: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|r| r.kind == kind && r.matches(name))
    }

    /// All name rules (known entities, then keywords) matching `name`.
    pub fn name_signals(&self, name: &str) -> Vec<&Rule> {
        let known = self
            .rules
            .iter()
            .filter(|r| r.kind == RuleKind::KnownEntity && r.matches(name));
        let keywords = self
            .rules
            .iter()
            .filter(|r| r.kind == RuleKind::OriginKeyword && r.matches(name));
        known.chain(keywords).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_table_compiles() {
        let set = RuleSet::embedded().unwrap();
        assert!(set.len() > 20);
        assert!(set.first_match(RuleKind::Exclusion, "PRI-DJI A CONSTRUCTION JV").is_some());
        assert!(set.first_match(RuleKind::TaiwanOverride, "Foxconn Technology").is_some());
    }

    #[test]
    fn first_match_wins_in_table_order() {
        let set = RuleSet::from_toml(
            r#"
[[rules]]
id = "a"
kind = "exclusion"
pattern = 'ACME'

[[rules]]
id = "b"
kind = "exclusion"
pattern = 'ACME\s+CHINA'
"#,
        )
        .unwrap();
        assert_eq!(set.first_match(RuleKind::Exclusion, "acme china").unwrap().id, "a");
    }

    #[test]
    fn name_rules_require_origin() {
        let err = RuleSet::from_toml(
            r#"
[[rules]]
id = "k"
kind = "known_entity"
pattern = 'X'
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("needs an origin"));
    }

    #[test]
    fn invalid_pattern_rejected() {
        let err = RuleSet::from_toml(
            r#"
[[rules]]
id = "bad"
kind = "exclusion"
pattern = '(unclosed'
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn name_signals_list_known_entities_first() {
        let set = RuleSet::embedded().unwrap();
        let ids: Vec<&str> = set
            .name_signals("Huawei Technologies (Shenzhen)")
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["known.huawei", "keyword.prc"]);
    }
}
