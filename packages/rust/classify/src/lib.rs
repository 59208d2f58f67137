//! Entity classification and risk scoring.
//!
//! This crate provides:
//! - [`RuleSet`] — the declarative, first-match-wins name rule table
//! - [`Classifier`] — origin + confidence for a party
//! - [`RiskScorer`] — record-level risk levels with explaining factors
//! - [`entity_key`] and [`goods_origin_signal`] helpers

pub mod classifier;
pub mod risk;
pub mod rules;

pub use classifier::{AMBIGUOUS_WARNING, Classifier, entity_key, goods_origin_signal};
pub use risk::RiskScorer;
pub use rules::{Rule, RuleKind, RuleSet};
