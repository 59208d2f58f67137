//! Record-level risk scoring.

use tenderwatch_shared::{
    BaseLevels, Classification, Origin, Record, RiskAssessment, RiskConfig, RiskLevel,
};

/// Deterministic risk scorer: a base level keyed to the most severe origin,
/// raised one step per aggravating factor, capped at `Critical`.
pub struct RiskScorer {
    base_levels: BaseLevels,
    sensitive_technologies: Vec<String>,
    sensitive_authority_keywords: Vec<String>,
    high_value_threshold: f64,
}

impl RiskScorer {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            base_levels: config.base_levels.clone(),
            sensitive_technologies: config
                .sensitive_technologies
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            sensitive_authority_keywords: config
                .sensitive_authority_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            high_value_threshold: config.high_value_threshold,
        }
    }

    fn base_level(&self, origin: Origin) -> RiskLevel {
        match origin {
            Origin::Prc => self.base_levels.prc,
            Origin::HongKong => self.base_levels.hong_kong,
            Origin::Macao => self.base_levels.macao,
            Origin::Taiwan => self.base_levels.taiwan,
            Origin::Unknown => self.base_levels.unknown,
            Origin::Other => self.base_levels.other,
        }
    }

    /// Score a record given the classifications of its parties.
    pub fn score(&self, record: &Record, classifications: &[Classification]) -> RiskAssessment {
        let origin = classifications
            .iter()
            .map(|c| c.origin)
            .max_by_key(|o| o.severity())
            .unwrap_or(Origin::Unknown);

        let mut level = self.base_level(origin);
        let mut factors = vec![format!("base {level} for origin {origin}")];

        let sensitive: Vec<&str> = record
            .tags
            .iter()
            .filter(|t| self.sensitive_technologies.contains(&t.to_ascii_lowercase()))
            .map(String::as_str)
            .collect();
        if !sensitive.is_empty() {
            level = level.raise();
            factors.push(format!("sensitive technology: {}", sensitive.join(", ")));
        }

        if let Some(value) = record.value.filter(|v| *v > self.high_value_threshold) {
            level = level.raise();
            factors.push(format!(
                "value {value:.0} exceeds {:.0}",
                self.high_value_threshold
            ));
        }

        if let Some(authority) = &record.authority_name {
            let lower = authority.to_lowercase();
            if let Some(keyword) = self
                .sensitive_authority_keywords
                .iter()
                .find(|k| lower.contains(k.as_str()))
            {
                level = level.raise();
                factors.push(format!("sensitive authority ({keyword})"));
            }
        }

        factors.push(format!("level {level}"));
        RiskAssessment { level, factors }
    }
}

#[cfg(test)]
mod tests {
    use tenderwatch_shared::{Confidence, Party, PartyRole};

    use super::*;

    fn classification(origin: Origin) -> Classification {
        Classification {
            origin,
            confidence: Confidence::High,
            rationale: String::new(),
            warnings: Vec::new(),
            verification_required: false,
            rule_id: None,
            ambiguous: false,
        }
    }

    fn record(value: Option<f64>, tags: &[&str], authority: &str) -> Record {
        Record {
            record_id: "R".into(),
            authority_name: Some(authority.into()),
            authority_jurisdiction: Some("DE".into()),
            parties: vec![Party {
                name: "P".into(),
                country_code: Some("CN".into()),
                parent_name: None,
                role: PartyRole::Prime,
            }],
            value,
            currency: Some("EUR".into()),
            date: None,
            sectors: Vec::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            description: None,
            member_path: "a.tar!/r.xml".into(),
        }
    }

    #[test]
    fn prc_telecom_high_value_is_critical() {
        let scorer = RiskScorer::new(&RiskConfig::default());
        let r = scorer.score(
            &record(Some(50_000_000.0), &["telecom"], "Stadt Bonn"),
            &[classification(Origin::Prc)],
        );
        assert_eq!(r.level, RiskLevel::Critical);
        assert!(r.factors.iter().any(|f| f.contains("telecom")));
    }

    #[test]
    fn base_levels_follow_most_severe_origin() {
        let scorer = RiskScorer::new(&RiskConfig::default());
        let rec = record(Some(1_000.0), &[], "Stadt Bonn");
        assert_eq!(scorer.score(&rec, &[classification(Origin::Other)]).level, RiskLevel::Low);
        assert_eq!(
            scorer
                .score(&rec, &[classification(Origin::Other), classification(Origin::HongKong)])
                .level,
            RiskLevel::Medium
        );
        assert_eq!(scorer.score(&rec, &[]).level, RiskLevel::Low);
    }

    #[test]
    fn sensitive_authority_raises_level() {
        let scorer = RiskScorer::new(&RiskConfig::default());
        let r = scorer.score(
            &record(None, &[], "Ministry of Defence"),
            &[classification(Origin::Taiwan)],
        );
        assert_eq!(r.level, RiskLevel::Medium);
    }

    #[test]
    fn caps_at_critical() {
        let scorer = RiskScorer::new(&RiskConfig::default());
        let r = scorer.score(
            &record(Some(1e9), &["nuclear"], "Ministry of Defence"),
            &[classification(Origin::Prc)],
        );
        assert_eq!(r.level, RiskLevel::Critical);
    }
}
