//! Rollups and the comparative jurisdiction ranking.
//!
//! Everything here is a pure function of the stored detections and the
//! per-jurisdiction record totals, so it can be re-derived at any time
//! (for example after a manual correction).

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::instrument;

use tenderwatch_classify::entity_key;
use tenderwatch_shared::{Detection, Origin, ReportConfig, RiskLevel};

/// Ranking weights and list sizes.
#[derive(Debug, Clone)]
pub struct AggregateParams {
    pub top_entities: usize,
    pub penetration_weight: f64,
    pub severity_weight: f64,
}

impl From<&ReportConfig> for AggregateParams {
    fn from(config: &ReportConfig) -> Self {
        Self {
            top_entities: config.top_entities,
            penetration_weight: config.penetration_weight,
            severity_weight: config.severity_weight,
        }
    }
}

impl Default for AggregateParams {
    fn default() -> Self {
        Self::from(&ReportConfig::default())
    }
}

/// An entity's share of a jurisdiction or sector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityShare {
    pub key: String,
    pub name: String,
    pub detections: usize,
    pub total_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JurisdictionSummary {
    pub jurisdiction: String,
    pub detections: usize,
    /// Distinct records with at least one tracked-origin party.
    pub flagged_records: usize,
    pub total_records: u64,
    /// Summed record value per currency, each record counted once.
    pub value_by_currency: BTreeMap<String, f64>,
    pub risk_histogram: BTreeMap<String, usize>,
    pub origin_histogram: BTreeMap<String, usize>,
    pub top_entities: Vec<EntityShare>,
    pub penetration: f64,
    pub severity: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityFootprint {
    pub key: String,
    pub name: String,
    pub origins: Vec<Origin>,
    pub jurisdictions: Vec<String>,
    pub sectors: Vec<String>,
    pub detections: usize,
    pub value_by_currency: BTreeMap<String, f64>,
    pub highest_risk: RiskLevel,
    pub verification_required: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectorRollup {
    pub tag: String,
    pub detections: usize,
    pub jurisdictions: Vec<String>,
    pub value_by_currency: BTreeMap<String, f64>,
    pub risk_histogram: BTreeMap<String, usize>,
    pub top_entities: Vec<EntityShare>,
}

/// One row of the comparative ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedJurisdiction {
    pub rank: usize,
    pub jurisdiction: String,
    pub score: f64,
    pub penetration: f64,
    pub severity: f64,
    pub detections: usize,
}

/// Everything the reporter writes, derived in one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregates {
    pub total_detections: usize,
    pub total_records: u64,
    pub jurisdictions: Vec<JurisdictionSummary>,
    pub entities: Vec<EntityFootprint>,
    pub sectors: Vec<SectorRollup>,
    pub ranking: Vec<RankedJurisdiction>,
}

/// Build every rollup. `record_totals` maps jurisdiction -> records parsed
/// there (flagged or not) and is the penetration denominator.
#[instrument(skip_all, fields(detections = detections.len()))]
pub fn aggregate(
    detections: &[Detection],
    record_totals: &BTreeMap<String, u64>,
    params: &AggregateParams,
) -> Aggregates {
    let mut by_jurisdiction: BTreeMap<String, Vec<&Detection>> = record_totals
        .keys()
        .map(|j| (j.clone(), Vec::new()))
        .collect();
    let mut by_entity: BTreeMap<String, Vec<&Detection>> = BTreeMap::new();
    let mut by_sector: BTreeMap<String, Vec<&Detection>> = BTreeMap::new();

    for detection in detections {
        by_jurisdiction
            .entry(detection.record.jurisdiction_label())
            .or_default()
            .push(detection);
        if let Some(party) = detection.party() {
            by_entity
                .entry(entity_key(&party.name))
                .or_default()
                .push(detection);
        }
        for tag in &detection.record.tags {
            by_sector.entry(tag.clone()).or_default().push(detection);
        }
    }

    let jurisdictions: Vec<JurisdictionSummary> = by_jurisdiction
        .into_iter()
        .map(|(code, dets)| {
            let total = record_totals.get(&code).copied().unwrap_or(0);
            summarize_jurisdiction(code, &dets, total, params)
        })
        .collect();

    let entities = by_entity
        .into_iter()
        .map(|(key, dets)| footprint(key, &dets))
        .collect();

    let sectors = by_sector
        .into_iter()
        .map(|(tag, dets)| SectorRollup {
            tag,
            detections: dets.len(),
            jurisdictions: dets
                .iter()
                .map(|d| d.record.jurisdiction_label())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            value_by_currency: record_values(&dets),
            risk_histogram: risk_histogram(&dets),
            top_entities: top_entities(&dets, params.top_entities),
        })
        .collect();

    let ranking = rank(&jurisdictions);

    Aggregates {
        total_detections: detections.len(),
        total_records: record_totals.values().sum(),
        jurisdictions,
        entities,
        sectors,
        ranking,
    }
}

fn summarize_jurisdiction(
    jurisdiction: String,
    dets: &[&Detection],
    total_records: u64,
    params: &AggregateParams,
) -> JurisdictionSummary {
    let flagged_records = dets
        .iter()
        .filter(|d| d.classification.origin.is_tracked())
        .map(|d| (&d.archive_id, &d.record.record_id))
        .collect::<BTreeSet<_>>()
        .len();
    let penetration = if total_records == 0 {
        0.0
    } else {
        (flagged_records as f64 / total_records as f64).min(1.0)
    };
    let severity = severity_index(dets);

    let mut origin_histogram: BTreeMap<String, usize> = BTreeMap::new();
    for d in dets {
        *origin_histogram
            .entry(d.classification.origin.to_string())
            .or_default() += 1;
    }

    JurisdictionSummary {
        jurisdiction,
        detections: dets.len(),
        flagged_records,
        total_records,
        value_by_currency: record_values(dets),
        risk_histogram: risk_histogram(dets),
        origin_histogram,
        top_entities: top_entities(dets, params.top_entities),
        penetration,
        severity,
        score: params.penetration_weight * penetration + params.severity_weight * severity,
    }
}

fn footprint(key: String, dets: &[&Detection]) -> EntityFootprint {
    let name = dets
        .iter()
        .find_map(|d| d.party().map(|p| p.name.trim().to_string()))
        .unwrap_or_else(|| key.clone());
    let origins: BTreeSet<Origin> = dets.iter().map(|d| d.classification.origin).collect();
    let mut value_by_currency: BTreeMap<String, f64> = BTreeMap::new();
    for d in dets {
        if let Some(value) = d.record.value {
            *value_by_currency.entry(currency_label(d)).or_default() += value;
        }
    }

    EntityFootprint {
        key,
        name,
        origins: origins.into_iter().collect(),
        jurisdictions: dets
            .iter()
            .map(|d| d.record.jurisdiction_label())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        sectors: dets
            .iter()
            .flat_map(|d| d.record.tags.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        detections: dets.len(),
        value_by_currency,
        highest_risk: dets
            .iter()
            .map(|d| d.risk.level)
            .max()
            .unwrap_or(RiskLevel::Low),
        verification_required: dets
            .iter()
            .filter(|d| d.classification.verification_required)
            .count(),
    }
}

/// Weighted RiskLevel histogram normalised to [0, 1]: all-Critical is 1.0,
/// all-Low is 0.25, no detections is 0.
pub fn severity_index(dets: &[&Detection]) -> f64 {
    if dets.is_empty() {
        return 0.0;
    }
    let max = RiskLevel::Critical.weight() as f64;
    let weighted: u32 = dets.iter().map(|d| d.risk.level.weight()).sum();
    weighted as f64 / (max * dets.len() as f64)
}

/// Sort by score descending, jurisdiction ascending on ties.
fn rank(summaries: &[JurisdictionSummary]) -> Vec<RankedJurisdiction> {
    let mut rows: Vec<&JurisdictionSummary> = summaries.iter().collect();
    rows.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.jurisdiction.cmp(&b.jurisdiction))
    });
    rows.into_iter()
        .enumerate()
        .map(|(i, s)| RankedJurisdiction {
            rank: i + 1,
            jurisdiction: s.jurisdiction.clone(),
            score: s.score,
            penetration: s.penetration,
            severity: s.severity,
            detections: s.detections,
        })
        .collect()
}

fn risk_histogram(dets: &[&Detection]) -> BTreeMap<String, usize> {
    let mut histogram: BTreeMap<String, usize> = RiskLevel::ALL
        .iter()
        .map(|l| (l.to_string(), 0))
        .collect();
    for d in dets {
        *histogram.entry(d.risk.level.to_string()).or_default() += 1;
    }
    histogram
}

/// Record values per currency; a record with several flagged parties is
/// counted once.
fn record_values(dets: &[&Detection]) -> BTreeMap<String, f64> {
    let mut seen = BTreeSet::new();
    let mut values: BTreeMap<String, f64> = BTreeMap::new();
    for d in dets {
        let Some(value) = d.record.value else {
            continue;
        };
        if seen.insert((&d.archive_id, &d.record.record_id)) {
            *values.entry(currency_label(d)).or_default() += value;
        }
    }
    values
}

fn top_entities(dets: &[&Detection], limit: usize) -> Vec<EntityShare> {
    let mut shares: BTreeMap<String, EntityShare> = BTreeMap::new();
    for d in dets {
        let Some(party) = d.party() else { continue };
        let key = entity_key(&party.name);
        let share = shares.entry(key.clone()).or_insert_with(|| EntityShare {
            key,
            name: party.name.trim().to_string(),
            detections: 0,
            total_value: 0.0,
        });
        share.detections += 1;
        share.total_value += d.record.value.unwrap_or(0.0);
    }
    let mut list: Vec<EntityShare> = shares.into_values().collect();
    list.sort_by(|a, b| {
        b.detections
            .cmp(&a.detections)
            .then_with(|| b.total_value.total_cmp(&a.total_value))
            .then_with(|| a.key.cmp(&b.key))
    });
    list.truncate(limit);
    list
}

fn currency_label(d: &Detection) -> String {
    d.record
        .currency
        .clone()
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::detection;

    fn with_risk(mut d: Detection, level: RiskLevel) -> Detection {
        d.risk.level = level;
        d
    }

    #[test]
    fn penetration_uses_record_totals() {
        let dets = vec![
            detection("R1", "Acme", Some("CN"), "DE", Some(10.0), None),
            detection("R2", "Acme", Some("CN"), "DE", Some(20.0), None),
        ];
        let totals = BTreeMap::from([("DE".to_string(), 8), ("FR".to_string(), 5)]);
        let agg = aggregate(&dets, &totals, &AggregateParams::default());

        let de = &agg.jurisdictions[0];
        assert_eq!(de.jurisdiction, "DE");
        assert_eq!(de.flagged_records, 2);
        assert!((de.penetration - 0.25).abs() < 1e-9);
        assert_eq!(de.value_by_currency["EUR"], 30.0);

        // Jurisdictions without detections still appear.
        let fr = &agg.jurisdictions[1];
        assert_eq!(fr.detections, 0);
        assert_eq!(fr.score, 0.0);
        assert_eq!(agg.total_records, 13);
    }

    #[test]
    fn untracked_origins_do_not_count_as_flagged() {
        let dets = vec![detection("R1", "Acme", None, "DE", Some(10.0), None)];
        let totals = BTreeMap::from([("DE".to_string(), 4)]);
        let agg = aggregate(&dets, &totals, &AggregateParams::default());
        assert_eq!(agg.jurisdictions[0].flagged_records, 0);
        assert_eq!(agg.jurisdictions[0].origin_histogram["Unknown"], 1);
    }

    #[test]
    fn severity_is_normalised() {
        let crit = with_risk(detection("R1", "A", Some("CN"), "DE", None, None), RiskLevel::Critical);
        let low = with_risk(detection("R2", "B", Some("CN"), "DE", None, None), RiskLevel::Low);
        assert_eq!(severity_index(&[&crit]), 1.0);
        assert_eq!(severity_index(&[&low]), 0.25);
        assert!((severity_index(&[&crit, &low]) - 0.625).abs() < 1e-9);
        assert_eq!(severity_index(&[]), 0.0);
    }

    #[test]
    fn ranking_orders_by_weighted_score() {
        let dets = vec![
            with_risk(detection("R1", "Acme", Some("CN"), "DE", None, None), RiskLevel::Critical),
            with_risk(detection("R2", "Acme", Some("CN"), "FR", None, None), RiskLevel::Low),
        ];
        let totals = BTreeMap::from([("DE".to_string(), 1), ("FR".to_string(), 10)]);
        let agg = aggregate(&dets, &totals, &AggregateParams::default());

        assert_eq!(agg.ranking[0].jurisdiction, "DE");
        assert_eq!(agg.ranking[0].rank, 1);
        // 0.6 * 1.0 + 0.4 * 1.0
        assert!((agg.ranking[0].score - 1.0).abs() < 1e-9);
        // 0.6 * 0.1 + 0.4 * 0.25
        assert!((agg.ranking[1].score - 0.16).abs() < 1e-9);
    }

    #[test]
    fn entity_footprints_and_sectors() {
        let mut a = detection("R1", "Acme Telecom Ltd", Some("CN"), "DE", Some(5.0), None);
        a.record.tags = vec!["telecom".into()];
        let mut b = detection("R2", "ACME TELECOM", Some("CN"), "NO", Some(7.0), None);
        b.record.tags = vec!["telecom".into(), "surveillance".into()];
        b.classification.verification_required = true;
        let agg = aggregate(&[a, b], &BTreeMap::new(), &AggregateParams::default());

        assert_eq!(agg.entities.len(), 1);
        let entity = &agg.entities[0];
        assert_eq!(entity.key, "ACME TELECOM");
        assert_eq!(entity.jurisdictions, vec!["DE", "NO"]);
        assert_eq!(entity.sectors, vec!["surveillance", "telecom"]);
        assert_eq!(entity.value_by_currency["EUR"], 12.0);
        assert_eq!(entity.verification_required, 1);

        let tags: Vec<&str> = agg.sectors.iter().map(|s| s.tag.as_str()).collect();
        assert_eq!(tags, vec!["surveillance", "telecom"]);
        assert_eq!(agg.sectors[1].detections, 2);
    }

    #[test]
    fn top_entities_are_truncated() {
        let dets: Vec<Detection> = (0..5)
            .map(|i| detection(&format!("R{i}"), &format!("Vendor {i}"), Some("CN"), "DE", Some(1.0), None))
            .collect();
        let params = AggregateParams {
            top_entities: 2,
            ..AggregateParams::default()
        };
        let agg = aggregate(&dets, &BTreeMap::new(), &params);
        assert_eq!(agg.jurisdictions[0].top_entities.len(), 2);
    }
}
