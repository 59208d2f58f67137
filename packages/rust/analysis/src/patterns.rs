//! Pattern mining over the entity graph.
//!
//! Every pattern is a candidate for analyst review and carries the evidence
//! that produced it. Nothing here asserts wrongdoing.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, instrument};

use tenderwatch_shared::{Origin, PatternConfig};

use crate::graph::EntityGraph;

/// Region label for jurisdictions outside every configured region.
pub const UNGROUPED_REGION: &str = "other";

/// Thresholds and region table for pattern detection.
#[derive(Debug, Clone)]
pub struct PatternParams {
    pub market_division_min_jurisdictions: usize,
    pub stepping_stone_window: usize,
    pub stepping_stone_multiple: f64,
    /// region name -> member jurisdiction codes
    pub regions: BTreeMap<String, Vec<String>>,
}

impl From<&PatternConfig> for PatternParams {
    fn from(config: &PatternConfig) -> Self {
        Self {
            market_division_min_jurisdictions: config.market_division_min_jurisdictions,
            stepping_stone_window: config.stepping_stone_window,
            stepping_stone_multiple: config.stepping_stone_multiple,
            regions: config.regions.clone(),
        }
    }
}

impl Default for PatternParams {
    fn default() -> Self {
        Self::from(&PatternConfig::default())
    }
}

impl PatternParams {
    /// Region of a jurisdiction code, or [`UNGROUPED_REGION`].
    pub fn region_of(&self, jurisdiction: &str) -> &str {
        self.regions
            .iter()
            .find(|(_, members)| {
                members
                    .iter()
                    .any(|m| m.eq_ignore_ascii_case(jurisdiction))
            })
            .map(|(name, _)| name.as_str())
            .unwrap_or(UNGROUPED_REGION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    MarketDivision,
    SteppingStone,
    RegionalConcentration,
    SubsidiaryLinkage,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::MarketDivision => "market_division",
            PatternKind::SteppingStone => "stepping_stone",
            PatternKind::RegionalConcentration => "regional_concentration",
            PatternKind::SubsidiaryLinkage => "subsidiary_linkage",
        }
    }
}

/// Evidence attached to a pattern; shape depends on the kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Evidence {
    MarketDivision {
        /// entity key -> its jurisdictions
        jurisdictions: BTreeMap<String, Vec<String>>,
        detections: BTreeMap<String, usize>,
        total_value: BTreeMap<String, f64>,
    },
    SteppingStone {
        dated_detections: usize,
        window: usize,
        first_mean: f64,
        last_mean: f64,
        ratio: f64,
        first_detection_ids: Vec<String>,
        last_detection_ids: Vec<String>,
    },
    RegionalConcentration {
        dominant_region: String,
        share: f64,
        detections_by_region: BTreeMap<String, usize>,
        jurisdictions: Vec<String>,
    },
    SubsidiaryLinkage {
        parent: String,
        parent_origin: Origin,
        own_country_code: Option<String>,
        detections: usize,
        total_value: f64,
        jurisdictions: Vec<String>,
    },
}

/// A candidate pattern: kind, participating entity keys and evidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pattern {
    pub kind: PatternKind,
    pub participants: Vec<String>,
    pub evidence: Evidence,
}

/// Run every detector over the graph. Output is sorted by kind, then
/// participants.
#[instrument(skip_all, fields(entities = graph.entity_keys().count()))]
pub fn detect_patterns(graph: &EntityGraph, params: &PatternParams) -> Vec<Pattern> {
    let mut patterns = Vec::new();
    patterns.extend(market_division(graph, params));
    patterns.extend(stepping_stones(graph, params));
    patterns.extend(regional_concentration(graph, params));
    patterns.extend(subsidiary_linkage(graph));
    patterns.sort_by(|a, b| (a.kind, &a.participants).cmp(&(b.kind, &b.participants)));

    debug!(patterns = patterns.len(), "pattern detection finished");
    patterns
}

/// Pairs of entities, each present in at least N jurisdictions, whose
/// jurisdiction sets do not overlap.
pub fn market_division(graph: &EntityGraph, params: &PatternParams) -> Vec<Pattern> {
    let min = params.market_division_min_jurisdictions.max(1);
    let candidates: Vec<(String, BTreeSet<String>)> = graph
        .entity_keys()
        .map(|key| (key.to_string(), graph.jurisdictions_of(key)))
        .filter(|(_, juris)| juris.len() >= min)
        .collect();

    let mut out = Vec::new();
    for (i, (left, left_juris)) in candidates.iter().enumerate() {
        for (right, right_juris) in &candidates[i + 1..] {
            if !left_juris.is_disjoint(right_juris) {
                continue;
            }
            let mut jurisdictions = BTreeMap::new();
            let mut detections = BTreeMap::new();
            let mut total_value = BTreeMap::new();
            for (key, juris) in [(left, left_juris), (right, right_juris)] {
                let awards = graph.awards_of(key);
                jurisdictions.insert(key.clone(), juris.iter().cloned().collect());
                detections.insert(key.clone(), awards.len());
                total_value.insert(key.clone(), awards.iter().filter_map(|a| a.value).sum());
            }
            out.push(Pattern {
                kind: PatternKind::MarketDivision,
                participants: vec![left.clone(), right.clone()],
                evidence: Evidence::MarketDivision {
                    jurisdictions,
                    detections,
                    total_value,
                },
            });
        }
    }
    out
}

/// Entities whose award values escalate: mean of the last `window` dated
/// awards exceeds `multiple` times the mean of the first `window`. The two
/// windows may overlap when an entity has fewer than `2 * window` awards.
pub fn stepping_stones(graph: &EntityGraph, params: &PatternParams) -> Vec<Pattern> {
    let window = params.stepping_stone_window.max(1);
    let mut out = Vec::new();

    for key in graph.entity_keys() {
        let dated: Vec<(String, f64)> = graph
            .awards_of(key)
            .into_iter()
            .filter(|a| a.date.is_some())
            .filter_map(|a| a.value.map(|v| (a.detection_id, v)))
            .collect();
        if dated.len() < window {
            continue;
        }

        let first = &dated[..window];
        let last = &dated[dated.len() - window..];
        let first_mean = first.iter().map(|(_, v)| v).sum::<f64>() / window as f64;
        let last_mean = last.iter().map(|(_, v)| v).sum::<f64>() / window as f64;
        if first_mean <= 0.0 || last_mean <= params.stepping_stone_multiple * first_mean {
            continue;
        }

        out.push(Pattern {
            kind: PatternKind::SteppingStone,
            participants: vec![key.to_string()],
            evidence: Evidence::SteppingStone {
                dated_detections: dated.len(),
                window,
                first_mean,
                last_mean,
                ratio: last_mean / first_mean,
                first_detection_ids: first.iter().map(|(id, _)| id.clone()).collect(),
                last_detection_ids: last.iter().map(|(id, _)| id.clone()).collect(),
            },
        });
    }
    out
}

/// Dominant region per entity by detection share. Descriptive only.
pub fn regional_concentration(graph: &EntityGraph, params: &PatternParams) -> Vec<Pattern> {
    let mut out = Vec::new();

    for key in graph.entity_keys() {
        let awards = graph.awards_of(key);
        if awards.is_empty() {
            continue;
        }
        let mut by_region: BTreeMap<String, usize> = BTreeMap::new();
        for award in &awards {
            *by_region
                .entry(params.region_of(&award.jurisdiction).to_string())
                .or_default() += 1;
        }
        // Highest count wins; ties go to the alphabetically first region.
        let Some((region, count)) = by_region
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(r, c)| (r.clone(), *c))
        else {
            continue;
        };

        out.push(Pattern {
            kind: PatternKind::RegionalConcentration,
            participants: vec![key.to_string()],
            evidence: Evidence::RegionalConcentration {
                dominant_region: region,
                share: count as f64 / awards.len() as f64,
                detections_by_region: by_region,
                jurisdictions: graph.jurisdictions_of(key).into_iter().collect(),
            },
        });
    }
    out
}

/// One pattern per indirect-exposure edge.
pub fn subsidiary_linkage(graph: &EntityGraph) -> Vec<Pattern> {
    graph
        .indirect_exposures()
        .into_iter()
        .map(|exposure| {
            let awards = graph.awards_of(&exposure.entity);
            Pattern {
                kind: PatternKind::SubsidiaryLinkage,
                participants: vec![exposure.entity.clone(), exposure.parent_key.clone()],
                evidence: Evidence::SubsidiaryLinkage {
                    parent: exposure.parent_name,
                    parent_origin: exposure.parent_origin,
                    own_country_code: exposure.own_country_code,
                    detections: awards.len(),
                    total_value: awards.iter().filter_map(|a| a.value).sum(),
                    jurisdictions: graph.jurisdictions_of(&exposure.entity).into_iter().collect(),
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{classifier, detection};
    use tenderwatch_shared::Detection;

    const POOL: [&str; 10] = ["AT", "BE", "CZ", "DE", "DK", "ES", "FI", "FR", "IT", "NL"];

    fn spread(entity: &str, jurisdictions: &[&str]) -> Vec<Detection> {
        jurisdictions
            .iter()
            .map(|j| detection(&format!("{entity}-{j}"), entity, Some("CN"), j, Some(1_000.0), None))
            .collect()
    }

    fn series(entity: &str, values: &[f64]) -> Vec<Detection> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                detection(
                    &format!("{entity}-{i}"),
                    entity,
                    Some("CN"),
                    "DE",
                    Some(*v),
                    Some((2020 + i as i32, 1, 1)),
                )
            })
            .collect()
    }

    fn graph(dets: &[Detection]) -> EntityGraph {
        EntityGraph::build(dets, &classifier())
    }

    #[test]
    fn disjoint_footprints_are_flagged() {
        let mut dets = spread("Alpha Telecom", &POOL[..5]);
        dets.extend(spread("Beta Networks", &POOL[5..]));
        let patterns = market_division(&graph(&dets), &PatternParams::default());

        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].participants, vec!["ALPHA TELECOM", "BETA NETWORKS"]);
        let Evidence::MarketDivision { jurisdictions, .. } = &patterns[0].evidence else {
            panic!("wrong evidence");
        };
        assert_eq!(jurisdictions["ALPHA TELECOM"].len(), 5);
    }

    #[test]
    fn overlapping_footprints_are_not_flagged() {
        let mut dets = spread("Alpha Telecom", &POOL[..5]);
        dets.extend(spread("Beta Networks", &POOL[..5]));
        assert!(market_division(&graph(&dets), &PatternParams::default()).is_empty());
    }

    #[test]
    fn small_footprints_are_ignored() {
        let mut dets = spread("Alpha Telecom", &POOL[..2]);
        dets.extend(spread("Beta Networks", &POOL[5..7]));
        assert!(market_division(&graph(&dets), &PatternParams::default()).is_empty());
    }

    #[test]
    fn escalating_values_are_flagged() {
        let dets = series("Gamma Rail", &[100.0, 120.0, 110.0, 400.0, 500.0, 450.0]);
        let patterns = stepping_stones(&graph(&dets), &PatternParams::default());

        assert_eq!(patterns.len(), 1);
        let Evidence::SteppingStone {
            first_mean,
            last_mean,
            ..
        } = &patterns[0].evidence
        else {
            panic!("wrong evidence");
        };
        assert!((first_mean - 110.0).abs() < 1e-9);
        assert!((last_mean - 450.0).abs() < 1e-9);
    }

    #[test]
    fn flat_values_are_not_flagged() {
        let dets = series("Gamma Rail", &[100.0; 6]);
        assert!(stepping_stones(&graph(&dets), &PatternParams::default()).is_empty());
    }

    #[test]
    fn overlapping_windows_still_flag_escalation() {
        let dets = series("Gamma Rail", &[1.0, 1.0, 1.0, 10.0, 10.0]);
        let patterns = stepping_stones(&graph(&dets), &PatternParams::default());

        assert_eq!(patterns.len(), 1);
        let Evidence::SteppingStone {
            first_mean,
            last_mean,
            last_detection_ids,
            ..
        } = &patterns[0].evidence
        else {
            panic!("wrong evidence");
        };
        assert!((first_mean - 1.0).abs() < 1e-9);
        assert!((last_mean - 7.0).abs() < 1e-9);
        assert_eq!(last_detection_ids.len(), 3);
    }

    #[test]
    fn fewer_awards_than_window_are_not_flagged() {
        let dets = series("Gamma Rail", &[1.0, 900.0]);
        assert!(stepping_stones(&graph(&dets), &PatternParams::default()).is_empty());
    }

    #[test]
    fn zero_valued_opening_window_is_not_flagged() {
        let dets = series("Gamma Rail", &[0.0, 0.0, 0.0, 500.0, 600.0, 700.0]);
        assert!(stepping_stones(&graph(&dets), &PatternParams::default()).is_empty());
    }

    #[test]
    fn zero_values_count_toward_the_means() {
        let dets = series("Gamma Rail", &[0.0, 3.0, 3.0, 10.0, 10.0, 10.0]);
        let patterns = stepping_stones(&graph(&dets), &PatternParams::default());
        assert_eq!(patterns.len(), 1);
    }

    #[test]
    fn dominant_region_by_share() {
        let mut params = PatternParams::default();
        params.regions = BTreeMap::from([
            ("nordics".to_string(), vec!["DK".to_string(), "FI".to_string()]),
            ("western_europe".to_string(), vec!["FR".to_string()]),
        ]);
        let dets = spread("Delta Power", &["DK", "FI", "FR", "PL"]);
        let patterns = regional_concentration(&graph(&dets), &params);

        let Evidence::RegionalConcentration {
            dominant_region,
            share,
            detections_by_region,
            ..
        } = &patterns[0].evidence
        else {
            panic!("wrong evidence");
        };
        assert_eq!(dominant_region, "nordics");
        assert!((share - 0.5).abs() < 1e-9);
        assert_eq!(detections_by_region[UNGROUPED_REGION], 1);
    }

    #[test]
    fn detect_patterns_is_sorted_by_kind() {
        let mut dets = spread("Alpha Telecom", &POOL[..5]);
        dets.extend(spread("Beta Networks", &POOL[5..]));
        let patterns = detect_patterns(&graph(&dets), &PatternParams::default());
        assert_eq!(patterns[0].kind, PatternKind::MarketDivision);
        assert!(patterns[1..]
            .iter()
            .all(|p| p.kind == PatternKind::RegionalConcentration));
    }

    #[test]
    fn pattern_serializes_kind_and_evidence() {
        let dets = series("Gamma Rail", &[1.0, 1.0, 1.0, 9.0, 9.0, 9.0]);
        let patterns = stepping_stones(&graph(&dets), &PatternParams::default());
        let json = serde_json::to_value(&patterns[0]).unwrap();
        assert_eq!(json["kind"], "stepping_stone");
        assert_eq!(json["evidence"]["window"], 3);
    }
}
