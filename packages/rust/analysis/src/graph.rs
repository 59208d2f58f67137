//! Entity/jurisdiction graph rebuilt from the stored detections.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::debug;

use tenderwatch_classify::{Classifier, entity_key};
use tenderwatch_shared::{Detection, Origin, Party};

/// A node of the entity graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    Entity {
        key: String,
        name: String,
        origin: Origin,
    },
    Jurisdiction(String),
    Parent {
        key: String,
        name: String,
        origin: Origin,
    },
}

/// A directed edge of the entity graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEdge {
    /// Entity -> jurisdiction, one per detection.
    Award {
        detection_id: String,
        value: Option<f64>,
        date: Option<NaiveDate>,
    },
    /// Entity -> declared parent whose origin is tracked while the entity's
    /// own country code is not.
    IndirectExposure,
}

/// One award edge as seen from its entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Award {
    pub detection_id: String,
    pub jurisdiction: String,
    pub value: Option<f64>,
    pub date: Option<NaiveDate>,
}

/// An indirect-exposure edge with both endpoints resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct IndirectExposure {
    pub entity: String,
    pub parent_key: String,
    pub parent_name: String,
    pub parent_origin: Origin,
    pub own_country_code: Option<String>,
}

/// Directed graph of non-domestic parties, jurisdictions and declared
/// parents. Edges are weighted by award value.
pub struct EntityGraph {
    graph: DiGraph<GraphNode, GraphEdge>,
    entities: BTreeMap<String, NodeIndex>,
    jurisdictions: BTreeMap<String, NodeIndex>,
    parents: BTreeMap<String, NodeIndex>,
    own_codes: BTreeMap<String, Option<String>>,
}

impl EntityGraph {
    /// Build the graph from scratch. Declared parents are run through
    /// `classifier` on their own, without any country code.
    pub fn build(detections: &[Detection], classifier: &Classifier) -> Self {
        let mut graph = Self {
            graph: DiGraph::new(),
            entities: BTreeMap::new(),
            jurisdictions: BTreeMap::new(),
            parents: BTreeMap::new(),
            own_codes: BTreeMap::new(),
        };

        for detection in detections {
            let Some(party) = detection.party() else {
                continue;
            };
            let jurisdiction = detection.record.jurisdiction_label();
            // Domestic parties only enter the graph through a tracked parent.
            let exposure = tracked_parent(party, classifier);
            if exposure.is_none() && is_domestic(party.country_code.as_deref(), &jurisdiction) {
                continue;
            }

            let key = entity_key(&party.name);
            let entity = graph.entity_node(&key, &party.name, detection.classification.origin);
            graph
                .own_codes
                .entry(key.clone())
                .or_insert_with(|| party.country_code.clone());
            let target = graph.jurisdiction_node(&jurisdiction);
            graph.graph.add_edge(
                entity,
                target,
                GraphEdge::Award {
                    detection_id: detection.id.clone(),
                    value: detection.record.value,
                    date: detection.record.date,
                },
            );

            if let Some((parent, parent_origin)) = exposure {
                let parent_node = graph.parent_node(parent, parent_origin);
                if graph.graph.find_edge(entity, parent_node).is_none() {
                    graph
                        .graph
                        .add_edge(entity, parent_node, GraphEdge::IndirectExposure);
                }
            }
        }

        debug!(
            nodes = graph.graph.node_count(),
            edges = graph.graph.edge_count(),
            "entity graph built"
        );
        graph
    }

    fn entity_node(&mut self, key: &str, name: &str, origin: Origin) -> NodeIndex {
        if let Some(&idx) = self.entities.get(key) {
            // Keep the most severe origin seen for this entity.
            if let GraphNode::Entity { origin: current, .. } = &mut self.graph[idx] {
                if origin.severity() > current.severity() {
                    *current = origin;
                }
            }
            return idx;
        }
        let idx = self.graph.add_node(GraphNode::Entity {
            key: key.to_string(),
            name: name.trim().to_string(),
            origin,
        });
        self.entities.insert(key.to_string(), idx);
        idx
    }

    fn jurisdiction_node(&mut self, code: &str) -> NodeIndex {
        if let Some(&idx) = self.jurisdictions.get(code) {
            return idx;
        }
        let idx = self.graph.add_node(GraphNode::Jurisdiction(code.to_string()));
        self.jurisdictions.insert(code.to_string(), idx);
        idx
    }

    fn parent_node(&mut self, name: &str, origin: Origin) -> NodeIndex {
        let key = entity_key(name);
        if let Some(&idx) = self.parents.get(&key) {
            return idx;
        }
        let idx = self.graph.add_node(GraphNode::Parent {
            key: key.clone(),
            name: name.trim().to_string(),
            origin,
        });
        self.parents.insert(key, idx);
        idx
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Entity keys in sorted order.
    pub fn entity_keys(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Display name and origin of an entity.
    pub fn entity(&self, key: &str) -> Option<(&str, Origin)> {
        let idx = self.entities.get(key)?;
        match &self.graph[*idx] {
            GraphNode::Entity { name, origin, .. } => Some((name.as_str(), *origin)),
            _ => None,
        }
    }

    /// Distinct jurisdictions an entity has awards in.
    pub fn jurisdictions_of(&self, key: &str) -> BTreeSet<String> {
        self.awards_of(key)
            .into_iter()
            .map(|a| a.jurisdiction)
            .collect()
    }

    /// Award edges of an entity, ordered by date then detection id
    /// (undated awards last).
    pub fn awards_of(&self, key: &str) -> Vec<Award> {
        let Some(&idx) = self.entities.get(key) else {
            return Vec::new();
        };
        let mut awards: Vec<Award> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter_map(|edge| match (edge.weight(), &self.graph[edge.target()]) {
                (
                    GraphEdge::Award {
                        detection_id,
                        value,
                        date,
                    },
                    GraphNode::Jurisdiction(code),
                ) => Some(Award {
                    detection_id: detection_id.clone(),
                    jurisdiction: code.clone(),
                    value: *value,
                    date: *date,
                }),
                _ => None,
            })
            .collect();
        awards.sort_by(|a, b| {
            (a.date.is_none(), a.date, &a.detection_id).cmp(&(b.date.is_none(), b.date, &b.detection_id))
        });
        awards
    }

    /// Every indirect-exposure edge, ordered by entity then parent.
    pub fn indirect_exposures(&self) -> Vec<IndirectExposure> {
        let mut out = Vec::new();
        for (key, &idx) in &self.entities {
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                if !matches!(edge.weight(), GraphEdge::IndirectExposure) {
                    continue;
                }
                if let GraphNode::Parent {
                    key: parent_key,
                    name,
                    origin,
                } = &self.graph[edge.target()]
                {
                    out.push(IndirectExposure {
                        entity: key.clone(),
                        parent_key: parent_key.clone(),
                        parent_name: name.clone(),
                        parent_origin: *origin,
                        own_country_code: self.own_codes.get(key).cloned().flatten(),
                    });
                }
            }
        }
        out.sort_by(|a, b| (&a.entity, &a.parent_key).cmp(&(&b.entity, &b.parent_key)));
        out
    }

    /// Total award value flowing into a jurisdiction.
    pub fn inbound_value(&self, jurisdiction: &str) -> f64 {
        let Some(&idx) = self.jurisdictions.get(jurisdiction) else {
            return 0.0;
        };
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| match edge.weight() {
                GraphEdge::Award { value, .. } => value.unwrap_or(0.0),
                GraphEdge::IndirectExposure => 0.0,
            })
            .sum()
    }
}

/// Declared parent classified (without a code) to a tracked origin, for a
/// party whose own country code is not tracked.
fn tracked_parent<'a>(party: &'a Party, classifier: &Classifier) -> Option<(&'a str, Origin)> {
    let parent = party
        .parent_name
        .as_deref()
        .filter(|p| !p.trim().is_empty())?;
    let own_tracked = party
        .country_code
        .as_deref()
        .and_then(Origin::from_country_code)
        .is_some();
    if own_tracked {
        return None;
    }
    let origin = classifier.classify(parent, None, None, None).origin;
    origin.is_tracked().then_some((parent, origin))
}

/// A party whose declared country is the authority's own jurisdiction.
fn is_domestic(country_code: Option<&str>, jurisdiction: &str) -> bool {
    country_code.is_some_and(|c| c.trim().eq_ignore_ascii_case(jurisdiction))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tenderwatch_shared::{
        ClassifyConfig, Classification, Confidence, Party, PartyRole, Record, RiskAssessment,
        RiskLevel, VerificationLocator,
    };

    pub(crate) fn classifier() -> Classifier {
        Classifier::new(&ClassifyConfig::default()).unwrap()
    }

    /// A single-party detection for graph and pattern tests.
    pub(crate) fn detection(
        record_id: &str,
        party: &str,
        code: Option<&str>,
        jurisdiction: &str,
        value: Option<f64>,
        date: Option<(i32, u32, u32)>,
    ) -> Detection {
        let record = Record {
            record_id: record_id.into(),
            authority_name: Some("Authority".into()),
            authority_jurisdiction: Some(jurisdiction.into()),
            parties: vec![Party {
                name: party.into(),
                country_code: code.map(str::to_string),
                parent_name: None,
                role: PartyRole::Prime,
            }],
            value,
            currency: value.map(|_| "EUR".to_string()),
            date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            sectors: Vec::new(),
            tags: Vec::new(),
            description: None,
            member_path: format!("a.tar!/{record_id}.xml"),
        };
        let origin = code
            .and_then(Origin::from_country_code)
            .unwrap_or(Origin::Unknown);
        Detection {
            id: Detection::stable_id(record_id, 0),
            archive_id: "a.tar".into(),
            record,
            party_index: 0,
            classification: Classification {
                origin,
                confidence: Confidence::High,
                rationale: String::new(),
                warnings: Vec::new(),
                verification_required: false,
                rule_id: None,
                ambiguous: false,
            },
            risk: RiskAssessment {
                level: RiskLevel::Medium,
                factors: Vec::new(),
            },
            goods_origin: None,
            locator: VerificationLocator {
                archive_path: "/data/a.tar".into(),
                member_path: format!("a.tar!/{record_id}.xml"),
                fragment: party.into(),
            },
        }
    }

    #[test]
    fn builds_entity_and_jurisdiction_nodes() {
        let dets = vec![
            detection("R1", "Acme Telecom Co., Ltd.", Some("CN"), "DE", Some(10.0), None),
            detection("R2", "ACME TELECOM CO LTD", Some("CN"), "FR", Some(5.0), None),
        ];
        let graph = EntityGraph::build(&dets, &classifier());
        assert_eq!(graph.entity_keys().collect::<Vec<_>>(), vec!["ACME TELECOM"]);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        let juris: Vec<String> = graph.jurisdictions_of("ACME TELECOM").into_iter().collect();
        assert_eq!(juris, vec!["DE", "FR"]);
        assert_eq!(graph.inbound_value("DE"), 10.0);
    }

    #[test]
    fn domestic_parties_are_left_out() {
        let dets = vec![detection("R1", "Local Builder GmbH", Some("DE"), "DE", Some(1.0), None)];
        let graph = EntityGraph::build(&dets, &classifier());
        assert_eq!(graph.entity_keys().count(), 0);
    }

    #[test]
    fn tracked_parent_adds_indirect_exposure() {
        let mut det = detection("R1", "Nordic Networks AB", Some("SE"), "NO", Some(1.0), None);
        det.record.parties[0].parent_name = Some("Huawei Technologies Co., Ltd.".into());
        let graph = EntityGraph::build(&[det], &classifier());

        let exposures = graph.indirect_exposures();
        assert_eq!(exposures.len(), 1);
        assert_eq!(exposures[0].entity, "NORDIC NETWORKS");
        assert_eq!(exposures[0].parent_origin, Origin::Prc);
        assert_eq!(exposures[0].own_country_code.as_deref(), Some("SE"));
    }

    #[test]
    fn domestic_subsidiary_of_tracked_parent_is_linked() {
        let mut det = detection("R1", "Nordic Networks AB", Some("NO"), "NO", Some(1.0), None);
        det.record.parties[0].parent_name = Some("Huawei Technologies Co., Ltd.".into());
        let graph = EntityGraph::build(&[det], &classifier());

        assert_eq!(graph.entity_keys().collect::<Vec<_>>(), vec!["NORDIC NETWORKS"]);
        let exposures = graph.indirect_exposures();
        assert_eq!(exposures.len(), 1);
        assert_eq!(exposures[0].parent_origin, Origin::Prc);
        assert_eq!(exposures[0].own_country_code.as_deref(), Some("NO"));
    }

    #[test]
    fn own_tracked_code_suppresses_indirect_exposure() {
        let mut det = detection("R1", "Huawei Europe", Some("CN"), "NO", Some(1.0), None);
        det.record.parties[0].parent_name = Some("Huawei Technologies Co., Ltd.".into());
        let graph = EntityGraph::build(&[det], &classifier());
        assert!(graph.indirect_exposures().is_empty());
    }

    #[test]
    fn awards_sorted_by_date_with_undated_last() {
        let dets = vec![
            detection("R3", "Acme", Some("CN"), "DE", Some(3.0), None),
            detection("R2", "Acme", Some("CN"), "DE", Some(2.0), Some((2024, 2, 1))),
            detection("R1", "Acme", Some("CN"), "DE", Some(1.0), Some((2023, 1, 1))),
        ];
        let graph = EntityGraph::build(&dets, &classifier());
        let ids: Vec<String> = graph
            .awards_of("ACME")
            .into_iter()
            .map(|a| a.detection_id)
            .collect();
        assert_eq!(ids, vec!["R1#0", "R2#0", "R3#0"]);
    }
}
