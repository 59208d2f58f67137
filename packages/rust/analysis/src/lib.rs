//! Post-run analysis over the detection store.
//!
//! - [`EntityGraph`] — entity/jurisdiction/parent graph, rebuilt on every pass
//! - [`detect_patterns`] — market division, stepping-stone, regional
//!   concentration and subsidiary linkage candidates
//! - [`aggregate`] — per-jurisdiction, per-entity and per-sector rollups plus
//!   the comparative ranking

pub mod aggregate;
pub mod graph;
pub mod patterns;

pub use aggregate::{
    AggregateParams, Aggregates, EntityFootprint, EntityShare, JurisdictionSummary,
    RankedJurisdiction, SectorRollup, aggregate, severity_index,
};
pub use graph::{Award, EntityGraph, GraphEdge, GraphNode, IndirectExposure};
pub use patterns::{
    Evidence, Pattern, PatternKind, PatternParams, UNGROUPED_REGION, detect_patterns,
};
