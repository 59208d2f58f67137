//! Core orchestration for tenderwatch.
//!
//! This crate ties archive walking, extraction, classification and storage
//! into the `run` pipeline, owns the checkpoint, and writes the report tree
//! produced by `analyze`.

pub mod checkpoint;
pub mod pipeline;
pub mod report;

pub use checkpoint::{CheckpointManager, CheckpointState, JurisdictionAccumulator};
pub use pipeline::{
    CancelFlag, Pipeline, ProgressReporter, RunError, RunReport, SilentProgress, run_directory,
};
pub use report::{AnalysisSummary, run_analysis, slug, write_reports, write_run_report};
