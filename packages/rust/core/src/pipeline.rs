//! End-to-end `run` pipeline: discover → walk → extract → classify → score →
//! persist → commit.
//!
//! Archives are processed by a bounded worker pool. Walking and parsing run
//! on the blocking pool; the per-archive store transaction and the checkpoint
//! commit are the only serialized steps.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use tenderwatch_archive::{AdapterRegistry, ArchiveReader, ArchiveRef, WalkItem, discover_archives};
use tenderwatch_classify::{Classifier, RiskScorer, goods_origin_signal};
use tenderwatch_extract::{RecordExtractor, RecordShape};
use tenderwatch_shared::{
    AppConfig, Classification, Detection, ErrorCategory, Record, Result, RunConfig,
    TenderwatchError, VerificationLocator,
};
use tenderwatch_storage::{ArchiveLedger, JurisdictionTotal, RecordEntry, Storage};

use crate::checkpoint::{CheckpointManager, JurisdictionAccumulator};

// ---------------------------------------------------------------------------
// Cancellation / progress
// ---------------------------------------------------------------------------

/// Graceful stop signal. Once set, no new archives are dispatched; archives
/// already in flight finish, persist and commit.
#[derive(Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once discovery knows how many archives there are.
    fn archives_found(&self, total: usize);
    /// Called after each archive finishes (processed, skipped or failed).
    fn archive_done(&self, archive_id: &str, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn archives_found(&self, _total: usize) {}
    fn archive_done(&self, _archive_id: &str, _current: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// One per-member or per-archive problem, with enough context to reproduce.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub category: ErrorCategory,
    pub archive: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    pub message: String,
}

/// End-of-run summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub archives_seen: usize,
    pub archives_skipped: usize,
    pub archives_processed: usize,
    pub archives_failed: usize,
    pub members_read: u64,
    pub malformed_members: u64,
    pub records_parsed: u64,
    pub detections_produced: u64,
    pub errors_by_category: BTreeMap<String, usize>,
    pub errors: Vec<RunError>,
    pub checkpoint_commits: usize,
    pub checkpoint_commit_failures: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunReport {
    fn record_error(&mut self, error: RunError) {
        *self
            .errors_by_category
            .entry(error.category.to_string())
            .or_default() += 1;
        self.errors.push(error);
    }

    fn merge(&mut self, result: ArchiveResult) {
        self.members_read += result.members;
        self.malformed_members += result.malformed;
        self.records_parsed += result.records;
        match result.status {
            ArchiveStatus::Processed { committed } => {
                self.archives_processed += 1;
                self.detections_produced += result.detections;
                if committed {
                    self.checkpoint_commits += 1;
                } else {
                    self.checkpoint_commit_failures += 1;
                }
            }
            ArchiveStatus::Failed => self.archives_failed += 1,
        }
        for error in result.errors {
            self.record_error(error);
        }
    }

    /// Total errors in the given category.
    pub fn count(&self, category: ErrorCategory) -> usize {
        self.errors_by_category
            .get(&category.to_string())
            .copied()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Everything a worker needs, shared across tasks.
#[derive(Clone)]
struct Stages {
    reader: ArchiveReader,
    extractor: Arc<RecordExtractor>,
    classifier: Arc<Classifier>,
    scorer: Arc<RiskScorer>,
}

/// The ingest pipeline, built once from the app config.
pub struct Pipeline {
    run: RunConfig,
    registry: Arc<AdapterRegistry>,
    stages: Stages,
}

impl Pipeline {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let run = RunConfig::from(config);
        let registry = Arc::new(AdapterRegistry::new());
        let stages = Stages {
            reader: ArchiveReader::new(Arc::clone(&registry), &run.archive),
            extractor: Arc::new(RecordExtractor::new(&run.extract)?),
            classifier: Arc::new(Classifier::new(&config.classify)?),
            scorer: Arc::new(RiskScorer::new(&config.risk)),
        };
        Ok(Self {
            run,
            registry,
            stages,
        })
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    pub fn classifier(&self) -> &Classifier {
        &self.stages.classifier
    }

    /// Process every archive under the input root that the checkpoint has
    /// not seen yet.
    #[instrument(skip_all, fields(input = %self.run.input_dir.display(), workers = self.run.workers))]
    pub async fn run(
        &self,
        storage: Arc<Storage>,
        checkpoint: Arc<CheckpointManager>,
        cancel: &CancelFlag,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let mut report = RunReport::default();

        progress.phase("Discovering archives");
        let archives = discover_archives(
            &self.run.input_dir,
            &self.registry,
            &self.run.archive.ignore_suffixes,
        )?;
        let total = archives.len();
        report.archives_seen = total;
        progress.archives_found(total);
        info!(archives = total, "archives discovered");

        progress.phase("Processing archives");
        let semaphore = Arc::new(Semaphore::new(self.run.workers.max(1)));
        let mut tasks: JoinSet<ArchiveResult> = JoinSet::new();
        let mut finished = 0usize;

        for archive in archives {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if checkpoint.is_processed(&archive.id).await {
                debug!(archive = %archive.id, "already processed, skipping");
                report.archives_skipped += 1;
                finished += 1;
                progress.archive_done(&archive.id, finished, total);
                continue;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|e| TenderwatchError::validation(format!("worker pool closed: {e}")))?,
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
            };

            let stages = self.stages.clone();
            let storage = Arc::clone(&storage);
            let checkpoint = Arc::clone(&checkpoint);
            tasks.spawn(async move {
                let _permit = permit;
                process_and_persist(stages, archive, &storage, &checkpoint).await
            });

            while let Some(joined) = tasks.try_join_next() {
                finished += 1;
                merge_joined(&mut report, joined, progress, finished, total);
            }
        }

        // In-flight archives always finish, persist and commit.
        while let Some(joined) = tasks.join_next().await {
            finished += 1;
            merge_joined(&mut report, joined, progress, finished, total);
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            processed = report.archives_processed,
            skipped = report.archives_skipped,
            failed = report.archives_failed,
            records = report.records_parsed,
            detections = report.detections_produced,
            cancelled = report.cancelled,
            "run complete"
        );
        progress.done(&report);
        Ok(report)
    }
}

fn merge_joined(
    report: &mut RunReport,
    joined: std::result::Result<ArchiveResult, tokio::task::JoinError>,
    progress: &dyn ProgressReporter,
    finished: usize,
    total: usize,
) {
    match joined {
        Ok(result) => {
            progress.archive_done(&result.archive_id, finished, total);
            report.merge(result);
        }
        Err(e) => {
            warn!(error = %e, "archive task aborted");
            report.archives_failed += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Per-archive work
// ---------------------------------------------------------------------------

enum ArchiveStatus {
    Processed { committed: bool },
    Failed,
}

struct ArchiveResult {
    archive_id: String,
    status: ArchiveStatus,
    members: u64,
    malformed: u64,
    records: u64,
    detections: u64,
    errors: Vec<RunError>,
}

/// Output of walking and classifying one archive, before persistence.
struct ArchiveOutcome {
    detections: Vec<Detection>,
    ledger: ArchiveLedger,
    records: Vec<RecordEntry>,
    totals: Vec<JurisdictionTotal>,
    accumulators: BTreeMap<String, JurisdictionAccumulator>,
    errors: Vec<RunError>,
    unreadable: bool,
}

#[instrument(skip_all, fields(archive = %archive.id))]
async fn process_and_persist(
    stages: Stages,
    archive: ArchiveRef,
    storage: &Storage,
    checkpoint: &CheckpointManager,
) -> ArchiveResult {
    let archive_id = archive.id.clone();
    let walked = tokio::task::spawn_blocking(move || stages.process(&archive)).await;

    let outcome = match walked {
        Ok(outcome) => outcome,
        Err(e) => {
            return ArchiveResult {
                archive_id: archive_id.clone(),
                status: ArchiveStatus::Failed,
                members: 0,
                malformed: 0,
                records: 0,
                detections: 0,
                errors: vec![RunError {
                    category: ErrorCategory::ArchiveUnreadable,
                    archive: archive_id,
                    member: None,
                    message: format!("worker failed: {e}"),
                }],
            };
        }
    };

    let mut result = ArchiveResult {
        archive_id: archive_id.clone(),
        status: ArchiveStatus::Failed,
        members: outcome.ledger.members,
        malformed: outcome.ledger.malformed,
        records: outcome.ledger.records,
        detections: outcome.detections.len() as u64,
        errors: outcome.errors,
    };

    // Unreadable archives are neither persisted nor committed; they are
    // retried in full next run.
    if outcome.unreadable {
        return result;
    }

    if let Err(e) = storage
        .replace_archive_detections(
            &outcome.ledger,
            &outcome.detections,
            &outcome.records,
            &outcome.totals,
        )
        .await
    {
        warn!(error = %e, "detection store write failed, archive stays unprocessed");
        result.errors.push(RunError {
            category: ErrorCategory::DetectionStoreWriteFailure,
            archive: archive_id,
            member: None,
            message: e.to_string(),
        });
        return result;
    }

    let committed = match checkpoint.commit(&archive_id, &outcome.accumulators).await {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "checkpoint commit failed, archive will be reprocessed");
            false
        }
    };
    result.status = ArchiveStatus::Processed { committed };
    result
}

impl Stages {
    /// Walk, extract, classify and score one archive. Never fails: problems
    /// are collected as [`RunError`]s.
    fn process(&self, archive: &ArchiveRef) -> ArchiveOutcome {
        let mut outcome = ArchiveOutcome {
            detections: Vec::new(),
            ledger: ArchiveLedger {
                archive_id: archive.id.clone(),
                path: archive.path.display().to_string(),
                members: 0,
                malformed: 0,
                records: 0,
                detections: 0,
                total_value: 0.0,
            },
            records: Vec::new(),
            totals: Vec::new(),
            accumulators: BTreeMap::new(),
            errors: Vec::new(),
            unreadable: false,
        };
        let mut totals: BTreeMap<String, JurisdictionTotal> = BTreeMap::new();
        let mut records_by_id: BTreeMap<String, RecordEntry> = BTreeMap::new();
        let mut seen_ids = BTreeSet::new();

        let walk = match self.reader.open(&archive.path) {
            Ok(walk) => walk,
            Err(e) => {
                warn!(archive = %archive.id, error = %e, "archive unreadable");
                outcome.unreadable = true;
                outcome.errors.push(RunError {
                    category: ErrorCategory::ArchiveUnreadable,
                    archive: archive.id.clone(),
                    member: None,
                    message: e.to_string(),
                });
                return outcome;
            }
        };

        for item in walk {
            match item {
                Ok(WalkItem::Member(member)) => {
                    outcome.ledger.members += 1;
                    if self.extractor.shape_of(&member.bytes, &member.qualified_path)
                        == RecordShape::Unsupported
                    {
                        continue;
                    }
                    let records = self
                        .extractor
                        .parse_all(&member.bytes, &member.qualified_path);
                    if records.is_empty() {
                        warn!(member = %member.qualified_path, "no record extracted");
                        outcome.ledger.malformed += 1;
                        outcome.errors.push(RunError {
                            category: ErrorCategory::MemberCorrupt,
                            archive: archive.id.clone(),
                            member: Some(member.qualified_path.clone()),
                            message: "no record could be extracted".into(),
                        });
                        continue;
                    }

                    for record in records {
                        outcome.ledger.records += 1;
                        let jurisdiction = record.jurisdiction_label();
                        let total = totals.entry(jurisdiction.clone()).or_insert_with(|| {
                            JurisdictionTotal {
                                jurisdiction: jurisdiction.clone(),
                                records: 0,
                                total_value: 0.0,
                            }
                        });
                        total.records += 1;
                        total.total_value += record.value.unwrap_or(0.0);
                        outcome.ledger.total_value += record.value.unwrap_or(0.0);
                        outcome
                            .accumulators
                            .entry(jurisdiction.clone())
                            .or_default()
                            .records += 1;
                        records_by_id.insert(
                            record.record_id.clone(),
                            RecordEntry {
                                record_id: record.record_id.clone(),
                                jurisdiction: jurisdiction.clone(),
                                value: record.value.unwrap_or(0.0),
                            },
                        );

                        for detection in self.detect(archive, record, &mut outcome.errors) {
                            if !seen_ids.insert(detection.id.clone()) {
                                debug!(id = %detection.id, "duplicate detection id in archive");
                                continue;
                            }
                            outcome
                                .accumulators
                                .entry(jurisdiction.clone())
                                .or_default()
                                .detections += 1;
                            outcome.detections.push(detection);
                        }
                    }
                }
                Ok(WalkItem::Corrupt(corrupt)) => {
                    warn!(member = %corrupt.qualified_path, reason = %corrupt.reason, "member corrupt, skipping");
                    outcome.ledger.members += 1;
                    outcome.ledger.malformed += 1;
                    outcome.errors.push(RunError {
                        category: ErrorCategory::MemberCorrupt,
                        archive: archive.id.clone(),
                        member: Some(corrupt.qualified_path),
                        message: corrupt.reason,
                    });
                }
                Err(e) => {
                    warn!(archive = %archive.id, error = %e, "archive stream broke");
                    outcome.unreadable = true;
                    outcome.errors.push(RunError {
                        category: ErrorCategory::ArchiveUnreadable,
                        archive: archive.id.clone(),
                        member: None,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        outcome.ledger.detections = outcome.detections.len() as u64;
        outcome.records = records_by_id.into_values().collect();
        outcome.totals = totals.into_values().collect();
        debug!(
            archive = %archive.id,
            members = outcome.ledger.members,
            records = outcome.ledger.records,
            detections = outcome.ledger.detections,
            "archive walked"
        );
        outcome
    }

    /// Classify every party on a record and keep the reportable ones.
    fn detect(&self, archive: &ArchiveRef, record: Record, errors: &mut Vec<RunError>) -> Vec<Detection> {
        let classifications: Vec<Classification> = record
            .parties
            .iter()
            .map(|party| {
                self.classifier.classify(
                    &party.name,
                    party.country_code.as_deref(),
                    party.parent_name.as_deref(),
                    record.value,
                )
            })
            .collect();
        let risk = self.scorer.score(&record, &classifications);
        let goods_origin = record.description.as_deref().and_then(goods_origin_signal);

        let mut detections = Vec::new();
        for (index, classification) in classifications.into_iter().enumerate() {
            let party = &record.parties[index];
            if classification.ambiguous {
                errors.push(RunError {
                    category: ErrorCategory::ClassificationAmbiguous,
                    archive: archive.id.clone(),
                    member: Some(record.member_path.clone()),
                    message: format!("{}: {}", party.name, classification.warnings.join("; ")),
                });
            }
            if !self.is_reportable(&classification, party.parent_name.as_deref()) {
                continue;
            }
            detections.push(Detection {
                id: Detection::stable_id(&record.record_id, index),
                archive_id: archive.id.clone(),
                record: record.clone(),
                party_index: index,
                classification,
                risk: risk.clone(),
                goods_origin: goods_origin.clone(),
                locator: VerificationLocator {
                    archive_path: archive.path.display().to_string(),
                    member_path: record.member_path.clone(),
                    fragment: party.name.clone(),
                },
            });
        }
        detections
    }

    /// Tracked origin, any warning, or a declared parent with a tracked origin.
    fn is_reportable(&self, classification: &Classification, parent: Option<&str>) -> bool {
        classification.origin.is_tracked()
            || !classification.warnings.is_empty()
            || parent.is_some_and(|p| {
                self.classifier
                    .classify(p, None, None, None)
                    .origin
                    .is_tracked()
            })
    }
}

/// Pipeline over an explicit input directory, for tests and one-off runs.
pub async fn run_directory(
    config: &AppConfig,
    input_dir: &Path,
    storage: Arc<Storage>,
    checkpoint: Arc<CheckpointManager>,
) -> Result<RunReport> {
    let mut config = config.clone();
    config.defaults.input_dir = input_dir.display().to_string();
    let pipeline = Pipeline::new(&config)?;
    pipeline
        .run(storage, checkpoint, &CancelFlag::new(), &SilentProgress)
        .await
}
