//! Report tree writer and the `analyze` entry point.
//!
//! Output layout under the report directory:
//!
//! ```text
//! jurisdictions/<CODE>.{json,md}
//! entities/<slug>.{json,md}
//! sectors/<tag>.{json,md}
//! patterns.json
//! comparative_analysis.{json,md}
//! verification/locators.jsonl
//! ```
//!
//! Every file is written atomically (temp file, then rename), contents are
//! sorted, and nothing carries a timestamp, so the same store always yields
//! byte-identical output.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, instrument};

use tenderwatch_analysis::{
    AggregateParams, Aggregates, EntityFootprint, EntityGraph, JurisdictionSummary, Pattern,
    PatternParams, SectorRollup, aggregate, detect_patterns,
};
use tenderwatch_classify::Classifier;
use tenderwatch_shared::{
    AppConfig, CURRENT_SCHEMA_VERSION, Confidence, Detection, Origin, Result, RiskLevel,
    TenderwatchError,
};
use tenderwatch_storage::Storage;

use crate::pipeline::RunReport;

/// Subdirectories owned by the writer; cleared before each write.
const OWNED_DIRS: [&str; 4] = ["jurisdictions", "entities", "sectors", "verification"];

/// What an analysis pass produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub detections: usize,
    pub jurisdictions: usize,
    pub entities: usize,
    pub sectors: usize,
    pub patterns: usize,
    pub files_written: usize,
}

/// Rebuild the graph, mine patterns, aggregate and write the report tree,
/// reading only the detection store.
#[instrument(skip_all, fields(out = %out_dir.display()))]
pub async fn run_analysis(
    config: &AppConfig,
    storage: &Storage,
    classifier: &Classifier,
    out_dir: &Path,
) -> Result<AnalysisSummary> {
    let detections = storage.list_detections().await?;
    let record_totals: BTreeMap<String, u64> = storage
        .jurisdiction_totals()
        .await?
        .into_iter()
        .map(|t| (t.jurisdiction, t.records))
        .collect();

    let graph = EntityGraph::build(&detections, classifier);
    let patterns = detect_patterns(&graph, &PatternParams::from(&config.patterns));
    let params = AggregateParams::from(&config.report);
    let aggregates = aggregate(&detections, &record_totals, &params);

    let files_written = write_reports(out_dir, &aggregates, &patterns, &detections, &params)?;

    let summary = AnalysisSummary {
        detections: detections.len(),
        jurisdictions: aggregates.jurisdictions.len(),
        entities: aggregates.entities.len(),
        sectors: aggregates.sectors.len(),
        patterns: patterns.len(),
        files_written,
    };
    info!(
        detections = summary.detections,
        patterns = summary.patterns,
        files = summary.files_written,
        "analysis complete"
    );
    Ok(summary)
}

/// Write the full report tree. Returns the number of files written.
pub fn write_reports(
    out_dir: &Path,
    aggregates: &Aggregates,
    patterns: &[Pattern],
    detections: &[Detection],
    params: &AggregateParams,
) -> Result<usize> {
    for dir in OWNED_DIRS {
        let path = out_dir.join(dir);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| TenderwatchError::io(&path, e))?;
        }
        std::fs::create_dir_all(&path).map_err(|e| TenderwatchError::io(&path, e))?;
    }

    let mut written = 0;

    for summary in &aggregates.jurisdictions {
        let stem = file_stem(&summary.jurisdiction, "unknown");
        let base = out_dir.join("jurisdictions").join(&stem);
        write_json(&base.with_extension("json"), summary)?;
        write_atomic(&base.with_extension("md"), &jurisdiction_markdown(summary))?;
        written += 2;
    }

    for entity in &aggregates.entities {
        let base = out_dir.join("entities").join(slug(&entity.key));
        write_json(&base.with_extension("json"), entity)?;
        write_atomic(&base.with_extension("md"), &entity_markdown(entity, patterns))?;
        written += 2;
    }

    for sector in &aggregates.sectors {
        let base = out_dir.join("sectors").join(file_stem(&sector.tag, "untagged"));
        write_json(&base.with_extension("json"), sector)?;
        write_atomic(&base.with_extension("md"), &sector_markdown(sector))?;
        written += 2;
    }

    write_json(&out_dir.join("patterns.json"), &PatternsDocument::new(patterns))?;
    written += 1;

    let comparative = ComparativeDocument::new(aggregates, params);
    write_json(&out_dir.join("comparative_analysis.json"), &comparative)?;
    write_atomic(
        &out_dir.join("comparative_analysis.md"),
        &comparative_markdown(&comparative),
    )?;
    written += 2;

    write_atomic(
        &out_dir.join("verification").join("locators.jsonl"),
        &locators_jsonl(detections)?,
    )?;
    written += 1;

    debug!(files = written, "report tree written");
    Ok(written)
}

/// Persist the end-of-run report next to the report tree.
pub fn write_run_report(path: &Path, report: &RunReport) -> Result<()> {
    write_json(path, report)
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PatternsDocument<'a> {
    schema_version: u32,
    counts: BTreeMap<String, usize>,
    patterns: &'a [Pattern],
}

impl<'a> PatternsDocument<'a> {
    fn new(patterns: &'a [Pattern]) -> Self {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for p in patterns {
            *counts.entry(p.kind.as_str().to_string()).or_default() += 1;
        }
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            counts,
            patterns,
        }
    }
}

#[derive(Serialize)]
struct RankingWeights {
    penetration: f64,
    severity: f64,
}

#[derive(Serialize)]
struct ComparativeDocument<'a> {
    schema_version: u32,
    weights: RankingWeights,
    total_detections: usize,
    total_records: u64,
    ranking: &'a [tenderwatch_analysis::RankedJurisdiction],
}

impl<'a> ComparativeDocument<'a> {
    fn new(aggregates: &'a Aggregates, params: &AggregateParams) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            weights: RankingWeights {
                penetration: params.penetration_weight,
                severity: params.severity_weight,
            },
            total_detections: aggregates.total_detections,
            total_records: aggregates.total_records,
            ranking: &aggregates.ranking,
        }
    }
}

#[derive(Serialize)]
struct LocatorLine<'a> {
    detection_id: &'a str,
    archive_id: &'a str,
    archive_path: &'a str,
    member_path: &'a str,
    fragment: &'a str,
    origin: Origin,
    confidence: Confidence,
    risk_level: RiskLevel,
    verification_required: bool,
}

fn locators_jsonl(detections: &[Detection]) -> Result<String> {
    let mut sorted: Vec<&Detection> = detections.iter().collect();
    sorted.sort_by(|a, b| (&a.archive_id, &a.id).cmp(&(&b.archive_id, &b.id)));

    let mut out = String::new();
    for d in sorted {
        let line = LocatorLine {
            detection_id: &d.id,
            archive_id: &d.archive_id,
            archive_path: &d.locator.archive_path,
            member_path: &d.locator.member_path,
            fragment: &d.locator.fragment,
            origin: d.classification.origin,
            confidence: d.classification.confidence,
            risk_level: d.risk.level,
            verification_required: d.classification.verification_required,
        };
        let json = serde_json::to_string(&line)
            .map_err(|e| TenderwatchError::validation(format!("locator serialization: {e}")))?;
        out.push_str(&json);
        out.push('\n');
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

fn jurisdiction_markdown(s: &JurisdictionSummary) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Jurisdiction {}\n", s.jurisdiction);
    let _ = writeln!(md, "- Detections: {}", s.detections);
    let _ = writeln!(md, "- Flagged records: {} of {}", s.flagged_records, s.total_records);
    let _ = writeln!(md, "- Penetration: {:.4}", s.penetration);
    let _ = writeln!(md, "- Severity index: {:.4}", s.severity);
    let _ = writeln!(md, "- Composite score: {:.4}\n", s.score);

    md.push_str("## Value by currency\n\n");
    push_values(&mut md, &s.value_by_currency);

    md.push_str("\n## Risk levels\n\n| Level | Detections |\n|---|---|\n");
    for (level, count) in &s.risk_histogram {
        let _ = writeln!(md, "| {level} | {count} |");
    }

    md.push_str("\n## Origins\n\n| Origin | Detections |\n|---|---|\n");
    for (origin, count) in &s.origin_histogram {
        let _ = writeln!(md, "| {origin} | {count} |");
    }

    md.push_str("\n## Top entities\n\n| Entity | Detections | Value |\n|---|---|---|\n");
    for e in &s.top_entities {
        let _ = writeln!(md, "| {} | {} | {:.2} |", e.name, e.detections, e.total_value);
    }
    md
}

fn entity_markdown(e: &EntityFootprint, patterns: &[Pattern]) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# {}\n", e.name);
    let _ = writeln!(md, "- Key: `{}`", e.key);
    let origins: Vec<&str> = e.origins.iter().map(|o| o.as_str()).collect();
    let _ = writeln!(md, "- Origins: {}", origins.join(", "));
    let _ = writeln!(md, "- Detections: {}", e.detections);
    let _ = writeln!(md, "- Highest risk: {}", e.highest_risk);
    let _ = writeln!(md, "- Verification required: {}", e.verification_required);
    let _ = writeln!(md, "- Jurisdictions: {}", e.jurisdictions.join(", "));
    if !e.sectors.is_empty() {
        let _ = writeln!(md, "- Sectors: {}", e.sectors.join(", "));
    }

    md.push_str("\n## Value by currency\n\n");
    push_values(&mut md, &e.value_by_currency);

    let related: Vec<&Pattern> = patterns
        .iter()
        .filter(|p| p.participants.iter().any(|k| k == &e.key))
        .collect();
    if !related.is_empty() {
        md.push_str("\n## Candidate patterns\n\n");
        for p in related {
            let _ = writeln!(md, "- {}: {}", p.kind.as_str(), p.participants.join(" / "));
        }
    }
    md.push_str("\nCandidates for analyst review only.\n");
    md
}

fn sector_markdown(s: &SectorRollup) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Sector {}\n", s.tag);
    let _ = writeln!(md, "- Detections: {}", s.detections);
    let _ = writeln!(md, "- Jurisdictions: {}\n", s.jurisdictions.join(", "));
    md.push_str("## Value by currency\n\n");
    push_values(&mut md, &s.value_by_currency);
    md.push_str("\n## Top entities\n\n| Entity | Detections | Value |\n|---|---|---|\n");
    for e in &s.top_entities {
        let _ = writeln!(md, "| {} | {} | {:.2} |", e.name, e.detections, e.total_value);
    }
    md
}

fn comparative_markdown(doc: &ComparativeDocument<'_>) -> String {
    let mut md = String::new();
    md.push_str("# Comparative jurisdiction analysis\n\n");
    let _ = writeln!(
        md,
        "Score = {:.2} x penetration + {:.2} x severity. {} detections over {} records.\n",
        doc.weights.penetration, doc.weights.severity, doc.total_detections, doc.total_records
    );
    md.push_str("| Rank | Jurisdiction | Score | Penetration | Severity | Detections |\n");
    md.push_str("|---|---|---|---|---|---|\n");
    for r in doc.ranking {
        let _ = writeln!(
            md,
            "| {} | {} | {:.4} | {:.4} | {:.4} | {} |",
            r.rank, r.jurisdiction, r.score, r.penetration, r.severity, r.detections
        );
    }
    md
}

fn push_values(md: &mut String, values: &BTreeMap<String, f64>) {
    if values.is_empty() {
        md.push_str("_none_\n");
        return;
    }
    for (currency, value) in values {
        let _ = writeln!(md, "- {currency}: {value:.2}");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lower-case, alphanumerics kept, everything else collapsed to `-`.
pub fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut dash = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() { "entity".to_string() } else { out }
}

/// Safe file stem that keeps the original case (jurisdiction codes).
fn file_stem(text: &str, fallback: &str) -> String {
    let stem: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() { fallback.to_string() } else { stem }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(value)
        .map_err(|e| TenderwatchError::validation(format!("report serialization: {e}")))?;
    json.push('\n');
    write_atomic(path, &json)
}

/// Write to a hidden temp file next to `path`, then rename over it.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).map_err(|e| TenderwatchError::io(&dir, e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{name}.tmp"));
    std::fs::write(&temp, content).map_err(|e| TenderwatchError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| TenderwatchError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::pipeline::run_directory;
    use crate::pipeline::tests::{notice, open_state, temp_dir, write_archive};

    fn read_tree(root: &Path) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    let rel = path.strip_prefix(root).unwrap().display().to_string();
                    files.insert(rel, std::fs::read_to_string(&path).unwrap());
                }
            }
        }
        files
    }

    #[test]
    fn slugs() {
        assert_eq!(slug("HUAWEI TECHNOLOGIES"), "huawei-technologies");
        assert_eq!(slug("  A&B -- C  "), "a-b-c");
        assert_eq!(slug("!!!"), "entity");
        assert_eq!(file_stem("DE", "unknown"), "DE");
        assert_eq!(file_stem("a/b", "x"), "a_b");
    }

    #[tokio::test]
    async fn analysis_writes_a_deterministic_tree() {
        let dir = temp_dir();
        let input = dir.join("input");
        std::fs::create_dir_all(&input).unwrap();
        write_archive(
            &input.join("batch.tar.gz"),
            &[
                ("n1.xml", notice("N-1", "DE", "Shenzhen Netcom Co., Ltd.", "CN", "50000000", "32500000")),
                ("n2.xml", notice("N-2", "FR", "Shenzhen Netcom Co., Ltd.", "CN", "1000", "32500000")),
                ("n3.xml", notice("N-3", "FR", "Local Works SARL", "FR", "500", "45000000")),
            ],
        );
        let (storage, checkpoint) = open_state(&dir).await;
        let config = AppConfig::default();
        run_directory(&config, &input, Arc::clone(&storage), checkpoint)
            .await
            .unwrap();

        let classifier = Classifier::new(&config.classify).unwrap();
        let out = dir.join("reports");
        let first = run_analysis(&config, &storage, &classifier, &out).await.unwrap();
        let snapshot = read_tree(&out);
        let second = run_analysis(&config, &storage, &classifier, &out).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(snapshot, read_tree(&out));
        assert_eq!(first.detections, 2);

        assert!(snapshot.contains_key("jurisdictions/DE.json"));
        assert!(snapshot.contains_key("jurisdictions/FR.md"));
        assert!(snapshot.contains_key("entities/shenzhen-netcom.json"));
        assert!(snapshot.contains_key("sectors/telecom.json"));
        assert!(snapshot.contains_key("patterns.json"));
        assert!(snapshot.contains_key("comparative_analysis.md"));
        assert!(!snapshot.keys().any(|k| k.ends_with(".tmp")));

        let locators = &snapshot["verification/locators.jsonl"];
        assert_eq!(locators.lines().count(), 2);
        assert!(locators.contains("batch.tar.gz!/n1.xml"));

        let fr: serde_json::Value = serde_json::from_str(&snapshot["jurisdictions/FR.json"]).unwrap();
        assert_eq!(fr["total_records"], 2);
        assert_eq!(fr["flagged_records"], 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn stale_entity_files_are_removed() {
        let dir = temp_dir();
        let out = dir.join("reports");
        std::fs::create_dir_all(out.join("entities")).unwrap();
        std::fs::write(out.join("entities/gone.json"), "{}").unwrap();

        let aggregates = aggregate(&[], &BTreeMap::new(), &AggregateParams::default());
        write_reports(&out, &aggregates, &[], &[], &AggregateParams::default()).unwrap();
        assert!(!out.join("entities/gone.json").exists());
        assert!(out.join("verification/locators.jsonl").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
