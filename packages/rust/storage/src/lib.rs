//! libSQL detection store (local file mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding detections, the
//! parsed-record index, the per-archive ledger, jurisdiction record totals and
//! the correction audit.
//!
//! Detections and records are keyed by their own ids, not by archive: a
//! record carried by several archives is stored once, attributed to the last
//! archive that wrote it.
//!
//! **Access rules:**
//! - Pipeline: read-write via [`Storage::open`]; per-archive writes are
//!   serialized behind an internal lock and run in one transaction
//! - Analysis and reporting: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use tenderwatch_classify::RiskScorer;
use tenderwatch_shared::{Classification, Detection, Result, TenderwatchError};

/// Ledger row for one fully processed archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveLedger {
    pub archive_id: String,
    pub path: String,
    pub members: u64,
    pub malformed: u64,
    pub records: u64,
    pub detections: u64,
    pub total_value: f64,
}

/// Records and summed value for one jurisdiction.
#[derive(Debug, Clone, PartialEq)]
pub struct JurisdictionTotal {
    pub jurisdiction: String,
    pub records: u64,
    pub total_value: f64,
}

/// One parsed record, as counted in the penetration denominators.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEntry {
    pub record_id: String,
    pub jurisdiction: String,
    pub value: f64,
}

/// One entry of the correction audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionEntry {
    pub archive_id: String,
    pub detection_id: String,
    pub previous: Classification,
    pub corrected: Classification,
    pub note: Option<String>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TenderwatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TenderwatchError::Storage(format!(
                "detection store not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        TenderwatchError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(TenderwatchError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Per-archive replacement
    // -----------------------------------------------------------------------

    /// Replace everything stored for one archive in a single transaction:
    /// the uncorrected detections and records it last wrote, its jurisdiction
    /// totals and its ledger row.
    ///
    /// Detections and records already written by another archive are taken
    /// over rather than duplicated. Manually corrected detections are never
    /// overwritten. Any failure rolls the whole archive back and is reported
    /// as `DetectionStoreWrite`.
    pub async fn replace_archive_detections(
        &self,
        ledger: &ArchiveLedger,
        detections: &[Detection],
        records: &[RecordEntry],
        totals: &[JurisdictionTotal],
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        self.replace_archive_inner(ledger, detections, records, totals)
            .await
            .map_err(|e| TenderwatchError::DetectionStoreWrite {
                archive_id: ledger.archive_id.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            archive = %ledger.archive_id,
            detections = detections.len(),
            "archive detections replaced"
        );
        Ok(())
    }

    async fn replace_archive_inner(
        &self,
        ledger: &ArchiveLedger,
        detections: &[Detection],
        records: &[RecordEntry],
        totals: &[JurisdictionTotal],
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        tx.execute(
            "DELETE FROM detections WHERE archive_id = ?1 AND corrected = 0",
            params![ledger.archive_id.as_str()],
        )
        .await
        .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        for detection in detections {
            let json = serde_json::to_string(detection)
                .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
            let party_name = detection
                .party()
                .map(|p| p.name.clone())
                .unwrap_or_default();
            // Corrected rows survived the delete above and are kept as-is.
            tx.execute(
                "INSERT INTO detections (archive_id, detection_id, record_id, party_index, party_name,
                    origin, confidence, risk_level, jurisdiction, value, currency, award_date,
                    detection_json, corrected, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14)
                 ON CONFLICT(detection_id) DO UPDATE SET
                   archive_id = excluded.archive_id,
                   record_id = excluded.record_id,
                   party_index = excluded.party_index,
                   party_name = excluded.party_name,
                   origin = excluded.origin,
                   confidence = excluded.confidence,
                   risk_level = excluded.risk_level,
                   jurisdiction = excluded.jurisdiction,
                   value = excluded.value,
                   currency = excluded.currency,
                   award_date = excluded.award_date,
                   detection_json = excluded.detection_json,
                   updated_at = excluded.updated_at
                 WHERE detections.corrected = 0",
                params![
                    detection.archive_id.as_str(),
                    detection.id.as_str(),
                    detection.record.record_id.as_str(),
                    detection.party_index as i64,
                    party_name,
                    detection.classification.origin.as_str(),
                    detection.classification.confidence.as_str(),
                    detection.risk.level.as_str(),
                    detection.record.jurisdiction_label(),
                    detection.record.value,
                    detection.record.currency.as_deref(),
                    detection.record.date.map(|d| d.to_string()),
                    json,
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
        }

        tx.execute(
            "DELETE FROM records WHERE archive_id = ?1",
            params![ledger.archive_id.as_str()],
        )
        .await
        .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        for record in records {
            tx.execute(
                "INSERT INTO records (record_id, archive_id, jurisdiction, value)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(record_id) DO UPDATE SET
                   archive_id = excluded.archive_id,
                   jurisdiction = excluded.jurisdiction,
                   value = excluded.value",
                params![
                    record.record_id.as_str(),
                    ledger.archive_id.as_str(),
                    record.jurisdiction.as_str(),
                    record.value,
                ],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
        }

        tx.execute(
            "DELETE FROM jurisdiction_totals WHERE archive_id = ?1",
            params![ledger.archive_id.as_str()],
        )
        .await
        .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        for total in totals {
            tx.execute(
                "INSERT INTO jurisdiction_totals (archive_id, jurisdiction, records, total_value)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    ledger.archive_id.as_str(),
                    total.jurisdiction.as_str(),
                    total.records as i64,
                    total.total_value,
                ],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
        }

        tx.execute(
            "INSERT INTO archives (archive_id, path, members, malformed, records, detections, total_value, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(archive_id) DO UPDATE SET
               path = excluded.path,
               members = excluded.members,
               malformed = excluded.malformed,
               records = excluded.records,
               detections = excluded.detections,
               total_value = excluded.total_value,
               processed_at = excluded.processed_at",
            params![
                ledger.archive_id.as_str(),
                ledger.path.as_str(),
                ledger.members as i64,
                ledger.malformed as i64,
                ledger.records as i64,
                ledger.detections as i64,
                ledger.total_value,
                now.as_str(),
            ],
        )
        .await
        .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// All detections, ordered by detection id.
    pub async fn list_detections(&self) -> Result<Vec<Detection>> {
        let mut rows = self
            .conn
            .query(
                "SELECT detection_json FROM detections ORDER BY detection_id",
                params![],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_detection(&row)?);
        }
        Ok(results)
    }

    /// Detections currently attributed to one archive.
    pub async fn list_archive_detections(&self, archive_id: &str) -> Result<Vec<Detection>> {
        let mut rows = self
            .conn
            .query(
                "SELECT detection_json FROM detections WHERE archive_id = ?1 ORDER BY detection_id",
                params![archive_id],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_detection(&row)?);
        }
        Ok(results)
    }

    /// Number of stored detections.
    pub async fn count_detections(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM detections", params![])
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(TenderwatchError::Storage(e.to_string())),
        }
    }

    /// Distinct records and their summed value per jurisdiction, over all
    /// archives.
    pub async fn jurisdiction_totals(&self) -> Result<Vec<JurisdictionTotal>> {
        let mut rows = self
            .conn
            .query(
                "SELECT jurisdiction, COUNT(*), SUM(value)
                 FROM records GROUP BY jurisdiction ORDER BY jurisdiction",
                params![],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(JurisdictionTotal {
                jurisdiction: row
                    .get::<String>(0)
                    .map_err(|e| TenderwatchError::Storage(e.to_string()))?,
                records: row.get::<i64>(1).unwrap_or(0) as u64,
                total_value: row.get::<f64>(2).unwrap_or(0.0),
            });
        }
        Ok(results)
    }

    /// Ledger rows of every processed archive, ordered by id.
    pub async fn archive_ledger(&self) -> Result<Vec<ArchiveLedger>> {
        let mut rows = self
            .conn
            .query(
                "SELECT archive_id, path, members, malformed, records, detections, total_value
                 FROM archives ORDER BY archive_id",
                params![],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(ArchiveLedger {
                archive_id: row
                    .get::<String>(0)
                    .map_err(|e| TenderwatchError::Storage(e.to_string()))?,
                path: row
                    .get::<String>(1)
                    .map_err(|e| TenderwatchError::Storage(e.to_string()))?,
                members: row.get::<i64>(2).unwrap_or(0) as u64,
                malformed: row.get::<i64>(3).unwrap_or(0) as u64,
                records: row.get::<i64>(4).unwrap_or(0) as u64,
                detections: row.get::<i64>(5).unwrap_or(0) as u64,
                total_value: row.get::<f64>(6).unwrap_or(0.0),
            });
        }
        Ok(results)
    }

    /// Jurisdiction totals of one archive (checkpoint rebuild).
    pub async fn archive_jurisdiction_totals(&self, archive_id: &str) -> Result<Vec<JurisdictionTotal>> {
        let mut rows = self
            .conn
            .query(
                "SELECT jurisdiction, records, total_value FROM jurisdiction_totals
                 WHERE archive_id = ?1 ORDER BY jurisdiction",
                params![archive_id],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(JurisdictionTotal {
                jurisdiction: row
                    .get::<String>(0)
                    .map_err(|e| TenderwatchError::Storage(e.to_string()))?,
                records: row.get::<i64>(1).unwrap_or(0) as u64,
                total_value: row.get::<f64>(2).unwrap_or(0.0),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Manual corrections
    // -----------------------------------------------------------------------

    /// Replace the classification of a stored detection, re-derive its risk
    /// from the record and the current classifications of the record's stored
    /// parties, mark it corrected and append an audit entry.
    pub async fn correct_classification(
        &self,
        detection_id: &str,
        classification: &Classification,
        note: Option<&str>,
        scorer: &RiskScorer,
    ) -> Result<Detection> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let mut rows = self
            .conn
            .query(
                "SELECT detection_json FROM detections WHERE detection_id = ?1",
                params![detection_id],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
        let mut detection = match rows.next().await {
            Ok(Some(row)) => row_to_detection(&row)?,
            Ok(None) => {
                return Err(TenderwatchError::validation(format!(
                    "no detection with id '{detection_id}'"
                )));
            }
            Err(e) => return Err(TenderwatchError::Storage(e.to_string())),
        };
        drop(rows);

        let mut rows = self
            .conn
            .query(
                "SELECT detection_json FROM detections WHERE record_id = ?1 ORDER BY party_index",
                params![detection.record.record_id.as_str()],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
        let mut classifications = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let sibling = row_to_detection(&row)?;
            if sibling.id == detection.id {
                classifications.push(classification.clone());
            } else {
                classifications.push(sibling.classification);
            }
        }
        drop(rows);

        let previous = serde_json::to_string(&detection.classification)
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
        let corrected = serde_json::to_string(classification)
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
        detection.classification = classification.clone();
        detection.risk = scorer.score(&detection.record, &classifications);
        let json = serde_json::to_string(&detection)
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        tx.execute(
            "UPDATE detections SET origin = ?1, confidence = ?2, risk_level = ?3,
                detection_json = ?4, corrected = 1, updated_at = ?5
             WHERE detection_id = ?6",
            params![
                classification.origin.as_str(),
                classification.confidence.as_str(),
                detection.risk.level.as_str(),
                json,
                now.as_str(),
                detection_id,
            ],
        )
        .await
        .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        tx.execute(
            "INSERT INTO corrections (id, archive_id, detection_id, previous_json, corrected_json, note, corrected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::now_v7().to_string(),
                detection.archive_id.as_str(),
                detection_id,
                previous,
                corrected,
                note,
                now.as_str(),
            ],
        )
        .await
        .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        info!(detection_id, risk = %detection.risk.level, "classification corrected");
        Ok(detection)
    }

    /// Correction audit entries for a detection id, oldest first.
    pub async fn corrections_for(&self, detection_id: &str) -> Result<Vec<CorrectionEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT archive_id, detection_id, previous_json, corrected_json, note
                 FROM corrections WHERE detection_id = ?1 ORDER BY id",
                params![detection_id],
            )
            .await
            .map_err(|e| TenderwatchError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let previous: String = row
                .get(2)
                .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
            let corrected: String = row
                .get(3)
                .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
            results.push(CorrectionEntry {
                archive_id: row
                    .get::<String>(0)
                    .map_err(|e| TenderwatchError::Storage(e.to_string()))?,
                detection_id: row
                    .get::<String>(1)
                    .map_err(|e| TenderwatchError::Storage(e.to_string()))?,
                previous: serde_json::from_str(&previous)
                    .map_err(|e| TenderwatchError::Storage(e.to_string()))?,
                corrected: serde_json::from_str(&corrected)
                    .map_err(|e| TenderwatchError::Storage(e.to_string()))?,
                note: row.get::<String>(4).ok(),
            });
        }
        Ok(results)
    }
}

/// Convert a `detection_json` row to a [`Detection`].
fn row_to_detection(row: &libsql::Row) -> Result<Detection> {
    let json: String = row
        .get(0)
        .map_err(|e| TenderwatchError::Storage(e.to_string()))?;
    serde_json::from_str(&json)
        .map_err(|e| TenderwatchError::Storage(format!("invalid detection json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenderwatch_shared::{
        Confidence, Origin, Party, PartyRole, Record, RiskAssessment, RiskConfig, RiskLevel,
        VerificationLocator,
    };

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("tw_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn detection(archive_id: &str, record_id: &str, jurisdiction: &str, origin: Origin) -> Detection {
        let record = Record {
            record_id: record_id.into(),
            authority_name: Some("Authority".into()),
            authority_jurisdiction: Some(jurisdiction.into()),
            parties: vec![Party {
                name: "Acme Telecom".into(),
                country_code: Some("CN".into()),
                parent_name: None,
                role: PartyRole::Prime,
            }],
            value: Some(1_000.0),
            currency: Some("EUR".into()),
            date: chrono::NaiveDate::from_ymd_opt(2024, 1, 15),
            sectors: Vec::new(),
            tags: Vec::new(),
            description: None,
            member_path: format!("{archive_id}!/{record_id}.xml"),
        };
        Detection {
            id: Detection::stable_id(record_id, 0),
            archive_id: archive_id.into(),
            record,
            party_index: 0,
            classification: Classification {
                origin,
                confidence: Confidence::High,
                rationale: "country code CN -> PRC".into(),
                warnings: Vec::new(),
                verification_required: false,
                rule_id: Some("country_code".into()),
                ambiguous: false,
            },
            risk: RiskAssessment {
                level: RiskLevel::Medium,
                factors: vec!["base Medium".into()],
            },
            goods_origin: None,
            locator: VerificationLocator {
                archive_path: format!("/data/{archive_id}"),
                member_path: format!("{archive_id}!/{record_id}.xml"),
                fragment: "Acme Telecom".into(),
            },
        }
    }

    fn ledger(archive_id: &str, detections: u64) -> ArchiveLedger {
        ArchiveLedger {
            archive_id: archive_id.into(),
            path: format!("/data/{archive_id}"),
            members: 3,
            malformed: 0,
            records: 3,
            detections,
            total_value: 3_000.0,
        }
    }

    fn records(jurisdiction: &str, ids: &[&str]) -> Vec<RecordEntry> {
        ids.iter()
            .map(|id| RecordEntry {
                record_id: (*id).into(),
                jurisdiction: jurisdiction.into(),
                value: 1_000.0,
            })
            .collect()
    }

    fn totals(jurisdiction: &str, records: u64) -> Vec<JurisdictionTotal> {
        vec![JurisdictionTotal {
            jurisdiction: jurisdiction.into(),
            records,
            total_value: 1_000.0 * records as f64,
        }]
    }

    fn scorer() -> RiskScorer {
        RiskScorer::new(&RiskConfig::default())
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("tw_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn replacing_an_archive_is_idempotent() {
        let storage = test_storage().await;
        let dets = vec![
            detection("a.tar", "N-1", "DE", Origin::Prc),
            detection("a.tar", "N-2", "DE", Origin::Prc),
        ];
        let recs = records("DE", &["N-1", "N-2", "N-3"]);
        for _ in 0..2 {
            storage
                .replace_archive_detections(&ledger("a.tar", 2), &dets, &recs, &totals("DE", 3))
                .await
                .unwrap();
        }
        assert_eq!(storage.count_detections().await.unwrap(), 2);
        assert_eq!(storage.archive_ledger().await.unwrap().len(), 1);
        let t = storage.jurisdiction_totals().await.unwrap();
        assert_eq!(t, totals("DE", 3));
    }

    #[tokio::test]
    async fn replacing_drops_stale_rows() {
        let storage = test_storage().await;
        storage
            .replace_archive_detections(
                &ledger("a.tar", 2),
                &[
                    detection("a.tar", "N-1", "DE", Origin::Prc),
                    detection("a.tar", "N-2", "DE", Origin::Prc),
                ],
                &records("DE", &["N-1", "N-2"]),
                &totals("DE", 2),
            )
            .await
            .unwrap();
        storage
            .replace_archive_detections(
                &ledger("a.tar", 1),
                &[detection("a.tar", "N-1", "DE", Origin::Prc)],
                &records("DE", &["N-1"]),
                &totals("DE", 1),
            )
            .await
            .unwrap();

        let ids: Vec<String> = storage
            .list_detections()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["N-1#0"]);
        assert_eq!(storage.jurisdiction_totals().await.unwrap()[0].records, 1);
    }

    #[tokio::test]
    async fn totals_sum_across_archives() {
        let storage = test_storage().await;
        storage
            .replace_archive_detections(&ledger("a.tar", 0), &[], &records("DE", &["A1", "A2", "A3"]), &totals("DE", 3))
            .await
            .unwrap();
        storage
            .replace_archive_detections(
                &ledger("b.tar", 0),
                &[],
                &records("DE", &["B1", "B2", "B3", "B4"]),
                &totals("DE", 4),
            )
            .await
            .unwrap();
        let t = storage.jurisdiction_totals().await.unwrap();
        assert_eq!(t[0].records, 7);
        assert_eq!(t[0].total_value, 7_000.0);
        assert_eq!(storage.archive_jurisdiction_totals("b.tar").await.unwrap()[0].records, 4);
    }

    #[tokio::test]
    async fn record_in_two_archives_is_stored_once() {
        let storage = test_storage().await;
        for archive in ["a.tar.gz", "b.tar.gz"] {
            storage
                .replace_archive_detections(
                    &ledger(archive, 1),
                    &[detection(archive, "N-1", "DE", Origin::Prc)],
                    &records("DE", &["N-1"]),
                    &totals("DE", 1),
                )
                .await
                .unwrap();
        }

        let stored = storage.list_detections().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "N-1#0");
        assert_eq!(stored[0].archive_id, "b.tar.gz");
        assert_eq!(storage.jurisdiction_totals().await.unwrap()[0].records, 1);

        // Reprocessing the first archive takes the row back without duplicating it.
        storage
            .replace_archive_detections(
                &ledger("a.tar.gz", 1),
                &[detection("a.tar.gz", "N-1", "DE", Origin::Prc)],
                &records("DE", &["N-1"]),
                &totals("DE", 1),
            )
            .await
            .unwrap();
        assert_eq!(storage.count_detections().await.unwrap(), 1);
        assert!(storage.list_archive_detections("b.tar.gz").await.unwrap().is_empty());
        assert_eq!(storage.archive_ledger().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrections_survive_reprocessing() {
        let storage = test_storage().await;
        let det = detection("a.tar", "N-1", "DE", Origin::Prc);
        storage
            .replace_archive_detections(
                &ledger("a.tar", 1),
                std::slice::from_ref(&det),
                &records("DE", &["N-1"]),
                &totals("DE", 1),
            )
            .await
            .unwrap();

        let mut fixed = det.classification.clone();
        fixed.origin = Origin::Taiwan;
        fixed.confidence = Confidence::Verified;
        let corrected = storage
            .correct_classification("N-1#0", &fixed, Some("HQ confirmed in Hsinchu"), &scorer())
            .await
            .unwrap();
        assert_eq!(corrected.classification.origin, Origin::Taiwan);

        // Re-run the archive with the pipeline's classification.
        storage
            .replace_archive_detections(&ledger("a.tar", 1), &[det], &records("DE", &["N-1"]), &totals("DE", 1))
            .await
            .unwrap();

        let stored = storage.list_archive_detections("a.tar").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].classification.origin, Origin::Taiwan);

        let audit = storage.corrections_for("N-1#0").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].previous.origin, Origin::Prc);
        assert_eq!(audit[0].note.as_deref(), Some("HQ confirmed in Hsinchu"));
    }

    #[tokio::test]
    async fn correction_rescores_risk() {
        let storage = test_storage().await;
        let mut det = detection("a.tar", "N-1", "DE", Origin::Prc);
        det.record.value = Some(50_000_000.0);
        det.record.tags = vec!["telecom".into()];
        det.risk = scorer().score(&det.record, std::slice::from_ref(&det.classification));
        assert_eq!(det.risk.level, RiskLevel::Critical);
        storage
            .replace_archive_detections(
                &ledger("a.tar", 1),
                std::slice::from_ref(&det),
                &records("DE", &["N-1"]),
                &totals("DE", 1),
            )
            .await
            .unwrap();

        let mut fixed = det.classification.clone();
        fixed.origin = Origin::Other;
        let corrected = storage
            .correct_classification("N-1#0", &fixed, None, &scorer())
            .await
            .unwrap();
        // Base Low for Other, raised for telecom and for the value.
        assert_eq!(corrected.risk.level, RiskLevel::High);

        let stored = storage.list_detections().await.unwrap();
        assert_eq!(stored[0].risk.level, RiskLevel::High);
        assert_eq!(stored[0].classification.origin, Origin::Other);
    }

    #[tokio::test]
    async fn correcting_unknown_id_fails() {
        let storage = test_storage().await;
        let det = detection("a.tar", "N-1", "DE", Origin::Prc);
        let err = storage
            .correct_classification("missing#0", &det.classification, None, &scorer())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing#0"));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("tw_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro
            .replace_archive_detections(&ledger("a.tar", 0), &[], &[], &[])
            .await;
        assert!(result.is_err());
        assert!(ro.list_detections().await.unwrap().is_empty());
    }
}
