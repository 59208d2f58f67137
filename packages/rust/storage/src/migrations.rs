//! SQL migration definitions for the detection store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: archives, records, detections, jurisdiction_totals, corrections",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per fully processed input archive
CREATE TABLE IF NOT EXISTS archives (
    archive_id   TEXT PRIMARY KEY,
    path         TEXT NOT NULL,
    members      INTEGER NOT NULL,
    malformed    INTEGER NOT NULL,
    records      INTEGER NOT NULL,
    detections   INTEGER NOT NULL,
    total_value  REAL NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL
);

-- Detections, keyed by record_id#party_index; archive_id is the last
-- archive that carried the record
CREATE TABLE IF NOT EXISTS detections (
    detection_id   TEXT PRIMARY KEY,
    archive_id     TEXT NOT NULL,
    record_id      TEXT NOT NULL,
    party_index    INTEGER NOT NULL,
    party_name     TEXT NOT NULL,
    origin         TEXT NOT NULL,
    confidence     TEXT NOT NULL,
    risk_level     TEXT NOT NULL,
    jurisdiction   TEXT NOT NULL,
    value          REAL,
    currency       TEXT,
    award_date     TEXT,
    detection_json TEXT NOT NULL,
    corrected      INTEGER NOT NULL DEFAULT 0,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_detections_jurisdiction ON detections(jurisdiction);
CREATE INDEX IF NOT EXISTS idx_detections_origin ON detections(origin);
CREATE INDEX IF NOT EXISTS idx_detections_archive ON detections(archive_id);
CREATE INDEX IF NOT EXISTS idx_detections_record ON detections(record_id);

-- Every parsed record once, whichever archives carried it (penetration denominators)
CREATE TABLE IF NOT EXISTS records (
    record_id    TEXT PRIMARY KEY,
    archive_id   TEXT NOT NULL,
    jurisdiction TEXT NOT NULL,
    value        REAL NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_records_archive ON records(archive_id);
CREATE INDEX IF NOT EXISTS idx_records_jurisdiction ON records(jurisdiction);

-- Record counts and values per archive and jurisdiction, as read from that archive
CREATE TABLE IF NOT EXISTS jurisdiction_totals (
    archive_id   TEXT NOT NULL,
    jurisdiction TEXT NOT NULL,
    records      INTEGER NOT NULL,
    total_value  REAL NOT NULL,
    PRIMARY KEY (archive_id, jurisdiction)
);

-- Audit trail of manual classification corrections
CREATE TABLE IF NOT EXISTS corrections (
    id             TEXT PRIMARY KEY,
    archive_id     TEXT NOT NULL,
    detection_id   TEXT NOT NULL,
    previous_json  TEXT NOT NULL,
    corrected_json TEXT NOT NULL,
    note           TEXT,
    corrected_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_corrections_detection ON corrections(detection_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
