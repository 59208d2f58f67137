//! Durable record of fully processed archives.
//!
//! The checkpoint file is JSON carrying a schema version, a monotonically
//! increasing revision, the processed archive ids, per-jurisdiction
//! accumulators and a sha256 checksum over everything else. It is replaced
//! by write-temp, fsync, rename; readers never see a partial file.
//!
//! A missing file is a fresh checkpoint. A file that cannot be parsed or
//! whose checksum does not match is [`TenderwatchError::CheckpointCorrupt`]
//! and is never silently treated as empty.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use tenderwatch_shared::{CURRENT_SCHEMA_VERSION, Result, TenderwatchError};
use tenderwatch_storage::Storage;

/// Integer counters kept per jurisdiction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurisdictionAccumulator {
    /// Records parsed with this authority jurisdiction.
    pub records: u64,
    /// Detections persisted for those records.
    pub detections: u64,
}

impl JurisdictionAccumulator {
    pub fn add(&mut self, other: &JurisdictionAccumulator) {
        self.records += other.records;
        self.detections += other.detections;
    }
}

/// Checkpoint contents, without the checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub schema_version: u32,
    pub revision: u64,
    pub processed_archive_ids: BTreeSet<String>,
    pub jurisdictions: BTreeMap<String, JurisdictionAccumulator>,
}

impl CheckpointState {
    fn fresh() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            revision: 0,
            processed_archive_ids: BTreeSet::new(),
            jurisdictions: BTreeMap::new(),
        }
    }

    fn checksum(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)
            .map_err(|e| TenderwatchError::validation(format!("checkpoint serialization: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// On-disk layout.
#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(flatten)]
    state: CheckpointState,
    checksum: String,
}

/// Versioned handle over the checkpoint file.
///
/// Reads go through an `RwLock`; commits are serialized by a separate mutex
/// so the in-memory state only changes after the file has been renamed.
pub struct CheckpointManager {
    path: PathBuf,
    state: RwLock<CheckpointState>,
    commit_lock: Mutex<()>,
}

impl CheckpointManager {
    /// Open the checkpoint at `path`. Missing means fresh; anything
    /// unreadable is `CheckpointCorrupt`.
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            read_checkpoint(path)?
        } else {
            debug!(path = %path.display(), "no checkpoint file, starting fresh");
            CheckpointState::fresh()
        };

        info!(
            path = %path.display(),
            revision = state.revision,
            processed = state.processed_archive_ids.len(),
            "checkpoint opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            commit_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_processed(&self, archive_id: &str) -> bool {
        self.state
            .read()
            .await
            .processed_archive_ids
            .contains(archive_id)
    }

    /// Copy of the current state for inspection.
    pub async fn snapshot(&self) -> CheckpointState {
        self.state.read().await.clone()
    }

    /// Mark `archive_id` processed and fold in its accumulators. Must only be
    /// called after the archive's detections are durably stored.
    ///
    /// Returns the new revision. Committing an id that is already present is
    /// a no-op returning the current revision.
    pub async fn commit(
        &self,
        archive_id: &str,
        accumulators: &BTreeMap<String, JurisdictionAccumulator>,
    ) -> Result<u64> {
        let _guard = self.commit_lock.lock().await;

        let mut next = self.state.read().await.clone();
        if next.processed_archive_ids.contains(archive_id) {
            return Ok(next.revision);
        }
        next.processed_archive_ids.insert(archive_id.to_string());
        for (jurisdiction, acc) in accumulators {
            next.jurisdictions
                .entry(jurisdiction.clone())
                .or_default()
                .add(acc);
        }
        next.revision += 1;

        write_checkpoint(&self.path, &next)?;
        let revision = next.revision;
        *self.state.write().await = next;

        debug!(archive = archive_id, revision, "checkpoint committed");
        Ok(revision)
    }

    /// Replace the checkpoint with one built from `archives`. Any existing
    /// file is kept aside as `<name>.corrupt` first.
    pub fn rebuild(
        path: &Path,
        archives: Vec<(String, BTreeMap<String, JurisdictionAccumulator>)>,
    ) -> Result<Self> {
        if path.exists() {
            let aside = path.with_extension("json.corrupt");
            std::fs::rename(path, &aside).map_err(|e| TenderwatchError::io(&aside, e))?;
            warn!(previous = %aside.display(), "previous checkpoint moved aside");
        }

        let mut state = CheckpointState::fresh();
        for (archive_id, accumulators) in archives {
            if !state.processed_archive_ids.insert(archive_id) {
                continue;
            }
            for (jurisdiction, acc) in accumulators {
                state
                    .jurisdictions
                    .entry(jurisdiction)
                    .or_default()
                    .add(&acc);
            }
        }
        state.revision = 1;
        write_checkpoint(path, &state)?;

        info!(
            path = %path.display(),
            processed = state.processed_archive_ids.len(),
            "checkpoint rebuilt"
        );
        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            commit_lock: Mutex::new(()),
        })
    }

    /// Rebuild from the detection store's archive ledger.
    pub async fn rebuild_from_store(path: &Path, storage: &Storage) -> Result<Self> {
        let mut archives = Vec::new();
        for ledger in storage.archive_ledger().await? {
            let mut accumulators: BTreeMap<String, JurisdictionAccumulator> = BTreeMap::new();
            for total in storage
                .archive_jurisdiction_totals(&ledger.archive_id)
                .await?
            {
                accumulators
                    .entry(total.jurisdiction)
                    .or_default()
                    .records += total.records;
            }
            for detection in storage.list_archive_detections(&ledger.archive_id).await? {
                accumulators
                    .entry(detection.record.jurisdiction_label())
                    .or_default()
                    .detections += 1;
            }
            archives.push((ledger.archive_id, accumulators));
        }
        Self::rebuild(path, archives)
    }
}

fn read_checkpoint(path: &Path) -> Result<CheckpointState> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| TenderwatchError::checkpoint_corrupt(path, format!("unreadable: {e}")))?;
    let file: CheckpointFile = serde_json::from_str(&content)
        .map_err(|e| TenderwatchError::checkpoint_corrupt(path, format!("invalid json: {e}")))?;

    if file.state.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(TenderwatchError::checkpoint_corrupt(
            path,
            format!(
                "schema_version {} is newer than supported {}",
                file.state.schema_version, CURRENT_SCHEMA_VERSION
            ),
        ));
    }
    if file.state.checksum()? != file.checksum {
        return Err(TenderwatchError::checkpoint_corrupt(path, "checksum mismatch"));
    }
    Ok(file.state)
}

/// Write `<file>.tmp`, fsync it, rename over `path`, fsync the directory.
fn write_checkpoint(path: &Path, state: &CheckpointState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TenderwatchError::io(parent, e))?;
    }
    let file = CheckpointFile {
        state: state.clone(),
        checksum: state.checksum()?,
    };
    let json = serde_json::to_string_pretty(&file)
        .map_err(|e| TenderwatchError::validation(format!("checkpoint serialization: {e}")))?;

    let temp = path.with_extension("json.tmp");
    {
        let mut f = std::fs::File::create(&temp).map_err(|e| TenderwatchError::io(&temp, e))?;
        f.write_all(json.as_bytes())
            .map_err(|e| TenderwatchError::io(&temp, e))?;
        f.sync_all().map_err(|e| TenderwatchError::io(&temp, e))?;
    }
    std::fs::rename(&temp, path).map_err(|e| TenderwatchError::io(path, e))?;

    // Directory fsync is not available on every platform.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tw_cp_{}", Uuid::now_v7()))
            .join("checkpoint.json")
    }

    fn acc(j: &str, records: u64, detections: u64) -> BTreeMap<String, JurisdictionAccumulator> {
        BTreeMap::from([(j.to_string(), JurisdictionAccumulator { records, detections })])
    }

    #[tokio::test]
    async fn missing_file_is_fresh() {
        let cp = CheckpointManager::open(&temp_path()).unwrap();
        let snap = cp.snapshot().await;
        assert_eq!(snap.revision, 0);
        assert!(snap.processed_archive_ids.is_empty());
    }

    #[tokio::test]
    async fn commit_persists_and_reopens() {
        let path = temp_path();
        let cp = CheckpointManager::open(&path).unwrap();
        assert_eq!(cp.commit("a.tar", &acc("DE", 5, 2)).await.unwrap(), 1);
        assert_eq!(cp.commit("b.tar", &acc("DE", 3, 1)).await.unwrap(), 2);
        assert!(cp.is_processed("a.tar").await);
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = CheckpointManager::open(&path).unwrap();
        let snap = reopened.snapshot().await;
        assert_eq!(snap.revision, 2);
        assert_eq!(snap.jurisdictions["DE"], JurisdictionAccumulator { records: 8, detections: 3 });
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn recommit_is_a_noop() {
        let path = temp_path();
        let cp = CheckpointManager::open(&path).unwrap();
        cp.commit("a.tar", &acc("DE", 5, 2)).await.unwrap();
        assert_eq!(cp.commit("a.tar", &acc("DE", 5, 2)).await.unwrap(), 1);
        assert_eq!(cp.snapshot().await.jurisdictions["DE"].records, 5);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn processed_set_never_shrinks() {
        let path = temp_path();
        let cp = CheckpointManager::open(&path).unwrap();
        let mut previous = BTreeSet::new();
        for id in ["c.tar", "a.tar", "b.tar", "a.tar"] {
            cp.commit(id, &BTreeMap::new()).await.unwrap();
            let current = cp.snapshot().await.processed_archive_ids;
            assert!(previous.is_subset(&current));
            previous = current;
        }
        assert_eq!(previous.len(), 3);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn garbled_file_is_corrupt() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        let err = CheckpointManager::open(&path).err().unwrap();
        assert!(matches!(err, TenderwatchError::CheckpointCorrupt { .. }));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn tampered_file_fails_checksum() {
        let path = temp_path();
        let cp = CheckpointManager::open(&path).unwrap();
        cp.commit("a.tar", &acc("DE", 5, 2)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("a.tar", "z.tar")).unwrap();
        let err = CheckpointManager::open(&path).err().unwrap();
        assert!(err.to_string().contains("checksum mismatch"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn rebuild_moves_corrupt_file_aside() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "garbage").unwrap();

        let cp = CheckpointManager::rebuild(&path, vec![("a.tar".into(), acc("FR", 2, 1))]).unwrap();
        assert!(cp.is_processed("a.tar").await);
        assert!(path.with_extension("json.corrupt").exists());

        let reopened = CheckpointManager::open(&path).unwrap();
        assert_eq!(reopened.snapshot().await.jurisdictions["FR"].records, 2);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
