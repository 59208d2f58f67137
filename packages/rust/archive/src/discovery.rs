//! Input discovery: find the archives under the input root.

use std::path::{Path, PathBuf};

use tracing::debug;

use tenderwatch_shared::{Result, TenderwatchError};

use crate::adapters::AdapterRegistry;

/// An input archive found under the input root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArchiveRef {
    /// Root-relative path with `/` separators. Stable across runs and hosts.
    pub id: String,
    pub path: PathBuf,
}

/// Walk `root` recursively and return every file a registered adapter claims,
/// sorted by id. Hidden files and partial downloads are skipped.
pub fn discover_archives(
    root: &Path,
    registry: &AdapterRegistry,
    ignore_suffixes: &[String],
) -> Result<Vec<ArchiveRef>> {
    if !root.is_dir() {
        return Err(TenderwatchError::validation(format!(
            "input directory does not exist: {}",
            root.display()
        )));
    }

    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| TenderwatchError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| TenderwatchError::io(&dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| TenderwatchError::io(&path, e))?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }

            let lower = name.to_ascii_lowercase();
            if ignore_suffixes
                .iter()
                .any(|s| lower.ends_with(&s.to_ascii_lowercase()))
            {
                debug!(file = %path.display(), "skipping partial download");
                continue;
            }
            if !registry.claims(&name) {
                continue;
            }

            found.push(ArchiveRef {
                id: relative_id(root, &path),
                path,
            });
        }
    }

    found.sort();
    debug!(root = %root.display(), count = found.len(), "discovered archives");
    Ok(found)
}

/// Root-relative id with `/` separators.
fn relative_id(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::tests::temp_dir;

    #[test]
    fn finds_archives_sorted_and_skips_partials() {
        let root = temp_dir();
        std::fs::create_dir_all(root.join("2024/01")).unwrap();
        std::fs::write(root.join("b.tar"), b"").unwrap();
        std::fs::write(root.join("2024/01/a.tar.gz"), b"").unwrap();
        std::fs::write(root.join("2024/01/c.tar.gz.part"), b"").unwrap();
        std::fs::write(root.join("2024/.hidden.tar"), b"").unwrap();
        std::fs::write(root.join("readme.md"), b"").unwrap();

        let registry = AdapterRegistry::new();
        let suffixes = tenderwatch_shared::ArchiveConfig::default().ignore_suffixes;
        let found = discover_archives(&root, &registry, &suffixes).unwrap();
        let ids: Vec<&str> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["2024/01/a.tar.gz", "b.tar"]);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn missing_root_is_an_error() {
        let registry = AdapterRegistry::new();
        let err = discover_archives(Path::new("/nonexistent/tenderwatch"), &registry, &[]);
        assert!(err.is_err());
    }
}
