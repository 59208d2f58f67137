//! Lazy, streaming walk over the leaf members of a nested archive.
//!
//! A producer thread decodes the container stack and sends members over a
//! bounded channel, so at most a handful of decoded members are held in memory
//! at once. Nested containers are decoded in memory; nothing is written to disk.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

use tracing::{debug, warn};

use tenderwatch_shared::{ArchiveConfig, MEMBER_PATH_SEPARATOR, Result, TenderwatchError};

use crate::adapters::{AdapterRegistry, ContainerAdapter, ContainerEntry, read_head};

/// Members buffered between the producer thread and the consumer.
const CHANNEL_CAPACITY: usize = 16;

/// A decoded leaf member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMember {
    /// Archive file name followed by every nesting level, joined with `!/`.
    pub qualified_path: String,
    /// Nesting level: 1 for members of the outer archive.
    pub depth: u32,
    pub bytes: Vec<u8>,
}

/// A member that could not be read. The walk continues with its siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberCorrupt {
    pub qualified_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkItem {
    Member(RawMember),
    Corrupt(MemberCorrupt),
}

/// Opens archives and walks their leaf members.
#[derive(Clone)]
pub struct ArchiveReader {
    registry: Arc<AdapterRegistry>,
    max_depth: u32,
    max_member_bytes: u64,
}

impl ArchiveReader {
    pub fn new(registry: Arc<AdapterRegistry>, config: &ArchiveConfig) -> Self {
        Self {
            registry,
            max_depth: config.max_depth.max(1),
            max_member_bytes: config.max_member_bytes,
        }
    }

    /// Open an archive and start walking it.
    ///
    /// Fails with `ArchiveUnreadable` when the file cannot be opened or is not
    /// a recognised container. Errors after this point arrive through the walk.
    pub fn open(&self, path: &Path) -> Result<MemberWalk> {
        let file = File::open(path)
            .map_err(|e| TenderwatchError::archive_unreadable(path, e.to_string()))?;
        let mut reader = BufReader::new(file);
        let head = read_head(&mut reader)
            .map_err(|e| TenderwatchError::archive_unreadable(path, e.to_string()))?;

        let root_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if self.registry.detect(&root_name, &head).is_none() {
            return Err(TenderwatchError::archive_unreadable(
                path,
                "not a recognised container format",
            ));
        }

        let (tx, rx) = sync_channel(CHANNEL_CAPACITY);
        let producer = Producer {
            registry: Arc::clone(&self.registry),
            max_depth: self.max_depth,
            max_member_bytes: self.max_member_bytes,
            tx,
        };
        let archive_path = path.to_path_buf();

        thread::Builder::new()
            .name("archive-walk".into())
            .spawn(move || producer.run(&archive_path, &root_name, head, reader))
            .map_err(|e| TenderwatchError::io(path, e))?;

        Ok(MemberWalk { rx })
    }
}

/// Finite, non-restartable iterator over an archive's members.
///
/// A terminal `Err(ArchiveUnreadable)` means the outer stream broke mid-walk.
/// Dropping the walk stops the producer at its next member.
pub struct MemberWalk {
    rx: Receiver<Result<WalkItem>>,
}

impl Iterator for MemberWalk {
    type Item = Result<WalkItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct Producer {
    registry: Arc<AdapterRegistry>,
    max_depth: u32,
    max_member_bytes: u64,
    tx: SyncSender<Result<WalkItem>>,
}

/// Internal outcome of reading one member.
enum MemberRead {
    Bytes(Vec<u8>),
    TooLarge,
}

impl Producer {
    fn run(&self, archive_path: &Path, root_name: &str, head: Vec<u8>, reader: impl Read) {
        let Some(adapter) = self.registry.detect(root_name, &head) else {
            self.fail(archive_path, "not a recognised container format");
            return;
        };
        let mut stream = Cursor::new(head).chain(reader);

        match self.walk(adapter, &mut stream, root_name, root_name, 0, 1) {
            Ok(ControlFlow::Continue(())) => {
                debug!(archive = %archive_path.display(), "archive walk complete");
            }
            Ok(ControlFlow::Break(())) => {
                debug!(archive = %archive_path.display(), "archive walk stopped by consumer");
            }
            Err(e) => {
                warn!(archive = %archive_path.display(), error = %e, "archive stream broke mid-walk");
                self.fail(archive_path, e.to_string());
            }
        }
    }

    fn fail(&self, archive_path: &Path, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(Err(TenderwatchError::archive_unreadable(archive_path, reason)));
    }

    fn emit(&self, item: WalkItem) -> ControlFlow<()> {
        match self.tx.send(Ok(item)) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }

    fn corrupt(&self, qualified_path: String, reason: impl Into<String>) -> ControlFlow<()> {
        let reason = reason.into();
        debug!(member = %qualified_path, %reason, "corrupt member");
        self.emit(WalkItem::Corrupt(MemberCorrupt {
            qualified_path,
            reason,
        }))
    }

    /// Walk one container. `path` is the qualified path of the container
    /// itself; `depth` the nesting level of its parent's members.
    ///
    /// An `Err` is a failure of `reader`; callers decide whether that breaks
    /// the whole archive (outer stream) or a single member (buffered inner).
    fn walk(
        &self,
        adapter: &dyn ContainerAdapter,
        reader: &mut dyn Read,
        container_name: &str,
        path: &str,
        depth: u32,
        layers: u32,
    ) -> io::Result<ControlFlow<()>> {
        let transparent = adapter.is_transparent();
        adapter.for_each_member(container_name, reader, &mut |entry: ContainerEntry<'_>| {
            if transparent {
                self.visit_stream(entry, path, depth, layers)
            } else {
                self.visit_member(entry, path, depth + 1, layers)
            }
        })
    }

    /// Content of a transparent wrapper: streamed, never buffered whole unless
    /// it turns out to be a leaf. Errors propagate to the enclosing container.
    fn visit_stream(
        &self,
        entry: ContainerEntry<'_>,
        path: &str,
        depth: u32,
        layers: u32,
    ) -> io::Result<ControlFlow<()>> {
        let head = read_head(entry.reader)?;
        match self.registry.detect(&entry.name, &head) {
            Some(inner) => {
                if layers + 1 > self.max_depth {
                    return Ok(self.corrupt(path.to_string(), self.depth_reason()));
                }
                let mut chained = Cursor::new(head).chain(entry.reader);
                self.walk(inner, &mut chained, &entry.name, path, depth, layers + 1)
            }
            None => {
                let mut chained = Cursor::new(head).chain(entry.reader);
                match self.read_bounded(&mut chained)? {
                    MemberRead::Bytes(bytes) => Ok(self.emit(WalkItem::Member(RawMember {
                        qualified_path: path.to_string(),
                        depth: depth.max(1),
                        bytes,
                    }))),
                    MemberRead::TooLarge => Ok(self.corrupt(path.to_string(), self.size_reason())),
                }
            }
        }
    }

    /// A named member of a real container: buffered, then either emitted as a
    /// leaf or walked as a nested container from memory.
    fn visit_member(
        &self,
        entry: ContainerEntry<'_>,
        path: &str,
        depth: u32,
        layers: u32,
    ) -> io::Result<ControlFlow<()>> {
        let qualified = format!("{path}{MEMBER_PATH_SEPARATOR}{}", entry.name);

        // A read error here is a failure of the enclosing stream.
        let bytes = match self.read_bounded(entry.reader)? {
            MemberRead::Bytes(bytes) => bytes,
            MemberRead::TooLarge => return Ok(self.corrupt(qualified, self.size_reason())),
        };

        let Some(inner) = self.registry.detect(&entry.name, &bytes) else {
            return Ok(self.emit(WalkItem::Member(RawMember {
                qualified_path: qualified,
                depth,
                bytes,
            })));
        };

        if layers + 1 > self.max_depth {
            return Ok(self.corrupt(qualified, self.depth_reason()));
        }

        let mut cursor = Cursor::new(bytes.as_slice());
        match self.walk(inner, &mut cursor, &entry.name, &qualified, depth, layers + 1) {
            Ok(flow) => Ok(flow),
            // The nested container lives in memory; its failure is local.
            Err(e) => Ok(self.corrupt(qualified, format!("{} container: {e}", inner.name()))),
        }
    }

    fn read_bounded(&self, reader: &mut dyn Read) -> io::Result<MemberRead> {
        let mut bytes = Vec::new();
        reader
            .take(self.max_member_bytes.saturating_add(1))
            .read_to_end(&mut bytes)?;
        if bytes.len() as u64 > self.max_member_bytes {
            Ok(MemberRead::TooLarge)
        } else {
            Ok(MemberRead::Bytes(bytes))
        }
    }

    fn size_reason(&self) -> String {
        format!("member exceeds max_member_bytes ({})", self.max_member_bytes)
    }

    fn depth_reason(&self) -> String {
        format!("nesting exceeds max_depth ({})", self.max_depth)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use uuid::Uuid;

    use super::*;

    pub(crate) fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn gz_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    pub(crate) fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tw-archive-test-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn reader_with(config: ArchiveConfig) -> ArchiveReader {
        ArchiveReader::new(Arc::new(AdapterRegistry::new()), &config)
    }

    fn collect(reader: &ArchiveReader, path: &Path) -> Vec<Result<WalkItem>> {
        reader.open(path).unwrap().collect()
    }

    fn members(items: &[Result<WalkItem>]) -> Vec<&RawMember> {
        items
            .iter()
            .filter_map(|i| match i {
                Ok(WalkItem::Member(m)) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn walks_nested_tar_gz() {
        let dir = temp_dir();
        let day = gz_bytes(&tar_bytes(&[
            ("notice-1.xml", b"<Notice/>".as_slice()),
            ("notice-2.xml", b"<Notice/>".as_slice()),
        ]));
        let month = gz_bytes(&tar_bytes(&[("2024-01-02.tar.gz", day.as_slice())]));
        let path = dir.join("2024-01.tar.gz");
        std::fs::write(&path, month).unwrap();

        let items = collect(&reader_with(ArchiveConfig::default()), &path);
        let found = members(&items);
        assert_eq!(found.len(), 2);
        assert_eq!(
            found[0].qualified_path,
            "2024-01.tar.gz!/2024-01-02.tar.gz!/notice-1.xml"
        );
        assert_eq!(found[0].depth, 2);
        assert_eq!(found[0].bytes, b"<Notice/>");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_inner_member_does_not_stop_walk() {
        let dir = temp_dir();
        let mut broken_gz = vec![0x1f, 0x8b];
        broken_gz.extend_from_slice(&[0xff; 32]);
        let outer = tar_bytes(&[
            ("bad.tar.gz", broken_gz.as_slice()),
            ("ok.xml", b"<Notice/>".as_slice()),
        ]);
        let path = dir.join("daily.tar");
        std::fs::write(&path, outer).unwrap();

        let items = collect(&reader_with(ArchiveConfig::default()), &path);
        assert_eq!(items.len(), 2);
        match &items[0] {
            Ok(WalkItem::Corrupt(c)) => assert_eq!(c.qualified_path, "daily.tar!/bad.tar.gz"),
            other => panic!("expected corrupt member, got {other:?}"),
        }
        match &items[1] {
            Ok(WalkItem::Member(m)) => assert_eq!(m.qualified_path, "daily.tar!/ok.xml"),
            other => panic!("expected member, got {other:?}"),
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unrecognised_outer_file_is_unreadable() {
        let dir = temp_dir();
        let path = dir.join("notes.txt");
        std::fs::write(&path, "hello").unwrap();

        let err = reader_with(ArchiveConfig::default()).open(&path).err().unwrap();
        assert!(matches!(err, TenderwatchError::ArchiveUnreadable { .. }));

        let missing = reader_with(ArchiveConfig::default())
            .open(&dir.join("missing.tar.gz"))
            .err()
            .unwrap();
        assert!(matches!(missing, TenderwatchError::ArchiveUnreadable { .. }));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn broken_outer_stream_ends_with_error() {
        let dir = temp_dir();
        let mut broken = vec![0x1f, 0x8b];
        broken.extend_from_slice(&[0xff; 64]);
        let path = dir.join("broken.tar.gz");
        std::fs::write(&path, broken).unwrap();

        let items = collect(&reader_with(ArchiveConfig::default()), &path);
        let last = items.last().unwrap();
        assert!(matches!(last, Err(TenderwatchError::ArchiveUnreadable { .. })));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn oversized_member_reported_corrupt() {
        let dir = temp_dir();
        let big = vec![b'x'; 100];
        let path = dir.join("big.tar");
        std::fs::write(
            &path,
            tar_bytes(&[("big.csv", big.as_slice()), ("small.csv", b"a,b".as_slice())]),
        )
        .unwrap();

        let config = ArchiveConfig {
            max_member_bytes: 8,
            ..ArchiveConfig::default()
        };
        let items = collect(&reader_with(config), &path);
        assert!(matches!(&items[0], Ok(WalkItem::Corrupt(c)) if c.reason.contains("max_member_bytes")));
        assert!(matches!(&items[1], Ok(WalkItem::Member(m)) if m.bytes == b"a,b"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn nesting_beyond_max_depth_reported_corrupt() {
        let dir = temp_dir();
        let inner = tar_bytes(&[("n.xml", b"<a/>".as_slice())]);
        let path = dir.join("outer.tar");
        std::fs::write(&path, tar_bytes(&[("inner.tar", inner.as_slice())])).unwrap();

        let config = ArchiveConfig {
            max_depth: 1,
            ..ArchiveConfig::default()
        };
        let items = collect(&reader_with(config), &path);
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Ok(WalkItem::Corrupt(c)) if c.reason.contains("max_depth")));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn compressed_leaf_keeps_its_name() {
        let dir = temp_dir();
        let leaf = gz_bytes(b"<Notice/>");
        let path = dir.join("bundle.tar");
        std::fs::write(&path, tar_bytes(&[("notice.xml.gz", leaf.as_slice())])).unwrap();

        let items = collect(&reader_with(ArchiveConfig::default()), &path);
        let found = members(&items);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].qualified_path, "bundle.tar!/notice.xml.gz");
        assert_eq!(found[0].bytes, b"<Notice/>");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn dropping_walk_early_is_safe() {
        let dir = temp_dir();
        let entries: Vec<(String, Vec<u8>)> = (0..64)
            .map(|i| (format!("n{i}.xml"), b"<a/>".to_vec()))
            .collect();
        let refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(n, d)| (n.as_str(), d.as_slice()))
            .collect();
        let path = dir.join("many.tar");
        std::fs::write(&path, tar_bytes(&refs)).unwrap();

        let mut walk = reader_with(ArchiveConfig::default()).open(&path).unwrap();
        assert!(walk.next().is_some());
        drop(walk);

        std::fs::remove_dir_all(&dir).ok();
    }
}
