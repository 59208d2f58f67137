//! tar adapter.

use std::io::{self, Read};
use std::ops::ControlFlow;

use tar::Archive;
use tracing::trace;

use super::{ContainerAdapter, ContainerEntry, Visit};

/// Offset of the `ustar` magic inside a tar header block.
const USTAR_OFFSET: usize = 257;

/// Enumerates regular files of a (ustar, GNU or v7) tar stream.
pub struct TarAdapter;

impl ContainerAdapter for TarAdapter {
    fn name(&self) -> &str {
        "tar"
    }

    fn sniff(&self, head: &[u8]) -> bool {
        head.get(USTAR_OFFSET..USTAR_OFFSET + 5) == Some(b"ustar".as_slice())
    }

    fn claims(&self, name: &str) -> bool {
        name.to_ascii_lowercase().ends_with(".tar")
    }

    fn for_each_member(
        &self,
        container_name: &str,
        reader: &mut dyn Read,
        visit: &mut Visit<'_>,
    ) -> io::Result<ControlFlow<()>> {
        let mut archive = Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            trace!(container = container_name, member = %name, "tar member");
            if visit(ContainerEntry {
                name,
                reader: &mut entry,
            })?
            .is_break()
            {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}
