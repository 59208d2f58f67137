//! Container adapter trait and built-in adapters.
//!
//! Adapters recognise one container format (gzip, tar, ...) and enumerate its
//! members as readable streams. Formats compose: a `.tar.gz` is walked as a
//! gzip stream whose single member is detected again and walked as a tar.

mod gzip;
mod tarball;

use std::io::{self, Read};
use std::ops::ControlFlow;

pub use gzip::GzipAdapter;
pub use tarball::TarAdapter;

/// Bytes read from a stream before detection. Covers the tar magic at offset 257.
pub const SNIFF_LEN: usize = 512;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One member handed out by a container while it is being enumerated.
pub struct ContainerEntry<'a> {
    /// Member name as stored in the container (for transparent adapters,
    /// the container name with its compression suffix removed).
    pub name: String,
    /// Reader positioned at the start of the member's content.
    pub reader: &'a mut dyn Read,
}

/// Callback invoked for each member; `Break` stops the enumeration.
pub type Visit<'v> = dyn FnMut(ContainerEntry<'_>) -> io::Result<ControlFlow<()>> + 'v;

/// A container format that can be walked member by member.
///
/// Adapters are tried in registration order; magic bytes are consulted for
/// every adapter before any extension check.
pub trait ContainerAdapter: Send + Sync {
    /// Short adapter name for tracing.
    fn name(&self) -> &str;

    /// Whether the leading bytes carry this format's magic.
    fn sniff(&self, head: &[u8]) -> bool;

    /// Whether a file name carries one of this format's extensions.
    fn claims(&self, name: &str) -> bool;

    /// Single-stream wrappers (compression) add no level to member paths.
    fn is_transparent(&self) -> bool {
        false
    }

    /// Enumerate members, invoking `visit` for each regular file.
    ///
    /// Returns `Break` if the visitor stopped early. Any `Err` means the
    /// container stream itself could not be read further.
    fn for_each_member(
        &self,
        container_name: &str,
        reader: &mut dyn Read,
        visit: &mut Visit<'_>,
    ) -> io::Result<ControlFlow<()>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds registered container adapters in priority order.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn ContainerAdapter>>,
}

impl AdapterRegistry {
    /// Create a registry with the built-in adapters (gzip, tar).
    pub fn new() -> Self {
        Self {
            adapters: vec![Box::new(GzipAdapter), Box::new(TarAdapter)],
        }
    }

    /// Register an additional adapter after the built-ins.
    pub fn register(&mut self, adapter: Box<dyn ContainerAdapter>) {
        self.adapters.push(adapter);
    }

    /// Find the adapter for a stream: magic bytes first, extension second.
    /// Returns `None` when the stream is a leaf member.
    pub fn detect(&self, name: &str, head: &[u8]) -> Option<&dyn ContainerAdapter> {
        self.adapters
            .iter()
            .find(|a| a.sniff(head))
            .or_else(|| self.adapters.iter().find(|a| a.claims(name)))
            .map(|a| a.as_ref())
    }

    /// Whether any adapter claims this file name by extension.
    pub fn claims(&self, name: &str) -> bool {
        self.adapters.iter().any(|a| a.claims(name))
    }

    /// Registered adapter names, in priority order.
    pub fn names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Read up to [`SNIFF_LEN`] bytes, stopping early only at end of stream.
pub(crate) fn read_head(reader: &mut dyn Read) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    reader.take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok(head)
}
