//! Nested archive traversal.
//!
//! This crate provides:
//! - [`adapters`] — container formats (gzip, tar) behind [`ContainerAdapter`]
//! - [`ArchiveReader`] — lazy walk over the leaf members of nested archives
//! - [`discover_archives`] — input discovery under a root directory

pub mod adapters;
pub mod discovery;
pub mod reader;

pub use adapters::{AdapterRegistry, ContainerAdapter, ContainerEntry, GzipAdapter, TarAdapter};
pub use discovery::{ArchiveRef, discover_archives};
pub use reader::{ArchiveReader, MemberCorrupt, MemberWalk, RawMember, WalkItem};
