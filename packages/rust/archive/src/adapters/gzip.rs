//! gzip adapter: a transparent single-member wrapper.

use std::io::{self, Read};
use std::ops::ControlFlow;

use flate2::read::MultiGzDecoder;

use super::{ContainerAdapter, ContainerEntry, Visit};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decompresses a gzip stream and hands out its content as one member.
pub struct GzipAdapter;

impl ContainerAdapter for GzipAdapter {
    fn name(&self) -> &str {
        "gzip"
    }

    fn sniff(&self, head: &[u8]) -> bool {
        head.starts_with(&GZIP_MAGIC)
    }

    fn claims(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        lower.ends_with(".gz") || lower.ends_with(".tgz")
    }

    fn is_transparent(&self) -> bool {
        true
    }

    fn for_each_member(
        &self,
        container_name: &str,
        reader: &mut dyn Read,
        visit: &mut Visit<'_>,
    ) -> io::Result<ControlFlow<()>> {
        let mut decoder = MultiGzDecoder::new(reader);
        visit(ContainerEntry {
            name: inner_name(container_name),
            reader: &mut decoder,
        })
    }
}

/// `a.tar.gz` → `a.tar`, `a.tgz` → `a.tar`, `notice.xml.gz` → `notice.xml`.
fn inner_name(container_name: &str) -> String {
    let lower = container_name.to_ascii_lowercase();
    if lower.ends_with(".tgz") {
        format!("{}.tar", &container_name[..container_name.len() - 4])
    } else if lower.ends_with(".gz") {
        container_name[..container_name.len() - 3].to_string()
    } else {
        container_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_compression_suffix() {
        assert_eq!(inner_name("2024-01.tar.gz"), "2024-01.tar");
        assert_eq!(inner_name("bundle.TGZ"), "bundle.tar");
        assert_eq!(inner_name("notice.xml.gz"), "notice.xml");
        assert_eq!(inner_name("raw"), "raw");
    }
}
