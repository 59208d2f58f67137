//! Record extraction from raw archive members.
//!
//! This crate provides:
//! - [`RecordExtractor`] — turns member bytes into typed [`Record`]s
//! - [`delimited`] / [`markup`] — the two supported record shapes
//! - [`Tagger`] — technology tags from sector codes and descriptions
//! - [`normalize`] — amount, date and id normalisation
//!
//! Extraction never fails past this crate: unusable input yields no records
//! and a logged reason.

pub mod delimited;
pub mod markup;
pub mod normalize;
pub mod tagger;

use tracing::debug;

use tenderwatch_shared::{ExtractConfig, MEMBER_PATH_SEPARATOR, Record, Result};

pub use tagger::Tagger;

/// Record layout of a member, inferred from its name and content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    Markup,
    Delimited { delimiter: u8 },
    Unsupported,
}

impl RecordShape {
    /// Infer the shape from the member's extension, sniffing content when the
    /// extension is not a known record type.
    pub fn infer(member_path: &str, bytes: &[u8], default_delimiter: u8) -> Self {
        let name = member_path
            .rsplit(MEMBER_PATH_SEPARATOR)
            .next()
            .unwrap_or(member_path);
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "xml" => RecordShape::Markup,
            "tsv" => RecordShape::Delimited { delimiter: b'\t' },
            "csv" | "txt" | "dat" => RecordShape::Delimited {
                delimiter: default_delimiter,
            },
            _ if looks_like_markup(bytes) => RecordShape::Markup,
            _ => RecordShape::Unsupported,
        }
    }
}

/// Leading `<` after an optional BOM and whitespace.
fn looks_like_markup(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}

/// Parses members into records and tags them.
pub struct RecordExtractor {
    config: ExtractConfig,
    tagger: Tagger,
}

impl RecordExtractor {
    pub fn new(config: &ExtractConfig) -> Result<Self> {
        Ok(Self {
            tagger: Tagger::new(&config.tagging)?,
            config: config.clone(),
        })
    }

    /// First record of a member, if any.
    pub fn parse(&self, bytes: &[u8], member_path: &str) -> Option<Record> {
        self.parse_all(bytes, member_path).into_iter().next()
    }

    /// Shape [`parse_all`](Self::parse_all) would use for this member.
    pub fn shape_of(&self, bytes: &[u8], member_path: &str) -> RecordShape {
        let default_delimiter = u8::try_from(self.config.delimited.delimiter).unwrap_or(b',');
        RecordShape::infer(member_path, bytes, default_delimiter)
    }

    /// Every record of a member: one for markup, one per data row for
    /// delimited members. Empty when the member is unusable.
    pub fn parse_all(&self, bytes: &[u8], member_path: &str) -> Vec<Record> {
        let mut records = match self.shape_of(bytes, member_path) {
            RecordShape::Markup => markup::parse_document(bytes, member_path, &self.config.markup)
                .into_iter()
                .collect(),
            RecordShape::Delimited { delimiter } => {
                delimited::parse_rows(bytes, member_path, delimiter, &self.config.delimited)
            }
            RecordShape::Unsupported => {
                debug!(member = member_path, "unsupported member type");
                Vec::new()
            }
        };

        for record in &mut records {
            record.tags = self
                .tagger
                .tags(&record.sectors, record.description.as_deref());
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> RecordExtractor {
        RecordExtractor::new(&ExtractConfig::default()).unwrap()
    }

    #[test]
    fn shape_from_extension_and_content() {
        assert_eq!(RecordShape::infer("a.tar!/n.XML", b"", b','), RecordShape::Markup);
        assert_eq!(
            RecordShape::infer("a.tar!/r.tsv", b"", b','),
            RecordShape::Delimited { delimiter: b'\t' }
        );
        assert_eq!(
            RecordShape::infer("a.tar!/r.dat", b"", b';'),
            RecordShape::Delimited { delimiter: b';' }
        );
        assert_eq!(
            RecordShape::infer("a.tar!/notice.xml.gz", b"\xef\xbb\xbf  <Notice/>", b','),
            RecordShape::Markup
        );
        assert_eq!(RecordShape::infer("a.tar!/logo.png", b"\x89PNG", b','), RecordShape::Unsupported);
    }

    #[test]
    fn markup_records_are_tagged() {
        let doc = br#"<Notice><NoticeId>N-1</NoticeId>
            <ItemClassificationCode>32412100</ItemClassificationCode>
            <Description>Video surveillance for border posts</Description>
            <Contractor><Name>Acme</Name><IdentificationCode>CN</IdentificationCode></Contractor>
            </Notice>"#;
        let record = extractor().parse(doc, "a.tar!/n.xml").unwrap();
        assert_eq!(record.tags, vec!["surveillance", "telecom"]);
    }

    #[test]
    fn delimited_member_yields_one_record_per_row() {
        let data = "id,date,authority,country,party,party_country\nA,2024-01-01,X,DE,P1,CN\nB,2024-01-02,Y,FR,P2,US\n";
        let records = extractor().parse_all(data.as_bytes(), "a.tar!/rows.csv");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].record_id, "B");
        assert_eq!(records[1].parties[0].country_code.as_deref(), Some("US"));
    }

    #[test]
    fn garbage_yields_nothing() {
        let e = extractor();
        assert!(e.parse(b"<Notice><NoticeId>1", "a.tar!/n.xml").is_none());
        assert!(e.parse_all(b"\x00\x01\x02", "a.tar!/blob.bin").is_empty());
    }
}
