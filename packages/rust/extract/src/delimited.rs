//! Delimited (CSV/TSV) record parsing driven by a configurable column map.

use csv::{ByteRecord, ReaderBuilder};
use tracing::debug;

use tenderwatch_shared::{DelimitedConfig, DelimitedField, Party, PartyRole, Record};

use crate::normalize::{clean_text, fallback_record_id, normalize_code, parse_amount, parse_date};

/// Parse every data row of a delimited member. Rows that fail to decode or
/// carry no mapped values are skipped.
pub fn parse_rows(
    bytes: &[u8],
    member_path: &str,
    delimiter: u8,
    config: &DelimitedConfig,
) -> Vec<Record> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(config.has_header)
        .flexible(true)
        .from_reader(bytes);

    let mut records = Vec::new();
    let mut row = ByteRecord::new();
    let mut index = 0usize;

    loop {
        match reader.read_byte_record(&mut row) {
            Ok(true) => {
                index += 1;
                if let Some(record) = row_to_record(&row, member_path, index, config) {
                    records.push(record);
                }
            }
            Ok(false) => break,
            Err(e) => {
                debug!(member = member_path, row = index + 1, error = %e, "unreadable delimited row");
                // A malformed row leaves the reader usable; an I/O level
                // failure would repeat forever.
                if e.is_io_error() {
                    break;
                }
                index += 1;
            }
        }
    }

    debug!(member = member_path, rows = index, records = records.len(), "parsed delimited member");
    records
}

/// Party columns seen in one row, in occurrence order.
#[derive(Default)]
struct PartyColumns {
    names: Vec<Option<String>>,
    countries: Vec<Option<String>>,
    parents: Vec<Option<String>>,
    roles: Vec<Option<String>>,
}

impl PartyColumns {
    fn into_parties(self) -> Vec<Party> {
        let Self {
            names,
            countries,
            parents,
            roles,
        } = self;

        names
            .into_iter()
            .enumerate()
            .filter_map(|(i, name)| {
                let name = name?;
                let role = roles
                    .get(i)
                    .and_then(|r| r.as_deref())
                    .and_then(PartyRole::parse_lenient)
                    .unwrap_or(PartyRole::Prime);
                Some(Party {
                    name,
                    country_code: countries.get(i).cloned().flatten(),
                    parent_name: parents.get(i).cloned().flatten(),
                    role,
                })
            })
            .collect()
    }
}

fn row_to_record(
    row: &ByteRecord,
    member_path: &str,
    index: usize,
    config: &DelimitedConfig,
) -> Option<Record> {
    let mut record_id = None;
    let mut authority_name = None;
    let mut authority_jurisdiction = None;
    let mut value = None;
    let mut currency = None;
    let mut date = None;
    let mut sectors = Vec::new();
    let mut description = None;
    let mut party_cols = PartyColumns::default();
    let mut any = false;

    for mapping in &config.columns {
        let cell = row
            .get(mapping.index)
            .map(|b| String::from_utf8_lossy(b).trim().to_string())
            .filter(|s| !s.is_empty());
        any |= cell.is_some();

        match mapping.field {
            DelimitedField::RecordId => record_id = record_id.or(cell),
            DelimitedField::AuthorityName => {
                authority_name = authority_name.or(cell.as_deref().and_then(clean_text));
            }
            DelimitedField::AuthorityCountry => {
                authority_jurisdiction =
                    authority_jurisdiction.or(cell.as_deref().and_then(normalize_code));
            }
            DelimitedField::PartyName => {
                party_cols.names.push(cell.as_deref().and_then(clean_text));
            }
            DelimitedField::PartyCountry => {
                party_cols.countries.push(cell.as_deref().and_then(normalize_code));
            }
            DelimitedField::PartyParent => {
                party_cols.parents.push(cell.as_deref().and_then(clean_text));
            }
            DelimitedField::PartyRole => party_cols.roles.push(cell),
            DelimitedField::Value => value = value.or(cell.as_deref().and_then(parse_amount)),
            DelimitedField::Currency => {
                currency = currency.or(cell.as_deref().and_then(normalize_code));
            }
            DelimitedField::Date => date = date.or(cell.as_deref().and_then(parse_date)),
            DelimitedField::Sector => {
                if let Some(cell) = cell {
                    sectors.extend(
                        cell.split([';', '|'])
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                    );
                }
            }
            DelimitedField::Description => {
                description = description.or(cell.as_deref().and_then(clean_text));
            }
        }
    }

    if !any {
        return None;
    }

    Some(Record {
        record_id: record_id.unwrap_or_else(|| fallback_record_id(member_path, Some(index))),
        authority_name,
        authority_jurisdiction,
        parties: party_cols.into_parties(),
        value,
        currency,
        date,
        sectors,
        tags: Vec::new(),
        description,
        member_path: member_path.to_string(),
    })
}
