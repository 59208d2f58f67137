//! Markup (XML) record parsing.
//!
//! Lookups are by element local name, case-insensitive, so the same tag lists
//! serve namespaced eForms notices and legacy un-namespaced exports. Parties
//! and the contracting authority are read from their container elements;
//! record-level fields (id, value, date, sectors, description) are taken from
//! their first occurrence anywhere in the document.

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;

use tenderwatch_shared::{MarkupConfig, Party, PartyRole, Record};

use crate::normalize::{clean_text, fallback_record_id, normalize_code, parse_amount, parse_date};

/// Attributes that may carry a country or sector code on an empty element.
const CODE_ATTRIBUTES: [&str; 2] = ["value", "code"];

/// Parse one markup document into a record. `None` for malformed or
/// truncated documents and for documents with no recognised fields.
pub fn parse_document(bytes: &[u8], member_path: &str, config: &MarkupConfig) -> Option<Record> {
    let tags = TagSets::new(config);
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut state = DocumentState::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => state.open(&tags, &e),
            Ok(Event::Empty(e)) => {
                state.open(&tags, &e);
                state.close();
            }
            Ok(Event::End(_)) => state.close(),
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .unwrap_or_else(|_| Cow::Owned(String::from_utf8_lossy(&t).into_owned()));
                state.text(&tags, &text);
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c).into_owned();
                state.text(&tags, &text);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(
                    member = member_path,
                    position = reader.buffer_position(),
                    error = %e,
                    "malformed markup"
                );
                return None;
            }
        }
        buf.clear();
    }

    if !state.stack.is_empty() {
        debug!(member = member_path, open = state.stack.len(), "truncated markup");
        return None;
    }

    state.into_record(member_path)
}

/// Lower-cased tag lists for cheap membership checks.
struct TagSets {
    record_id: Vec<String>,
    authority_containers: Vec<String>,
    authority_name: Vec<String>,
    authority_country: Vec<String>,
    party_containers: Vec<String>,
    party_name: Vec<String>,
    party_country: Vec<String>,
    party_parent: Vec<String>,
    party_role: Vec<String>,
    value: Vec<String>,
    currency_attributes: Vec<String>,
    date: Vec<String>,
    sector: Vec<String>,
    description: Vec<String>,
}

fn lowered(list: &[String]) -> Vec<String> {
    list.iter().map(|s| s.to_ascii_lowercase()).collect()
}

impl TagSets {
    fn new(config: &MarkupConfig) -> Self {
        Self {
            record_id: lowered(&config.record_id),
            authority_containers: lowered(&config.authority_containers),
            authority_name: lowered(&config.authority_name),
            authority_country: lowered(&config.authority_country),
            party_containers: lowered(&config.party_containers),
            party_name: lowered(&config.party_name),
            party_country: lowered(&config.party_country),
            party_parent: lowered(&config.party_parent),
            party_role: lowered(&config.party_role),
            value: lowered(&config.value),
            currency_attributes: lowered(&config.currency_attributes),
            date: lowered(&config.date),
            sector: lowered(&config.sector),
            description: lowered(&config.description),
        }
    }
}

fn has(list: &[String], name: &str) -> bool {
    list.iter().any(|t| t == name)
}

#[derive(Default)]
struct PartyDraft {
    name: Option<String>,
    country: Option<String>,
    parent: Option<String>,
    role: Option<PartyRole>,
    default_role: Option<PartyRole>,
}

#[derive(Default)]
struct DocumentState {
    /// Lower-cased local names of open elements.
    stack: Vec<String>,
    /// Open party container and the stack depth it was opened at.
    party: Option<(usize, PartyDraft)>,
    /// Stack depth of the open authority container.
    authority_depth: Option<usize>,
    /// Currency attribute seen on the value element awaiting its text.
    pending_currency: Option<String>,

    record_id: Option<String>,
    authority_name: Option<String>,
    authority_country: Option<String>,
    parties: Vec<Party>,
    value: Option<f64>,
    currency: Option<String>,
    date: Option<chrono::NaiveDate>,
    sectors: Vec<String>,
    description: Option<String>,
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

impl DocumentState {
    fn open(&mut self, tags: &TagSets, e: &BytesStart<'_>) {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
        let attrs = attributes(e);
        self.stack.push(name.clone());
        let depth = self.stack.len();

        if self.party.is_none() && self.authority_depth.is_none() {
            if has(&tags.party_containers, &name) {
                let default_role = if name.starts_with("sub") {
                    PartyRole::Sub
                } else if name.contains("recipient") {
                    PartyRole::Recipient
                } else {
                    PartyRole::Prime
                };
                self.party = Some((
                    depth,
                    PartyDraft {
                        default_role: Some(default_role),
                        ..PartyDraft::default()
                    },
                ));
                return;
            }
            if has(&tags.authority_containers, &name) {
                self.authority_depth = Some(depth);
                return;
            }
        }

        let code_attr = attrs
            .iter()
            .find(|(k, _)| CODE_ATTRIBUTES.contains(&k.as_str()))
            .map(|(_, v)| v.clone());

        if has(&tags.value, &name) {
            self.pending_currency = attrs
                .iter()
                .find(|(k, _)| has(&tags.currency_attributes, k))
                .and_then(|(_, v)| normalize_code(v));
        }

        if let Some(code) = code_attr {
            if has(&tags.sector, &name) {
                self.sectors.push(code.trim().to_string());
            } else if let Some((_, party)) = self.party.as_mut() {
                if has(&tags.party_country, &name) {
                    set_once(&mut party.country, normalize_code(&code));
                }
            } else if self.authority_depth.is_some() && has(&tags.authority_country, &name) {
                set_once(&mut self.authority_country, normalize_code(&code));
            }
        }
    }

    fn close(&mut self) {
        let depth = self.stack.len();
        let closes_party = matches!(&self.party, Some((d, _)) if *d == depth);
        if closes_party {
            if let Some((_, draft)) = self.party.take() {
                if let Some(name) = draft.name {
                    self.parties.push(Party {
                        name,
                        country_code: draft.country,
                        parent_name: draft.parent,
                        role: draft
                            .role
                            .or(draft.default_role)
                            .unwrap_or(PartyRole::Prime),
                    });
                }
            }
        }
        if self.authority_depth == Some(depth) {
            self.authority_depth = None;
        }
        self.stack.pop();
    }

    fn text(&mut self, tags: &TagSets, text: &str) {
        let Some(name) = self.stack.last().cloned() else {
            return;
        };

        if let Some((_, party)) = self.party.as_mut() {
            if has(&tags.party_name, &name) {
                set_once(&mut party.name, clean_text(text));
                return;
            }
            if has(&tags.party_country, &name) {
                set_once(&mut party.country, normalize_code(text));
                return;
            }
            if has(&tags.party_parent, &name) {
                set_once(&mut party.parent, clean_text(text));
                return;
            }
            if has(&tags.party_role, &name) {
                set_once(&mut party.role, PartyRole::parse_lenient(text));
                return;
            }
        } else if self.authority_depth.is_some() {
            if has(&tags.authority_name, &name) {
                set_once(&mut self.authority_name, clean_text(text));
                return;
            }
            if has(&tags.authority_country, &name) {
                set_once(&mut self.authority_country, normalize_code(text));
                return;
            }
        }

        if has(&tags.record_id, &name) {
            set_once(&mut self.record_id, clean_text(text));
        } else if has(&tags.value, &name) {
            if self.value.is_none() {
                if let Some(amount) = parse_amount(text) {
                    self.value = Some(amount);
                    self.currency = self.pending_currency.take();
                }
            }
        } else if has(&tags.date, &name) {
            set_once(&mut self.date, parse_date(text));
        } else if has(&tags.sector, &name) {
            if let Some(code) = clean_text(text) {
                self.sectors.push(code);
            }
        } else if has(&tags.description, &name) {
            set_once(&mut self.description, clean_text(text));
        }
    }

    fn into_record(self, member_path: &str) -> Option<Record> {
        let recognised = self.record_id.is_some()
            || self.authority_name.is_some()
            || !self.parties.is_empty()
            || self.value.is_some();
        if !recognised {
            debug!(member = member_path, "markup has no recognised record fields");
            return None;
        }

        let mut sectors = self.sectors;
        sectors.dedup();

        Some(Record {
            record_id: self
                .record_id
                .unwrap_or_else(|| fallback_record_id(member_path, None)),
            authority_name: self.authority_name,
            authority_jurisdiction: self.authority_country,
            parties: self.parties,
            value: self.value,
            currency: self.currency,
            date: self.date,
            sectors,
            tags: Vec::new(),
            description: self.description,
            member_path: member_path.to_string(),
        })
    }
}

/// Attributes as (lower-cased local key, unescaped value). Broken attributes are skipped.
fn attributes(e: &BytesStart<'_>) -> Vec<(String, String)> {
    e.attributes()
        .filter_map(|a| a.ok())
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.local_name().as_ref()).to_ascii_lowercase();
            let value = a
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
            (key, value)
        })
        .collect()
}
