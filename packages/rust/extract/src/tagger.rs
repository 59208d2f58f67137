//! Technology tagging from sector codes and description keywords.

use std::collections::BTreeSet;

use regex::Regex;

use tenderwatch_shared::{Result, TaggingConfig, TenderwatchError};

/// Maps sector codes and free text to normalised technology tags.
pub struct Tagger {
    /// (digit prefix, tag), longest prefixes first.
    prefixes: Vec<(String, String)>,
    keywords: Vec<(Regex, String)>,
}

impl Tagger {
    pub fn new(config: &TaggingConfig) -> Result<Self> {
        let mut prefixes: Vec<(String, String)> = config
            .code_prefixes
            .iter()
            .map(|(p, t)| (digits(p), t.to_ascii_lowercase()))
            .filter(|(p, _)| !p.is_empty())
            .collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        let mut keywords = Vec::new();
        for (tag, words) in &config.keywords {
            for word in words {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(word.trim()));
                let re = Regex::new(&pattern).map_err(|e| {
                    TenderwatchError::config(format!("invalid tagging keyword '{word}': {e}"))
                })?;
                keywords.push((re, tag.to_ascii_lowercase()));
            }
        }

        Ok(Self { prefixes, keywords })
    }

    /// Lower-case, deduplicated, sorted tags for a record.
    pub fn tags(&self, sectors: &[String], description: Option<&str>) -> Vec<String> {
        let mut tags = BTreeSet::new();

        for sector in sectors {
            let code = digits(sector);
            for (prefix, tag) in &self.prefixes {
                if code.starts_with(prefix.as_str()) {
                    tags.insert(tag.clone());
                }
            }
        }

        if let Some(text) = description {
            for (re, tag) in &self.keywords {
                if re.is_match(text) {
                    tags.insert(tag.clone());
                }
            }
        }

        tags.into_iter().collect()
    }
}

/// CPV codes arrive as `32500000-0`; only the digits before the check digit matter.
fn digits(code: &str) -> String {
    code.split('-')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagger() -> Tagger {
        Tagger::new(&TaggingConfig::default()).unwrap()
    }

    #[test]
    fn cpv_prefixes_map_to_tags() {
        let tags = tagger().tags(&["32500000-0".into(), "48000000".into()], None);
        assert_eq!(tags, vec!["software", "telecom"]);
    }

    #[test]
    fn nested_prefixes_all_apply() {
        let tags = tagger().tags(&["35125000".into()], None);
        assert_eq!(tags, vec!["defense", "surveillance"]);
    }

    #[test]
    fn description_keywords_match_on_word_boundaries() {
        let t = tagger();
        let tags = t.tags(&[], Some("Supply of CCTV cameras and UAV spare parts"));
        assert_eq!(tags, vec!["drones", "surveillance"]);

        // "uav" inside another word must not match
        assert!(t.tags(&[], Some("guava juice")).is_empty());
    }

    #[test]
    fn tags_are_deduplicated() {
        let tags = tagger().tags(
            &["32000000".into(), "32400000".into()],
            Some("5G telecommunication network equipment"),
        );
        assert_eq!(tags, vec!["telecom"]);
    }
}
