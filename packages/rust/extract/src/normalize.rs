//! Value normalisation shared by the delimited and markup parsers.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Parse a monetary amount written with any common grouping convention:
/// `1,234,567.89`, `1.234.567,89`, `1 234 567`, `EUR 12,5`.
pub fn parse_amount(raw: &str) -> Option<f64> {
    // A minus anywhere ahead of the first digit, so currency prefixes keep the sign.
    let negative = raw
        .split(|c: char| c.is_ascii_digit())
        .next()
        .is_some_and(|prefix| prefix.contains('-'));
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(c), None) => {
            let digits_after = cleaned.len() - c - 1;
            if cleaned.matches(',').count() > 1 || digits_after == 3 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        (None, Some(_)) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})").expect("valid regex"));

static COMPACT_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})(\d{2})(\d{2})$").expect("valid regex"));

static DMY_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})[/.](\d{1,2})[/.](\d{4})$").expect("valid regex"));

/// Parse a date in ISO (optionally with time or offset suffix), compact
/// `YYYYMMDD`, or day-first `DD/MM/YYYY` form.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    let (y, m, d) = if let Some(c) = ISO_DATE_RE.captures(s) {
        (c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?)
    } else if let Some(c) = COMPACT_DATE_RE.captures(s) {
        (c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?)
    } else if let Some(c) = DMY_DATE_RE.captures(s) {
        (c[3].parse().ok()?, c[2].parse().ok()?, c[1].parse().ok()?)
    } else {
        return None;
    };
    NaiveDate::from_ymd_opt(y, m, d)
}

/// Upper-cased, trimmed country or currency code; `None` when blank.
pub fn normalize_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    (!code.is_empty()).then_some(code)
}

/// Collapse internal whitespace; `None` when blank.
pub fn clean_text(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// Stable record id for data without one: a truncated hash of the member
/// path (and row number for multi-row members).
pub fn fallback_record_id(member_path: &str, row: Option<usize>) -> String {
    let key = match row {
        Some(row) => format!("{member_path}#{row}"),
        None => member_path.to_string(),
    };
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    format!("h-{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_in_common_notations() {
        assert_eq!(parse_amount("1,234,567.89"), Some(1_234_567.89));
        assert_eq!(parse_amount("1.234.567,89"), Some(1_234_567.89));
        assert_eq!(parse_amount("1 234 567"), Some(1_234_567.0));
        assert_eq!(parse_amount("50000000"), Some(50_000_000.0));
        assert_eq!(parse_amount("EUR 12,5"), Some(12.5));
        assert_eq!(parse_amount("1,234"), Some(1_234.0));
        assert_eq!(parse_amount("1.5"), Some(1.5));
        assert_eq!(parse_amount("-200"), Some(-200.0));
        assert_eq!(parse_amount("EUR -200"), Some(-200.0));
        assert_eq!(parse_amount("-EUR 1.234,50"), Some(-1_234.5));
        assert_eq!(parse_amount("NOK 1-200"), Some(1_200.0));
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn dates_in_common_notations() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15);
        assert_eq!(parse_date("2024-01-15"), expected);
        assert_eq!(parse_date("2024-01-15+01:00"), expected);
        assert_eq!(parse_date("2024-01-15T10:00:00Z"), expected);
        assert_eq!(parse_date("20240115"), expected);
        assert_eq!(parse_date("15/01/2024"), expected);
        assert_eq!(parse_date("15.01.2024"), expected);
        assert_eq!(parse_date("2024-13-45"), None);
        assert_eq!(parse_date("soon"), None);
    }

    #[test]
    fn fallback_ids_are_stable_and_row_specific() {
        let a = fallback_record_id("a.tar!/x.csv", Some(1));
        assert_eq!(a, fallback_record_id("a.tar!/x.csv", Some(1)));
        assert_ne!(a, fallback_record_id("a.tar!/x.csv", Some(2)));
        assert!(a.starts_with("h-"));
        assert_eq!(a.len(), 18);
    }

    #[test]
    fn text_cleanup() {
        assert_eq!(clean_text("  Huawei \n Technologies  "), Some("Huawei Technologies".into()));
        assert_eq!(clean_text("   "), None);
        assert_eq!(normalize_code(" cn "), Some("CN".into()));
    }
}
