//! Core domain types: records, parties, classifications, detections.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Current schema version for the checkpoint and report formats.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Separator between nesting levels in a qualified member path.
pub const MEMBER_PATH_SEPARATOR: &str = "!/";

// ---------------------------------------------------------------------------
// Origin / Confidence
// ---------------------------------------------------------------------------

/// Geographic origin of a counterparty.
///
/// Taiwan, HongKong and Macao are tracked separately from PRC and must never
/// be folded into PRC aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Origin {
    #[serde(rename = "PRC")]
    Prc,
    Taiwan,
    HongKong,
    Macao,
    Other,
    Unknown,
}

impl Origin {
    pub const ALL: [Origin; 6] = [
        Origin::Prc,
        Origin::Taiwan,
        Origin::HongKong,
        Origin::Macao,
        Origin::Other,
        Origin::Unknown,
    ];

    /// Map an ISO 3166 alpha-2 or alpha-3 code to a tracked origin.
    /// Returns `None` for every code outside the tracked set.
    pub fn from_country_code(code: &str) -> Option<Origin> {
        match code.trim().to_ascii_uppercase().as_str() {
            "CN" | "CHN" => Some(Origin::Prc),
            "TW" | "TWN" => Some(Origin::Taiwan),
            "HK" | "HKG" => Some(Origin::HongKong),
            "MO" | "MAC" => Some(Origin::Macao),
            _ => None,
        }
    }

    /// PRC, Taiwan, HongKong or Macao.
    pub fn is_tracked(self) -> bool {
        matches!(
            self,
            Origin::Prc | Origin::Taiwan | Origin::HongKong | Origin::Macao
        )
    }

    /// Severity rank used to pick the "most severe" origin on a record.
    pub fn severity(self) -> u8 {
        match self {
            Origin::Prc => 5,
            Origin::HongKong => 4,
            Origin::Macao => 3,
            Origin::Taiwan => 2,
            Origin::Unknown => 1,
            Origin::Other => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Prc => "PRC",
            Origin::Taiwan => "Taiwan",
            Origin::HongKong => "HongKong",
            Origin::Macao => "Macao",
            Origin::Other => "Other",
            Origin::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prc" | "china" => Ok(Origin::Prc),
            "taiwan" => Ok(Origin::Taiwan),
            "hongkong" | "hong_kong" | "hong-kong" => Ok(Origin::HongKong),
            "macao" | "macau" => Ok(Origin::Macao),
            "other" => Ok(Origin::Other),
            "unknown" => Ok(Origin::Unknown),
            other => Err(format!("unknown origin '{other}'")),
        }
    }
}

/// Confidence tier, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
    NeedsReview,
    Low,
    Medium,
    High,
    Verified,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::NeedsReview => "NeedsReview",
            Confidence::Low => "Low",
            Confidence::Medium => "Medium",
            Confidence::High => "High",
            Confidence::Verified => "Verified",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "needsreview" | "needs_review" | "needs-review" => Ok(Confidence::NeedsReview),
            "low" => Ok(Confidence::Low),
            "medium" => Ok(Confidence::Medium),
            "high" => Ok(Confidence::High),
            "verified" => Ok(Confidence::Verified),
            other => Err(format!("unknown confidence tier '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Record / Party
// ---------------------------------------------------------------------------

/// Role a party plays on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Prime,
    Sub,
    Recipient,
}

impl PartyRole {
    /// Lenient parse of free-form role labels found in source data.
    pub fn parse_lenient(s: &str) -> Option<PartyRole> {
        let lower = s.trim().to_ascii_lowercase();
        if lower.is_empty() {
            return None;
        }
        if lower.starts_with("sub") {
            Some(PartyRole::Sub)
        } else if lower.contains("recipient") || lower.contains("beneficiar") {
            Some(PartyRole::Recipient)
        } else if lower.contains("prime")
            || lower.contains("contractor")
            || lower.contains("winner")
            || lower.contains("lead")
        {
            Some(PartyRole::Prime)
        } else {
            None
        }
    }
}

/// A named counterparty on a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    pub role: PartyRole,
}

/// One typed record extracted from a single archive member (or one row of it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier taken from the data, or a stable hash of the member path.
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_name: Option<String>,
    /// ISO country code of the contracting authority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_jurisdiction: Option<String>,
    pub parties: Vec<Party>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    /// Raw classification codes (e.g., CPV).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sectors: Vec<String>,
    /// Normalized sector/technology tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Qualified member path the record was read from.
    pub member_path: String,
}

impl Record {
    /// Jurisdiction label used for grouping; `"unknown"` when absent.
    pub fn jurisdiction_label(&self) -> String {
        self.authority_jurisdiction
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

// ---------------------------------------------------------------------------
// Classification / Risk
// ---------------------------------------------------------------------------

/// Output of the entity classifier. Never mutated once produced
/// (manual corrections replace it wholesale).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub origin: Origin,
    pub confidence: Confidence,
    /// Human-readable concatenation of every rule that fired.
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub verification_required: bool,
    /// Id of the rule table entry that decided the origin, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Set when name signals pointed at more than one origin.
    #[serde(default)]
    pub ambiguous: bool,
}

/// Categorical risk level, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    /// One level up, capped at `Critical`.
    pub fn raise(self) -> RiskLevel {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }

    /// 1-based weight used by severity indices.
    pub fn weight(self) -> u32 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
            RiskLevel::Critical => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Critical => "Critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level '{other}'")),
        }
    }
}

/// A risk level together with the factors that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub factors: Vec<String>,
}

/// Low-confidence "manufactured in X" signal read from free text.
/// Kept apart from the primary classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodsOriginSignal {
    pub origin: Origin,
    pub confidence: Confidence,
    pub fragment: String,
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Everything an analyst needs to reach the exact source bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationLocator {
    pub archive_path: String,
    pub member_path: String,
    /// Text fragment that matched (usually the party name as it appears).
    pub fragment: String,
}

/// The atomic persisted unit: one resolved (record, party, classification, risk).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Stable key: `record_id#party_index`.
    pub id: String,
    pub archive_id: String,
    pub record: Record,
    pub party_index: usize,
    pub classification: Classification,
    pub risk: RiskAssessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goods_origin: Option<GoodsOriginSignal>,
    pub locator: VerificationLocator,
}

impl Detection {
    /// Build the stable detection key for a record and party index.
    pub fn stable_id(record_id: &str, party_index: usize) -> String {
        format!("{record_id}#{party_index}")
    }

    /// The party this detection is about.
    pub fn party(&self) -> Option<&Party> {
        self.record.parties.get(self.party_index)
    }
}
