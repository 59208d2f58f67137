//! Application configuration for tenderwatch.
//!
//! User config lives at `~/.tenderwatch/tenderwatch.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TenderwatchError};
use crate::types::RiskLevel;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "tenderwatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".tenderwatch";

// ---------------------------------------------------------------------------
// Config structs (matching tenderwatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Archive walking limits.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Record extraction (delimited + markup field maps, tagging tables).
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Entity classifier.
    #[serde(default)]
    pub classify: ClassifyConfig,

    /// Risk scorer.
    #[serde(default)]
    pub risk: RiskConfig,

    /// Pattern detection thresholds and regions.
    #[serde(default)]
    pub patterns: PatternConfig,

    /// Aggregation/report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory holding the pre-downloaded archives.
    #[serde(default = "default_input_dir")]
    pub input_dir: String,

    /// Directory for `checkpoint.json` and `detections.db`.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Directory for the report tree.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Archives processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            state_dir: default_state_dir(),
            output_dir: default_output_dir(),
            workers: default_workers(),
        }
    }
}

fn default_input_dir() -> String {
    "data/archives".into()
}
fn default_state_dir() -> String {
    "var/state".into()
}
fn default_output_dir() -> String {
    "var/reports".into()
}
fn default_workers() -> u32 {
    4
}

/// `[archive]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Maximum container nesting depth (outer archive is depth 0).
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Members larger than this are reported as corrupt instead of read.
    #[serde(default = "default_max_member_bytes")]
    pub max_member_bytes: u64,

    /// File suffixes marking incomplete downloads; never picked up as input.
    #[serde(default = "default_ignore_suffixes")]
    pub ignore_suffixes: Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_member_bytes: default_max_member_bytes(),
            ignore_suffixes: default_ignore_suffixes(),
        }
    }
}

fn default_max_depth() -> u32 {
    8
}
fn default_max_member_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_ignore_suffixes() -> Vec<String> {
    vec![".part".into(), ".tmp".into(), ".crdownload".into()]
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// `[extract]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractConfig {
    #[serde(default)]
    pub delimited: DelimitedConfig,

    #[serde(default)]
    pub markup: MarkupConfig,

    #[serde(default)]
    pub tagging: TaggingConfig,
}

/// Field a delimited column feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelimitedField {
    RecordId,
    AuthorityName,
    AuthorityCountry,
    PartyName,
    PartyCountry,
    PartyParent,
    PartyRole,
    Value,
    Currency,
    Date,
    Sector,
    Description,
}

/// One `[[extract.delimited.columns]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Zero-based column index.
    pub index: usize,
    pub field: DelimitedField,
}

/// `[extract.delimited]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelimitedConfig {
    /// Field delimiter. `.tsv` members always use a tab.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Whether the first row is a header.
    #[serde(default = "default_true")]
    pub has_header: bool,

    /// Column index → field map. Repeated party fields pair up by order.
    #[serde(default = "default_columns")]
    pub columns: Vec<ColumnMapping>,
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            has_header: true,
            columns: default_columns(),
        }
    }
}

fn default_delimiter() -> char {
    ','
}
fn default_true() -> bool {
    true
}
fn default_columns() -> Vec<ColumnMapping> {
    use DelimitedField::*;
    [
        RecordId,
        Date,
        AuthorityName,
        AuthorityCountry,
        PartyName,
        PartyCountry,
        PartyParent,
        Value,
        Currency,
        Sector,
        Description,
    ]
    .into_iter()
    .enumerate()
    .map(|(index, field)| ColumnMapping { index, field })
    .collect()
}

/// `[extract.markup]` section. Every entry is a list of element local names
/// (namespace prefixes are ignored, matching is case-insensitive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkupConfig {
    #[serde(default = "default_record_id_tags")]
    pub record_id: Vec<String>,
    #[serde(default = "default_authority_containers")]
    pub authority_containers: Vec<String>,
    #[serde(default = "default_name_tags")]
    pub authority_name: Vec<String>,
    #[serde(default = "default_country_tags")]
    pub authority_country: Vec<String>,
    #[serde(default = "default_party_containers")]
    pub party_containers: Vec<String>,
    #[serde(default = "default_name_tags")]
    pub party_name: Vec<String>,
    #[serde(default = "default_country_tags")]
    pub party_country: Vec<String>,
    #[serde(default = "default_parent_tags")]
    pub party_parent: Vec<String>,
    #[serde(default = "default_role_tags")]
    pub party_role: Vec<String>,
    #[serde(default = "default_value_tags")]
    pub value: Vec<String>,
    /// Attributes carrying the currency on value elements.
    #[serde(default = "default_currency_attributes")]
    pub currency_attributes: Vec<String>,
    #[serde(default = "default_date_tags")]
    pub date: Vec<String>,
    #[serde(default = "default_sector_tags")]
    pub sector: Vec<String>,
    #[serde(default = "default_description_tags")]
    pub description: Vec<String>,
}

impl Default for MarkupConfig {
    fn default() -> Self {
        Self {
            record_id: default_record_id_tags(),
            authority_containers: default_authority_containers(),
            authority_name: default_name_tags(),
            authority_country: default_country_tags(),
            party_containers: default_party_containers(),
            party_name: default_name_tags(),
            party_country: default_country_tags(),
            party_parent: default_parent_tags(),
            party_role: default_role_tags(),
            value: default_value_tags(),
            currency_attributes: default_currency_attributes(),
            date: default_date_tags(),
            sector: default_sector_tags(),
            description: default_description_tags(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn default_record_id_tags() -> Vec<String> {
    strings(&["NoticeId", "NoticePublicationID", "NO_DOC_OJS", "RecordId", "AwardId"])
}
fn default_authority_containers() -> Vec<String> {
    strings(&[
        "ContractingParty",
        "ContractingAuthority",
        "ADDRESS_CONTRACTING_BODY",
        "CONTRACTING_BODY",
        "AwardingAgency",
        "Buyer",
    ])
}
fn default_name_tags() -> Vec<String> {
    strings(&["Name", "OFFICIALNAME", "OfficialName", "RegistrationName"])
}
fn default_country_tags() -> Vec<String> {
    strings(&["IdentificationCode", "COUNTRY", "CountryCode", "Country"])
}
fn default_party_containers() -> Vec<String> {
    strings(&[
        "Contractor",
        "WinningTenderer",
        "Winner",
        "Tenderer",
        "ADDRESS_CONTRACTOR",
        "Recipient",
        "Subcontractor",
    ])
}
fn default_parent_tags() -> Vec<String> {
    strings(&["ParentName", "UltimateParentName", "ParentCompany"])
}
fn default_role_tags() -> Vec<String> {
    strings(&["Role", "PartyRole"])
}
fn default_value_tags() -> Vec<String> {
    strings(&["TotalAmount", "VAL_TOTAL", "PayableAmount", "AwardAmount", "Value"])
}
fn default_currency_attributes() -> Vec<String> {
    strings(&["currencyID", "CURRENCY", "currency"])
}
fn default_date_tags() -> Vec<String> {
    strings(&["IssueDate", "DATE_PUB", "DATE_CONCLUSION_CONTRACT", "AwardDate", "ActionDate"])
}
fn default_sector_tags() -> Vec<String> {
    strings(&["ItemClassificationCode", "CPV_CODE", "NaicsCode", "Sector"])
}
fn default_description_tags() -> Vec<String> {
    strings(&["Description", "SHORT_DESCR", "TITLE", "Title"])
}

/// `[extract.tagging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggingConfig {
    /// Sector-code prefix → technology tag.
    #[serde(default = "default_code_prefixes")]
    pub code_prefixes: BTreeMap<String, String>,

    /// Technology tag → description keywords.
    #[serde(default = "default_keywords")]
    pub keywords: BTreeMap<String, Vec<String>>,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            code_prefixes: default_code_prefixes(),
            keywords: default_keywords(),
        }
    }
}

fn default_code_prefixes() -> BTreeMap<String, String> {
    [
        ("32", "telecom"),
        ("3171", "semiconductors"),
        ("3172", "semiconductors"),
        ("35", "defense"),
        ("3512", "surveillance"),
        ("38", "instruments"),
        ("48", "software"),
        ("0912", "nuclear"),
        ("7652", "nuclear"),
        ("3441", "drones"),
        ("7231", "data_processing"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_keywords() -> BTreeMap<String, Vec<String>> {
    [
        ("telecom", vec!["telecommunication", "5g", "radio access", "network equipment", "fibre optic"]),
        ("surveillance", vec!["cctv", "video surveillance", "facial recognition", "body scanner"]),
        ("nuclear", vec!["nuclear", "radioactive", "reactor"]),
        ("quantum", vec!["quantum"]),
        ("semiconductors", vec!["semiconductor", "microchip", "integrated circuit"]),
        ("drones", vec!["drone", "unmanned aerial", "uav"]),
        ("energy_grid", vec!["smart meter", "inverter", "grid control"]),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), strings(&v)))
    .collect()
}

// ---------------------------------------------------------------------------
// Classification / risk / patterns / report
// ---------------------------------------------------------------------------

/// `[classify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyConfig {
    /// Optional external rule table (TOML). Embedded defaults when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<String>,

    /// Values above this set `verification_required`.
    #[serde(default = "default_high_value")]
    pub high_value_threshold: f64,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            high_value_threshold: default_high_value(),
        }
    }
}

fn default_high_value() -> f64 {
    10_000_000.0
}

/// Base risk level per origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseLevels {
    #[serde(default = "medium")]
    pub prc: RiskLevel,
    #[serde(default = "medium")]
    pub hong_kong: RiskLevel,
    #[serde(default = "low")]
    pub macao: RiskLevel,
    #[serde(default = "low")]
    pub taiwan: RiskLevel,
    #[serde(default = "low")]
    pub unknown: RiskLevel,
    #[serde(default = "low")]
    pub other: RiskLevel,
}

impl Default for BaseLevels {
    fn default() -> Self {
        Self {
            prc: RiskLevel::Medium,
            hong_kong: RiskLevel::Medium,
            macao: RiskLevel::Low,
            taiwan: RiskLevel::Low,
            unknown: RiskLevel::Low,
            other: RiskLevel::Low,
        }
    }
}

fn medium() -> RiskLevel {
    RiskLevel::Medium
}
fn low() -> RiskLevel {
    RiskLevel::Low
}

/// `[risk]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub base_levels: BaseLevels,

    /// Tags that raise the level by one.
    #[serde(default = "default_sensitive_technologies")]
    pub sensitive_technologies: Vec<String>,

    /// Authority-name keywords that raise the level by one.
    #[serde(default = "default_sensitive_authorities")]
    pub sensitive_authority_keywords: Vec<String>,

    /// Values above this raise the level by one.
    #[serde(default = "default_high_value")]
    pub high_value_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            base_levels: BaseLevels::default(),
            sensitive_technologies: default_sensitive_technologies(),
            sensitive_authority_keywords: default_sensitive_authorities(),
            high_value_threshold: default_high_value(),
        }
    }
}

fn default_sensitive_technologies() -> Vec<String> {
    strings(&[
        "telecom",
        "nuclear",
        "surveillance",
        "quantum",
        "semiconductors",
        "defense",
        "drones",
        "energy_grid",
    ])
}
fn default_sensitive_authorities() -> Vec<String> {
    strings(&[
        "defence", "defense", "ministry", "nuclear", "armed forces", "police", "intelligence",
    ])
}

/// `[patterns]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Minimum jurisdictions per entity for market-division candidates.
    #[serde(default = "default_min_jurisdictions")]
    pub market_division_min_jurisdictions: usize,

    /// Detections in the first/last window of the stepping-stone check.
    #[serde(default = "default_window")]
    pub stepping_stone_window: usize,

    /// Required growth multiple between first and last window means.
    #[serde(default = "default_multiple")]
    pub stepping_stone_multiple: f64,

    /// Region name → member jurisdiction codes.
    #[serde(default = "default_regions")]
    pub regions: BTreeMap<String, Vec<String>>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            market_division_min_jurisdictions: default_min_jurisdictions(),
            stepping_stone_window: default_window(),
            stepping_stone_multiple: default_multiple(),
            regions: default_regions(),
        }
    }
}

fn default_min_jurisdictions() -> usize {
    3
}
fn default_window() -> usize {
    3
}
fn default_multiple() -> f64 {
    2.0
}
fn default_regions() -> BTreeMap<String, Vec<String>> {
    [
        ("western_europe", vec!["AT", "BE", "CH", "DE", "FR", "IE", "LI", "LU", "NL", "UK", "GB"]),
        ("nordics", vec!["DK", "FI", "IS", "NO", "SE"]),
        ("southern_europe", vec!["CY", "ES", "GR", "EL", "IT", "MT", "PT"]),
        ("central_eastern_europe", vec!["BG", "CZ", "EE", "HR", "HU", "LT", "LV", "PL", "RO", "SI", "SK"]),
        ("north_america", vec!["US", "CA"]),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), strings(&v)))
    .collect()
}

/// `[report]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Entities listed per jurisdiction summary.
    #[serde(default = "default_top_entities")]
    pub top_entities: usize,

    /// Ranking weight of the penetration rate.
    #[serde(default = "default_penetration_weight")]
    pub penetration_weight: f64,

    /// Ranking weight of the severity index.
    #[serde(default = "default_severity_weight")]
    pub severity_weight: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            top_entities: default_top_entities(),
            penetration_weight: default_penetration_weight(),
            severity_weight: default_severity_weight(),
        }
    }
}

fn default_top_entities() -> usize {
    10
}
fn default_penetration_weight() -> f64 {
    0.6
}
fn default_severity_weight() -> f64 {
    0.4
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root directory holding input archives.
    pub input_dir: PathBuf,
    /// Directory for checkpoint and detection store.
    pub state_dir: PathBuf,
    /// Directory for the report tree.
    pub output_dir: PathBuf,
    /// Concurrent archive workers.
    pub workers: usize,
    pub archive: ArchiveConfig,
    pub extract: ExtractConfig,
}

impl RunConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join("detections.db")
    }
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            input_dir: PathBuf::from(&config.defaults.input_dir),
            state_dir: PathBuf::from(&config.defaults.state_dir),
            output_dir: PathBuf::from(&config.defaults.output_dir),
            workers: config.defaults.workers.max(1) as usize,
            archive: config.archive.clone(),
            extract: config.extract.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.tenderwatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TenderwatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.tenderwatch/tenderwatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TenderwatchError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        TenderwatchError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject configurations the pipeline cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.patterns.stepping_stone_window == 0 {
        return Err(TenderwatchError::config(
            "patterns.stepping_stone_window must be at least 1",
        ));
    }
    if config.patterns.stepping_stone_multiple <= 0.0 {
        return Err(TenderwatchError::config(
            "patterns.stepping_stone_multiple must be positive",
        ));
    }
    if config.report.penetration_weight < 0.0 || config.report.severity_weight < 0.0 {
        return Err(TenderwatchError::config("report weights must be non-negative"));
    }
    if config.archive.max_depth == 0 {
        return Err(TenderwatchError::config("archive.max_depth must be at least 1"));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TenderwatchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TenderwatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TenderwatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("input_dir"));
        assert!(toml_str.contains("high_value_threshold"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.patterns.market_division_min_jurisdictions, 3);
        assert_eq!(parsed.extract.delimited.columns.len(), 11);
        assert_eq!(parsed.risk.base_levels.prc, RiskLevel::Medium);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
input_dir = "/srv/archives"

[extract.delimited]
delimiter = ";"

[[extract.delimited.columns]]
index = 0
field = "record_id"

[[extract.delimited.columns]]
index = 3
field = "party_name"

[patterns]
stepping_stone_multiple = 3.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.input_dir, "/srv/archives");
        assert_eq!(config.defaults.workers, 4);
        assert_eq!(config.extract.delimited.delimiter, ';');
        assert_eq!(config.extract.delimited.columns.len(), 2);
        assert_eq!(
            config.extract.delimited.columns[1].field,
            DelimitedField::PartyName
        );
        assert_eq!(config.patterns.stepping_stone_multiple, 3.0);
        assert_eq!(config.patterns.stepping_stone_window, 3);
        assert!(config.extract.markup.party_containers.contains(&"Contractor".to_string()));
    }

    #[test]
    fn run_config_from_app_config() {
        let app = AppConfig::default();
        let run = RunConfig::from(&app);
        assert_eq!(run.workers, 4);
        assert_eq!(run.checkpoint_path(), PathBuf::from("var/state/checkpoint.json"));
        assert_eq!(run.store_path(), PathBuf::from("var/state/detections.db"));
    }

    #[test]
    fn invalid_window_rejected() {
        let mut config = AppConfig::default();
        config.patterns.stepping_stone_window = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("stepping_stone_window"));
    }
}
