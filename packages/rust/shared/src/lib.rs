//! Shared types, error model, and configuration for tenderwatch.
//!
//! This crate is the foundation depended on by all other tenderwatch crates.
//! It provides:
//! - [`TenderwatchError`] — the unified error type and [`ErrorCategory`] taxonomy
//! - Domain types ([`Record`], [`Party`], [`Classification`], [`Detection`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ArchiveConfig, BaseLevels, ClassifyConfig, ColumnMapping, DefaultsConfig,
    DelimitedConfig, DelimitedField, ExtractConfig, MarkupConfig, PatternConfig, ReportConfig,
    RiskConfig, RunConfig, TaggingConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, validate_config,
};
pub use error::{ErrorCategory, Result, TenderwatchError};
pub use types::{
    CURRENT_SCHEMA_VERSION, Classification, Confidence, Detection, GoodsOriginSignal,
    MEMBER_PATH_SEPARATOR, Origin, Party, PartyRole, Record, RiskAssessment, RiskLevel,
    VerificationLocator,
};
