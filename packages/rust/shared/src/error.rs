//! Error types for tenderwatch.
//!
//! Library crates use [`TenderwatchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all tenderwatch operations.
#[derive(Debug, thiserror::Error)]
pub enum TenderwatchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The outer container of an archive could not be opened or its stream broke.
    /// Fatal for that archive only; it is retried on the next run.
    #[error("archive unreadable: {path:?}: {reason}")]
    ArchiveUnreadable { path: PathBuf, reason: String },

    /// A single member inside an archive could not be read or decoded.
    #[error("member corrupt: {archive:?} :: {member}: {reason}")]
    MemberCorrupt {
        archive: PathBuf,
        member: String,
        reason: String,
    },

    /// The checkpoint file exists but cannot be trusted. Fatal for the whole run.
    #[error("checkpoint corrupt at {path:?}: {reason} (rebuild with `tenderwatch checkpoint rebuild --confirm`)")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// Persisting an archive's detections failed. The archive stays unprocessed.
    #[error("detection store write failed for archive {archive_id}: {reason}")]
    DetectionStoreWrite { archive_id: String, reason: String },

    /// Record or rule parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TenderwatchError>;

impl TenderwatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn archive_unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ArchiveUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn checkpoint_corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The reporting category of this error, if it belongs to the run taxonomy.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::ArchiveUnreadable { .. } => Some(ErrorCategory::ArchiveUnreadable),
            Self::MemberCorrupt { .. } => Some(ErrorCategory::MemberCorrupt),
            Self::CheckpointCorrupt { .. } => Some(ErrorCategory::CheckpointCorrupt),
            Self::DetectionStoreWrite { .. } => Some(ErrorCategory::DetectionStoreWriteFailure),
            _ => None,
        }
    }
}

/// Error taxonomy used in the end-of-run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ArchiveUnreadable,
    MemberCorrupt,
    /// Never fatal: always resolved to `Unknown`/`NeedsReview`.
    ClassificationAmbiguous,
    CheckpointCorrupt,
    DetectionStoreWriteFailure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ArchiveUnreadable => "archive_unreadable",
            Self::MemberCorrupt => "member_corrupt",
            Self::ClassificationAmbiguous => "classification_ambiguous",
            Self::CheckpointCorrupt => "checkpoint_corrupt",
            Self::DetectionStoreWriteFailure => "detection_store_write_failure",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = TenderwatchError::config("missing input_dir");
        assert_eq!(err.to_string(), "config error: missing input_dir");

        let err = TenderwatchError::validation("schema_version 99 not supported");
        assert!(err.to_string().contains("schema_version 99"));
    }

    #[test]
    fn checkpoint_corrupt_mentions_rebuild() {
        let err = TenderwatchError::checkpoint_corrupt("/tmp/cp.json", "checksum mismatch");
        let msg = err.to_string();
        assert!(msg.contains("checksum mismatch"));
        assert!(msg.contains("--confirm"));
        assert_eq!(err.category(), Some(ErrorCategory::CheckpointCorrupt));
    }

    #[test]
    fn ambient_errors_have_no_category() {
        assert_eq!(TenderwatchError::parse("x").category(), None);
        assert_eq!(TenderwatchError::Storage("x".into()).category(), None);
    }
}
