//! Error types and exit codes for symdex-engine

use std::process::ExitCode;
use thiserror::Error;

/// Main error type for symdex-engine operations
///
/// The variant set is closed: every failure the engine can surface maps to
/// exactly one of these kinds, and `kind()` yields the stable wire name
/// used in API error payloads.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Manifest error: {message}")]
    Manifest { message: String },

    #[error("Extractor unavailable: {message}")]
    ExtractorUnavailable { message: String },

    #[error("Extractor timed out after {seconds}s: {file_key}")]
    ExtractorTimeout { file_key: String, seconds: u64 },

    #[error("Parse failed for {file_key}: {message}")]
    ParseFailed { file_key: String, message: String },

    #[error("No compile flags for {file_key}")]
    MissingFlags { file_key: String },

    #[error("Overlay cap exceeded for context {context_id}: {message}")]
    OverlayCapExceeded { context_id: String, message: String },

    #[error("Parse budget exceeded: {message}")]
    BudgetExceeded { message: String },

    #[error("Write contention: {message}")]
    WriteContention { message: String },

    #[error("Store corrupt: {message}")]
    StoreCorrupt { message: String },

    #[error("Sync auth failed for {repo_id}: {message}")]
    SyncAuthFailed { repo_id: String, message: String },

    #[error("Sync checkout failed for {repo_id}: {message}")]
    SyncCheckoutFailed { repo_id: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable wire name for this error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Manifest { .. } => "manifest_error",
            Self::ExtractorUnavailable { .. } => "extractor_unavailable",
            Self::ExtractorTimeout { .. } => "extractor_timeout",
            Self::ParseFailed { .. } => "parse_failed",
            Self::MissingFlags { .. } => "missing_flags",
            Self::OverlayCapExceeded { .. } => "overlay_cap_exceeded",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::WriteContention { .. } => "write_contention",
            Self::StoreCorrupt { .. } => "store_corrupt",
            Self::SyncAuthFailed { .. } => "sync_auth_failed",
            Self::SyncCheckoutFailed { .. } => "sync_checkout_failed",
            Self::Internal { .. } => "internal_error",
            Self::Io(_) => "internal_error",
        }
    }

    /// Whether this kind maps to a client error (4xx-equivalent)
    ///
    /// Everything else surfaces as a 5xx-equivalent except the per-file
    /// kinds, which are folded into the confidence envelope and never
    /// abort a query.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::NotFound { .. })
    }

    /// Convert error to process exit code:
    /// - 0: Success
    /// - 1: IO / internal failure
    /// - 2: Invalid request or manifest
    /// - 3: Extractor failure (unavailable, timeout, parse)
    /// - 4: Store failure
    /// - 5: Sync failure
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Validation { .. } | Self::NotFound { .. } | Self::Manifest { .. } => {
                ExitCode::from(2)
            }
            Self::ExtractorUnavailable { .. }
            | Self::ExtractorTimeout { .. }
            | Self::ParseFailed { .. }
            | Self::MissingFlags { .. } => ExitCode::from(3),
            Self::OverlayCapExceeded { .. }
            | Self::BudgetExceeded { .. }
            | Self::WriteContention { .. }
            | Self::StoreCorrupt { .. } => ExitCode::from(4),
            Self::SyncAuthFailed { .. } | Self::SyncCheckoutFailed { .. } => ExitCode::from(5),
            Self::Internal { .. } | Self::Io(_) => ExitCode::from(1),
        }
    }

    /// Shorthand for an internal error from any displayable cause
    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(code, ref msg)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                Self::WriteContention {
                    message: msg.clone().unwrap_or_else(|| code.to_string()),
                }
            }
            rusqlite::Error::SqliteFailure(code, ref msg)
                if code.code == rusqlite::ErrorCode::DatabaseCorrupt
                    || code.code == rusqlite::ErrorCode::NotADatabase =>
            {
                Self::StoreCorrupt {
                    message: msg.clone().unwrap_or_else(|| code.to_string()),
                }
            }
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {}", e),
        }
    }
}

/// Result type alias for symdex-engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        let e = EngineError::Validation {
            message: "bad".into(),
        };
        assert_eq!(e.kind(), "validation_error");
        assert!(e.is_client_error());

        let e = EngineError::WriteContention {
            message: "busy".into(),
        };
        assert_eq!(e.kind(), "write_contention");
        assert!(!e.is_client_error());
    }

    #[test]
    fn busy_sqlite_error_maps_to_write_contention() {
        let e = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let mapped = EngineError::from(e);
        assert_eq!(mapped.kind(), "write_contention");
    }
}
