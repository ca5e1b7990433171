//! Crate-level errors.
//!
//! Every [`Error`] resolves to an [`ErrorCode`]. The code fixes the process
//! exit status and tells a scheduler whether rerunning can help. When stdout
//! is not a terminal the binary prints [`Error::to_structured_json`] instead
//! of prose.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::EntityType;
use crate::sync::types::SyncError;

/// Result type alias for trs-sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error identifiers, grouped by exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    AlreadyInitialized,
    DatabaseError,

    // Not Found (exit 3)
    QuarantineNotFound,
    RowNotFound,

    // Validation (exit 4)
    InvalidArgument,

    // Sync (exit 6)
    SyncError,
    CursorConflict,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Upper snake case name used in JSON output.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::QuarantineNotFound => "QUARANTINE_NOT_FOUND",
            Self::RowNotFound => "ROW_NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::SyncError => "SYNC_ERROR",
            Self::CursorConflict => "CURSOR_CONFLICT",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::AlreadyInitialized | Self::DatabaseError => 2,
            Self::QuarantineNotFound | Self::RowNotFound => 3,
            Self::InvalidArgument => 4,
            Self::SyncError | Self::CursorConflict => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether rerunning the same command later may succeed.
    ///
    /// True for store contention and sync stops that leave the cursor
    /// behind the failing record.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError | Self::SyncError | Self::CursorConflict
        )
    }
}

/// Errors that can occur in trs-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: run `trs-sync init` first")]
    NotInitialized,

    #[error("Already initialized at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("Quarantine entry not found: {id}")]
    QuarantineNotFound { id: i64 },

    #[error("No {entity_type} row with external id {external_id}")]
    RowNotFound {
        entity_type: EntityType,
        external_id: String,
    },

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A run stopped before the feed was drained for a batch-fatal reason.
    #[error("Sync run stopped: {0}")]
    RunStopped(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Sync failures are split by what the operator can do about them.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyInitialized { .. } => ErrorCode::AlreadyInitialized,
            Self::QuarantineNotFound { .. } => ErrorCode::QuarantineNotFound,
            Self::RowNotFound { .. } => ErrorCode::RowNotFound,
            Self::Sync(SyncError::CursorAdvanceConflict { .. }) => ErrorCode::CursorConflict,
            Self::Sync(SyncError::Database(_)) | Self::Database(_) => ErrorCode::DatabaseError,
            Self::Sync(SyncError::Io(_)) | Self::Io(_) => ErrorCode::IoError,
            Self::Sync(SyncError::Json(_)) | Self::Json(_) => ErrorCode::JsonError,
            Self::Sync(_) | Self::RunStopped(_) => ErrorCode::SyncError,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Next step for the operator, when there is an obvious one.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => {
                Some("Run `trs-sync init` to create the database".to_string())
            }

            Self::AlreadyInitialized { path } => Some(format!(
                "Database already exists at {}. Use `--force` to reapply the schema.",
                path.display()
            )),

            Self::QuarantineNotFound { id } => Some(format!(
                "No quarantine entry {id}. Use `trs-sync quarantine list --all` to see entries."
            )),

            Self::RowNotFound { entity_type, .. } => Some(format!(
                "The {entity_type} may not have synced yet. Check `trs-sync status` for pending retries."
            )),

            Self::Sync(SyncError::CursorAdvanceConflict { .. }) => Some(
                "Another worker advanced this cursor. Applied records are durable; rerun to continue."
                    .to_string(),
            ),

            Self::Sync(SyncError::ConstraintViolation { .. }) => Some(
                "A concurrent worker wrote the same row. Rerun to re-read current state."
                    .to_string(),
            ),

            Self::RunStopped(_) => Some(
                "Inspect the logged record, then rerun with `--ignore-invalid` or fix the source."
                    .to_string(),
            ),

            Self::InvalidArgument(msg) if msg.contains("entity") => {
                Some("Valid entity types: contact, induction, all".to_string())
            }

            Self::Config(_) => Some(
                "Check the config file and TRS_SYNC_* environment variables.".to_string(),
            ),

            Self::Sync(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::InvalidArgument(_)
            | Self::Other(_) => None,
        }
    }

    /// `{"error": {code, message, retryable, exit_code, hint?}}`
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
