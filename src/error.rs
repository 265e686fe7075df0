//! Custom error types for mender.
//!
//! Every failure the healing loop can run into maps onto one variant here.
//! The retry controller recovers all loop errors and turns them into a
//! terminal session verdict; only configuration errors escape to the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mender operations
#[derive(Error, Debug)]
pub enum HealError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Missing required file
    #[error("Missing required file: {path}")]
    MissingFile { path: PathBuf },

    // =========================================================================
    // Healing Loop Errors
    // =========================================================================
    /// Infrastructure failure while running a test (runner missing, spawn
    /// failure, browser launch failure, timeout)
    #[error("Execution adapter error: {message}")]
    Adapter { message: String },

    /// No structured diagnosis could be located in a transcript or response
    #[error("Extraction error: {message}")]
    Extraction { message: String },

    /// A targeted substitution anchor was not found verbatim in the source
    #[error("Patch conflict in {path}: anchor not found: {anchor}")]
    PatchConflict { path: PathBuf, anchor: String },

    /// A patch was structurally unusable (wrong target, no-op, empty)
    #[error("Malformed patch: {reason}")]
    MalformedPatch { reason: String },

    /// The reasoning capability failed or timed out
    #[error("Reasoning error: {message}")]
    Reasoning { message: String },

    /// The retry budget was consumed while the test still fails
    #[error("Retry budget of {budget} iterations exhausted")]
    Exhausted { budget: u32 },

    /// Too many consecutive failures could not be categorised
    #[error("Unknown diagnosis {count} time(s) in a row (tolerance: {tolerance})")]
    UnknownDiagnosis { count: u32, tolerance: u32 },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HealError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an adapter error
    pub fn adapter(message: impl Into<String>) -> Self {
        Self::Adapter {
            message: message.into(),
        }
    }

    /// Create an extraction error
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction {
            message: message.into(),
        }
    }

    /// Create a patch conflict error
    pub fn patch_conflict(path: impl Into<PathBuf>, anchor: impl Into<String>) -> Self {
        Self::PatchConflict {
            path: path.into(),
            anchor: anchor.into(),
        }
    }

    /// Create a malformed patch error
    pub fn malformed_patch(reason: impl Into<String>) -> Self {
        Self::MalformedPatch {
            reason: reason.into(),
        }
    }

    /// Create a reasoning error
    pub fn reasoning(message: impl Into<String>) -> Self {
        Self::Reasoning {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error may go away when the same operation is retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Adapter { .. } | Self::Reasoning { .. })
    }

    /// Check if this error is a structural patch application failure
    pub fn is_patch_failure(&self) -> bool {
        matches!(self, Self::PatchConflict { .. } | Self::MalformedPatch { .. })
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exhausted { .. } => 3,
            Self::Extraction { .. }
            | Self::PatchConflict { .. }
            | Self::MalformedPatch { .. }
            | Self::UnknownDiagnosis { .. } => 4,
            Self::MissingFile { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for mender results
pub type Result<T> = std::result::Result<T, HealError>;
