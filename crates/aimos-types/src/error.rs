//! Shared error types for the AIMOS memory core.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the memory core.
///
/// Every variant maps to a stable kind string (see [`AimosError::kind`]) so
/// callers can branch on the failure class without matching messages.
#[derive(Error, Debug)]
pub enum AimosError {
    /// Bad input: empty query, invalid tag weight, oversize document, etc.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An atom, snapshot, node, or entity required by the call does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A backend, embedding, or external call exceeded its configured budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The backing store is unreadable or violates a structural invariant.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// A journal file failed checksum or framing validation on load.
    #[error("Journal corrupted: {} ({reason})", path.display())]
    JournalCorruption {
        /// The journal that failed validation.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
        /// Where the journal was moved, if quarantine succeeded.
        quarantined_to: Option<PathBuf>,
    },

    /// An external provider rejected the call because of rate limiting.
    #[error("Rate limited: {0}")]
    RateLimit(String),

    /// An external provider rejected the credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// More tokens were requested than any allocation path can satisfy.
    #[error("Budget exceeded: requested {requested}, available {available}")]
    BudgetExceeded {
        /// Tokens requested by the caller.
        requested: u64,
        /// Tokens actually available.
        available: u64,
    },

    /// A storage backend operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AimosError {
    /// Stable, machine-readable kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Corruption(_) => "corruption_error",
            Self::JournalCorruption { .. } => "journal_corruption_error",
            Self::RateLimit(_) => "rate_limit",
            Self::Auth(_) => "auth",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// True for the corruption family (plain or journal).
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_) | Self::JournalCorruption { .. })
    }

    /// Shorthand for a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<serde_json::Error> for AimosError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Alias for Result with AimosError.
pub type AimosResult<T> = Result<T, AimosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(AimosError::validation("x").kind(), "validation_error");
        assert_eq!(AimosError::NotFound("s".into()).kind(), "not_found");
        let err = AimosError::JournalCorruption {
            path: PathBuf::from("atoms.log"),
            reason: "checksum mismatch".into(),
            quarantined_to: None,
        };
        assert_eq!(err.kind(), "journal_corruption_error");
        assert!(err.is_corruption());
        assert!(err.to_string().contains("atoms.log"));
    }

    #[test]
    fn test_budget_exceeded_message() {
        let err = AimosError::BudgetExceeded {
            requested: 900,
            available: 100,
        };
        assert_eq!(err.to_string(), "Budget exceeded: requested 900, available 100");
    }
}
