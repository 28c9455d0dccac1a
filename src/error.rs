//! Error taxonomy for the review core.
//!
//! Callers branch on [`ErrorKind`]: validation and guard failures go back to
//! the user, conflicts and key outages are retried, integrity violations stop
//! any automated processing of the affected record.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T, E = ReviewError> = std::result::Result<T, E>;

/// Tamper evidence found while reading or walking the ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityViolation {
    /// The stored signature does not verify against the stored public key.
    #[error("signature mismatch on ledger record {record_id}")]
    SignatureMismatch { record_id: i64 },
    /// The key resolved fine but the AEAD tag rejected the payload.
    #[error("payload of ledger record {record_id} failed authentication")]
    PayloadTampered { record_id: i64 },
    /// Re-hashing the chain disagreed with what is stored.
    #[error("hash chain broken at ledger record {record_id}: {detail}")]
    ChainBreak { record_id: i64, detail: String },
}

impl IntegrityViolation {
    pub fn record_id(&self) -> i64 {
        match self {
            Self::SignatureMismatch { record_id }
            | Self::PayloadTampered { record_id }
            | Self::ChainBreak { record_id, .. } => *record_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("guard violation: {0}")]
    Guard(String),

    #[error("concurrency conflict: {0}")]
    Conflict(String),

    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityViolation),

    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Stable classification of a [`ReviewError`], used in audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Forbidden,
    NotFound,
    Guard,
    Conflict,
    Integrity,
    KeyUnavailable,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Guard => "guard",
            Self::Conflict => "conflict",
            Self::Integrity => "integrity",
            Self::KeyUnavailable => "key_unavailable",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ReviewError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Guard(_) => ErrorKind::Guard,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::KeyUnavailable(_) => ErrorKind::KeyUnavailable,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether the same call may simply be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::KeyUnavailable(_))
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn guard(msg: impl Into<String>) -> Self {
        Self::Guard(msg.into())
    }

    pub(crate) fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// True when a SQLite error is a UNIQUE / constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_and_key_outages_are_retryable() {
        assert!(ReviewError::conflict("tail moved").is_retryable());
        assert!(ReviewError::KeyUnavailable("kms down".into()).is_retryable());
        assert!(!ReviewError::guard("quorum").is_retryable());
        assert!(!ReviewError::validation("bad level").is_retryable());
        assert!(!ReviewError::from(IntegrityViolation::SignatureMismatch { record_id: 4 })
            .is_retryable());
    }

    #[test]
    fn integrity_kind_is_distinct_from_storage() {
        let err = ReviewError::from(IntegrityViolation::ChainBreak {
            record_id: 9,
            detail: "hash mismatch".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(err.to_string().contains("record 9"));
        assert_ne!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn record_id_is_exposed_for_every_violation() {
        assert_eq!(IntegrityViolation::PayloadTampered { record_id: 3 }.record_id(), 3);
        assert_eq!(IntegrityViolation::SignatureMismatch { record_id: 5 }.record_id(), 5);
    }
}
