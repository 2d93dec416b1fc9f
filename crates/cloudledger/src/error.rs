//! Error types for the reconciliation engine

use thiserror::Error;

/// Reconciliation engine errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Transient collector error: {0}")]
    Transient(String),

    #[error("Permanent collector error: {0}")]
    Permanent(String),

    #[error("Conversion failed for entity {entity}: {message}")]
    Conversion { entity: String, message: String },

    #[error("Invalid resource descriptor: {0}")]
    Descriptor(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{failed} of {total} entities failed to reconcile ({resource} in scope {scope})")]
    EntitiesFailed {
        resource: String,
        scope: String,
        failed: usize,
        total: usize,
        /// Every failed entity hit a retryable error (e.g. a locked database)
        retryable: bool,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse failure taxonomy used by schedulers to decide on retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, timeout or quota problems; the whole run may be retried
    Transient,
    /// Auth or permission problems; surfaced to operators, never retried
    Permanent,
    /// Malformed upstream payload
    Data,
    /// Stored state contradicts an engine invariant
    Invariant,
    /// The backing store failed
    Storage,
    /// The pass finished but some entities were rolled back
    Partial,
}

impl LedgerError {
    pub fn conversion(entity: impl Into<String>, message: impl Into<String>) -> Self {
        LedgerError::Conversion {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::Transient(_) => ErrorClass::Transient,
            LedgerError::Permanent(_) => ErrorClass::Permanent,
            LedgerError::Conversion { .. } | LedgerError::Json(_) => ErrorClass::Data,
            LedgerError::Descriptor(_) => ErrorClass::Permanent,
            LedgerError::Invariant(_) => ErrorClass::Invariant,
            LedgerError::Storage(_) => ErrorClass::Storage,
            LedgerError::EntitiesFailed { .. } => ErrorClass::Partial,
        }
    }

    /// Whether a scheduler may retry the run that produced this error
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::EntitiesFailed { retryable, .. } => *retryable,
            _ => matches!(self.class(), ErrorClass::Transient | ErrorClass::Storage),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(LedgerError::Transient("503".into()).is_retryable());
        assert!(LedgerError::Storage("database is locked".into()).is_retryable());
        assert!(!LedgerError::Permanent("403".into()).is_retryable());
        assert!(!LedgerError::Invariant("no open history".into()).is_retryable());
        assert_eq!(
            LedgerError::conversion("i-1", "bad status").class(),
            ErrorClass::Data
        );

        let partial = LedgerError::EntitiesFailed {
            resource: "instance".into(),
            scope: "proj".into(),
            failed: 1,
            total: 3,
            retryable: false,
        };
        assert_eq!(partial.class(), ErrorClass::Partial);
        assert!(!partial.is_retryable());
        assert_eq!(
            partial.to_string(),
            "1 of 3 entities failed to reconcile (instance in scope proj)"
        );
    }

    #[test]
    fn test_locked_database_partial_is_retryable() {
        let partial = LedgerError::EntitiesFailed {
            resource: "disk".into(),
            scope: "proj".into(),
            failed: 2,
            total: 2,
            retryable: true,
        };
        assert_eq!(partial.class(), ErrorClass::Partial);
        assert!(partial.is_retryable());
    }
}
