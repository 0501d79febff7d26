//! Error types for record operations
//!
//! Errors are classified by how the caller should surface them:
//! - Validation: bad input, reported inline, other items continue
//! - External: insight provider or backend failures, skipped per record
//! - Bulk: a batch commit failed, nothing was mutated, safe to retry
//! - NoOp: guard rejected the request before any work started

use thiserror::Error;

/// Error types for CRM state operations
#[derive(Debug, Error)]
pub enum CrmError {
    // Validation errors
    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field '{field}' expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Field '{0}' cannot be changed")]
    ImmutableField(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid criteria: {0}")]
    InvalidCriteria(String),

    #[error("Invalid stage configuration: {0}")]
    InvalidStages(String),

    #[error("Duplicate record id: {0}")]
    DuplicateId(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("CSV error: {0}")]
    Csv(String),

    // External call failures
    #[error("Insight provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Failed to parse provider response: {0}")]
    ResponseParse(String),

    // Bulk failures
    #[error("Bulk operation failed: {0}")]
    BulkFailed(String),

    #[error("Another bulk operation is already running")]
    Busy,

    // No-op guards
    #[error("No records selected")]
    EmptySelection,

    #[error("Nothing to update")]
    EmptyPatch,

    #[error("Enter a search term first")]
    EmptySearch,

    // Storage
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    Validation,
    External,
    Bulk,
    NoOp,
    Storage,
}

impl CrmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CrmError::UnknownField(_)
            | CrmError::TypeMismatch { .. }
            | CrmError::ImmutableField(_)
            | CrmError::InvalidValue { .. }
            | CrmError::InvalidCriteria(_)
            | CrmError::InvalidStages(_)
            | CrmError::DuplicateId(_)
            | CrmError::RecordNotFound(_)
            | CrmError::StageNotFound(_)
            | CrmError::Csv(_) => ErrorClass::Validation,
            CrmError::ProviderUnavailable(_) | CrmError::ResponseParse(_) => ErrorClass::External,
            CrmError::BulkFailed(_) | CrmError::Busy => ErrorClass::Bulk,
            CrmError::EmptySelection | CrmError::EmptyPatch | CrmError::EmptySearch => {
                ErrorClass::NoOp
            }
            CrmError::Storage(_) | CrmError::Serialization(_) => ErrorClass::Storage,
        }
    }

    /// Returns true if retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrmError::ProviderUnavailable(_)
                | CrmError::BulkFailed(_)
                | CrmError::Busy
                | CrmError::Storage(_)
        )
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            CrmError::UnknownField(_) | CrmError::TypeMismatch { .. } => {
                "Check the field names and value types."
            }
            CrmError::ImmutableField(_) => "This field is read-only. Deal stages and probabilities change by moving the deal.",
            CrmError::InvalidValue { .. } => "Correct the highlighted value and try again.",
            CrmError::InvalidCriteria(_) => "Adjust the filter ranges.",
            CrmError::InvalidStages(_) => "Check the pipeline stage configuration.",
            CrmError::DuplicateId(_) => "Use a different identifier.",
            CrmError::RecordNotFound(_) => "The record may have been deleted. Refresh the list.",
            CrmError::StageNotFound(_) => "Pick one of the configured pipeline stages.",
            CrmError::Csv(_) => "Check the file has a header row and is comma-delimited.",
            CrmError::ProviderUnavailable(_) => "AI insights are unavailable. Try again later.",
            CrmError::ResponseParse(_) => "The AI response was malformed. Try again.",
            CrmError::BulkFailed(_) => "No records were changed. Try again.",
            CrmError::Busy => "Wait for the current operation to finish.",
            CrmError::EmptySelection => "Select at least one record.",
            CrmError::EmptyPatch => "Choose at least one field to update.",
            CrmError::EmptySearch => "Type something to search for.",
            CrmError::Storage(_) | CrmError::Serialization(_) => {
                "Check the data directory is writable."
            }
        }
    }
}

impl From<std::io::Error> for CrmError {
    fn from(err: std::io::Error) -> Self {
        CrmError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CrmError {
    fn from(err: serde_json::Error) -> Self {
        CrmError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for CrmError {
    fn from(err: rusqlite::Error) -> Self {
        CrmError::Storage(err.to_string())
    }
}

impl From<csv::Error> for CrmError {
    fn from(err: csv::Error) -> Self {
        CrmError::Csv(err.to_string())
    }
}

/// Serializable error representation for the front-end
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFacingError {
    pub message: String,
    pub class: ErrorClass,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

impl From<&CrmError> for UserFacingError {
    fn from(err: &CrmError) -> Self {
        UserFacingError {
            message: err.to_string(),
            class: err.class(),
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_are_noop_class() {
        assert_eq!(CrmError::EmptySelection.class(), ErrorClass::NoOp);
        assert_eq!(CrmError::EmptySearch.class(), ErrorClass::NoOp);
        assert!(!CrmError::EmptySelection.is_retryable());
    }

    #[test]
    fn test_bulk_failure_is_retryable() {
        let err = CrmError::BulkFailed("network".to_string());
        let facing = UserFacingError::from(&err);
        assert!(facing.can_retry);
        assert_eq!(facing.class, ErrorClass::Bulk);
        assert_eq!(facing.message, "Bulk operation failed: network");
    }

    #[test]
    fn test_user_facing_error_serializes_camel_case() {
        let err = CrmError::UnknownField("favourite_color".to_string());
        let json = serde_json::to_value(UserFacingError::from(&err)).expect("serialize");
        assert_eq!(json["class"], "validation");
        assert_eq!(json["canRetry"], false);
        assert!(json["recoverySuggestion"].is_string());
    }
}
