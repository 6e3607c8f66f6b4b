//! Error types for the store.

use crate::{AccountId, RecordId, StoreKey, TypeName};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All possible errors from store operations.
///
/// Programming errors (misuse of the API) are reported through the store's
/// diagnostic channel and turn the offending mutation into a no-op; they are
/// never silently swallowed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    // Programming errors
    #[error("cannot create record {0}: already exists")]
    CreateExisting(StoreKey),

    #[error("cannot write to record {key}: status is {status}")]
    WriteToUnready { key: StoreKey, status: String },

    #[error("cannot destroy record {0}: not loaded")]
    DestroyUnloaded(StoreKey),

    #[error("cannot move record {0}: not in a movable state")]
    MoveUnready(StoreKey),

    #[error("record type not registered: {0}")]
    TypeNotRegistered(TypeName),

    #[error("unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("record {0} has no id")]
    NoId(StoreKey),

    #[error("record already saved to store")]
    AlreadySaved,

    #[error("record not yet saved to store")]
    NotSaved,

    // Source-reported failures
    #[error("commit failed for {key}: {error}")]
    Commit { key: StoreKey, error: CommitError },

    #[error("record not found at source: {type_name}/{id}")]
    NotFound { type_name: TypeName, id: RecordId },

    // Query errors
    #[error("unknown query: {0}")]
    UnknownQuery(u64),
}

/// A commit failure reported by the source.
///
/// `error_type` is an opaque discriminator the application matches against
/// (for example `"overQuota"`); watchers that declared it handled suppress
/// the store's default revert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitError {
    pub error_type: String,
    pub description: String,
}

impl CommitError {
    pub fn new(error_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            description: description.into(),
        }
    }
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.description)
    }
}

/// A failed attribute validation.
///
/// Validation does not block writes; it blocks `Record::is_valid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    pub attribute: String,
    pub message: String,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
