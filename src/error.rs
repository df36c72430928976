// 🧯 Error taxonomy
// Typed errors for the ledger core and the roster importer.
//
// - LedgerError: log / projection / workflow failures
// - ImportError: configuration errors that abort a whole import run
// - ApplyError:  one roster row failed during confirm (the batch continues)

use thiserror::Error;

/// Errors raised by the action log, projector and request workflow.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// An action was appended without a membership type.
    #[error("membership type is required")]
    MissingMembershipType,

    #[error("unknown membership type: {0}")]
    UnknownMembershipType(String),

    /// The type's category does not admit this kind of target.
    #[error("membership type '{membership_type}' cannot be held by {target_kind} targets")]
    TargetNotAllowed {
        membership_type: String,
        target_kind: String,
    },

    #[error("membership type '{0}' is not linked to a group")]
    MissingGroup(String),

    #[error("missing required agreements for '{group}': {missing}")]
    MissingPrerequisites { group: String, missing: String },

    #[error("membership request {0} not found")]
    RequestNotFound(i64),

    #[error("request {request_id} is {status}, expected {expected}")]
    InvalidRequestState {
        request_id: i64,
        status: String,
        expected: String,
    },

    #[error("organization {0} not found")]
    OrganizationNotFound(i64),

    /// The external group-grant call failed. Nothing after it was recorded.
    #[error("failed to grant group '{group}' to '{username}': {message}")]
    GroupGrant {
        username: String,
        group: String,
        message: String,
    },

    #[error("directory error: {0}")]
    Directory(String),

    #[error("invalid stored value: {0}")]
    InvalidStoredValue(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration errors: the run is aborted before any row is processed.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("a membership type must be selected")]
    MissingMembershipType,

    #[error("membership type '{0}' does not exist or is disabled")]
    UnknownMembershipType(String),

    #[error("roster has no header row")]
    NoHeaders,

    #[error("roster must include an Email column")]
    MissingEmailColumn,

    #[error("roster must include an organization id and/or organization name column")]
    MissingOrganizationColumn,

    /// An explicit column mapping names a header that is not in the roster.
    #[error("column override for '{field}' names unknown header '{header}'")]
    UnknownColumnOverride { field: String, header: String },

    #[error("invalid roster CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to read roster: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A single roster row failed to apply during confirm.
#[derive(Debug, Error)]
#[error("row {row}: {source}")]
pub struct ApplyError {
    pub row: usize,
    #[source]
    pub source: LedgerError,
}

impl ApplyError {
    pub fn new(row: usize, source: LedgerError) -> Self {
        ApplyError { row, source }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
