//! Error kinds shared across the store, adapters, and the sync engine.
//!
//! | Kind | Scope | Effect on a sync run |
//! |------|-------|----------------------|
//! | [`AdapterError`] | run | aborts the run, `success = false` |
//! | [`MappingFailure`] | item | recorded, run continues |
//! | [`StoreError`] | item | recorded; consecutive failures trip the circuit breaker |
//! | [`SyncError`] | caller | configuration or programmer error, returned as `Err` |
//!
//! A missing relationship target is not an error at all; see
//! [`Resolution`](crate::records::Resolution).

use thiserror::Error;

/// Failure reported by a [`Store`](crate::store::Store) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    /// Optimistic write lost a race, or a create hit an existing key.
    #[error("write conflict on record {0}")]
    Conflict(String),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Run-level failure raised by a source adapter (auth, network, I/O).
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for AdapterError {
    fn from(e: std::io::Error) -> Self {
        AdapterError::Io(e.to_string())
    }
}

/// An external item that could not be converted into a record.
#[derive(Debug, Clone, Error)]
#[error("failed to map item '{external_id}': {reason}")]
pub struct MappingFailure {
    pub external_id: String,
    pub reason: String,
}

impl MappingFailure {
    pub fn new(external_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("collection header not found: {0}")]
    HeaderMissing(String),
    #[error("record {0} is not a collection header")]
    NotAHeader(String),
    #[error("record {record} is not a member of collection {header}")]
    NotAMember { header: String, record: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that escape a sync call. Everything else lands in the
/// [`SyncResult`](crate::engine::SyncResult).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown source: '{0}'")]
    UnknownSource(String),
    #[error("a sync run for '{0}' is already in progress")]
    AlreadyRunning(String),
    #[error("invalid sync options: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
