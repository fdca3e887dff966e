//! Error types for the Slipway state layer.

use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("mirror i/o error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict { key: String, expected: u64, found: u64 },

    #[error("port {port} is already allocated to {holder}")]
    PortConflict { port: u16, holder: String },
}

impl StateError {
    /// Whether the failure means the store could not be reached at all,
    /// as opposed to a data-level rejection.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
                | StateError::Unavailable(_)
        )
    }

    /// Whether the failure is an optimistic-concurrency rejection.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StateError::VersionConflict { .. } | StateError::PortConflict { .. }
        )
    }
}
