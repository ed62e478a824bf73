//! Error types for the cell cache
//!
//! ## Table of Contents
//! - **CellError**: Main error enum covering all failure modes
//! - **Result**: Type alias for `Result<T, CellError>`

use crate::types::{CellId, CellStatus};
use thiserror::Error;

/// Result type alias for cell cache operations
pub type Result<T> = std::result::Result<T, CellError>;

/// Main error type for cell cache operations
#[derive(Error, Debug)]
pub enum CellError {
    /// Configuration error during builder setup
    #[error("configuration error: {0}")]
    Config(String),

    /// A create message named an id that is already cached
    #[error("cell {0} already exists")]
    DuplicateCell(CellId),

    /// A message referenced a cell that is not cached
    #[error("unknown cell {0}")]
    UnknownCell(CellId),

    /// A create message named a parent that is not cached
    #[error("unknown parent {parent} for cell {cell}")]
    UnknownParent {
        /// Cell being created
        cell: CellId,
        /// Parent it declared
        parent: CellId,
    },

    /// No constructor is registered for the type identifier
    #[error("no cell type registered for '{0}'")]
    UnknownCellType(String),

    /// The cell already has a parent
    #[error("cell {cell} already has parent {parent}")]
    MultipleParents {
        /// Child cell
        cell: CellId,
        /// Its current parent
        parent: CellId,
    },

    /// Attaching would make a cell its own ancestor
    #[error("attaching {cell} under {parent} would create a cycle")]
    CyclicParent {
        /// Child cell
        cell: CellId,
        /// Requested parent
        parent: CellId,
    },

    /// A component of the same kind is already attached
    #[error("cell {cell} already has a '{kind}' component")]
    DuplicateComponent {
        /// Owning cell
        cell: CellId,
        /// Component kind
        kind: String,
    },

    /// The cell reached `Disk` through a decrease and cannot be raised again
    #[error("cell {0} was released and must be recreated")]
    Released(CellId),

    /// A lifecycle hook failed
    #[error("{kind} hook failed on cell {cell} entering {status}: {reason}")]
    Hook {
        /// Owning cell
        cell: CellId,
        /// Component kind
        kind: String,
        /// Status of the step being applied
        status: CellStatus,
        /// Failure description
        reason: String,
    },

    /// Fetching a declared resource failed
    #[error("resource error for {url}: {reason}")]
    Resource {
        /// URL being fetched
        url: String,
        /// Failure description
        reason: String,
    },

    /// Metrics registration or export failure
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (should not occur in normal operation)
    #[error("internal error: {0}")]
    Internal(String),
}

impl CellError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a hook failure
    pub fn hook(cell: CellId, kind: impl Into<String>, status: CellStatus, reason: impl Into<String>) -> Self {
        Self::Hook {
            cell,
            kind: kind.into(),
            status,
            reason: reason.into(),
        }
    }

    /// Create a resource error
    pub fn resource(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resource {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error comes from stale or out-of-order protocol traffic.
    ///
    /// Stale errors are logged as warnings and otherwise ignored.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::UnknownCell(_))
    }
}

impl From<prometheus::Error> for CellError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}

impl From<toml::de::Error> for CellError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
