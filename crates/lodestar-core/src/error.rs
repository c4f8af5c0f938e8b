//! Error types for lodestar-core.

use thiserror::Error;

use crate::identity::{CellId, NotebookId};

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Result type for calls into the editor host.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Result type for calls into the kernel link.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Failures reported by the editor host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The notebook is not open in the host.
    #[error("notebook not open: {0}")]
    UnknownNotebook(NotebookId),

    /// A cell index did not resolve to a cell.
    #[error("cell index {index} out of range for {notebook} ({len} cells)")]
    IndexOutOfRange {
        notebook: NotebookId,
        index: usize,
        len: usize,
    },

    /// The execution-reporting handle is unknown or already ended.
    #[error("execution handle {0} is not live")]
    ExecutionNotLive(u64),

    /// The host rejected an edit.
    #[error("edit rejected: {0}")]
    EditRejected(String),

    /// Saving the document failed.
    #[error("save failed for {notebook}: {message}")]
    SaveFailed {
        notebook: NotebookId,
        message: String,
    },
}

/// Failures reported by the kernel link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The kernel answered a request with an error.
    #[error("kernel request failed: {0}")]
    Request(String),

    /// The link to the kernel is gone.
    #[error("kernel link closed")]
    Closed,
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation message referenced a cell that does not exist anywhere in
    /// the current document. The engine and the kernel disagree about the
    /// notebook's contents.
    #[error("cell {cell_id} does not resolve to any cell in {notebook}")]
    UnresolvedCell {
        notebook: NotebookId,
        cell_id: CellId,
    },

    /// Editor host failure.
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// Kernel link failure.
    #[error("kernel link error: {0}")]
    Link(#[from] LinkError),

    /// The engine task has stopped.
    #[error("engine is not running")]
    Closed,
}

impl EngineError {
    /// Whether the error indicates an engine/kernel desynchronisation.
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::UnresolvedCell { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_cell_message() {
        let err = EngineError::UnresolvedCell {
            notebook: NotebookId::new("file:///a.py"),
            cell_id: CellId::new("c1"),
        };
        assert_eq!(
            err.to_string(),
            "cell c1 does not resolve to any cell in file:///a.py"
        );
        assert!(err.is_desync());
    }

    #[test]
    fn test_host_error_converts() {
        let err: EngineError = HostError::ExecutionNotLive(3).into();
        assert!(!err.is_desync());
        assert_eq!(err.to_string(), "host error: execution handle 3 is not live");
    }
}
