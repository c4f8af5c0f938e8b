//! Stable cell identity.
//!
//! A cell's identity lives in its persisted metadata, never in its position.
//! Positions ([`CellIndex`]) shift on every insert, delete and move; the
//! [`CellId`] stored under [`CELL_ID_KEY`] survives all of them and is the
//! join key between kernel messages, runtime state and the document.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Metadata, NotebookCell};

/// Metadata key holding the persisted cell identifier.
pub const CELL_ID_KEY: &str = "lodestar_id";

/// Transient position of a cell within a notebook.
pub type CellIndex = usize;

/// Stable identifier of a notebook cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh, random identifier for a cell that has none.
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a notebook document, derived from its location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotebookId(String);

impl NotebookId {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotebookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kernel-supplied token identifying one execution attempt of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read a cell's persisted identity.
///
/// Returns `None` for cells that were never assigned one, and for metadata
/// whose id field does not decode as a non-empty string.
pub fn identity_of(cell: &NotebookCell) -> Option<CellId> {
    identity_in(&cell.metadata)
}

/// Read the persisted identity from raw cell metadata.
pub fn identity_in(metadata: &Metadata) -> Option<CellId> {
    metadata
        .get(CELL_ID_KEY)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(CellId::new)
}

/// Write `id` into `metadata`, replacing any previous identity.
pub fn assign_identity(metadata: &mut Metadata, id: &CellId) {
    metadata.insert(CELL_ID_KEY.to_string(), Value::String(id.0.clone()));
}
