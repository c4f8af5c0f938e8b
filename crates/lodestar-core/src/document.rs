//! Notebook document model shared with the editor host.
//!
//! These are the shapes the host hands to the engine (cells, change events)
//! and the shapes the engine hands back (edit batches, rendered outputs).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{CellId, CellIndex, NotebookId};

/// Persisted per-cell (or per-notebook) metadata.
pub type Metadata = serde_json::Map<String, Value>;

/// MIME type the host renders as standard output.
pub const STDOUT_MIME: &str = "application/vnd.code.notebook.stdout";

/// MIME type the host renders as standard error.
pub const STDERR_MIME: &str = "application/vnd.code.notebook.stderr";

/// Kind of notebook cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    #[default]
    Code,
    Markdown,
}

/// A cell as the host currently holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookCell {
    /// Cell kind.
    #[serde(default)]
    pub kind: CellKind,
    /// Source text.
    pub source: String,
    /// Persisted metadata (identity, staleness marker, host fields).
    #[serde(default)]
    pub metadata: Metadata,
    /// Rendered outputs.
    #[serde(default)]
    pub outputs: Vec<CellOutput>,
}

impl NotebookCell {
    /// A code cell with no metadata and no outputs.
    pub fn code(source: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Code,
            source: source.into(),
            metadata: Metadata::new(),
            outputs: Vec::new(),
        }
    }

    /// A markdown cell with no metadata.
    pub fn markdown(source: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Markdown,
            ..Self::code(source)
        }
    }

    /// Attach a persisted identity.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        crate::identity::assign_identity(&mut self.metadata, &CellId::new(id));
        self
    }

    /// Attach rendered outputs.
    pub fn with_outputs(mut self, outputs: Vec<CellOutput>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn has_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }
}

/// One rendered output of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    pub items: Vec<OutputItem>,
}

impl CellOutput {
    pub fn new(items: Vec<OutputItem>) -> Self {
        Self { items }
    }

    /// A single-item output.
    pub fn single(item: OutputItem) -> Self {
        Self { items: vec![item] }
    }
}

/// One MIME-typed representation inside an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    pub mime: String,
    pub data: Value,
}

impl OutputItem {
    pub fn new(mime: impl Into<String>, data: Value) -> Self {
        Self {
            mime: mime.into(),
            data,
        }
    }

    pub fn text(mime: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(mime, Value::String(text.into()))
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::text(STDOUT_MIME, text)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::text(STDERR_MIME, text)
    }
}

/// A structural change: cells removed from `start` and replaced by
/// `added_cells` at the same position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChange {
    /// First index of the affected range.
    pub start: CellIndex,
    /// Cells removed from `start..start + removed_cells.len()`.
    #[serde(default)]
    pub removed_cells: Vec<NotebookCell>,
    /// Cells inserted at `start`.
    #[serde(default)]
    pub added_cells: Vec<NotebookCell>,
}

impl ContentChange {
    /// Indices the removed cells occupied before the change.
    pub fn removed_indices(&self) -> impl Iterator<Item = CellIndex> + '_ {
        (0..self.removed_cells.len()).map(move |offset| self.start + offset)
    }

    /// Indices the added cells occupy after the change.
    pub fn added_indices(&self) -> impl Iterator<Item = CellIndex> + '_ {
        (0..self.added_cells.len()).map(move |offset| self.start + offset)
    }
}

/// An in-place change to a single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellChange {
    /// Current index of the cell.
    pub index: CellIndex,
    /// The cell after the change.
    pub cell: NotebookCell,
    /// Source text changed.
    #[serde(default)]
    pub text_changed: bool,
    /// Metadata changed.
    #[serde(default)]
    pub metadata_changed: bool,
    /// Outputs changed.
    #[serde(default)]
    pub outputs_changed: bool,
}

/// One batch of document changes as delivered by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChangeEvent {
    pub notebook: NotebookId,
    #[serde(default)]
    pub content_changes: Vec<ContentChange>,
    #[serde(default)]
    pub cell_changes: Vec<CellChange>,
}

impl DocumentChangeEvent {
    pub fn new(notebook: NotebookId) -> Self {
        Self {
            notebook,
            content_changes: Vec::new(),
            cell_changes: Vec::new(),
        }
    }

    pub fn removed_cells(&self) -> impl Iterator<Item = &NotebookCell> {
        self.content_changes
            .iter()
            .flat_map(|change| change.removed_cells.iter())
    }

    pub fn added_cells(&self) -> impl Iterator<Item = &NotebookCell> {
        self.content_changes
            .iter()
            .flat_map(|change| change.added_cells.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.content_changes.is_empty() && self.cell_changes.is_empty()
    }
}

/// Document lifecycle events delivered to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentEvent {
    /// The document's cells changed.
    Changed(DocumentChangeEvent),
    /// The document was closed in the editor.
    Closed { notebook: NotebookId },
}

/// A single edit in an [`EditBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotebookEdit {
    /// Replace the cell at `index` with `cell`.
    ReplaceCell { index: CellIndex, cell: NotebookCell },
    /// Replace the metadata of the cell at `index`.
    UpdateCellMetadata { index: CellIndex, metadata: Metadata },
    /// Replace the notebook-level metadata.
    UpdateNotebookMetadata { metadata: Metadata },
}

/// Edits applied to one notebook atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditBatch {
    pub notebook: NotebookId,
    pub edits: Vec<NotebookEdit>,
}

impl EditBatch {
    pub fn new(notebook: NotebookId) -> Self {
        Self {
            notebook,
            edits: Vec::new(),
        }
    }

    pub fn single(notebook: NotebookId, edit: NotebookEdit) -> Self {
        Self {
            notebook,
            edits: vec![edit],
        }
    }

    pub fn push(&mut self, edit: NotebookEdit) {
        self.edits.push(edit);
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }
}
