//! Redeserialization coordinator.
//!
//! The host periodically replaces a notebook's whole cell list with freshly
//! parsed cells (on save, on external edits, on tool-driven rewrites). The
//! new cells carry neither identity nor outputs. This module recognises such
//! batches, re-pairs old and new cells by content, and writes identity and
//! outputs back in a single edit so the rest of the engine never notices.
//! Batches that are not bulk replacements are routed to the staleness
//! tracker's positional handling.

use std::sync::Arc;

use futures::future::join_all;

use crate::document::{DocumentChangeEvent, EditBatch, NotebookCell, NotebookEdit};
use crate::host::{EditorHost, KernelLink, notify_cell_deleted};
use crate::identity::{CellId, CellIndex, assign_identity};
use crate::matcher::match_cells;
use crate::staleness::StalenessTracker;

/// Whether a change batch looks like a bulk replacement.
///
/// A re-parse from bytes always starts from blank cells, so it removes cells
/// that had output and adds cells that have none. A user deleting or
/// inserting a cell does not blank unrelated outputs.
pub fn is_bulk_replacement(event: &DocumentChangeEvent) -> bool {
    let mut removed = event.removed_cells().peekable();
    let mut added = event.added_cells().peekable();
    if removed.peek().is_none() || added.peek().is_none() {
        return false;
    }

    added.all(|cell| !cell.has_outputs()) && removed.any(NotebookCell::has_outputs)
}

/// Summary of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Identities carried over to new cells.
    pub restored: Vec<CellId>,
    /// Identities minted for cells with no previous counterpart.
    pub minted: Vec<CellId>,
    /// Identities reported to the kernel as deleted.
    pub deleted: Vec<CellId>,
}

/// Detects bulk replacements and restores identity continuity.
pub struct RedeserializationCoordinator<H, K> {
    host: Arc<H>,
    kernel: Arc<K>,
}

impl<H: EditorHost, K: KernelLink> RedeserializationCoordinator<H, K> {
    pub fn new(host: Arc<H>, kernel: Arc<K>) -> Self {
        Self { host, kernel }
    }

    /// Route one change batch.
    ///
    /// In-place cell changes always go to the staleness tracker. Structural
    /// changes are reconciled when the batch is a bulk replacement and handled
    /// positionally otherwise.
    pub async fn on_document_change(
        &self,
        event: &DocumentChangeEvent,
        staleness: &mut StalenessTracker<H>,
    ) -> Option<Reconciliation> {
        staleness
            .on_cell_changes(&event.notebook, &event.cell_changes)
            .await;

        if event.content_changes.is_empty() {
            return None;
        }

        if is_bulk_replacement(event) {
            Some(self.reconcile(event, staleness).await)
        } else {
            staleness.on_cells_removed(self.kernel.as_ref(), event).await;
            None
        }
    }

    /// Transplant identities and outputs from removed cells onto their
    /// re-parsed counterparts.
    pub async fn reconcile(
        &self,
        event: &DocumentChangeEvent,
        staleness: &mut StalenessTracker<H>,
    ) -> Reconciliation {
        let notebook = &event.notebook;
        let previous: Vec<NotebookCell> = event.removed_cells().cloned().collect();
        let next: Vec<NotebookCell> = event.added_cells().cloned().collect();
        let next_indices: Vec<CellIndex> = event
            .content_changes
            .iter()
            .flat_map(|change| change.added_indices())
            .collect();

        let matching = match_cells(&previous, &next);
        let mut summary = Reconciliation::default();
        let mut batch = EditBatch::new(notebook.clone());

        for (id, pair) in &matching.matched {
            let mut cell = pair.next.clone();
            assign_identity(&mut cell.metadata, id);
            cell.outputs = pair.previous.outputs.clone();
            batch.push(NotebookEdit::ReplaceCell {
                index: next_indices[pair.position],
                cell,
            });
            summary.restored.push(id.clone());
        }

        for new_cell in &matching.new_cells {
            let id = CellId::mint();
            let mut metadata = new_cell.cell.metadata.clone();
            assign_identity(&mut metadata, &id);
            batch.push(NotebookEdit::UpdateCellMetadata {
                index: next_indices[new_cell.position],
                metadata,
            });
            summary.minted.push(id);
        }

        if !batch.is_empty() {
            match self.host.apply_edit(batch).await {
                Ok(()) => {
                    if let Err(e) = self.host.save(notebook).await {
                        tracing::warn!("Failed to save {} after reconciliation: {}", notebook, e);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to restore cell identities in {}: {}", notebook, e);
                }
            }
        }

        staleness.clear_notebook(notebook);

        summary.deleted = matching.deleted_ids();
        join_all(
            summary
                .deleted
                .iter()
                .map(|id| notify_cell_deleted(self.kernel.as_ref(), notebook, id)),
        )
        .await;

        tracing::info!(
            "Reconciled {}: {} restored, {} new, {} deleted",
            notebook,
            summary.restored.len(),
            summary.minted.len(),
            summary.deleted.len()
        );

        summary
    }
}
