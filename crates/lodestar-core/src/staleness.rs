//! Staleness tracking.
//!
//! A cell is stale when its source was edited after it last ran. Tracking is
//! keyed by position because the host's metadata updates are positional;
//! entries are removed rather than set to `false`, so a notebook with no
//! entry has no stale cells.
//!
//! Every mark/clear is mirrored into the cell's persisted metadata
//! (`state = "stale"`), and the "active notebook has stale cells" boolean
//! is pushed to a host UI flag whenever it changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::document::{CellChange, DocumentChangeEvent, EditBatch, Metadata, NotebookEdit};
use crate::host::{EditorHost, KernelLink, notify_cell_deleted};
use crate::identity::{CellId, CellIndex, NotebookId, identity_of};

/// Metadata key holding the persisted execution state marker.
pub const CELL_STATE_KEY: &str = "state";

/// Persisted marker value for a stale cell.
pub const STALE_STATE: &str = "stale";

/// Whether persisted metadata marks the cell stale.
///
/// Anything that does not decode as the `"stale"` string counts as not stale.
pub fn is_marked_stale(metadata: &Metadata) -> bool {
    metadata.get(CELL_STATE_KEY).and_then(Value::as_str) == Some(STALE_STATE)
}

/// Snapshot of a notebook's stale cells, broadcast on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleChange {
    pub notebook: NotebookId,
    pub stale_cells: Vec<CellIndex>,
}

/// Tracks edited-but-not-rerun cells per notebook.
pub struct StalenessTracker<H> {
    host: Arc<H>,
    stale: FxHashMap<NotebookId, BTreeSet<CellIndex>>,
    active: Option<NotebookId>,
    flag: String,
    /// Last value pushed to the host flag.
    published: Option<bool>,
    changes: broadcast::Sender<StaleChange>,
}

impl<H: EditorHost> StalenessTracker<H> {
    pub fn new(host: Arc<H>, flag: impl Into<String>, change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        Self {
            host,
            stale: FxHashMap::default(),
            active: None,
            flag: flag.into(),
            published: None,
            changes,
        }
    }

    /// Subscribe to staleness changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StaleChange> {
        self.changes.subscribe()
    }

    pub(crate) fn change_sender(&self) -> broadcast::Sender<StaleChange> {
        self.changes.clone()
    }

    /// Mark a cell stale and persist the marker.
    ///
    /// Repeated marks keep a single entry but rewrite the marker each time.
    pub async fn mark_stale(&mut self, notebook: &NotebookId, index: CellIndex) {
        let inserted = self
            .stale
            .entry(notebook.clone())
            .or_default()
            .insert(index);
        if inserted {
            tracing::debug!("Cell {}[{}] is stale", notebook, index);
            self.changed(notebook);
        }

        self.write_marker(notebook, index, true).await;
    }

    /// Clear a cell's staleness and remove the persisted marker.
    pub async fn clear_stale(&mut self, notebook: &NotebookId, index: CellIndex) {
        self.forget(notebook, index);
        self.write_marker(notebook, index, false).await;
    }

    /// Stale indices of a notebook, ascending.
    pub fn get_stale_cells(&self, notebook: &NotebookId) -> Vec<CellIndex> {
        self.stale
            .get(notebook)
            .map(|cells| cells.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_stale(&self, notebook: &NotebookId, index: CellIndex) -> bool {
        self.stale
            .get(notebook)
            .is_some_and(|cells| cells.contains(&index))
    }

    /// Whether the active notebook has any stale cell.
    pub fn has_stale_cells(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|notebook| self.stale.contains_key(notebook))
    }

    pub fn active_notebook(&self) -> Option<&NotebookId> {
        self.active.as_ref()
    }

    /// Change the active notebook and re-project the UI flag.
    pub fn set_active_notebook(&mut self, notebook: Option<NotebookId>) {
        self.active = notebook;
        self.publish_flag();
    }

    /// Forget every notebook and the active one. Persisted markers stay.
    pub fn clear_all(&mut self) {
        self.stale.clear();
        self.active = None;
        self.publish_flag();
    }

    /// Drop all tracking for a notebook without touching its metadata.
    pub fn clear_notebook(&mut self, notebook: &NotebookId) {
        if self.stale.remove(notebook).is_some() {
            tracing::debug!("Cleared staleness tracking for {}", notebook);
            self.changed(notebook);
        }
    }

    /// React to in-place cell changes: text edits make a cell stale, and a
    /// marker removed by someone else clears it.
    pub async fn on_cell_changes(&mut self, notebook: &NotebookId, changes: &[CellChange]) {
        for change in changes {
            if change.text_changed {
                self.mark_stale(notebook, change.index).await;
            } else if change.metadata_changed
                && !is_marked_stale(&change.cell.metadata)
                && self.is_stale(notebook, change.index)
            {
                self.clear_stale(notebook, change.index).await;
            }
        }
    }

    /// React to structural changes in a batch that is not a bulk replacement.
    ///
    /// Changes apply in order, each against the list the previous one left.
    /// Removed positions stop being tracked and the entries after a changed
    /// range shift with their cells. An added cell carrying the persisted
    /// marker is tracked at its new position, which keeps a moved stale cell
    /// stale. A removed cell whose identity reappears among the batch's added
    /// cells was moved; any other removed identity is reported to the kernel
    /// as deleted.
    pub async fn on_cells_removed<K: KernelLink>(
        &mut self,
        kernel: &K,
        event: &DocumentChangeEvent,
    ) {
        let notebook = &event.notebook;
        let moved: FxHashSet<CellId> = event.added_cells().filter_map(identity_of).collect();

        let before = self.stale.remove(notebook).unwrap_or_default();
        let mut tracked = before.clone();
        let mut deleted = Vec::new();
        for change in &event.content_changes {
            let removed = change.removed_cells.len();
            let removed_end = change.start + removed;
            tracked = tracked
                .into_iter()
                .filter_map(|index| {
                    if index < change.start {
                        Some(index)
                    } else if index < removed_end {
                        None
                    } else {
                        Some(index - removed + change.added_cells.len())
                    }
                })
                .collect();
            tracked.extend(
                change
                    .added_indices()
                    .zip(&change.added_cells)
                    .filter(|(_, cell)| is_marked_stale(&cell.metadata))
                    .map(|(index, _)| index),
            );

            for cell in &change.removed_cells {
                match identity_of(cell) {
                    Some(id) if moved.contains(&id) => {
                        tracing::debug!("Cell {} moved within {}", id, notebook);
                    }
                    Some(id) => deleted.push(id),
                    None => {}
                }
            }
        }

        let reindexed = tracked != before;
        if !tracked.is_empty() {
            self.stale.insert(notebook.clone(), tracked);
        }
        if reindexed {
            tracing::debug!(
                "Stale cells of {} re-indexed: {:?}",
                notebook,
                self.get_stale_cells(notebook)
            );
            self.changed(notebook);
        }

        join_all(deleted.iter().map(|id| notify_cell_deleted(kernel, notebook, id))).await;
    }

    /// Remove a tracking entry without touching metadata.
    fn forget(&mut self, notebook: &NotebookId, index: CellIndex) {
        let Some(cells) = self.stale.get_mut(notebook) else {
            return;
        };
        if !cells.remove(&index) {
            return;
        }
        if cells.is_empty() {
            self.stale.remove(notebook);
        }
        tracing::debug!("Cell {}[{}] is no longer stale", notebook, index);
        self.changed(notebook);
    }

    async fn write_marker(&self, notebook: &NotebookId, index: CellIndex, stale: bool) {
        let cell = match self.host.cell(notebook, index).await {
            Ok(cell) => cell,
            Err(e) => {
                tracing::warn!(
                    "Failed to read cell {}[{}] for staleness update: {}",
                    notebook,
                    index,
                    e
                );
                return;
            }
        };

        let mut metadata = cell.metadata;
        if stale {
            metadata.insert(CELL_STATE_KEY.to_string(), Value::String(STALE_STATE.to_string()));
        } else if metadata.remove(CELL_STATE_KEY).is_none() {
            return;
        }

        let edit = EditBatch::single(
            notebook.clone(),
            NotebookEdit::UpdateCellMetadata { index, metadata },
        );
        if let Err(e) = self.host.apply_edit(edit).await {
            tracing::warn!("Failed to update staleness metadata of {}[{}]: {}", notebook, index, e);
        }
    }

    fn changed(&mut self, notebook: &NotebookId) {
        // No subscribers is fine.
        let _ = self.changes.send(StaleChange {
            notebook: notebook.clone(),
            stale_cells: self.get_stale_cells(notebook),
        });
        self.publish_flag();
    }

    fn publish_flag(&mut self) {
        let has_stale = self.has_stale_cells();
        if self.published == Some(has_stale) {
            return;
        }
        match self.host.set_flag(&self.flag, has_stale) {
            Ok(()) => self.published = Some(has_stale),
            Err(e) => tracing::warn!("Failed to set host flag {}: {}", self.flag, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ContentChange, NotebookCell};
    use crate::memory::{MemoryHost, RecordingKernel};

    const FLAG: &str = "test.hasStaleCells";

    fn setup() -> (Arc<MemoryHost>, StalenessTracker<MemoryHost>, NotebookId) {
        let host = Arc::new(MemoryHost::new());
        let notebook = NotebookId::new("file:///nb.py");
        host.open_notebook(
            notebook.clone(),
            vec![
                NotebookCell::code("a = 1").with_id("a"),
                NotebookCell::code("b = a").with_id("b"),
                NotebookCell::code("c = b").with_id("c"),
            ],
        );
        let tracker = StalenessTracker::new(Arc::clone(&host), FLAG, 16);
        (host, tracker, notebook)
    }

    #[tokio::test]
    async fn test_mark_is_idempotent_but_rewrites_marker() {
        let (host, mut tracker, nb) = setup();
        tracker.mark_stale(&nb, 1).await;
        tracker.mark_stale(&nb, 1).await;

        assert_eq!(tracker.get_stale_cells(&nb), vec![1]);
        assert_eq!(host.edit_count(&nb), 2);
        assert!(is_marked_stale(&host.cells_of(&nb)[1].metadata));
    }

    #[tokio::test]
    async fn test_clear_removes_entry_and_marker() {
        let (host, mut tracker, nb) = setup();
        tracker.mark_stale(&nb, 0).await;
        tracker.clear_stale(&nb, 0).await;

        assert!(tracker.get_stale_cells(&nb).is_empty());
        assert!(!host.cells_of(&nb)[0].metadata.contains_key(CELL_STATE_KEY));
        // The identity survives the metadata rewrite.
        assert_eq!(identity_of(&host.cells_of(&nb)[0]), Some(CellId::new("a")));
    }

    #[tokio::test]
    async fn test_clear_without_marker_issues_no_edit() {
        let (host, mut tracker, nb) = setup();
        tracker.clear_stale(&nb, 2).await;
        assert_eq!(host.edit_count(&nb), 0);
    }

    #[tokio::test]
    async fn test_flag_flips_once_per_transition() {
        let (host, mut tracker, nb) = setup();
        tracker.set_active_notebook(Some(nb.clone()));
        assert_eq!(host.flag_history(FLAG), vec![false]);

        tracker.mark_stale(&nb, 0).await;
        tracker.mark_stale(&nb, 1).await;
        tracker.mark_stale(&nb, 2).await;
        assert_eq!(host.flag_history(FLAG), vec![false, true]);

        tracker.clear_stale(&nb, 0).await;
        tracker.clear_stale(&nb, 1).await;
        assert_eq!(host.flag_history(FLAG), vec![false, true]);

        tracker.clear_stale(&nb, 2).await;
        assert_eq!(host.flag_history(FLAG), vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_flag_follows_active_notebook() {
        let (host, mut tracker, nb) = setup();
        let other = NotebookId::new("file:///other.py");
        tracker.mark_stale(&nb, 0).await;
        // No active notebook yet: the projection is false.
        assert_eq!(host.flag_history(FLAG), vec![false]);

        tracker.set_active_notebook(Some(nb.clone()));
        assert!(tracker.has_stale_cells());
        tracker.set_active_notebook(Some(other));
        assert!(!tracker.has_stale_cells());
        tracker.set_active_notebook(None);
        assert_eq!(host.flag_history(FLAG), vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_subscribers_see_snapshots() {
        let (_host, mut tracker, nb) = setup();
        let mut rx = tracker.subscribe();

        tracker.mark_stale(&nb, 2).await;
        tracker.mark_stale(&nb, 0).await;

        assert_eq!(rx.recv().await.unwrap().stale_cells, vec![2]);
        assert_eq!(rx.recv().await.unwrap().stale_cells, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_text_change_marks_and_external_clear_unmarks() {
        let (host, mut tracker, nb) = setup();
        let mut cell = host.cells_of(&nb)[1].clone();
        cell.source = "b = a + 1".to_string();
        tracker
            .on_cell_changes(
                &nb,
                &[CellChange {
                    index: 1,
                    cell: cell.clone(),
                    text_changed: true,
                    metadata_changed: false,
                    outputs_changed: false,
                }],
            )
            .await;
        assert_eq!(tracker.get_stale_cells(&nb), vec![1]);

        // Metadata rewritten elsewhere without the marker.
        tracker
            .on_cell_changes(
                &nb,
                &[CellChange {
                    index: 1,
                    cell,
                    text_changed: false,
                    metadata_changed: true,
                    outputs_changed: false,
                }],
            )
            .await;
        assert!(tracker.get_stale_cells(&nb).is_empty());
    }

    #[tokio::test]
    async fn test_marker_echo_keeps_cell_stale() {
        let (host, mut tracker, nb) = setup();
        tracker.mark_stale(&nb, 0).await;
        let echoed = host.cells_of(&nb)[0].clone();
        tracker
            .on_cell_changes(
                &nb,
                &[CellChange {
                    index: 0,
                    cell: echoed,
                    text_changed: false,
                    metadata_changed: true,
                    outputs_changed: false,
                }],
            )
            .await;
        assert_eq!(tracker.get_stale_cells(&nb), vec![0]);
    }

    #[tokio::test]
    async fn test_removal_notifies_kernel_unless_moved() {
        let (host, mut tracker, nb) = setup();
        let kernel = RecordingKernel::new();
        let cells = host.cells_of(&nb);
        tracker.mark_stale(&nb, 1).await;

        let event = DocumentChangeEvent {
            notebook: nb.clone(),
            content_changes: vec![
                ContentChange {
                    start: 0,
                    removed_cells: vec![cells[0].clone()],
                    added_cells: Vec::new(),
                },
                ContentChange {
                    start: 1,
                    removed_cells: vec![cells[2].clone()],
                    added_cells: vec![cells[0].clone()],
                },
            ],
            cell_changes: Vec::new(),
        };
        tracker.on_cells_removed(&kernel, &event).await;

        let deleted: Vec<_> = kernel.deletions().into_iter().map(|r| r.cell_id).collect();
        assert_eq!(deleted, vec![CellId::new("c")]);
        // b slid up into the first slot.
        assert_eq!(tracker.get_stale_cells(&nb), vec![0]);
    }

    #[tokio::test]
    async fn test_stale_entries_follow_inserts_and_deletes() {
        let (host, mut tracker, nb) = setup();
        let kernel = RecordingKernel::new();
        tracker.set_active_notebook(Some(nb.clone()));
        tracker.mark_stale(&nb, 2).await;

        let mut event = DocumentChangeEvent::new(nb.clone());
        event.content_changes.push(ContentChange {
            start: 0,
            removed_cells: vec![host.cells_of(&nb)[0].clone()],
            added_cells: Vec::new(),
        });
        tracker.on_cells_removed(&kernel, &event).await;
        assert_eq!(tracker.get_stale_cells(&nb), vec![1]);

        let mut event = DocumentChangeEvent::new(nb.clone());
        event.content_changes.push(ContentChange {
            start: 0,
            removed_cells: Vec::new(),
            added_cells: vec![NotebookCell::code("z = 0"), NotebookCell::code("w = 0")],
        });
        tracker.on_cells_removed(&kernel, &event).await;
        assert_eq!(tracker.get_stale_cells(&nb), vec![3]);

        tracker.clear_stale(&nb, 3).await;
        assert!(tracker.get_stale_cells(&nb).is_empty());
        assert_eq!(host.flag(FLAG), Some(false));
    }

    #[tokio::test]
    async fn test_moved_stale_cell_stays_stale() {
        let (host, mut tracker, nb) = setup();
        let kernel = RecordingKernel::new();
        tracker.mark_stale(&nb, 0).await;
        let moved = host.cells_of(&nb)[0].clone();

        let mut event = DocumentChangeEvent::new(nb.clone());
        event.content_changes.push(ContentChange {
            start: 0,
            removed_cells: vec![moved.clone()],
            added_cells: Vec::new(),
        });
        event.content_changes.push(ContentChange {
            start: 2,
            removed_cells: Vec::new(),
            added_cells: vec![moved],
        });
        tracker.on_cells_removed(&kernel, &event).await;

        assert_eq!(tracker.get_stale_cells(&nb), vec![2]);
        assert!(kernel.deletions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_notification_is_swallowed() {
        let (host, mut tracker, nb) = setup();
        let kernel = RecordingKernel::new();
        kernel.set_failing(true);
        let cells = host.cells_of(&nb);

        let mut event = DocumentChangeEvent::new(nb.clone());
        event.content_changes.push(ContentChange {
            start: 1,
            removed_cells: vec![cells[1].clone()],
            added_cells: Vec::new(),
        });
        tracker.on_cells_removed(&kernel, &event).await;
        assert_eq!(kernel.attempts(), 1);
        assert!(kernel.deletions().is_empty());
    }
}
