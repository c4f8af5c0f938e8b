//! In-memory editor host and kernel link.
//!
//! [`MemoryHost`] keeps open notebooks, execution handles, and UI flags in
//! process and journals every call the engine makes. Edits are echoed back as
//! [`DocumentEvent`]s once a change sink is attached, the way an editor
//! reports its own document changes. Used by the replay CLI and by tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::document::{
    CellChange, CellOutput, ContentChange, DocumentChangeEvent, DocumentEvent, EditBatch, Metadata,
    NotebookCell, NotebookEdit,
};
use crate::error::{HostError, HostResult, LinkError, LinkResult};
use crate::host::{EditorHost, ExecutionToken, KernelLink};
use crate::identity::{CELL_ID_KEY, CellId, CellIndex, NotebookId, identity_of};
use crate::protocol::DeleteCellRequest;

/// One call the engine made into the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    EditApplied {
        notebook: NotebookId,
        edits: usize,
    },
    Saved {
        notebook: NotebookId,
    },
    ExecutionBegun {
        token: ExecutionToken,
        notebook: NotebookId,
        index: CellIndex,
    },
    ExecutionStarted {
        token: ExecutionToken,
        started_at_ms: u64,
    },
    OutputReplaced {
        token: ExecutionToken,
        outputs: usize,
    },
    ExecutionEnded {
        token: ExecutionToken,
        success: bool,
        ended_at_ms: Option<u64>,
    },
    FlagSet {
        name: String,
        value: bool,
    },
}

/// What the host recorded about one execution handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub token: ExecutionToken,
    pub notebook: NotebookId,
    /// Index of the cell when the execution began.
    pub index: CellIndex,
    /// Identity of the cell when the execution began.
    pub cell_id: Option<CellId>,
    pub started_at_ms: Option<u64>,
    /// `Some(success)` once ended.
    pub ended: Option<bool>,
    pub ended_at_ms: Option<u64>,
    /// Latest outputs written through the handle.
    pub outputs: Vec<CellOutput>,
}

#[derive(Default)]
struct HostState {
    notebooks: FxHashMap<NotebookId, Vec<NotebookCell>>,
    notebook_metadata: FxHashMap<NotebookId, Metadata>,
    edit_counts: FxHashMap<NotebookId, usize>,
    save_counts: FxHashMap<NotebookId, usize>,
    executions: BTreeMap<u64, ExecutionRecord>,
    next_token: u64,
    flags: FxHashMap<String, Vec<bool>>,
    journal: Vec<HostEvent>,
    reject_edits: bool,
    sink: Option<mpsc::UnboundedSender<DocumentEvent>>,
}

impl HostState {
    fn cells_mut(&mut self, notebook: &NotebookId) -> HostResult<&mut Vec<NotebookCell>> {
        self.notebooks
            .get_mut(notebook)
            .ok_or_else(|| HostError::UnknownNotebook(notebook.clone()))
    }

    fn live_execution(&mut self, token: ExecutionToken) -> HostResult<&mut ExecutionRecord> {
        self.executions
            .get_mut(&token.0)
            .filter(|record| record.ended.is_none())
            .ok_or(HostError::ExecutionNotLive(token.0))
    }

    fn emit(&mut self, event: DocumentEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        if sink.send(event).is_err() {
            tracing::debug!("Change sink closed, detaching");
            self.sink = None;
        }
    }

    fn emit_change(&mut self, change: DocumentChangeEvent) {
        if !change.is_empty() {
            self.emit(DocumentEvent::Changed(change));
        }
    }
}

fn check_index(notebook: &NotebookId, index: CellIndex, len: usize) -> HostResult<()> {
    if index < len {
        Ok(())
    } else {
        Err(HostError::IndexOutOfRange {
            notebook: notebook.clone(),
            index,
            len,
        })
    }
}

/// In-process [`EditorHost`].
#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<HostState>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open (or reopen) a notebook with the given cells.
    pub fn open_notebook(&self, notebook: NotebookId, cells: Vec<NotebookCell>) {
        tracing::debug!("Opened {} with {} cells", notebook, cells.len());
        self.state().notebooks.insert(notebook, cells);
    }

    /// Close a notebook and report it to the change sink.
    pub fn close_notebook(&self, notebook: &NotebookId) -> HostResult<()> {
        let mut state = self.state();
        state
            .notebooks
            .remove(notebook)
            .ok_or_else(|| HostError::UnknownNotebook(notebook.clone()))?;
        state.notebook_metadata.remove(notebook);
        state.emit(DocumentEvent::Closed {
            notebook: notebook.clone(),
        });
        Ok(())
    }

    /// Route document events to `sink` from now on.
    pub fn attach_change_sink(&self, sink: mpsc::UnboundedSender<DocumentEvent>) {
        self.state().sink = Some(sink);
    }

    /// Attach a fresh change sink and return its receiving end.
    pub fn change_events(&self) -> mpsc::UnboundedReceiver<DocumentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach_change_sink(tx);
        rx
    }

    /// Stop echoing document events.
    pub fn detach_change_sink(&self) {
        self.state().sink = None;
    }

    /// Make every following `apply_edit` fail.
    pub fn set_rejecting_edits(&self, reject: bool) {
        self.state().reject_edits = reject;
    }

    /// Snapshot of a notebook's cells. Empty if the notebook is not open.
    pub fn cells_of(&self, notebook: &NotebookId) -> Vec<NotebookCell> {
        self.state()
            .notebooks
            .get(notebook)
            .cloned()
            .unwrap_or_default()
    }

    pub fn notebook_metadata(&self, notebook: &NotebookId) -> Metadata {
        self.state()
            .notebook_metadata
            .get(notebook)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of edit batches applied to a notebook.
    pub fn edit_count(&self, notebook: &NotebookId) -> usize {
        self.state().edit_counts.get(notebook).copied().unwrap_or(0)
    }

    pub fn save_count(&self, notebook: &NotebookId) -> usize {
        self.state().save_counts.get(notebook).copied().unwrap_or(0)
    }

    /// Every value pushed to a flag, in order.
    pub fn flag_history(&self, name: &str) -> Vec<bool> {
        self.state().flags.get(name).cloned().unwrap_or_default()
    }

    /// Current value of a flag.
    pub fn flag(&self, name: &str) -> Option<bool> {
        self.state()
            .flags
            .get(name)
            .and_then(|history| history.last().copied())
    }

    pub fn execution(&self, token: ExecutionToken) -> Option<ExecutionRecord> {
        self.state().executions.get(&token.0).cloned()
    }

    /// All executions in the order they were begun.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.state().executions.values().cloned().collect()
    }

    pub fn journal(&self) -> Vec<HostEvent> {
        self.state().journal.clone()
    }

    /// User edit: replace the source text of one cell.
    pub fn edit_cell_source(
        &self,
        notebook: &NotebookId,
        index: CellIndex,
        source: impl Into<String>,
    ) -> HostResult<()> {
        let mut state = self.state();
        let cells = state.cells_mut(notebook)?;
        check_index(notebook, index, cells.len())?;
        cells[index].source = source.into();
        let cell = cells[index].clone();

        let mut change = DocumentChangeEvent::new(notebook.clone());
        change.cell_changes.push(CellChange {
            index,
            cell,
            text_changed: true,
            metadata_changed: false,
            outputs_changed: false,
        });
        state.emit_change(change);
        Ok(())
    }

    /// User edit: insert a cell at `index` (clamped to the end).
    pub fn insert_cell(
        &self,
        notebook: &NotebookId,
        index: CellIndex,
        cell: NotebookCell,
    ) -> HostResult<()> {
        let mut state = self.state();
        let cells = state.cells_mut(notebook)?;
        let start = index.min(cells.len());
        cells.insert(start, cell.clone());

        let mut change = DocumentChangeEvent::new(notebook.clone());
        change.content_changes.push(ContentChange {
            start,
            removed_cells: Vec::new(),
            added_cells: vec![cell],
        });
        state.emit_change(change);
        Ok(())
    }

    /// User edit: delete the cell at `index`.
    pub fn delete_cell(&self, notebook: &NotebookId, index: CellIndex) -> HostResult<()> {
        let mut state = self.state();
        let cells = state.cells_mut(notebook)?;
        check_index(notebook, index, cells.len())?;
        let removed = cells.remove(index);

        let mut change = DocumentChangeEvent::new(notebook.clone());
        change.content_changes.push(ContentChange {
            start: index,
            removed_cells: vec![removed],
            added_cells: Vec::new(),
        });
        state.emit_change(change);
        Ok(())
    }

    /// User edit: move a cell. Reported as a removal at `from` followed by an
    /// insertion at `to` in the shortened list.
    pub fn move_cell(
        &self,
        notebook: &NotebookId,
        from: CellIndex,
        to: CellIndex,
    ) -> HostResult<()> {
        let mut state = self.state();
        let cells = state.cells_mut(notebook)?;
        check_index(notebook, from, cells.len())?;
        let cell = cells.remove(from);
        let to = to.min(cells.len());
        cells.insert(to, cell.clone());

        let mut change = DocumentChangeEvent::new(notebook.clone());
        change.content_changes.push(ContentChange {
            start: from,
            removed_cells: vec![cell.clone()],
            added_cells: Vec::new(),
        });
        change.content_changes.push(ContentChange {
            start: to,
            removed_cells: Vec::new(),
            added_cells: vec![cell],
        });
        state.emit_change(change);
        Ok(())
    }

    /// Replace every cell with freshly parsed ones, as a re-read from disk
    /// does. The new cells lose their identity and outputs.
    pub fn replace_all_cells(
        &self,
        notebook: &NotebookId,
        cells: Vec<NotebookCell>,
    ) -> HostResult<()> {
        let parsed: Vec<NotebookCell> = cells
            .into_iter()
            .map(|mut cell| {
                cell.metadata.remove(CELL_ID_KEY);
                cell.outputs.clear();
                cell
            })
            .collect();

        let mut state = self.state();
        let current = state.cells_mut(notebook)?;
        let removed = std::mem::replace(current, parsed.clone());

        let mut change = DocumentChangeEvent::new(notebook.clone());
        change.content_changes.push(ContentChange {
            start: 0,
            removed_cells: removed,
            added_cells: parsed,
        });
        state.emit_change(change);
        Ok(())
    }
}

impl EditorHost for MemoryHost {
    async fn cells(&self, notebook: &NotebookId) -> HostResult<Vec<NotebookCell>> {
        self.state()
            .notebooks
            .get(notebook)
            .cloned()
            .ok_or_else(|| HostError::UnknownNotebook(notebook.clone()))
    }

    async fn apply_edit(&self, batch: EditBatch) -> HostResult<()> {
        let mut state = self.state();
        if state.reject_edits {
            return Err(HostError::EditRejected(format!(
                "{} edit(s) to {}",
                batch.len(),
                batch.notebook
            )));
        }

        // Apply to a copy so a bad edit leaves the document untouched.
        let mut cells = state.cells_mut(&batch.notebook)?.clone();
        let mut notebook_metadata = None;
        let mut change = DocumentChangeEvent::new(batch.notebook.clone());
        for edit in &batch.edits {
            match edit {
                NotebookEdit::ReplaceCell { index, cell } => {
                    check_index(&batch.notebook, *index, cells.len())?;
                    let removed = std::mem::replace(&mut cells[*index], cell.clone());
                    change.content_changes.push(ContentChange {
                        start: *index,
                        removed_cells: vec![removed],
                        added_cells: vec![cell.clone()],
                    });
                }
                NotebookEdit::UpdateCellMetadata { index, metadata } => {
                    check_index(&batch.notebook, *index, cells.len())?;
                    cells[*index].metadata = metadata.clone();
                    change.cell_changes.push(CellChange {
                        index: *index,
                        cell: cells[*index].clone(),
                        text_changed: false,
                        metadata_changed: true,
                        outputs_changed: false,
                    });
                }
                NotebookEdit::UpdateNotebookMetadata { metadata } => {
                    notebook_metadata = Some(metadata.clone());
                }
            }
        }

        state.notebooks.insert(batch.notebook.clone(), cells);
        if let Some(metadata) = notebook_metadata {
            state
                .notebook_metadata
                .insert(batch.notebook.clone(), metadata);
        }
        *state.edit_counts.entry(batch.notebook.clone()).or_default() += 1;
        state.journal.push(HostEvent::EditApplied {
            notebook: batch.notebook.clone(),
            edits: batch.len(),
        });
        state.emit_change(change);
        Ok(())
    }

    async fn save(&self, notebook: &NotebookId) -> HostResult<()> {
        let mut state = self.state();
        if !state.notebooks.contains_key(notebook) {
            return Err(HostError::SaveFailed {
                notebook: notebook.clone(),
                message: "notebook is not open".to_string(),
            });
        }
        *state.save_counts.entry(notebook.clone()).or_default() += 1;
        state.journal.push(HostEvent::Saved {
            notebook: notebook.clone(),
        });
        Ok(())
    }

    fn begin_execution(
        &self,
        notebook: &NotebookId,
        index: CellIndex,
    ) -> HostResult<ExecutionToken> {
        let mut state = self.state();
        let cells = state.cells_mut(notebook)?;
        check_index(notebook, index, cells.len())?;
        let cell_id = identity_of(&cells[index]);

        state.next_token += 1;
        let token = ExecutionToken(state.next_token);
        state.executions.insert(
            token.0,
            ExecutionRecord {
                token,
                notebook: notebook.clone(),
                index,
                cell_id,
                started_at_ms: None,
                ended: None,
                ended_at_ms: None,
                outputs: Vec::new(),
            },
        );
        state.journal.push(HostEvent::ExecutionBegun {
            token,
            notebook: notebook.clone(),
            index,
        });
        Ok(token)
    }

    fn start_execution(&self, token: ExecutionToken, started_at_ms: u64) -> HostResult<()> {
        let mut state = self.state();
        state.live_execution(token)?.started_at_ms = Some(started_at_ms);
        state.journal.push(HostEvent::ExecutionStarted {
            token,
            started_at_ms,
        });
        Ok(())
    }

    fn end_execution(
        &self,
        token: ExecutionToken,
        success: bool,
        ended_at_ms: Option<u64>,
    ) -> HostResult<()> {
        let mut state = self.state();
        let record = state.live_execution(token)?;
        record.ended = Some(success);
        record.ended_at_ms = ended_at_ms;
        state.journal.push(HostEvent::ExecutionEnded {
            token,
            success,
            ended_at_ms,
        });
        Ok(())
    }

    async fn replace_output(
        &self,
        token: ExecutionToken,
        outputs: Vec<CellOutput>,
    ) -> HostResult<()> {
        let mut state = self.state();
        let record = state.live_execution(token)?;
        record.outputs = outputs.clone();
        let notebook = record.notebook.clone();
        let cell_id = record.cell_id.clone();
        let begun_at = record.index;
        state.journal.push(HostEvent::OutputReplaced {
            token,
            outputs: outputs.len(),
        });

        // The handle follows its cell, wherever it has moved since.
        let Ok(cells) = state.cells_mut(&notebook) else {
            return Ok(());
        };
        let index = match &cell_id {
            Some(id) => cells
                .iter()
                .position(|cell| identity_of(cell).as_ref() == Some(id)),
            None => (begun_at < cells.len()).then_some(begun_at),
        };
        let Some(index) = index else {
            return Ok(());
        };
        cells[index].outputs = outputs;
        let cell = cells[index].clone();

        let mut change = DocumentChangeEvent::new(notebook);
        change.cell_changes.push(CellChange {
            index,
            cell,
            text_changed: false,
            metadata_changed: false,
            outputs_changed: true,
        });
        state.emit_change(change);
        Ok(())
    }

    fn set_flag(&self, name: &str, value: bool) -> HostResult<()> {
        let mut state = self.state();
        state.flags.entry(name.to_string()).or_default().push(value);
        state.journal.push(HostEvent::FlagSet {
            name: name.to_string(),
            value,
        });
        Ok(())
    }
}

#[derive(Default)]
struct KernelState {
    failing: bool,
    attempts: usize,
    deletions: Vec<DeleteCellRequest>,
}

/// [`KernelLink`] that records delete-cell requests.
#[derive(Default)]
pub struct RecordingKernel {
    state: Mutex<KernelState>,
}

impl RecordingKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following request fail.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Number of requests received, failed or not.
    pub fn attempts(&self) -> usize {
        self.state().attempts
    }

    /// Requests that succeeded, in order.
    pub fn deletions(&self) -> Vec<DeleteCellRequest> {
        self.state().deletions.clone()
    }
}

impl KernelLink for RecordingKernel {
    async fn delete_cell(&self, request: DeleteCellRequest) -> LinkResult<()> {
        let mut state = self.state();
        state.attempts += 1;
        if state.failing {
            return Err(LinkError::Request(format!(
                "delete_cell {} rejected",
                request.cell_id
            )));
        }
        state.deletions.push(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::OutputItem;

    fn host_with(cells: Vec<NotebookCell>) -> (MemoryHost, NotebookId) {
        let host = MemoryHost::new();
        let nb = NotebookId::new("file:///nb.py");
        host.open_notebook(nb.clone(), cells);
        (host, nb)
    }

    fn changed(event: DocumentEvent) -> DocumentChangeEvent {
        match event {
            DocumentEvent::Changed(change) => change,
            other => panic!("expected a change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_batch_is_atomic() {
        let (host, nb) = host_with(vec![NotebookCell::code("a")]);
        let mut batch = EditBatch::new(nb.clone());
        batch.push(NotebookEdit::ReplaceCell {
            index: 0,
            cell: NotebookCell::code("replaced"),
        });
        batch.push(NotebookEdit::UpdateCellMetadata {
            index: 5,
            metadata: Metadata::new(),
        });

        let err = host.apply_edit(batch).await.unwrap_err();
        assert!(matches!(err, HostError::IndexOutOfRange { index: 5, .. }));
        assert_eq!(host.cells_of(&nb)[0].source, "a");
        assert_eq!(host.edit_count(&nb), 0);
    }

    #[tokio::test]
    async fn test_edits_are_echoed() {
        let (host, nb) = host_with(vec![NotebookCell::code("a").with_id("x")]);
        let mut events = host.change_events();

        let mut metadata = host.cells_of(&nb)[0].metadata.clone();
        metadata.insert("state".into(), "stale".into());
        host.apply_edit(EditBatch::single(
            nb.clone(),
            NotebookEdit::UpdateCellMetadata { index: 0, metadata },
        ))
        .await
        .unwrap();

        let change = changed(events.try_recv().unwrap());
        assert!(change.content_changes.is_empty());
        assert_eq!(change.cell_changes.len(), 1);
        assert!(change.cell_changes[0].metadata_changed);
        assert!(!change.cell_changes[0].text_changed);
    }

    #[tokio::test]
    async fn test_replace_all_strips_identity_and_outputs() {
        let (host, nb) = host_with(vec![
            NotebookCell::code("a")
                .with_id("x")
                .with_outputs(vec![CellOutput::single(OutputItem::stdout("1"))]),
        ]);
        let mut events = host.change_events();

        host.replace_all_cells(&nb, host.cells_of(&nb)).unwrap();
        let cells = host.cells_of(&nb);
        assert_eq!(identity_of(&cells[0]), None);
        assert!(!cells[0].has_outputs());

        let change = changed(events.try_recv().unwrap());
        assert_eq!(change.removed_cells().count(), 1);
        assert_eq!(change.added_cells().count(), 1);
    }

    #[tokio::test]
    async fn test_move_reports_removal_then_insertion() {
        let (host, nb) = host_with(vec![
            NotebookCell::code("a").with_id("a"),
            NotebookCell::code("b").with_id("b"),
            NotebookCell::code("c").with_id("c"),
        ]);
        let mut events = host.change_events();

        host.move_cell(&nb, 0, 2).unwrap();
        let order: Vec<_> = host.cells_of(&nb).into_iter().map(|c| c.source).collect();
        assert_eq!(order, vec!["b", "c", "a"]);

        let change = changed(events.try_recv().unwrap());
        assert_eq!(change.content_changes[0].start, 0);
        assert_eq!(change.content_changes[1].start, 2);
    }

    #[tokio::test]
    async fn test_ended_execution_is_dead() {
        let (host, nb) = host_with(vec![NotebookCell::code("a").with_id("x")]);
        let token = host.begin_execution(&nb, 0).unwrap();
        host.start_execution(token, 1_000).unwrap();
        host.end_execution(token, true, Some(2_000)).unwrap();

        assert_eq!(
            host.end_execution(token, true, None),
            Err(HostError::ExecutionNotLive(token.0))
        );
        assert!(host.replace_output(token, Vec::new()).await.is_err());
        assert_eq!(host.execution(token).unwrap().ended_at_ms, Some(2_000));
    }

    #[tokio::test]
    async fn test_outputs_follow_moved_cell() {
        let (host, nb) = host_with(vec![
            NotebookCell::code("a").with_id("a"),
            NotebookCell::code("b").with_id("b"),
        ]);
        let token = host.begin_execution(&nb, 0).unwrap();
        host.move_cell(&nb, 0, 1).unwrap();

        let outputs = vec![CellOutput::single(OutputItem::stdout("hi"))];
        host.replace_output(token, outputs.clone()).await.unwrap();
        assert_eq!(host.cells_of(&nb)[1].outputs, outputs);
        assert!(host.cells_of(&nb)[0].outputs.is_empty());
    }

    #[tokio::test]
    async fn test_recording_kernel() {
        let kernel = RecordingKernel::new();
        let request = DeleteCellRequest {
            notebook: NotebookId::new("file:///nb.py"),
            cell_id: CellId::new("a"),
        };
        kernel.delete_cell(request.clone()).await.unwrap();
        kernel.set_failing(true);
        assert!(kernel.delete_cell(request.clone()).await.is_err());

        assert_eq!(kernel.attempts(), 2);
        assert_eq!(kernel.deletions(), vec![request]);
    }
}
