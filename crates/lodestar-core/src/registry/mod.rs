//! Execution registry.
//!
//! Binds the kernel's operation stream to the host's execution-reporting
//! handles. One [`CellEntry`] per notebook cell holds the cumulative
//! [`CellRuntimeState`], at most one live [`ExecutionHandle`], and the
//! bookkeeping for the deferred finalize that follows `idle`.
//!
//! Per-status behaviour:
//!
//! - `queued`: clear staleness, force-end any live handle (superseded), begin
//!   a new handle at the cell's current index.
//! - `running`: start the handle, then render output.
//! - `idle`: render output, then schedule a deferred finalize. Trailing
//!   console fragments that land shortly after `idle` still belong to this
//!   run; the finalize only ends the handle if no newer `queued` arrived.
//! - anything else: re-render if a handle is live, otherwise ignore.

mod state;

pub use state::CellRuntimeState;

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::{EngineError, EngineResult};
use crate::host::{EditorHost, ExecutionToken};
use crate::identity::{CellId, CellIndex, NotebookId, RunId, identity_of};
use crate::protocol::{CellOperation, CellStatus, kernel_time_to_millis};
use crate::staleness::StalenessTracker;

/// One in-flight kernel execution of one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    /// Run the handle was created for.
    pub run_id: Option<RunId>,
    /// Host execution-reporting object.
    pub token: ExecutionToken,
    /// Host time the execution was started, once `running` arrived.
    pub started_at_ms: Option<u64>,
}

/// A finalize that came due for a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFinalize {
    pub notebook: NotebookId,
    pub cell_id: CellId,
    /// Run generation captured when `idle` was processed.
    pub generation: u64,
    /// Run id captured when `idle` was processed.
    pub run_id: Option<RunId>,
}

/// Cells are keyed per notebook: copies of a notebook share persisted ids.
type CellKey = (NotebookId, CellId);

/// Registry state for one cell.
#[derive(Debug)]
struct CellEntry {
    state: CellRuntimeState,
    execution: Option<ExecutionHandle>,
    last_run_id: Option<RunId>,
    /// Bumped on every `queued`. Distinguishes runs even when the kernel
    /// omits run ids.
    generation: u64,
    finalizer: Option<AbortHandle>,
}

impl CellEntry {
    fn new(notebook: NotebookId) -> Self {
        Self {
            state: CellRuntimeState::new(notebook),
            execution: None,
            last_run_id: None,
            generation: 0,
            finalizer: None,
        }
    }

    fn cancel_finalizer(&mut self) {
        if let Some(timer) = self.finalizer.take() {
            timer.abort();
        }
    }
}

/// Tracks kernel-driven executions per cell.
pub struct ExecutionRegistry<H> {
    host: Arc<H>,
    cells: FxHashMap<CellKey, CellEntry>,
    finalize_delay: Duration,
    finalize_tx: mpsc::UnboundedSender<PendingFinalize>,
}

impl<H: EditorHost> ExecutionRegistry<H> {
    /// Create a registry. Due finalizers are delivered on `finalize_tx` and
    /// must be fed back through [`finalize`](Self::finalize).
    pub fn new(
        host: Arc<H>,
        finalize_delay: Duration,
        finalize_tx: mpsc::UnboundedSender<PendingFinalize>,
    ) -> Self {
        Self {
            host,
            cells: FxHashMap::default(),
            finalize_delay,
            finalize_tx,
        }
    }

    /// Process one operation message for a cell of `notebook`.
    ///
    /// Returns [`EngineError::UnresolvedCell`] when the cell id does not
    /// exist in the notebook at all. Every other failure is logged and
    /// swallowed.
    pub async fn handle_cell_operation(
        &mut self,
        notebook: &NotebookId,
        op: CellOperation,
        staleness: &mut StalenessTracker<H>,
    ) -> EngineResult<()> {
        let cell_id = op.cell_id.clone();
        let Some(index) = self.resolve_index(notebook, &cell_id).await? else {
            return Ok(());
        };

        let host = Arc::clone(&self.host);
        let finalize_tx = self.finalize_tx.clone();
        let finalize_delay = self.finalize_delay;
        let entry = self
            .cells
            .entry((notebook.clone(), cell_id.clone()))
            .or_insert_with(|| CellEntry::new(notebook.clone()));
        entry.state.apply(&op);

        let status = op.status.clone().unwrap_or(CellStatus::Other(String::new()));
        tracing::debug!(
            "Cell {} ({}[{}]) -> {} (run {:?})",
            cell_id,
            notebook,
            index,
            status,
            op.run_id
        );

        match status {
            CellStatus::Queued => {
                staleness.clear_stale(notebook, index).await;

                entry.cancel_finalizer();
                if let Some(superseded) = entry.execution.take() {
                    tracing::debug!(
                        "Cell {}: run {:?} superseded by {:?}",
                        cell_id,
                        superseded.run_id,
                        op.run_id
                    );
                    end_execution(host.as_ref(), &cell_id, superseded, true, None);
                }

                entry.generation += 1;
                entry.last_run_id = op.run_id.clone();
                match host.begin_execution(notebook, index) {
                    Ok(token) => {
                        entry.execution = Some(ExecutionHandle {
                            run_id: op.run_id,
                            token,
                            started_at_ms: None,
                        });
                    }
                    Err(e) => tracing::warn!(
                        "Failed to begin execution for cell {} in {}: {}",
                        cell_id,
                        notebook,
                        e
                    ),
                }
            }
            CellStatus::Running => {
                let Some(execution) = entry.execution.as_mut() else {
                    tracing::warn!(
                        "Cell {} reported running without a pending execution (run {:?})",
                        cell_id,
                        op.run_id
                    );
                    return Ok(());
                };

                let started_at_ms = kernel_time_to_millis(op.timestamp);
                match host.start_execution(execution.token, started_at_ms) {
                    Ok(()) => execution.started_at_ms = Some(started_at_ms),
                    Err(e) => {
                        tracing::warn!("Failed to start execution for cell {}: {}", cell_id, e)
                    }
                }
                // Output must follow the start so the running UI is coherent.
                render_output(host.as_ref(), &cell_id, execution.token, &entry.state).await;
            }
            CellStatus::Idle => {
                let Some(token) = entry.execution.as_ref().map(|e| e.token) else {
                    tracing::warn!(
                        "Cell {} reported idle without a pending execution (run {:?})",
                        cell_id,
                        op.run_id
                    );
                    return Ok(());
                };

                // Output must land before the execution ends.
                render_output(host.as_ref(), &cell_id, token, &entry.state).await;

                entry.cancel_finalizer();
                let due = PendingFinalize {
                    notebook: notebook.clone(),
                    cell_id: cell_id.clone(),
                    generation: entry.generation,
                    run_id: entry.last_run_id.clone(),
                };
                entry.finalizer = Some(schedule_finalize(finalize_tx, finalize_delay, due));
            }
            CellStatus::Other(_) => match entry.execution.as_ref() {
                Some(execution) => {
                    render_output(host.as_ref(), &cell_id, execution.token, &entry.state).await;
                }
                None => tracing::debug!("Cell {}: no pending execution, update ignored", cell_id),
            },
        }

        Ok(())
    }

    /// Finish the execution for a due finalizer, unless a newer run has been
    /// queued since it was scheduled.
    pub async fn finalize(&mut self, due: PendingFinalize) {
        let key = (due.notebook.clone(), due.cell_id.clone());
        let Some(entry) = self.cells.get_mut(&key) else {
            tracing::debug!(
                "Finalize for unknown cell {} in {} ignored",
                due.cell_id,
                due.notebook
            );
            return;
        };

        if entry.generation != due.generation || entry.last_run_id != due.run_id {
            tracing::debug!(
                "Finalize for cell {} run {:?} skipped: superseded by {:?}",
                due.cell_id,
                due.run_id,
                entry.last_run_id
            );
            return;
        }

        entry.finalizer = None;
        if let Some(execution) = entry.execution.take() {
            let success = !entry.state.errored();
            let ended_at_ms = entry.state.finished_at.map(kernel_time_to_millis);
            end_execution(self.host.as_ref(), &due.cell_id, execution, success, ended_at_ms);
        }
    }

    /// Runtime state of a cell, if any message for it was seen.
    pub fn runtime_state(
        &self,
        notebook: &NotebookId,
        cell_id: &CellId,
    ) -> Option<&CellRuntimeState> {
        self.entry(notebook, cell_id).map(|entry| &entry.state)
    }

    /// The live execution of a cell, if any.
    pub fn live_execution(
        &self,
        notebook: &NotebookId,
        cell_id: &CellId,
    ) -> Option<&ExecutionHandle> {
        self.entry(notebook, cell_id)
            .and_then(|entry| entry.execution.as_ref())
    }

    fn entry(&self, notebook: &NotebookId, cell_id: &CellId) -> Option<&CellEntry> {
        self.cells.get(&(notebook.clone(), cell_id.clone()))
    }

    /// Number of live executions across all cells.
    pub fn live_count(&self) -> usize {
        self.cells
            .values()
            .filter(|entry| entry.execution.is_some())
            .count()
    }

    /// Drop all state for a closed notebook, ending its live executions.
    pub fn close_notebook(&mut self, notebook: &NotebookId) {
        let host = Arc::clone(&self.host);
        self.cells.retain(|(owner, cell_id), entry| {
            if owner != notebook {
                return true;
            }
            entry.cancel_finalizer();
            if let Some(execution) = entry.execution.take() {
                end_execution(host.as_ref(), cell_id, execution, true, None);
            }
            false
        });
    }

    /// Cancel pending finalizers and force-end every live execution.
    pub fn shutdown(&mut self) {
        let host = Arc::clone(&self.host);
        let mut ended = 0;
        for ((_, cell_id), entry) in self.cells.iter_mut() {
            entry.cancel_finalizer();
            if let Some(execution) = entry.execution.take() {
                end_execution(host.as_ref(), cell_id, execution, true, None);
                ended += 1;
            }
        }
        self.cells.clear();
        if ended > 0 {
            tracing::info!("Force-ended {} live execution(s) at shutdown", ended);
        }
    }

    /// Current index of `cell_id` in the document.
    ///
    /// `Ok(None)` when the document could not be read at all.
    async fn resolve_index(
        &self,
        notebook: &NotebookId,
        cell_id: &CellId,
    ) -> EngineResult<Option<CellIndex>> {
        let cells = match self.host.cells(notebook).await {
            Ok(cells) => cells,
            Err(e) => {
                tracing::warn!(
                    "Failed to read cells of {} for cell {}: {}",
                    notebook,
                    cell_id,
                    e
                );
                return Ok(None);
            }
        };

        match cells
            .iter()
            .position(|cell| identity_of(cell).as_ref() == Some(cell_id))
        {
            Some(index) => Ok(Some(index)),
            None => {
                tracing::error!(
                    "Operation for cell {} which does not exist in {} ({} cells)",
                    cell_id,
                    notebook,
                    cells.len()
                );
                Err(EngineError::UnresolvedCell {
                    notebook: notebook.clone(),
                    cell_id: cell_id.clone(),
                })
            }
        }
    }
}

impl<H> Drop for ExecutionRegistry<H> {
    fn drop(&mut self) {
        for entry in self.cells.values_mut() {
            entry.cancel_finalizer();
        }
    }
}

/// Deliver `due` on `tx` after `delay`. Aborting the handle cancels it.
fn schedule_finalize(
    tx: mpsc::UnboundedSender<PendingFinalize>,
    delay: Duration,
    due: PendingFinalize,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(due);
    })
    .abort_handle()
}

async fn render_output<H: EditorHost>(
    host: &H,
    cell_id: &CellId,
    token: ExecutionToken,
    state: &CellRuntimeState,
) {
    if let Err(e) = host.replace_output(token, state.render()).await {
        tracing::warn!("Failed to update output for cell {}: {}", cell_id, e);
    }
}

fn end_execution<H: EditorHost>(
    host: &H,
    cell_id: &CellId,
    execution: ExecutionHandle,
    success: bool,
    ended_at_ms: Option<u64>,
) {
    if let Err(e) = host.end_execution(execution.token, success, ended_at_ms) {
        tracing::warn!(
            "Failed to end execution for cell {} (run {:?}): {}",
            cell_id,
            execution.run_id,
            e
        );
    }
}
