//! Seams to the external collaborators.
//!
//! The engine never talks to an editor or a kernel process directly. It is
//! generic over an [`EditorHost`] (document model, edit application,
//! execution reporting, UI flags) and a [`KernelLink`] (advisory requests to
//! the kernel). Operation messages and document events are delivered to the
//! engine as streams; these traits cover only the calls the engine makes.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::document::{CellOutput, EditBatch, NotebookCell};
use crate::error::{HostError, HostResult, LinkResult};
use crate::identity::{CellId, CellIndex, NotebookId};
use crate::protocol::DeleteCellRequest;

/// Opaque handle of an execution-reporting object owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionToken(pub u64);

/// The editor host.
pub trait EditorHost: Send + Sync + 'static {
    /// Current cells of a notebook, in document order.
    fn cells(
        &self,
        notebook: &NotebookId,
    ) -> impl Future<Output = HostResult<Vec<NotebookCell>>> + Send;

    /// The cell currently at `index`.
    fn cell(
        &self,
        notebook: &NotebookId,
        index: CellIndex,
    ) -> impl Future<Output = HostResult<NotebookCell>> + Send {
        async move {
            let mut cells = self.cells(notebook).await?;
            let len = cells.len();
            if index >= len {
                return Err(HostError::IndexOutOfRange {
                    notebook: notebook.clone(),
                    index,
                    len,
                });
            }
            Ok(cells.swap_remove(index))
        }
    }

    /// Apply every edit in the batch atomically.
    fn apply_edit(&self, batch: EditBatch) -> impl Future<Output = HostResult<()>> + Send;

    /// Persist the notebook.
    fn save(&self, notebook: &NotebookId) -> impl Future<Output = HostResult<()>> + Send;

    /// Create an execution-reporting handle for the cell at `index`.
    fn begin_execution(
        &self,
        notebook: &NotebookId,
        index: CellIndex,
    ) -> HostResult<ExecutionToken>;

    /// Mark the execution as started at `started_at_ms` (host milliseconds).
    fn start_execution(&self, token: ExecutionToken, started_at_ms: u64) -> HostResult<()>;

    /// End the execution. The handle is dead afterwards.
    fn end_execution(
        &self,
        token: ExecutionToken,
        success: bool,
        ended_at_ms: Option<u64>,
    ) -> HostResult<()>;

    /// Replace the rendered output of the execution's cell.
    fn replace_output(
        &self,
        token: ExecutionToken,
        outputs: Vec<CellOutput>,
    ) -> impl Future<Output = HostResult<()>> + Send;

    /// Set a host-visible boolean flag used for UI enablement.
    fn set_flag(&self, name: &str, value: bool) -> HostResult<()>;
}

/// The command side of the kernel link.
pub trait KernelLink: Send + Sync + 'static {
    /// Tell the kernel a cell no longer exists.
    fn delete_cell(
        &self,
        request: DeleteCellRequest,
    ) -> impl Future<Output = LinkResult<()>> + Send;
}

/// Notify the kernel that `cell_id` was deleted. Failures are logged only.
pub async fn notify_cell_deleted<K: KernelLink>(
    kernel: &K,
    notebook: &NotebookId,
    cell_id: &CellId,
) {
    tracing::debug!("Notifying kernel that cell {} was deleted from {}", cell_id, notebook);
    let request = DeleteCellRequest {
        notebook: notebook.clone(),
        cell_id: cell_id.clone(),
    };
    if let Err(e) = kernel.delete_cell(request).await {
        tracing::warn!(
            "Failed to notify kernel of deleted cell {} in {}: {}",
            cell_id,
            notebook,
            e
        );
    }
}
