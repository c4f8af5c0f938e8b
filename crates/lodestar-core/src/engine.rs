//! The engine actor.
//!
//! [`Engine`] owns the execution registry, the staleness tracker, and the
//! redeserialization coordinator, and processes one event at a time to
//! completion. It can be driven directly (each `handle_*` method processes a
//! single event) or run as a task with [`Engine::run`], in which case an
//! [`EngineHandle`] reaches it through a command channel.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::EngineConfig;
use crate::coordinator::{Reconciliation, RedeserializationCoordinator};
use crate::document::DocumentEvent;
use crate::error::{EngineError, EngineResult};
use crate::host::{EditorHost, KernelLink};
use crate::identity::{CellId, CellIndex, NotebookId};
use crate::protocol::KernelNotification;
use crate::registry::{CellRuntimeState, ExecutionRegistry, PendingFinalize};
use crate::staleness::{StaleChange, StalenessTracker};

/// Requests sent from an [`EngineHandle`] to the running engine.
#[derive(Debug)]
pub enum EngineCommand {
    MarkStale {
        notebook: NotebookId,
        index: CellIndex,
        reply: oneshot::Sender<()>,
    },
    ClearStale {
        notebook: NotebookId,
        index: CellIndex,
        reply: oneshot::Sender<()>,
    },
    GetStaleCells {
        notebook: NotebookId,
        reply: oneshot::Sender<Vec<CellIndex>>,
    },
    SetActiveNotebook {
        notebook: Option<NotebookId>,
        reply: oneshot::Sender<()>,
    },
    CloseNotebook {
        notebook: NotebookId,
        reply: oneshot::Sender<()>,
    },
    RuntimeState {
        notebook: NotebookId,
        cell_id: CellId,
        reply: oneshot::Sender<Option<CellRuntimeState>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Event streams the running engine consumes.
pub struct EngineInputs {
    /// Operation messages from the kernel.
    pub kernel: mpsc::UnboundedReceiver<KernelNotification>,
    /// Document events from the editor host.
    pub documents: mpsc::UnboundedReceiver<DocumentEvent>,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    changes: broadcast::Sender<StaleChange>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Mark a cell stale.
    pub async fn mark_cell_stale(
        &self,
        notebook: NotebookId,
        index: CellIndex,
    ) -> EngineResult<()> {
        self.request(|reply| EngineCommand::MarkStale {
            notebook,
            index,
            reply,
        })
        .await
    }

    /// Clear a cell's staleness.
    pub async fn clear_cell_stale(
        &self,
        notebook: NotebookId,
        index: CellIndex,
    ) -> EngineResult<()> {
        self.request(|reply| EngineCommand::ClearStale {
            notebook,
            index,
            reply,
        })
        .await
    }

    /// Stale indices of a notebook, ascending.
    pub async fn get_stale_cells(&self, notebook: NotebookId) -> EngineResult<Vec<CellIndex>> {
        self.request(|reply| EngineCommand::GetStaleCells { notebook, reply })
            .await
    }

    /// Stream of staleness snapshots. Slow receivers lag rather than block.
    pub fn subscribe_staleness(&self) -> broadcast::Receiver<StaleChange> {
        self.changes.subscribe()
    }

    pub async fn set_active_notebook(&self, notebook: Option<NotebookId>) -> EngineResult<()> {
        self.request(|reply| EngineCommand::SetActiveNotebook { notebook, reply })
            .await
    }

    /// Tear down a notebook's executions and staleness.
    pub async fn close_notebook(&self, notebook: NotebookId) -> EngineResult<()> {
        self.request(|reply| EngineCommand::CloseNotebook { notebook, reply })
            .await
    }

    pub async fn runtime_state(
        &self,
        notebook: NotebookId,
        cell_id: CellId,
    ) -> EngineResult<Option<CellRuntimeState>> {
        self.request(|reply| EngineCommand::RuntimeState {
            notebook,
            cell_id,
            reply,
        })
        .await
    }

    /// Stop the engine. Succeeds if it already stopped.
    pub async fn shutdown(&self) -> EngineResult<()> {
        match self.request(|reply| EngineCommand::Shutdown { reply }).await {
            Err(EngineError::Closed) => Ok(()),
            other => other,
        }
    }
}

/// Single-task notebook execution engine.
pub struct Engine<H, K> {
    host: Arc<H>,
    registry: ExecutionRegistry<H>,
    staleness: StalenessTracker<H>,
    coordinator: RedeserializationCoordinator<H, K>,
    commands: mpsc::Receiver<EngineCommand>,
    due: mpsc::UnboundedReceiver<PendingFinalize>,
}

impl<H: EditorHost, K: KernelLink> Engine<H, K> {
    pub fn new(host: Arc<H>, kernel: Arc<K>, config: EngineConfig) -> (Self, EngineHandle) {
        let (commands_tx, commands) = mpsc::channel(config.command_capacity.max(1));
        let (due_tx, due) = mpsc::unbounded_channel();

        let staleness = StalenessTracker::new(
            Arc::clone(&host),
            config.stale_flag.clone(),
            config.change_capacity,
        );
        let handle = EngineHandle {
            commands: commands_tx,
            changes: staleness.change_sender(),
        };

        let engine = Self {
            registry: ExecutionRegistry::new(Arc::clone(&host), config.finalize_delay, due_tx),
            coordinator: RedeserializationCoordinator::new(Arc::clone(&host), kernel),
            staleness,
            host,
            commands,
            due,
        };
        (engine, handle)
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn staleness(&self) -> &StalenessTracker<H> {
        &self.staleness
    }

    pub fn registry(&self) -> &ExecutionRegistry<H> {
        &self.registry
    }

    /// Process one kernel operation message.
    pub async fn handle_kernel(&mut self, notification: KernelNotification) -> EngineResult<()> {
        self.registry
            .handle_cell_operation(
                &notification.notebook,
                notification.operation,
                &mut self.staleness,
            )
            .await
    }

    /// Process one document event.
    pub async fn handle_document(&mut self, event: DocumentEvent) -> Option<Reconciliation> {
        match event {
            DocumentEvent::Changed(change) => {
                self.coordinator
                    .on_document_change(&change, &mut self.staleness)
                    .await
            }
            DocumentEvent::Closed { notebook } => {
                self.close_notebook(&notebook);
                None
            }
        }
    }

    /// Run every finalizer whose timer already fired. Returns how many ran.
    pub async fn run_due_finalizers(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(due) = self.due.try_recv() {
            self.registry.finalize(due).await;
            ran += 1;
        }
        ran
    }

    pub async fn mark_cell_stale(&mut self, notebook: &NotebookId, index: CellIndex) {
        self.staleness.mark_stale(notebook, index).await;
    }

    pub async fn clear_cell_stale(&mut self, notebook: &NotebookId, index: CellIndex) {
        self.staleness.clear_stale(notebook, index).await;
    }

    pub fn get_stale_cells(&self, notebook: &NotebookId) -> Vec<CellIndex> {
        self.staleness.get_stale_cells(notebook)
    }

    pub fn set_active_notebook(&mut self, notebook: Option<NotebookId>) {
        self.staleness.set_active_notebook(notebook);
    }

    pub fn runtime_state(
        &self,
        notebook: &NotebookId,
        cell_id: &CellId,
    ) -> Option<&CellRuntimeState> {
        self.registry.runtime_state(notebook, cell_id)
    }

    /// Force-end a notebook's executions and drop its tracking.
    pub fn close_notebook(&mut self, notebook: &NotebookId) {
        tracing::info!("Closing {}", notebook);
        self.registry.close_notebook(notebook);
        self.staleness.clear_notebook(notebook);
        if self.staleness.active_notebook() == Some(notebook) {
            self.staleness.set_active_notebook(None);
        }
    }

    /// Cancel timers, force-end live executions, and clear all state.
    pub fn shutdown(&mut self) {
        self.registry.shutdown();
        self.staleness.clear_all();
        // Timers already fired before the abort are dropped unprocessed.
        while self.due.try_recv().is_ok() {}
        tracing::info!("Engine stopped");
    }

    /// Process events until shutdown is requested or every input is closed.
    ///
    /// Pending events win over handle commands, so a command observes every
    /// event queued before it. Kernel messages win over due finalizers: output
    /// that arrived before a timer fired still belongs to the run it ends.
    pub async fn run(mut self, inputs: EngineInputs) {
        let EngineInputs {
            mut kernel,
            mut documents,
        } = inputs;
        let mut kernel_open = true;
        let mut documents_open = true;
        let mut commands_open = true;

        tracing::info!("Engine started");
        loop {
            if !kernel_open && !documents_open && !commands_open {
                tracing::debug!("All engine inputs closed");
                break;
            }

            tokio::select! {
                biased;

                message = kernel.recv(), if kernel_open => match message {
                    // Unresolved cells are already logged loudly by the registry.
                    Some(message) => {
                        if let Err(e) = self.handle_kernel(message).await {
                            tracing::debug!("Kernel message dropped: {}", e);
                        }
                    }
                    None => kernel_open = false,
                },

                Some(due) = self.due.recv() => {
                    self.registry.finalize(due).await;
                }

                event = documents.recv(), if documents_open => match event {
                    Some(event) => {
                        self.handle_document(event).await;
                    }
                    None => documents_open = false,
                },

                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if let Some(reply) = self.handle_command(command).await {
                            // Stop admitting events before tearing down.
                            drop(kernel);
                            drop(documents);
                            self.shutdown();
                            let _ = reply.send(());
                            return;
                        }
                    }
                    None => commands_open = false,
                },
            }
        }

        self.shutdown();
    }

    /// Answer one handle request. A shutdown request is handed back with its
    /// reply channel for the run loop to tear down.
    async fn handle_command(&mut self, command: EngineCommand) -> Option<oneshot::Sender<()>> {
        match command {
            EngineCommand::MarkStale {
                notebook,
                index,
                reply,
            } => {
                self.mark_cell_stale(&notebook, index).await;
                let _ = reply.send(());
            }
            EngineCommand::ClearStale {
                notebook,
                index,
                reply,
            } => {
                self.clear_cell_stale(&notebook, index).await;
                let _ = reply.send(());
            }
            EngineCommand::GetStaleCells { notebook, reply } => {
                let _ = reply.send(self.get_stale_cells(&notebook));
            }
            EngineCommand::SetActiveNotebook { notebook, reply } => {
                self.set_active_notebook(notebook);
                let _ = reply.send(());
            }
            EngineCommand::CloseNotebook { notebook, reply } => {
                self.close_notebook(&notebook);
                let _ = reply.send(());
            }
            EngineCommand::RuntimeState {
                notebook,
                cell_id,
                reply,
            } => {
                let _ = reply.send(self.runtime_state(&notebook, &cell_id).cloned());
            }
            EngineCommand::Shutdown { reply } => return Some(reply),
        }
        None
    }
}
