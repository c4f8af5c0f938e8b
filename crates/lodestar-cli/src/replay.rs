//! Replay a scenario through the engine against the in-memory host.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lodestar_core::memory::{ExecutionRecord, MemoryHost, RecordingKernel};
use lodestar_core::{
    CellId, CellIndex, CellOutput, DocumentEvent, Engine, EngineConfig, KernelNotification,
    NotebookCell, NotebookId, identity_of,
};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::scenario::{Scenario, ScenarioCell, Step};

/// Final state of one cell.
#[derive(Debug, Serialize)]
pub struct CellReport {
    pub index: CellIndex,
    pub id: Option<CellId>,
    pub source: String,
    pub stale_marker: bool,
    pub outputs: Vec<CellOutput>,
}

/// What a replay produced.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub notebook: NotebookId,
    pub cells: Vec<CellReport>,
    pub stale_cells: Vec<CellIndex>,
    pub deleted_cells: Vec<CellId>,
    pub executions: Vec<ExecutionRecord>,
}

struct Replay {
    host: Arc<MemoryHost>,
    kernel: Arc<RecordingKernel>,
    engine: Engine<MemoryHost, RecordingKernel>,
    documents: mpsc::UnboundedReceiver<DocumentEvent>,
    notebook: NotebookId,
    finalize_delay: Duration,
}

impl Replay {
    fn new(scenario: &Scenario, config: EngineConfig) -> Self {
        let host = Arc::new(MemoryHost::new());
        let kernel = Arc::new(RecordingKernel::new());
        let notebook = scenario.notebook_id();
        host.open_notebook(notebook.clone(), scenario.initial_cells());
        let documents = host.change_events();

        let finalize_delay = config.finalize_delay;
        let (mut engine, _handle) = Engine::new(Arc::clone(&host), Arc::clone(&kernel), config);
        engine.set_active_notebook(Some(notebook.clone()));

        Self {
            host,
            kernel,
            engine,
            documents,
            notebook,
            finalize_delay,
        }
    }

    /// Feed every pending document event to the engine, including the ones
    /// its own edits produce.
    async fn settle(&mut self) {
        while let Ok(event) = self.documents.try_recv() {
            if let Some(summary) = self.engine.handle_document(event).await {
                tracing::debug!(
                    "Reconciled: {} restored, {} new, {} deleted",
                    summary.restored.len(),
                    summary.minted.len(),
                    summary.deleted.len()
                );
            }
        }
    }

    async fn wait(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await;
        let ran = self.engine.run_due_finalizers().await;
        tracing::debug!("Waited {:?}, {} finalizer(s) ran", duration, ran);
        self.settle().await;
    }

    async fn step(&mut self, step: &Step) -> anyhow::Result<()> {
        let notebook = self.notebook.clone();
        match step {
            Step::Kernel { operation } => {
                self.engine
                    .handle_kernel(KernelNotification {
                        notebook,
                        operation: operation.clone(),
                    })
                    .await?;
            }
            Step::Edit { index, source } => {
                self.host.edit_cell_source(&notebook, *index, source.clone())?
            }
            Step::Insert { index, cell } => {
                self.host.insert_cell(&notebook, *index, cell.to_cell())?
            }
            Step::Delete { index } => self.host.delete_cell(&notebook, *index)?,
            Step::Move { from, to } => self.host.move_cell(&notebook, *from, *to)?,
            Step::ReplaceAll { cells } => {
                let cells: Vec<NotebookCell> = cells.iter().map(ScenarioCell::to_cell).collect();
                self.host.replace_all_cells(&notebook, cells)?
            }
            Step::MarkStale { index } => self.engine.mark_cell_stale(&notebook, *index).await,
            Step::ClearStale { index } => self.engine.clear_cell_stale(&notebook, *index).await,
            Step::Wait { ms } => self.wait(Duration::from_millis(*ms)).await,
        }
        self.settle().await;
        Ok(())
    }

    /// Let outstanding finalizers fire, then stop the engine.
    async fn finish(mut self) -> ReplayReport {
        if self.engine.registry().live_count() > 0 {
            self.wait(self.finalize_delay * 2).await;
        }

        let stale_cells = self.engine.get_stale_cells(&self.notebook);
        self.engine.shutdown();

        let cells = self
            .host
            .cells_of(&self.notebook)
            .into_iter()
            .enumerate()
            .map(|(index, cell)| CellReport {
                index,
                id: identity_of(&cell),
                stale_marker: lodestar_core::staleness::is_marked_stale(&cell.metadata),
                source: cell.source,
                outputs: cell.outputs,
            })
            .collect();

        ReplayReport {
            notebook: self.notebook,
            cells,
            stale_cells,
            deleted_cells: self
                .kernel
                .deletions()
                .into_iter()
                .map(|request| request.cell_id)
                .collect(),
            executions: self.host.executions(),
        }
    }
}

/// Play every step of a scenario and return the final state.
pub async fn run(scenario: &Scenario, config: EngineConfig) -> anyhow::Result<ReplayReport> {
    let mut replay = Replay::new(scenario, config);
    tracing::info!(
        "Replaying {} step(s) against {} ({} cells)",
        scenario.steps.len(),
        replay.notebook,
        scenario.cells.len()
    );

    for (number, step) in scenario.steps.iter().enumerate() {
        replay
            .step(step)
            .await
            .with_context(|| format!("Step {} ({}) failed", number + 1, step.name()))?;
    }

    Ok(replay.finish().await)
}

/// `lodestar replay`: run a scenario file and print the report as JSON.
pub async fn execute(path: &Path, finalize_delay_ms: u64) -> anyhow::Result<()> {
    let scenario = Scenario::load(path).await?;
    scenario.validate()?;

    let config =
        EngineConfig::default().with_finalize_delay(Duration::from_millis(finalize_delay_ms));
    let report = run(&scenario, config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `lodestar check`: parse and validate a scenario without running it.
pub async fn check(path: &Path) -> anyhow::Result<()> {
    let scenario = Scenario::load(path).await?;
    scenario.validate()?;
    println!(
        "{}: {} cells, {} steps OK",
        path.display(),
        scenario.cells.len(),
        scenario.steps.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(json: &str) -> Scenario {
        serde_json::from_str(json).expect("valid scenario")
    }

    fn fast() -> EngineConfig {
        EngineConfig::default().with_finalize_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_replay_run_and_reparse() {
        let scenario = scenario(
            r#"{
                "cells": [{"id": "a", "source": "x = 1"}, {"id": "b", "source": "print(x)"}],
                "steps": [
                    {"step": "kernel", "operation": {"cell_id": "b", "run_id": "r1", "status": "queued"}},
                    {"step": "kernel", "operation": {"cell_id": "b", "run_id": "r1", "status": "running",
                        "console": [{"channel": "stdout", "mimetype": "text/plain", "data": "1\n"}]}},
                    {"step": "kernel", "operation": {"cell_id": "b", "run_id": "r1", "status": "idle"}},
                    {"step": "wait", "ms": 20},
                    {"step": "replace_all", "cells": [{"source": "print(x)"}]}
                ]
            }"#,
        );

        let report = run(&scenario, fast()).await.unwrap();
        assert_eq!(report.cells.len(), 1);
        assert_eq!(report.cells[0].id, Some(CellId::new("b")));
        assert_eq!(report.cells[0].outputs.len(), 1);
        assert_eq!(report.deleted_cells, vec![CellId::new("a")]);
        assert_eq!(report.executions[0].ended, Some(true));
    }

    #[tokio::test]
    async fn test_replay_reports_stale_cells() {
        let scenario = scenario(
            r#"{
                "cells": [{"id": "a", "source": "x = 1"}, {"id": "b", "source": "y = 2"}],
                "steps": [{"step": "edit", "index": 1, "source": "y = 3"}]
            }"#,
        );

        let report = run(&scenario, fast()).await.unwrap();
        assert_eq!(report.stale_cells, vec![1]);
        assert!(report.cells[1].stale_marker);
        assert!(!report.cells[0].stale_marker);
    }

    #[tokio::test]
    async fn test_replay_fails_on_desync() {
        let scenario = scenario(
            r#"{
                "cells": [{"id": "a", "source": "x = 1"}],
                "steps": [{"step": "kernel", "operation": {"cell_id": "zzz", "status": "queued"}}]
            }"#,
        );

        let err = run(&scenario, fast()).await.unwrap_err();
        assert!(format!("{err:#}").contains("does not resolve"));
    }
}
