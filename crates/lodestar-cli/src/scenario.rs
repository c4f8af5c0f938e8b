//! Replay scenario format.
//!
//! A scenario is a JSON file describing one notebook and a sequence of steps
//! played against it:
//!
//! ```json
//! {
//!   "notebook": "file:///demo.py",
//!   "cells": [{"id": "a", "source": "x = 1"}, {"source": "# Notes", "kind": "markdown"}],
//!   "steps": [
//!     {"step": "edit", "index": 0, "source": "x = 2"},
//!     {"step": "kernel", "operation": {"cell_id": "a", "status": "queued"}},
//!     {"step": "wait", "ms": 100}
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, bail};
use lodestar_core::{CellIndex, CellKind, CellOperation, NotebookCell, NotebookId};
use serde::Deserialize;

const DEFAULT_NOTEBOOK: &str = "file:///scenario.py";

fn default_notebook() -> String {
    DEFAULT_NOTEBOOK.to_string()
}

/// A cell as written in a scenario.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioCell {
    /// Persisted identity. Cells without one start unidentified.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: CellKind,
    pub source: String,
}

impl ScenarioCell {
    pub fn to_cell(&self) -> NotebookCell {
        let cell = NotebookCell {
            kind: self.kind,
            ..NotebookCell::code(self.source.clone())
        };
        match &self.id {
            Some(id) => cell.with_id(id.clone()),
            None => cell,
        }
    }
}

/// One scripted action.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Deliver a kernel operation message.
    Kernel { operation: CellOperation },
    /// Replace the source text of a cell.
    Edit { index: CellIndex, source: String },
    /// Insert a cell.
    Insert { index: CellIndex, cell: ScenarioCell },
    /// Delete a cell.
    Delete { index: CellIndex },
    /// Move a cell.
    Move { from: CellIndex, to: CellIndex },
    /// Re-read the notebook from disk with the given cells.
    ReplaceAll { cells: Vec<ScenarioCell> },
    /// Explicitly mark a cell stale.
    MarkStale { index: CellIndex },
    /// Explicitly clear a cell's staleness.
    ClearStale { index: CellIndex },
    /// Let time pass so deferred finalizers can fire.
    Wait { ms: u64 },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kernel { .. } => "kernel",
            Self::Edit { .. } => "edit",
            Self::Insert { .. } => "insert",
            Self::Delete { .. } => "delete",
            Self::Move { .. } => "move",
            Self::ReplaceAll { .. } => "replace_all",
            Self::MarkStale { .. } => "mark_stale",
            Self::ClearStale { .. } => "clear_stale",
            Self::Wait { .. } => "wait",
        }
    }
}

/// A complete replay script.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default = "default_notebook")]
    pub notebook: String,
    #[serde(default)]
    pub cells: Vec<ScenarioCell>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Read and parse a scenario file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid scenario {}", path.display()))
    }

    pub fn notebook_id(&self) -> NotebookId {
        NotebookId::new(self.notebook.clone())
    }

    pub fn initial_cells(&self) -> Vec<NotebookCell> {
        self.cells.iter().map(ScenarioCell::to_cell).collect()
    }

    /// Check the script for mistakes that would make a replay meaningless:
    /// duplicate initial identities and indices that cannot exist at the
    /// point a step runs.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for id in self.cells.iter().filter_map(|cell| cell.id.as_deref()) {
            if !seen.insert(id) {
                bail!("Duplicate cell id {:?} in initial cells", id);
            }
        }

        let mut len = self.cells.len();
        for (number, step) in self.steps.iter().enumerate() {
            let in_range = |index: CellIndex| -> anyhow::Result<()> {
                if index >= len {
                    bail!(
                        "Step {} ({}): index {} out of range ({} cells)",
                        number + 1,
                        step.name(),
                        index,
                        len
                    );
                }
                Ok(())
            };

            match step {
                Step::Edit { index, .. }
                | Step::MarkStale { index }
                | Step::ClearStale { index } => in_range(*index)?,
                Step::Delete { index } => {
                    in_range(*index)?;
                    len -= 1;
                }
                Step::Move { from, .. } => in_range(*from)?,
                Step::Insert { .. } => len += 1,
                Step::ReplaceAll { cells } => len = cells.len(),
                Step::Kernel { .. } | Step::Wait { .. } => {}
            }
        }

        Ok(())
    }
}
