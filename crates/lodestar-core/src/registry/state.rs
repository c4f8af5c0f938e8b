//! Cumulative per-cell runtime state and its rendering.

use serde::Serialize;
use serde_json::Value;

use crate::document::{CellOutput, OutputItem, STDERR_MIME, STDOUT_MIME};
use crate::identity::NotebookId;
use crate::protocol::{CellOperation, CellStatus, OutputChannel, OutputPayload};

/// Everything the kernel has told us about one cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellRuntimeState {
    /// Notebook the cell belongs to.
    pub notebook: NotebookId,
    /// Last status received.
    pub status: CellStatus,
    /// Latest main output.
    pub output: Option<OutputPayload>,
    /// Console fragments of the current run, in arrival order.
    pub console: Vec<OutputPayload>,
    /// Error data from the current run, if it raised.
    pub error: Option<Value>,
    /// Kernel time the current run started (seconds).
    pub started_at: Option<f64>,
    /// Kernel time the current run went idle (seconds).
    pub finished_at: Option<f64>,
}

impl CellRuntimeState {
    pub fn new(notebook: NotebookId) -> Self {
        Self {
            notebook,
            status: CellStatus::default(),
            output: None,
            console: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Fold one operation message into the state.
    pub fn apply(&mut self, op: &CellOperation) {
        if let Some(status) = &op.status {
            match status {
                CellStatus::Queued => {
                    self.error = None;
                    self.finished_at = None;
                }
                CellStatus::Running if self.status != CellStatus::Running => {
                    self.console.clear();
                    self.started_at = Some(op.timestamp);
                }
                CellStatus::Idle => self.finished_at = Some(op.timestamp),
                _ => {}
            }
            self.status = status.clone();
        }

        if let Some(output) = &op.output {
            if output.channel == OutputChannel::Error {
                self.error = Some(output.data.clone());
            }
            self.output = Some(output.clone());
        }

        if let Some(console) = &op.console {
            let fragments = console.clone().into_fragments();
            if fragments.is_empty() {
                self.console.clear();
            } else {
                self.console.extend(fragments);
            }
        }
    }

    /// Whether the current run raised.
    pub fn errored(&self) -> bool {
        self.error.is_some()
    }

    /// Render the state as host outputs: main output first, then console
    /// streams with adjacent same-stream text merged.
    pub fn render(&self) -> Vec<CellOutput> {
        let mut outputs = Vec::new();

        if let Some(output) = self.output.as_ref().filter(|o| !o.is_blank()) {
            outputs.push(CellOutput::single(OutputItem::new(
                output.mimetype.clone(),
                output.data.clone(),
            )));
        }

        let mut last_stream: Option<&str> = None;
        for fragment in self.console.iter().filter(|f| !f.is_blank()) {
            let mime = match fragment.channel {
                OutputChannel::Stderr | OutputChannel::Error => STDERR_MIME,
                _ => STDOUT_MIME,
            };

            if last_stream == Some(mime)
                && let (Some(last), Value::String(text)) = (outputs.last_mut(), &fragment.data)
                && let Some(Value::String(existing)) =
                    last.items.first_mut().map(|item| &mut item.data)
            {
                existing.push_str(text);
                continue;
            }

            let item = match &fragment.data {
                Value::String(text) => OutputItem::text(mime, text.clone()),
                other => OutputItem::text(mime, other.to_string()),
            };
            outputs.push(CellOutput::single(item));
            last_stream = Some(mime);
        }

        outputs
    }
}
