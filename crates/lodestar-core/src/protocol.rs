//! Kernel link protocol messages.
//!
//! Operation messages arrive from the kernel as JSON objects:
//!
//! ```json
//! {"cell_id": "c1", "run_id": "r7", "status": "running", "timestamp": 1712.5,
//!  "output": {"channel": "output", "mimetype": "text/plain", "data": "42"},
//!  "console": [{"channel": "stdout", "mimetype": "text/plain", "data": "hi\n"}]}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{CellId, NotebookId, RunId};

/// Execution status carried by an operation message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CellStatus {
    /// Scheduled by the kernel, not yet running.
    Queued,
    /// Running in the kernel.
    Running,
    /// Finished (successfully or not).
    #[default]
    Idle,
    /// Any status the engine does not drive transitions for.
    Other(String),
}

impl CellStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Other(status) => status,
        }
    }
}

impl From<String> for CellStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "idle" => Self::Idle,
            _ => Self::Other(status),
        }
    }
}

impl From<CellStatus> for String {
    fn from(status: CellStatus) -> Self {
        match status {
            CellStatus::Other(status) => status,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel an output fragment was produced on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    /// The cell's main output.
    Output,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// Input prompt echo.
    Stdin,
    /// Error raised by the cell.
    Error,
}

/// An output payload: structured data plus its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub channel: OutputChannel,
    pub mimetype: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: f64,
}

impl OutputPayload {
    pub fn new(channel: OutputChannel, mimetype: impl Into<String>, data: Value) -> Self {
        Self {
            channel,
            mimetype: mimetype.into(),
            data,
            timestamp: 0.0,
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(OutputChannel::Stdout, "text/plain", Value::String(text.into()))
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(OutputChannel::Stderr, "text/plain", Value::String(text.into()))
    }

    /// Whether the payload carries nothing worth rendering.
    pub fn is_blank(&self) -> bool {
        match &self.data {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

/// Console field of an operation message: one fragment or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConsoleUpdate {
    Many(Vec<OutputPayload>),
    One(OutputPayload),
}

impl ConsoleUpdate {
    pub fn into_fragments(self) -> Vec<OutputPayload> {
        match self {
            Self::Many(fragments) => fragments,
            Self::One(fragment) => vec![fragment],
        }
    }
}

/// One kernel operation message for one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOperation {
    pub cell_id: CellId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// `None` for messages that only carry output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CellStatus>,
    /// Kernel timestamp in seconds.
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputPayload>,
    /// `None` leaves console output untouched, an empty list clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleUpdate>,
}

impl CellOperation {
    pub fn new(cell_id: CellId, status: CellStatus) -> Self {
        Self {
            cell_id,
            run_id: None,
            status: Some(status),
            timestamp: 0.0,
            output: None,
            console: None,
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(RunId::new(run_id));
        self
    }

    pub fn at(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_output(mut self, output: OutputPayload) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_console(mut self, fragments: Vec<OutputPayload>) -> Self {
        self.console = Some(ConsoleUpdate::Many(fragments));
        self
    }
}

/// An operation message tagged with the notebook it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelNotification {
    pub notebook: NotebookId,
    pub operation: CellOperation,
}

/// Best-effort request telling the kernel a cell was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteCellRequest {
    pub notebook: NotebookId,
    pub cell_id: CellId,
}

/// Convert a kernel timestamp (seconds) into host milliseconds.
///
/// This is the only place kernel time is rescaled.
pub fn kernel_time_to_millis(seconds: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    (seconds * 1000.0).round() as u64
}
