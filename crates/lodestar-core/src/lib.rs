//! Notebook execution engine for lodestar.
//!
//! This crate provides:
//! - Stable cell identity persisted in cell metadata
//! - Execution registry binding kernel operation messages to host execution handles
//! - Staleness tracking with persisted markers and a host UI flag
//! - Redeserialization reconciliation that keeps identity and outputs across re-parses
//! - An in-memory editor host and kernel link for replay and tests

pub mod config;
pub mod coordinator;
pub mod document;
pub mod engine;
pub mod error;
pub mod host;
pub mod identity;
pub mod matcher;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod staleness;

pub use config::EngineConfig;
pub use coordinator::{Reconciliation, RedeserializationCoordinator, is_bulk_replacement};
pub use document::{
    CellChange, CellKind, CellOutput, ContentChange, DocumentChangeEvent, DocumentEvent, EditBatch,
    Metadata, NotebookCell, NotebookEdit, OutputItem,
};
pub use engine::{Engine, EngineCommand, EngineHandle, EngineInputs};
pub use error::{EngineError, EngineResult, HostError, HostResult, LinkError, LinkResult};
pub use host::{EditorHost, ExecutionToken, KernelLink};
pub use identity::{CellId, CellIndex, NotebookId, RunId, assign_identity, identity_of};
pub use matcher::{CellMatch, match_cells};
pub use memory::{ExecutionRecord, HostEvent, MemoryHost, RecordingKernel};
pub use protocol::{
    CellOperation, CellStatus, ConsoleUpdate, DeleteCellRequest, KernelNotification,
    OutputChannel, OutputPayload,
};
pub use registry::{CellRuntimeState, ExecutionHandle, ExecutionRegistry, PendingFinalize};
pub use staleness::{StaleChange, StalenessTracker};
