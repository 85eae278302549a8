//! The cascade execution engine.
//!
//! Runs declarative pipelines of heterogeneous cells — model calls,
//! deterministic tools, human checkpoints — with handoff routing,
//! candidate fan-out, context threading, and append-only telemetry.
//!
//! Entry point: build an [`Engine`] with its collaborators (session
//! manager, provider registry, tool registry, log store) and call
//! [`Engine::run_cascade`].

pub mod branch;
pub mod cancel;
pub mod candidates;
pub mod cell;
pub mod checkpoint;
pub mod context;
pub mod pool;
pub mod scheduler;
pub mod wards;

pub use branch::BranchManager;
pub use cancel::{CancelMap, CancelToken};
pub use cell::CellOutcome;
pub use checkpoint::{CheckpointBroker, CheckpointRecord, CheckpointResponse, CheckpointStatus};
pub use context::{AssembledContext, ContextRecord};
pub use pool::WorkerPool;
pub use scheduler::{
    CascadeFailure, CascadeResult, CascadeStatus, CellRunSummary, Engine, RunOptions,
};
