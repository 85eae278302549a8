//! Per-session state container ("echo") and the process-wide session
//! manager.
//!
//! An echo holds everything one cascade execution accumulates: the mutable
//! state map, the append-only message history, the lineage of cell outputs,
//! and non-fatal error records. Sub-cascades get child echoes that merge
//! back into their parent on completion.

pub mod echo;
pub mod manager;

pub use echo::{Echo, EchoSnapshot, ErrorEntry, HistoryEntry, LineageEntry, ToolCallRecord};
pub use manager::SessionManager;
