//! Append-only telemetry store and the asynchronous logger in front of it.
//!
//! Four tables: universal log rows plus the three analytics tables. The
//! reference backend is JSONL files under a state dir; an in-memory
//! backend backs tests and short-lived embedders. Delivery is
//! at-least-once — readers deduplicate on `(trace_id, node_type)`.

pub mod logger;
pub mod store;

pub use logger::{ExecutionContext, Logger};
pub use store::{JsonlLogStore, LogStore, MemoryLogStore};
