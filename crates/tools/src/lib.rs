//! Tool contract, registry, and the deterministic executor.
//!
//! A tool is a typed capability: name + description + JSON-schema
//! parameters + an async `invoke`. LLM cells see tool catalogs filtered by
//! their trait policy; deterministic cells dispatch directly through the
//! [`executor::DeterministicExecutor`].

pub mod executor;
pub mod registry;
pub mod shell;
pub mod target;
pub mod tool;

pub use executor::{DeterministicExecutor, DeterministicOutcome};
pub use registry::ToolRegistry;
pub use target::{parse_tool_target, ToolTarget};
pub use tool::{FnTool, Route, Tool, ToolContext};
