//! Post-cascade analytics worker.
//!
//! Runs after `cascade_completed` lands in the store, off the cascade's
//! critical path. Computes per-session and per-cell aggregates, compares
//! them against global / cluster / genus / species baselines, flags
//! outliers, and attributes cost between re-injected context and new
//! work. Failures are logged and swallowed — analytics never touches a
//! cascade's outcome.

pub mod baselines;
pub mod complexity;
pub mod worker;

pub use worker::run_for_session;
