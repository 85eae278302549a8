//! Sandboxed template engine for cell instructions and tool inputs.
//!
//! Templates interpolate `{{ expression }}` holes against an evaluation
//! scope of `{input, state, outputs, env, session_id, checkpoint_id}`.
//! The expression language is deliberately small: dotted paths, literals,
//! comparisons, `and`/`or`/`not`, and `|` filters. Missing variables render
//! as empty strings — degradation, not failure.

pub mod expr;
pub mod render;
pub mod toon;

pub use render::{is_truthy, render_str, render_value, Scope};
