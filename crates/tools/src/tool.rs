//! The cell-facing tool contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use casc_domain::error::Result;
use casc_domain::message::ToolDefinition;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execution context handed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub cell_name: String,
    /// Snapshot of the session state at dispatch time.
    pub state: Value,
    /// Cooperative cancellation flag. Tools that ignore it run to
    /// completion, but their results are discarded.
    pub cancelled: Arc<AtomicBool>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, cell_name: impl Into<String>, state: Value) -> Self {
        Self {
            session_id: session_id.into(),
            cell_name: cell_name.into(),
            state,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A registered capability a cell may invoke.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters(&self) -> Value;
    /// Whether invocations of this tool may run concurrently within one
    /// turn. Defaults to sequential.
    fn parallel_safe(&self) -> bool {
        false
    }
    /// Catalog tags; a `manifest` tag opts the tool into automatic
    /// selection for cells with `traits: "manifest"`.
    fn tags(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value>;

    /// The definition advertised to the model.
    fn describe(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing hints
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome routing declared by a tool's return value via `_route`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Success,
    Error,
}

/// Read the `_route` hint from a tool output. Absent or unrecognized
/// hints count as success; an error route carries the `error` field text.
pub fn parse_route(output: &Value) -> (Route, Option<String>) {
    match output.get("_route").and_then(Value::as_str) {
        Some("error") => {
            let message = output
                .get("error")
                .map(|e| match e {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "tool reported an error route".to_string());
            (Route::Error, Some(message))
        }
        _ => (Route::Success, None),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FnTool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type ToolFn = dyn Fn(Value, &ToolContext) -> Result<Value> + Send + Sync;

/// A tool built from a plain function — the registration path for
/// embedder-provided callables (including `python:module.fn` targets,
/// registered under their dotted name).
pub struct FnTool {
    name: String,
    description: String,
    parameters: Value,
    parallel_safe: bool,
    tags: Vec<String>,
    func: Arc<ToolFn>,
}

impl FnTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        func: impl Fn(Value, &ToolContext) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            parallel_safe: false,
            tags: Vec::new(),
            func: Arc::new(func),
        }
    }

    pub fn parallel_safe(mut self, parallel_safe: bool) -> Self {
        self.parallel_safe = parallel_safe;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

#[async_trait::async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn parameters(&self) -> Value {
        self.parameters.clone()
    }
    fn parallel_safe(&self) -> bool {
        self.parallel_safe
    }
    fn tags(&self) -> Vec<String> {
        self.tags.clone()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        (self.func)(args, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn route_parsing() {
        let (route, err) = parse_route(&json!({"rows": [], "_route": "success"}));
        assert_eq!(route, Route::Success);
        assert!(err.is_none());

        let (route, err) = parse_route(&json!({"_route": "error", "error": "no such table"}));
        assert_eq!(route, Route::Error);
        assert_eq!(err.as_deref(), Some("no such table"));

        let (route, _) = parse_route(&json!({"value": 1}));
        assert_eq!(route, Route::Success);
    }

    #[tokio::test]
    async fn fn_tool_invokes() {
        let tool = FnTool::new(
            "double",
            "Double a number.",
            json!({"type": "object", "properties": {"n": {"type": "number"}}, "required": ["n"]}),
            |args, _ctx| Ok(json!({"n": args["n"].as_f64().unwrap_or(0.0) * 2.0})),
        );
        let ctx = ToolContext::new("s1", "cell", json!({}));
        let out = tool.invoke(json!({"n": 4}), &ctx).await.unwrap();
        assert_eq!(out["n"], json!(8.0));
        assert_eq!(tool.describe().name, "double");
    }
}
