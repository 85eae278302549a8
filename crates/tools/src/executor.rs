//! Deterministic cell execution.
//!
//! Renders the cell's templated inputs against the session scope, resolves
//! the tool target, invokes it, and honors `_route` hints. Tabular outputs
//! (a `rows` array) are materialized into session state as
//! `_{cell_name}` for later cells.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use casc_domain::cascade::Cell;
use casc_domain::error::{Error, Result};
use casc_echo::Echo;
use casc_template::{render_value, Scope};

use crate::registry::ToolRegistry;
use crate::shell;
use crate::target::{parse_tool_target, ToolTarget};
use crate::tool::{parse_route, Route, ToolContext};

/// Result of one deterministic cell.
#[derive(Debug, Clone)]
pub struct DeterministicOutcome {
    pub output: Value,
    pub route: Route,
    /// Error text for `_route: error` outputs.
    pub error: Option<String>,
}

pub struct DeterministicExecutor {
    registry: Arc<ToolRegistry>,
    scripts_dir: Option<PathBuf>,
}

impl DeterministicExecutor {
    pub fn new(registry: Arc<ToolRegistry>, scripts_dir: Option<PathBuf>) -> Self {
        Self {
            registry,
            scripts_dir,
        }
    }

    /// Execute a deterministic cell against the session.
    ///
    /// Tool exceptions surface as `Error::Deterministic` carrying the cell,
    /// tool, and rendered inputs; the scheduler decides whether
    /// `rules.on_error` absorbs them.
    pub async fn execute(
        &self,
        cell: &Cell,
        echo: &Echo,
        input: &Value,
        env: &Value,
    ) -> Result<DeterministicOutcome> {
        let spec = cell.tool.as_deref().ok_or_else(|| Error::Deterministic {
            cell: cell.name.clone(),
            tool: String::new(),
            message: "cell has no tool target".into(),
        })?;

        let scope = Scope::new()
            .with("input", input.clone())
            .with("state", echo.state_scope())
            .with("outputs", echo.outputs_scope())
            .with("env", env.clone())
            .with("session_id", json!(echo.session_id));

        let rendered = render_inputs(&cell.inputs, &scope);
        let ctx = ToolContext::new(&echo.session_id, &cell.name, echo.state_scope());

        let invoked = self
            .dispatch(spec, rendered.clone(), &ctx)
            .await
            .map_err(|e| Error::Deterministic {
                cell: cell.name.clone(),
                tool: spec.to_string(),
                message: format!(
                    "{e} (inputs: {})",
                    serde_json::to_string(&rendered).unwrap_or_default()
                ),
            })?;

        let (route, error) = parse_route(&invoked);
        match route {
            Route::Success => {
                if let Some(rows) = invoked.get("rows").filter(|r| r.is_array()) {
                    echo.update_state(format!("_{}", cell.name), rows.clone());
                }
            }
            Route::Error => {
                echo.add_error(
                    &cell.name,
                    "tool",
                    error.clone().unwrap_or_else(|| "error route".into()),
                );
            }
        }

        Ok(DeterministicOutcome {
            output: invoked,
            route,
            error,
        })
    }

    async fn dispatch(
        &self,
        spec: &str,
        rendered: Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<Value> {
        match parse_tool_target(spec)? {
            ToolTarget::Registered(name) => {
                let tool = self
                    .registry
                    .get(&name)
                    .ok_or_else(|| Error::Config(format!("no registered tool named {name}")))?;
                tool.invoke(Value::Object(rendered), ctx).await
            }
            ToolTarget::Python { module, symbol } => {
                // Embedder-registered callables live in the registry under
                // their dotted name.
                let name = format!("{module}.{symbol}");
                let tool = self.registry.get(&name).ok_or_else(|| {
                    Error::Config(format!("no registered callable for python:{name}"))
                })?;
                tool.invoke(Value::Object(rendered), ctx).await
            }
            ToolTarget::Sql(path) => {
                let tool = self.registry.get("sql").ok_or_else(|| {
                    Error::Config("sql: targets need a registered `sql` tool".into())
                })?;
                let script = self.read_script(&path)?;
                let mut args = rendered;
                args.insert("script".into(), Value::String(script));
                tool.invoke(Value::Object(args), ctx).await
            }
            ToolTarget::Shell(path) => {
                let resolved = self.resolve_script_path(&path)?;
                shell::run_script(&resolved, &rendered).await
            }
        }
    }

    fn resolve_script_path(&self, path: &str) -> Result<PathBuf> {
        let candidate = PathBuf::from(path);
        if candidate.is_absolute() {
            return Ok(candidate);
        }
        match &self.scripts_dir {
            Some(dir) => Ok(dir.join(candidate)),
            None => Ok(candidate),
        }
    }

    fn read_script(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_script_path(path)?;
        std::fs::read_to_string(&resolved).map_err(|e| {
            Error::Config(format!("cannot read script {}: {e}", resolved.display()))
        })
    }
}

/// Render a templated input map. String values go through the template
/// engine with native-type preservation; containers recurse; everything
/// else passes through.
fn render_inputs(inputs: &Map<String, Value>, scope: &Scope) -> Map<String, Value> {
    inputs
        .iter()
        .map(|(k, v)| (k.clone(), render_input_value(v, scope)))
        .collect()
}

fn render_input_value(value: &Value, scope: &Scope) -> Value {
    match value {
        Value::String(template) => render_value(template, scope),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_input_value(v, scope)).collect())
        }
        Value::Object(map) => Value::Object(render_inputs(map, scope)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::FnTool;
    use casc_domain::cascade::Cell;

    fn det_cell(name: &str, tool: &str, inputs: Value) -> Cell {
        Cell {
            name: name.into(),
            tool: Some(tool.into()),
            inputs: inputs.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    fn registry_with_sql_data() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FnTool::new(
            "sql_data",
            "Run a query.",
            json!({"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]}),
            |args, _| {
                assert_eq!(args["query"], json!("SELECT 1 AS n"));
                Ok(json!({
                    "rows": [{"n": 1}],
                    "columns": ["n"],
                    "row_count": 1,
                    "_route": "success"
                }))
            },
        )));
        registry
    }

    #[tokio::test]
    async fn executes_and_materializes_rows() {
        let executor = DeterministicExecutor::new(registry_with_sql_data(), None);
        let echo = Echo::new("s1", None, None);
        let cell = det_cell("load", "sql_data", json!({"query": "SELECT 1 AS n"}));

        let outcome = executor
            .execute(&cell, &echo, &json!({}), &json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.route, Route::Success);
        assert_eq!(outcome.output["row_count"], json!(1));
        assert_eq!(echo.get_state("_load"), Some(json!([{"n": 1}])));
    }

    #[tokio::test]
    async fn renders_templated_inputs_natively() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FnTool::new(
            "inspect",
            "Echo args.",
            json!({"type": "object"}),
            |args, _| Ok(args),
        )));
        let executor = DeterministicExecutor::new(registry, None);
        let echo = Echo::new("s1", None, None);
        echo.update_state("threshold", json!(5));

        let cell = det_cell(
            "probe",
            "inspect",
            json!({
                "limit": "{{ state.threshold }}",
                "label": "top {{ state.threshold }}",
                "nested": {"msg": "{{ input.msg }}"}
            }),
        );
        let outcome = executor
            .execute(&cell, &echo, &json!({"msg": "hi"}), &json!({}))
            .await
            .unwrap();
        // Whole-expression templates keep native types.
        assert_eq!(outcome.output["limit"], json!(5));
        assert_eq!(outcome.output["label"], json!("top 5"));
        assert_eq!(outcome.output["nested"]["msg"], json!("hi"));
    }

    #[tokio::test]
    async fn error_route_records_error_without_failing() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FnTool::new(
            "flaky",
            "Always errors.",
            json!({"type": "object"}),
            |_, _| Ok(json!({"_route": "error", "error": "no such table"})),
        )));
        let executor = DeterministicExecutor::new(registry, None);
        let echo = Echo::new("s1", None, None);
        let cell = det_cell("load", "flaky", json!({}));

        let outcome = executor
            .execute(&cell, &echo, &json!({}), &json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.route, Route::Error);
        assert_eq!(outcome.error.as_deref(), Some("no such table"));
        assert_eq!(echo.errors_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn tool_exception_becomes_deterministic_error() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FnTool::new(
            "boom",
            "Panics politely.",
            json!({"type": "object"}),
            |_, _| {
                Err(Error::Tool {
                    tool: "boom".into(),
                    message: "connection refused".into(),
                })
            },
        )));
        let executor = DeterministicExecutor::new(registry, None);
        let echo = Echo::new("s1", None, None);
        let cell = det_cell("load", "boom", json!({"q": "x"}));

        let err = executor
            .execute(&cell, &echo, &json!({}), &json!({}))
            .await
            .unwrap_err();
        match err {
            Error::Deterministic {
                cell, tool, message, ..
            } => {
                assert_eq!(cell, "load");
                assert_eq!(tool, "boom");
                assert!(message.contains("connection refused"));
                assert!(message.contains("inputs"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unregistered_tool_is_an_error() {
        let executor = DeterministicExecutor::new(Arc::new(ToolRegistry::new()), None);
        let echo = Echo::new("s1", None, None);
        let cell = det_cell("load", "ghost", json!({}));
        assert!(executor
            .execute(&cell, &echo, &json!({}), &json!({}))
            .await
            .is_err());
    }
}
