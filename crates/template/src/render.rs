//! Template rendering against an evaluation scope.

use serde_json::{Map, Value};

use crate::expr;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The evaluation scope: named roots (`input`, `state`, `outputs`, `env`,
/// `session_id`, `checkpoint_id`) with dotted lookup beneath them.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    roots: Map<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.roots.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.roots.insert(name.into(), value);
    }

    /// Resolve a dotted path. Any miss yields `null`.
    pub fn lookup(&self, path: &[String]) -> Value {
        let mut current = match path.first().and_then(|root| self.roots.get(root)) {
            Some(v) => v,
            None => return Value::Null,
        };
        for segment in &path[1..] {
            current = match current {
                Value::Object(map) => match map.get(segment) {
                    Some(v) => v,
                    None => return Value::Null,
                },
                Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(v) => v,
                    None => return Value::Null,
                },
                _ => return Value::Null,
            };
        }
        current.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render a template to text. `{{ expr }}` holes evaluate against the
/// scope; missing variables and malformed expressions render empty.
pub fn render_str(template: &str, scope: &Scope) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        match rest[open + 2..].find("}}") {
            Some(close) => {
                let src = &rest[open + 2..open + 2 + close];
                let value = eval_expression(src, scope);
                out.push_str(&stringify(&value));
                rest = &rest[open + 2 + close + 2..];
            }
            None => {
                // Unclosed hole: keep the literal text.
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render preserving native types: a template that is exactly one
/// expression hole returns the evaluated value rather than its string
/// form. Everything else renders to a string.
pub fn render_value(template: &str, scope: &Scope) -> Value {
    let trimmed = template.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
    {
        if !inner.contains("{{") && !inner.contains("}}") {
            return eval_expression(inner, scope);
        }
    }
    Value::String(render_str(template, scope))
}

fn eval_expression(src: &str, scope: &Scope) -> Value {
    match expr::parse(src.trim()) {
        Some(parsed) => expr::eval(&parsed, scope),
        None => Value::Null,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Template truthiness: `null`, `false`, `0`, `""`, `[]`, `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        Scope::new()
            .with("input", json!({"msg": "hi"}))
            .with("state", json!({"done": false, "n": 2}))
            .with("outputs", json!({"load": {"rows": [{"n": 1}]}}))
    }

    #[test]
    fn interpolates_text() {
        assert_eq!(render_str("Say {{input.msg}}", &scope()), "Say hi");
        assert_eq!(
            render_str("{{input.msg}} and {{state.n}}", &scope()),
            "hi and 2"
        );
    }

    #[test]
    fn missing_variable_renders_empty() {
        assert_eq!(render_str("x={{input.gone}}!", &scope()), "x=!");
        assert_eq!(render_str("x={{ total garbage (}}", &scope()), "x=");
    }

    #[test]
    fn unclosed_hole_is_literal() {
        assert_eq!(render_str("a {{input.msg", &scope()), "a {{input.msg");
    }

    #[test]
    fn native_value_preserved_for_single_expression() {
        let value = render_value("{{ outputs.load.rows }}", &scope());
        assert_eq!(value, json!([{"n": 1}]));

        // Mixed templates always produce strings.
        let value = render_value("rows: {{ outputs.load.rows }}", &scope());
        assert!(value.is_string());
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!([0])));
    }

    #[test]
    fn loop_until_style_condition() {
        let value = render_value("{{state.done}}", &scope());
        assert!(!is_truthy(&value));
        let done = Scope::new().with("state", json!({"done": true}));
        assert!(is_truthy(&render_value("{{state.done}}", &done)));
    }
}
