//! Tool target parsing for deterministic cells.

use casc_domain::error::{Error, Result};

/// A parsed `tool` spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolTarget {
    /// A name looked up in the registry.
    Registered(String),
    /// `python:a.b.c.fn` — an embedder-registered callable addressed by
    /// module path + symbol.
    Python { module: String, symbol: String },
    /// `sql:reports/daily.sql` — a script dispatched to the registered
    /// tabular `sql` tool.
    Sql(String),
    /// `shell:scripts/fetch.sh` — a script run by the built-in shell tool.
    Shell(String),
}

/// Parse a deterministic cell's `tool` spec.
pub fn parse_tool_target(spec: &str) -> Result<ToolTarget> {
    if let Some(rest) = spec.strip_prefix("python:") {
        let (module, symbol) = rest.rsplit_once('.').ok_or_else(|| {
            Error::Config(format!("python tool target {spec} needs module.symbol"))
        })?;
        if module.is_empty() || symbol.is_empty() {
            return Err(Error::Config(format!(
                "python tool target {spec} needs module.symbol"
            )));
        }
        return Ok(ToolTarget::Python {
            module: module.to_string(),
            symbol: symbol.to_string(),
        });
    }
    if let Some(path) = spec.strip_prefix("sql:") {
        return Ok(ToolTarget::Sql(path.to_string()));
    }
    if let Some(path) = spec.strip_prefix("shell:") {
        return Ok(ToolTarget::Shell(path.to_string()));
    }
    if spec.is_empty() {
        return Err(Error::Config("empty tool target".into()));
    }
    Ok(ToolTarget::Registered(spec.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_name() {
        assert_eq!(
            parse_tool_target("sql_data").unwrap(),
            ToolTarget::Registered("sql_data".into())
        );
    }

    #[test]
    fn python_target_splits_on_last_dot() {
        assert_eq!(
            parse_tool_target("python:a.b.c.fn").unwrap(),
            ToolTarget::Python {
                module: "a.b.c".into(),
                symbol: "fn".into()
            }
        );
        assert!(parse_tool_target("python:bare").is_err());
    }

    #[test]
    fn script_targets() {
        assert_eq!(
            parse_tool_target("sql:reports/daily.sql").unwrap(),
            ToolTarget::Sql("reports/daily.sql".into())
        );
        assert_eq!(
            parse_tool_target("shell:fetch.sh").unwrap(),
            ToolTarget::Shell("fetch.sh".into())
        );
    }

    #[test]
    fn empty_spec_rejected() {
        assert!(parse_tool_target("").is_err());
    }
}
