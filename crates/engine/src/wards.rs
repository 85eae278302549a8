//! Ward (guardrail) evaluation.
//!
//! Wards run after each turn's validation step. A failing ward either
//! loops the cell with a corrective message (`on_fail: retry`) or aborts
//! it (`on_fail: fail`).

use serde_json::Value;

use casc_domain::cascade::{WardAction, WardConfig, WardKind};
use casc_template::{is_truthy, render_value, Scope};

/// One ward rejection.
#[derive(Debug, Clone)]
pub struct WardFailure {
    pub kind: WardKind,
    pub action: WardAction,
    pub message: String,
}

/// Validate a JSON value against a schema; `Err` carries the first
/// violation. Shared by `output_schema` checks and jsonschema wards.
pub fn validate_schema(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| format!("invalid schema: {e}"))?;
    let message = match validator.iter_errors(instance).next() {
        None => return Ok(()),
        Some(error) => format!("{error} (at {})", error.instance_path()),
    };
    Err(message)
}

/// Evaluate every ward against the turn's output. The first failure wins;
/// a `fail`-action failure is reported over earlier `retry` ones.
pub fn check_wards(
    wards: &[WardConfig],
    output: &Value,
    content: &str,
    state: &Value,
) -> Result<(), WardFailure> {
    let mut first_retry: Option<WardFailure> = None;

    for ward in wards {
        let failure = match ward.kind {
            WardKind::Regex => check_regex(ward, content),
            WardKind::Jsonschema => validate_schema(&ward.spec, output).err(),
            WardKind::Predicate => check_predicate(ward, output, state),
        };
        if let Some(message) = failure {
            let failure = WardFailure {
                kind: ward.kind,
                action: ward.on_fail,
                message,
            };
            if failure.action == WardAction::Fail {
                return Err(failure);
            }
            first_retry.get_or_insert(failure);
        }
    }

    match first_retry {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

fn check_regex(ward: &WardConfig, content: &str) -> Option<String> {
    let pattern = ward.spec.as_str()?;
    match regex::Regex::new(pattern) {
        Ok(re) if re.is_match(content) => None,
        Ok(_) => Some(format!("output does not match /{pattern}/")),
        Err(e) => Some(format!("invalid ward pattern /{pattern}/: {e}")),
    }
}

fn check_predicate(ward: &WardConfig, output: &Value, state: &Value) -> Option<String> {
    let expr = match ward.spec.as_str() {
        Some(expr) => expr,
        None => return Some("predicate ward spec must be a template string".into()),
    };
    let scope = Scope::new()
        .with("output", output.clone())
        .with("state", state.clone());
    if is_truthy(&render_value(expr, &scope)) {
        None
    } else {
        Some(format!("predicate {expr} evaluated falsy"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ward(kind: WardKind, spec: Value, on_fail: WardAction) -> WardConfig {
        WardConfig {
            kind,
            spec,
            on_fail,
        }
    }

    #[test]
    fn regex_ward_matches_content() {
        let wards = vec![ward(
            WardKind::Regex,
            json!("^SUMMARY:"),
            WardAction::Retry,
        )];
        assert!(check_wards(&wards, &json!(null), "SUMMARY: fine", &json!({})).is_ok());
        let failure =
            check_wards(&wards, &json!(null), "no prefix here", &json!({})).unwrap_err();
        assert_eq!(failure.action, WardAction::Retry);
    }

    #[test]
    fn jsonschema_ward_validates_output() {
        let schema = json!({"type": "object", "required": ["x"]});
        let wards = vec![ward(WardKind::Jsonschema, schema, WardAction::Fail)];
        assert!(check_wards(&wards, &json!({"x": 1}), "", &json!({})).is_ok());
        let failure = check_wards(&wards, &json!({}), "", &json!({})).unwrap_err();
        assert_eq!(failure.action, WardAction::Fail);
    }

    #[test]
    fn predicate_ward_reads_output_and_state() {
        let wards = vec![ward(
            WardKind::Predicate,
            json!("{{ output.score >= 0.5 and state.ready }}"),
            WardAction::Retry,
        )];
        assert!(check_wards(
            &wards,
            &json!({"score": 0.8}),
            "",
            &json!({"ready": true})
        )
        .is_ok());
        assert!(check_wards(
            &wards,
            &json!({"score": 0.2}),
            "",
            &json!({"ready": true})
        )
        .is_err());
    }

    #[test]
    fn fail_action_wins_over_retry() {
        let wards = vec![
            ward(WardKind::Regex, json!("^A"), WardAction::Retry),
            ward(
                WardKind::Jsonschema,
                json!({"type": "object"}),
                WardAction::Fail,
            ),
        ];
        let failure = check_wards(&wards, &json!("not an object"), "B", &json!({})).unwrap_err();
        assert_eq!(failure.action, WardAction::Fail);
    }

    #[test]
    fn schema_helper_reports_path() {
        let schema = json!({"type": "object", "properties": {"n": {"type": "integer"}}});
        let err = validate_schema(&schema, &json!({"n": "oops"})).unwrap_err();
        assert!(err.contains("/n"));
    }
}
