//! Input complexity scoring.

use serde_json::Value;

/// Weighted complexity of a top-level input, clamped to [0, 1]:
/// 0.4·chars/10000 + 0.3·tokens/2500 + 0.15·depth/10 + 0.15·items/1000.
pub fn input_complexity_score(input: &Value) -> f64 {
    let chars = char_count(input);
    let tokens = chars as f64 / 4.0;
    let depth = json_depth(input);
    let items = array_items(input);

    let score = 0.4 * (chars as f64 / 10_000.0)
        + 0.3 * (tokens / 2_500.0)
        + 0.15 * (depth as f64 / 10.0)
        + 0.15 * (items as f64 / 1_000.0);
    score.clamp(0.0, 1.0)
}

/// Category buckets over the complexity score.
pub fn input_category(score: f64) -> &'static str {
    match score {
        s if s < 0.1 => "tiny",
        s if s < 0.3 => "small",
        s if s < 0.6 => "medium",
        s if s < 0.85 => "large",
        _ => "huge",
    }
}

/// Serialized size of the input's content. An empty input weighs nothing.
fn char_count(value: &Value) -> usize {
    match value {
        Value::Object(map) if map.is_empty() => 0,
        Value::Array(items) if items.is_empty() => 0,
        other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
    }
}

/// Nesting depth; scalars and empty containers are depth zero.
fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => map
            .values()
            .map(json_depth)
            .max()
            .map(|d| d + 1)
            .unwrap_or(0),
        Value::Array(items) => items
            .iter()
            .map(json_depth)
            .max()
            .map(|d| d + 1)
            .unwrap_or(0),
        _ => 0,
    }
}

/// Total array elements, recursively.
fn array_items(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len() + items.iter().map(array_items).sum::<usize>(),
        Value::Object(map) => map.values().map(array_items).sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_input_is_tiny_zero() {
        let score = input_complexity_score(&json!({}));
        assert_eq!(score, 0.0);
        assert_eq!(input_category(score), "tiny");
    }

    #[test]
    fn small_inputs_stay_small() {
        let score = input_complexity_score(&json!({"msg": "hi"}));
        assert!(score < 0.1);
        assert_eq!(input_category(score), "tiny");
    }

    #[test]
    fn big_inputs_clamp_to_one() {
        let huge = json!({"blob": "x".repeat(100_000)});
        let score = input_complexity_score(&huge);
        assert_eq!(score, 1.0);
        assert_eq!(input_category(score), "huge");
    }

    #[test]
    fn category_boundaries() {
        assert_eq!(input_category(0.0), "tiny");
        assert_eq!(input_category(0.1), "small");
        assert_eq!(input_category(0.3), "medium");
        assert_eq!(input_category(0.6), "large");
        assert_eq!(input_category(0.85), "huge");
        assert_eq!(input_category(1.0), "huge");
    }

    #[test]
    fn depth_and_items_contribute() {
        let shallow = input_complexity_score(&json!({"a": 1}));
        let deep = input_complexity_score(&json!({"a": {"b": {"c": {"d": 1}}}}));
        assert!(deep > shallow);

        let listy = input_complexity_score(&json!({"rows": (0..500).collect::<Vec<_>>()}));
        assert!(listy > shallow);
    }
}
