//! Engine configuration.
//!
//! The embedder reads environment/config files and hands the engine this
//! struct; the core never touches the environment itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Process-wide engine defaults and bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model used when neither the cell nor the cascade declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Global candidate worker pool shared across all cascades.
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,
    /// Per-turn pool for parallel-safe tool calls.
    #[serde(default = "default_tool_pool")]
    pub tool_pool: usize,
    /// Maximum sub-cascade nesting depth.
    #[serde(default = "default_sub_cascade_depth")]
    pub sub_cascade_depth: usize,
    /// Logger queue high-water mark; beyond it low-severity rows are shed.
    #[serde(default = "default_logger_high_water")]
    pub logger_high_water: usize,
    /// Provider retry attempts per turn for transient failures.
    #[serde(default = "default_provider_attempts")]
    pub provider_attempts: u32,
    /// Base backoff between provider retries; doubles per attempt, capped.
    #[serde(default = "default_provider_backoff_ms")]
    pub provider_backoff_ms: u64,
    /// Optional wall-clock bound for a whole cascade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade_timeout_ms: Option<u64>,
    /// Directory `sql:`/`shell:` tool targets resolve against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts_dir: Option<PathBuf>,
    /// Per-model pricing (USD per million tokens), keyed by model name.
    #[serde(default)]
    pub pricing: HashMap<String, Pricing>,
    /// Fire the analytics worker automatically after `cascade_completed`.
    /// Embedders that schedule the worker themselves turn this off.
    #[serde(default = "default_auto_analytics")]
    pub auto_analytics: bool,
}

fn default_auto_analytics() -> bool {
    true
}

fn default_candidate_pool() -> usize {
    8
}
fn default_tool_pool() -> usize {
    4
}
fn default_sub_cascade_depth() -> usize {
    8
}
fn default_logger_high_water() -> usize {
    10_000
}
fn default_provider_attempts() -> u32 {
    3
}
fn default_provider_backoff_ms() -> u64 {
    250
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            candidate_pool: default_candidate_pool(),
            tool_pool: default_tool_pool(),
            sub_cascade_depth: default_sub_cascade_depth(),
            logger_high_water: default_logger_high_water(),
            provider_attempts: default_provider_attempts(),
            provider_backoff_ms: default_provider_backoff_ms(),
            cascade_timeout_ms: None,
            scripts_dir: None,
            pricing: HashMap::new(),
            auto_analytics: default_auto_analytics(),
        }
    }
}

impl EngineConfig {
    pub fn pricing_for(&self, model: &str) -> Option<&Pricing> {
        self.pricing.get(model)
    }
}

/// Per-model token pricing, USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    /// Estimated USD cost for a call.
    pub fn estimate_cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 * self.input_per_mtok + tokens_out as f64 * self.output_per_mtok)
            / 1_000_000.0
    }

    /// Input-side cost only — used to price injected context tokens.
    pub fn input_cost(&self, tokens: u64) -> f64 {
        tokens as f64 * self.input_per_mtok / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_bounds() {
        let config = EngineConfig::default();
        assert_eq!(config.candidate_pool, 8);
        assert_eq!(config.tool_pool, 4);
        assert_eq!(config.sub_cascade_depth, 8);
        assert_eq!(config.logger_high_water, 10_000);
        assert_eq!(config.provider_attempts, 3);
    }

    #[test]
    fn pricing_estimates() {
        let pricing = Pricing {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        };
        let cost = pricing.estimate_cost(1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 1e-9);
        assert!((pricing.input_cost(2_000_000) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.candidate_pool, 8);
        assert!(config.default_model.is_none());
    }
}
