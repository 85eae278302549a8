//! Analytics row types.
//!
//! One row per finished session (`cascade_analytics`), per executed cell
//! (`cell_analytics`), and per injected context message
//! (`cell_context_breakdown`). Baseline fields are `None` when the tier has
//! fewer than ten prior samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-session aggregate with baselines and anomaly scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeAnalyticsRow {
    // Identity
    pub session_id: String,
    pub cascade_id: String,
    pub genus_hash: String,

    // Input summary
    pub input_complexity_score: f64,
    pub input_category: String,
    pub input_fingerprint: Value,

    // Raw metrics
    pub total_cost: f64,
    pub total_duration_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub message_count: u64,
    pub cell_count: u64,
    pub error_count: u64,

    // Baselines
    pub global_avg_cost: Option<f64>,
    pub cluster_avg_cost: Option<f64>,
    pub cluster_stddev_cost: Option<f64>,
    pub genus_avg_cost: Option<f64>,
    pub genus_run_count: u64,

    // Anomaly scores
    pub cost_z_score: f64,
    pub duration_z_score: f64,
    pub is_cost_outlier: bool,
    pub is_duration_outlier: bool,

    // Efficiency
    pub cost_per_message: f64,
    pub cost_per_token: f64,
    pub tokens_per_message: f64,

    // Context attribution
    pub total_context_cost_estimated: f64,
    pub total_new_cost_estimated: f64,
    pub context_cost_pct: f64,
    pub cells_with_context: u64,
    pub avg_cell_context_pct: f64,
    pub max_cell_context_pct: f64,

    // Temporal
    pub hour_of_day: u32,
    pub day_of_week: u32,
    pub is_weekend: bool,

    pub created_at: DateTime<Utc>,
}

/// Per-cell metrics against species baselines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellAnalyticsRow {
    pub session_id: String,
    pub cascade_id: String,
    pub cell_name: String,
    pub cell_index: u32,
    pub species_hash: String,

    pub cell_cost: f64,
    pub cell_duration_ms: u64,
    pub cell_tokens: u64,
    /// Share of the session's total cost / duration.
    pub cell_cost_pct: f64,
    pub cell_duration_pct: f64,

    pub species_avg_cost: Option<f64>,
    pub species_stddev_cost: Option<f64>,
    pub cost_z_score: f64,
    pub is_cost_outlier: bool,

    pub context_cost_estimated: f64,
    pub new_message_cost_estimated: f64,
    pub context_cost_pct: f64,
    /// Mean distance (in cells) between this cell and its context sources.
    pub context_depth_avg: f64,

    pub created_at: DateTime<Utc>,
}

/// One injected context message, attributed to its source cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellContextBreakdownRow {
    pub session_id: String,
    pub cell_name: String,
    pub cell_index: u32,
    pub context_message_hash: String,
    /// The cell whose output was injected.
    pub context_message_cell: String,
    pub context_message_tokens: u64,
    pub context_message_cost_estimated: f64,
    /// Share of the receiving cell's cost.
    pub context_message_pct: f64,
    pub created_at: DateTime<Utc>,
}
