//! The analytics worker: one finished session in, three tables out.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Timelike, Utc};
use serde_json::Value;

use casc_domain::analytics::{CascadeAnalyticsRow, CellAnalyticsRow, CellContextBreakdownRow};
use casc_domain::error::{Error, Result};
use casc_domain::hash;
use casc_domain::logrow::{LogRow, NodeType};
use casc_store::LogStore;

use crate::baselines::Baseline;
use crate::complexity;

/// Compute and append analytics for a finished session.
///
/// Reads the session's (deduplicated) log rows, derives aggregates and
/// context attribution, queries prior rows for baselines, and appends one
/// `cascade_analytics` row, one `cell_analytics` row per completed phase,
/// and one `cell_context_breakdown` row per injected context message.
pub async fn run_for_session(store: &dyn LogStore, session_id: &str) -> Result<()> {
    let rows = store.rows_for_session(session_id)?;
    let start = rows
        .iter()
        .find(|r| r.node_type == NodeType::CascadeStart)
        .ok_or_else(|| Error::Analytics(format!("session {session_id}: no cascade_start row")))?;
    let done = rows
        .iter()
        .find(|r| r.node_type == NodeType::CascadeCompleted)
        .ok_or_else(|| {
            Error::Analytics(format!("session {session_id}: no cascade_completed row"))
        })?;

    let cascade_id = start.cascade_id.clone();
    let genus_hash = start.genus_hash.clone();
    let input: Value = serde_json::from_str(&start.content).unwrap_or(Value::Null);

    // ── Input summary ─────────────────────────────────────────────
    let input_complexity_score = complexity::input_complexity_score(&input);
    let input_category = complexity::input_category(input_complexity_score).to_string();
    let input_fingerprint = hash::input_fingerprint(&input);

    // ── Raw aggregates ────────────────────────────────────────────
    let total_cost = done.cost;
    let total_duration_ms = done.duration_ms;
    let tokens_in = done.tokens_in;
    let tokens_out = done.tokens_out;
    let message_count = rows
        .iter()
        .filter(|r| {
            matches!(
                r.node_type,
                NodeType::Turn
                    | NodeType::User
                    | NodeType::System
                    | NodeType::Assistant
                    | NodeType::ToolCall
                    | NodeType::ToolResult
            )
        })
        .count() as u64;
    let error_count = rows
        .iter()
        .filter(|r| r.node_type == NodeType::Error)
        .count() as u64;

    let completed_phases: Vec<&LogRow> = rows
        .iter()
        .filter(|r| r.node_type == NodeType::PhaseEnd && phase_status(r) == "completed")
        .collect();
    let cell_count = completed_phases.len() as u64;

    // ── Context attribution ───────────────────────────────────────
    let context_rows: Vec<&LogRow> = rows
        .iter()
        .filter(|r| r.content_type == "context")
        .collect();
    let mut cell_costs: HashMap<String, f64> = HashMap::new();
    for phase in &completed_phases {
        *cell_costs.entry(phase.cell_name.clone()).or_default() += phase.cost;
    }
    let mut context_cost_by_cell: HashMap<String, f64> = HashMap::new();
    for row in &context_rows {
        *context_cost_by_cell.entry(row.cell_name.clone()).or_default() += row.cost;
    }

    let total_context_cost: f64 = context_rows.iter().map(|r| r.cost).sum();
    let total_new_cost = (total_cost - total_context_cost).max(0.0);
    let context_cost_pct = pct(total_context_cost, total_cost);

    let cells_with_context: HashSet<&str> = context_rows
        .iter()
        .map(|r| r.cell_name.as_str())
        .collect();
    let cell_context_pcts: Vec<f64> = cells_with_context
        .iter()
        .filter_map(|cell| {
            let cell_cost = cell_costs.get(*cell).copied().unwrap_or(0.0);
            let context = context_cost_by_cell.get(*cell).copied().unwrap_or(0.0);
            (cell_cost > 0.0).then(|| pct(context, cell_cost))
        })
        .collect();
    let avg_cell_context_pct = if cell_context_pcts.is_empty() {
        0.0
    } else {
        cell_context_pcts.iter().sum::<f64>() / cell_context_pcts.len() as f64
    };
    let max_cell_context_pct = cell_context_pcts.iter().copied().fold(0.0, f64::max);

    // ── Baselines ─────────────────────────────────────────────────
    let global_rows = store.cascade_analytics_for(&cascade_id)?;
    let global = Baseline::from_samples(&costs_of(&global_rows));
    let cluster_rows: Vec<&CascadeAnalyticsRow> = global_rows
        .iter()
        .filter(|r| r.input_category == input_category)
        .collect();
    let cluster_cost = Baseline::from_samples(
        &cluster_rows.iter().map(|r| r.total_cost).collect::<Vec<_>>(),
    );
    let cluster_duration = Baseline::from_samples(
        &cluster_rows
            .iter()
            .map(|r| r.total_duration_ms as f64)
            .collect::<Vec<_>>(),
    );
    let genus_rows = store.cascade_analytics_for_genus(&genus_hash)?;
    let genus = Baseline::from_samples(&costs_of(&genus_rows));

    let cost_z_score = cluster_cost.z_score(total_cost);
    let duration_z_score = cluster_duration.z_score(total_duration_ms as f64);

    // ── Efficiency / temporal ─────────────────────────────────────
    let total_tokens = tokens_in + tokens_out;
    let cost_per_message = ratio(total_cost, message_count as f64);
    let cost_per_token = ratio(total_cost, total_tokens as f64);
    let tokens_per_message = ratio(total_tokens as f64, message_count as f64);

    let started_at = start.timestamp;
    let day_of_week = started_at.weekday().num_days_from_monday();

    store.append_cascade_analytics(&CascadeAnalyticsRow {
        session_id: session_id.to_string(),
        cascade_id: cascade_id.clone(),
        genus_hash: genus_hash.clone(),
        input_complexity_score,
        input_category: input_category.clone(),
        input_fingerprint,
        total_cost,
        total_duration_ms,
        tokens_in,
        tokens_out,
        message_count,
        cell_count,
        error_count,
        global_avg_cost: global.avg,
        cluster_avg_cost: cluster_cost.avg,
        cluster_stddev_cost: cluster_cost.stddev,
        genus_avg_cost: genus.avg,
        genus_run_count: genus_rows.len() as u64,
        cost_z_score,
        duration_z_score,
        is_cost_outlier: cluster_cost.is_outlier(total_cost),
        is_duration_outlier: cluster_duration.is_outlier(total_duration_ms as f64),
        cost_per_message,
        cost_per_token,
        tokens_per_message,
        total_context_cost_estimated: total_context_cost,
        total_new_cost_estimated: total_new_cost,
        context_cost_pct,
        cells_with_context: cells_with_context.len() as u64,
        avg_cell_context_pct,
        max_cell_context_pct,
        hour_of_day: started_at.hour(),
        day_of_week,
        is_weekend: day_of_week >= 5,
        created_at: Utc::now(),
    })?;

    // ── Per-cell rows ─────────────────────────────────────────────
    let mut index_by_cell: HashMap<String, u32> = HashMap::new();
    for row in &rows {
        if !row.cell_name.is_empty() {
            index_by_cell
                .entry(row.cell_name.clone())
                .or_insert(row.cell_index);
        }
    }

    for phase in &completed_phases {
        let cell_cost = phase.cost;
        let cell_tokens = phase.tokens_in + phase.tokens_out;
        let prior = store.cell_analytics_for_species(&phase.species_hash)?;
        let species = Baseline::from_samples(
            &prior.iter().map(|r| r.cell_cost).collect::<Vec<_>>(),
        );

        let cell_context: Vec<&&LogRow> = context_rows
            .iter()
            .filter(|r| r.cell_name == phase.cell_name)
            .collect();
        let context_cost_estimated: f64 = cell_context.iter().map(|r| r.cost).sum();
        let depths: Vec<f64> = cell_context
            .iter()
            .filter_map(|r| {
                let source = r.context_source.as_deref()?;
                let source_index = index_by_cell.get(source)?;
                Some(phase.cell_index.saturating_sub(*source_index) as f64)
            })
            .collect();
        let context_depth_avg = if depths.is_empty() {
            0.0
        } else {
            depths.iter().sum::<f64>() / depths.len() as f64
        };

        store.append_cell_analytics(&CellAnalyticsRow {
            session_id: session_id.to_string(),
            cascade_id: cascade_id.clone(),
            cell_name: phase.cell_name.clone(),
            cell_index: phase.cell_index,
            species_hash: phase.species_hash.clone(),
            cell_cost,
            cell_duration_ms: phase.duration_ms,
            cell_tokens,
            cell_cost_pct: pct(cell_cost, total_cost),
            cell_duration_pct: pct(phase.duration_ms as f64, total_duration_ms as f64),
            species_avg_cost: species.avg,
            species_stddev_cost: species.stddev,
            cost_z_score: species.z_score(cell_cost),
            is_cost_outlier: species.is_outlier(cell_cost),
            context_cost_estimated,
            new_message_cost_estimated: (cell_cost - context_cost_estimated).max(0.0),
            context_cost_pct: pct(context_cost_estimated, cell_cost),
            context_depth_avg,
            created_at: Utc::now(),
        })?;
    }

    // ── Per-injected-message rows ─────────────────────────────────
    for row in &context_rows {
        let cell_cost = cell_costs.get(&row.cell_name).copied().unwrap_or(0.0);
        store.append_context_breakdown(&CellContextBreakdownRow {
            session_id: session_id.to_string(),
            cell_name: row.cell_name.clone(),
            cell_index: row.cell_index,
            context_message_hash: row.content_hash.clone(),
            context_message_cell: row.context_source.clone().unwrap_or_default(),
            context_message_tokens: row.tokens_in,
            context_message_cost_estimated: row.cost,
            context_message_pct: pct(row.cost, cell_cost),
            created_at: Utc::now(),
        })?;
    }

    Ok(())
}

fn phase_status(row: &LogRow) -> String {
    serde_json::from_str::<Value>(&row.content)
        .ok()
        .and_then(|v| v.get("status").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

fn costs_of(rows: &[CascadeAnalyticsRow]) -> Vec<f64> {
    rows.iter().map(|r| r.total_cost).collect()
}

fn pct(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

fn ratio(num: f64, denom: f64) -> f64 {
    if denom > 0.0 {
        num / denom
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casc_domain::message::Usage;
    use casc_store::MemoryLogStore;
    use serde_json::json;
    use std::sync::Arc;

    fn session_rows(session: &str, cost: f64) -> Vec<LogRow> {
        let make = |node_type: NodeType| {
            let mut row = LogRow::new(node_type);
            row.session_id = session.to_string();
            row.cascade_id = "report".into();
            row.genus_hash = "genus1234".into();
            row
        };

        let start = make(NodeType::CascadeStart)
            .with_content(&serde_json::to_string(&json!({"msg": "hi"})).unwrap());

        let mut phase = make(NodeType::PhaseEnd)
            .with_content(&json!({"cell": "reply", "status": "completed", "turns": 1}).to_string())
            .with_usage(&Usage {
                tokens_in: 10,
                tokens_out: 2,
                cost,
            })
            .with_duration_ms(40);
        phase.cell_name = "reply".into();
        phase.species_hash = "species99".into();

        let mut turn = make(NodeType::Turn).with_content("hi").with_usage(&Usage {
            tokens_in: 10,
            tokens_out: 2,
            cost,
        });
        turn.cell_name = "reply".into();

        let done = make(NodeType::CascadeCompleted)
            .with_content(&json!({"status": "success"}).to_string())
            .with_usage(&Usage {
                tokens_in: 10,
                tokens_out: 2,
                cost,
            })
            .with_duration_ms(50);

        vec![start, phase, turn, done]
    }

    #[tokio::test]
    async fn first_run_has_empty_baselines_and_zero_z() {
        let store = Arc::new(MemoryLogStore::new());
        for row in session_rows("s1", 0.00012) {
            store.append_row(&row).unwrap();
        }

        run_for_session(store.as_ref(), "s1").await.unwrap();

        let row = store.cascade_analytics_for_session("s1").unwrap();
        assert_eq!(row.cascade_id, "report");
        assert_eq!(row.cost_z_score, 0.0);
        assert!(!row.is_cost_outlier);
        assert!(row.cluster_avg_cost.is_none());
        assert_eq!(row.cell_count, 1);
        assert!((row.total_cost - 0.00012).abs() < 1e-12);

        let cells = store.cell_analytics_for_session("s1");
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].cell_name, "reply");
        assert!((cells[0].cell_cost_pct - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cluster_baseline_flags_outliers() {
        let store = Arc::new(MemoryLogStore::new());
        // 50 prior sessions, alternating 0.015 / 0.025: mean 0.02, stddev 0.005.
        for i in 0..50 {
            let session = format!("prior{i}");
            let cost = if i % 2 == 0 { 0.015 } else { 0.025 };
            for row in session_rows(&session, cost) {
                store.append_row(&row).unwrap();
            }
            run_for_session(store.as_ref(), &session).await.unwrap();
        }

        for row in session_rows("expensive", 0.04) {
            store.append_row(&row).unwrap();
        }
        run_for_session(store.as_ref(), "expensive").await.unwrap();

        let row = store.cascade_analytics_for_session("expensive").unwrap();
        assert!((row.cluster_avg_cost.unwrap() - 0.02).abs() < 1e-12);
        assert!((row.cluster_stddev_cost.unwrap() - 0.005).abs() < 1e-12);
        assert!((row.cost_z_score - 4.0).abs() < 1e-9);
        assert!(row.is_cost_outlier);
        assert_eq!(row.genus_run_count, 50);
    }

    #[tokio::test]
    async fn context_rows_become_breakdown_rows() {
        let store = Arc::new(MemoryLogStore::new());
        let mut rows = session_rows("s1", 0.01);
        let mut context = LogRow::new(NodeType::User).with_content("[Output from load]:\n1");
        context.session_id = "s1".into();
        context.cascade_id = "report".into();
        context.cell_name = "reply".into();
        context.cell_index = 1;
        context.content_type = "context".into();
        context.context_source = Some("load".into());
        context.tokens_in = 8;
        context.cost = 0.004;
        rows.push(context);
        for row in rows {
            store.append_row(&row).unwrap();
        }

        run_for_session(store.as_ref(), "s1").await.unwrap();

        let breakdown = store.context_breakdown_for("s1");
        assert_eq!(breakdown.len(), 1);
        assert_eq!(breakdown[0].context_message_cell, "load");
        assert_eq!(breakdown[0].context_message_tokens, 8);
        assert!((breakdown[0].context_message_pct - 40.0).abs() < 1e-9);

        let summary = store.cascade_analytics_for_session("s1").unwrap();
        assert!((summary.total_context_cost_estimated - 0.004).abs() < 1e-12);
        assert!((summary.total_new_cost_estimated - 0.006).abs() < 1e-12);
        assert_eq!(summary.cells_with_context, 1);
        assert!((summary.max_cell_context_pct - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_session_is_an_analytics_error() {
        let store = MemoryLogStore::new();
        let err = run_for_session(&store, "ghost").await.unwrap_err();
        assert_eq!(err.kind(), "analytics");
    }
}
