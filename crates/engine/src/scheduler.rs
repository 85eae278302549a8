//! Phase scheduler — walks a cascade's cells with handoff routing,
//! self-loops, sub-cascades, and structured completion results.
//!
//! One cascade runs as a single logical task; cells execute sequentially
//! in handoff order. The only intra-cascade fork is the candidate engine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Map, Value};

use casc_domain::cascade::{Cascade, Cell};
use casc_domain::config::EngineConfig;
use casc_domain::error::Error;
use casc_domain::event::EngineEvent;
use casc_domain::hash;
use casc_domain::logrow::{LogRow, NodeType};
use casc_domain::message::Usage;
use casc_echo::{Echo, LineageEntry, SessionManager, ToolCallRecord};
use casc_providers::{mask_secrets, ProviderRegistry};
use casc_store::{ExecutionContext, LogStore, Logger};
use casc_template::{is_truthy, render_value, Scope};
use casc_tools::{DeterministicExecutor, ToolRegistry};

use crate::cancel::{CancelMap, CancelToken};
use crate::candidates;
use crate::cell::{self, CellOutcome, CellRunArgs, StateBuffer};
use crate::checkpoint::CheckpointBroker;
use crate::pool::WorkerPool;
use crate::wards;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeStatus {
    Success,
    Failed,
}

/// Where and why a cascade failed.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeFailure {
    pub kind: String,
    pub message: String,
    pub cell: String,
    pub cascade: String,
}

/// One executed phase, summarized for embedders that render progress
/// without querying the store.
#[derive(Debug, Clone, Serialize)]
pub struct CellRunSummary {
    pub cell: String,
    pub status: String,
    pub turns: u32,
    pub duration_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
}

/// Structured result returned to the embedder.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeResult {
    pub status: CascadeStatus,
    pub session_id: String,
    pub lineage: Vec<LineageEntry>,
    pub cells: Vec<CellRunSummary>,
    pub final_state: Value,
    pub cost: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CascadeFailure>,
}

/// Per-run options supplied by the embedder.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub session_id: Option<String>,
    pub caller_id: Option<String>,
    pub parent_session_id: Option<String>,
    /// `env` root of the template scope.
    pub env: Value,
    /// Resume execution at this cell (branching).
    pub start_at: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The cascade execution engine: scheduler plus every shared collaborator.
///
/// Construct inside a tokio runtime (the logger spawns its drain task).
pub struct Engine {
    pub config: EngineConfig,
    pub sessions: Arc<SessionManager>,
    pub providers: Arc<ProviderRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub store: Arc<dyn LogStore>,
    pub logger: Arc<Logger>,
    pub checkpoints: Arc<CheckpointBroker>,
    pub cancel_map: Arc<CancelMap>,
    pub(crate) candidate_pool: WorkerPool,
    pub(crate) tool_pool: WorkerPool,
    executor: DeterministicExecutor,
    library: RwLock<HashMap<String, Cascade>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        sessions: Arc<SessionManager>,
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn LogStore>,
    ) -> Self {
        let logger = Logger::spawn(store.clone(), config.logger_high_water);
        let executor = DeterministicExecutor::new(tools.clone(), config.scripts_dir.clone());
        Self {
            candidate_pool: WorkerPool::new("candidates", config.candidate_pool),
            tool_pool: WorkerPool::new("turn-tools", config.tool_pool),
            config,
            sessions,
            providers,
            tools,
            store,
            logger,
            checkpoints: Arc::new(CheckpointBroker::new()),
            cancel_map: Arc::new(CancelMap::new()),
            executor,
            library: RwLock::new(HashMap::new()),
        }
    }

    /// Register a cascade for `launch_sub_cascade` lookup.
    pub fn register_cascade(&self, cascade: Cascade) -> casc_domain::Result<()> {
        cascade.validate()?;
        self.library
            .write()
            .insert(cascade.cascade_id.clone(), cascade);
        Ok(())
    }

    pub(crate) fn has_cascades(&self) -> bool {
        !self.library.read().is_empty()
    }

    /// Run the post-cascade analytics worker synchronously (tests and
    /// embedders that want deterministic ordering; the scheduler itself
    /// fires it in the background).
    pub async fn run_analytics(&self, session_id: &str) -> casc_domain::Result<()> {
        self.logger.flush().await;
        casc_analytics::run_for_session(self.store.as_ref(), session_id).await
    }

    // ── Cascade entry points ──────────────────────────────────────

    pub async fn run_cascade(
        &self,
        cascade: &Cascade,
        input: Value,
        opts: RunOptions,
    ) -> CascadeResult {
        self.run_cascade_at_depth(cascade, input, opts, 0).await
    }

    pub(crate) fn run_cascade_at_depth<'a>(
        &'a self,
        cascade: &'a Cascade,
        input: Value,
        opts: RunOptions,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = CascadeResult> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let session_id = opts
                .session_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            // Pre-flight: structure and top-level input.
            if let Err(e) = cascade.validate() {
                return prevalidation_failure(cascade, &session_id, e);
            }
            if let Some(schema) = &cascade.inputs_schema {
                if let Err(violation) = wards::validate_schema(schema, &input) {
                    return prevalidation_failure(
                        cascade,
                        &session_id,
                        Error::Validation(format!("cascade input: {violation}")),
                    );
                }
            }

            let (echo, _) = self.sessions.get_or_create(
                &session_id,
                opts.caller_id.clone(),
                opts.parent_session_id.clone(),
            );
            let genus_hash = hash::genus_hash(cascade, &input);
            echo.set_genus_hash(&genus_hash);

            let env = match &opts.env {
                Value::Null => json!({}),
                other => other.clone(),
            };

            let base_ctx = ExecutionContext {
                session_id: session_id.clone(),
                parent_session_id: opts.parent_session_id.clone(),
                caller_id: opts.caller_id.clone(),
                cascade_id: cascade.cascade_id.clone(),
                cell_name: String::new(),
                cell_index: 0,
                genus_hash: genus_hash.clone(),
                species_hash: String::new(),
            };

            let cancel = self.cancel_map.register(&session_id);
            if let Some(parent) = &opts.parent_session_id {
                self.cancel_map.add_to_group(parent, &session_id);
            }

            let mut start_row = LogRow::new(NodeType::CascadeStart)
                .with_role("system")
                .with_content(hash::canonical_json(&input));
            start_row.content_type = "input".into();
            self.logger.log(&base_ctx, start_row);
            EngineEvent::CascadeStarted {
                session_id: session_id.clone(),
                cascade_id: cascade.cascade_id.clone(),
                genus_hash: genus_hash.clone(),
            }
            .emit();

            let usage_acc: Arc<Mutex<Usage>> = Arc::new(Mutex::new(Usage::default()));
            let summaries: Arc<Mutex<Vec<CellRunSummary>>> = Arc::new(Mutex::new(Vec::new()));
            let walk = self.walk(
                cascade,
                &input,
                &env,
                &echo,
                &base_ctx,
                &cancel,
                opts.start_at.as_deref(),
                depth,
                usage_acc.clone(),
                summaries.clone(),
            );
            let failure = match self.config.cascade_timeout_ms.filter(|_| depth == 0) {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), walk).await {
                    Ok(failure) => failure,
                    Err(_) => {
                        cancel.cancel();
                        let cell_name = echo.lineage_snapshot().last().map(|e| e.cell.clone());
                        echo.add_error(
                            cell_name.clone().unwrap_or_default(),
                            "timeout",
                            format!("cascade timed out after {ms}ms"),
                        );
                        Some(CascadeFailure {
                            kind: "timeout".into(),
                            message: format!("cascade timed out after {ms}ms"),
                            cell: cell_name.unwrap_or_default(),
                            cascade: cascade.cascade_id.clone(),
                        })
                    }
                },
                None => walk.await,
            };

            let total = *usage_acc.lock();
            let duration_ms = started.elapsed().as_millis() as u64;
            let status = if failure.is_none() {
                CascadeStatus::Success
            } else {
                CascadeStatus::Failed
            };

            let mut done_row = LogRow::new(NodeType::CascadeCompleted)
                .with_role("system")
                .with_content(
                    json!({
                        "status": status,
                        "cells": echo.lineage_snapshot().len(),
                        "errors": echo.errors_snapshot().len(),
                        "total_cost": total.cost,
                    })
                    .to_string(),
                )
                .with_usage(&total)
                .with_duration_ms(duration_ms);
            done_row.content_type = "summary".into();
            self.logger.log(&base_ctx, done_row);

            EngineEvent::CascadeFinished {
                session_id: session_id.clone(),
                cascade_id: cascade.cascade_id.clone(),
                status: match status {
                    CascadeStatus::Success => "success".into(),
                    CascadeStatus::Failed => "failed".into(),
                },
                total_cost: total.cost,
                duration_ms,
            }
            .emit();

            self.cancel_map.remove(&session_id);
            if self.config.auto_analytics {
                self.spawn_analytics(&session_id);
            }

            let cells = std::mem::take(&mut *summaries.lock());
            CascadeResult {
                status,
                session_id,
                lineage: echo.lineage_snapshot(),
                cells,
                final_state: echo.state_scope(),
                cost: total.cost,
                duration_ms,
                error: failure,
            }
        })
    }

    /// Post-run analytics: fire-and-forget, never blocks cascade return.
    fn spawn_analytics(&self, session_id: &str) {
        let store = self.store.clone();
        let logger = self.logger.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            logger.flush().await;
            let started = Instant::now();
            match casc_analytics::run_for_session(store.as_ref(), &session_id).await {
                Ok(()) => EngineEvent::AnalyticsWritten {
                    session_id,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
                .emit(),
                // Analytics failures are invisible to the cascade.
                Err(e) => tracing::warn!(session_id = %session_id, error = %e, "analytics worker failed"),
            }
        });
    }

    // ── The walk ──────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn walk(
        &self,
        cascade: &Cascade,
        input: &Value,
        env: &Value,
        echo: &Echo,
        base_ctx: &ExecutionContext,
        cancel: &CancelToken,
        start_at: Option<&str>,
        depth: usize,
        usage_acc: Arc<Mutex<Usage>>,
        summaries: Arc<Mutex<Vec<CellRunSummary>>>,
    ) -> Option<CascadeFailure> {
        let mut idx = match start_at {
            Some(name) => match cascade.cell_index(name) {
                Some(i) => i,
                None => {
                    return Some(CascadeFailure {
                        kind: "config".into(),
                        message: format!("start_at names unknown cell {name}"),
                        cell: name.to_string(),
                        cascade: cascade.cascade_id.clone(),
                    });
                }
            },
            None => 0,
        };
        let mut phase_turns: u32 = 0;

        while idx < cascade.cells.len() {
            let cell = &cascade.cells[idx];

            if cancel.is_cancelled() {
                return Some(CascadeFailure {
                    kind: "timeout".into(),
                    message: "cascade cancelled".into(),
                    cell: cell.name.clone(),
                    cascade: cascade.cascade_id.clone(),
                });
            }
            if phase_turns >= cascade.rules.max_turns {
                // Normal termination: the turn budget bounds cyclic routes.
                echo.add_error(
                    &cell.name,
                    "validation",
                    format!(
                        "cascade max_turns ({}) exhausted",
                        cascade.rules.max_turns
                    ),
                );
                break;
            }
            phase_turns += 1;

            let species_hash = hash::species_hash(cell, input);
            let ctx = base_ctx.for_cell(&cell.name, idx as u32, &species_hash);
            echo.set_current(&cascade.cascade_id, &cell.name);

            let mut phase_row = LogRow::new(NodeType::PhaseStart).with_role("system").with_content(
                json!({"cell": cell.name, "index": idx, "phase": phase_turns}).to_string(),
            );
            phase_row.content_type = "phase".into();
            self.logger.log(&ctx, phase_row);

            let state_buffer: StateBuffer = Arc::new(Mutex::new(Map::new()));
            let phase_started = Instant::now();
            let result = self
                .run_single_cell(
                    cascade,
                    cell,
                    echo,
                    input,
                    env,
                    ctx.clone(),
                    cancel.clone(),
                    state_buffer.clone(),
                    phase_turns,
                    depth,
                )
                .await;
            let phase_duration = phase_started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => {
                    let buffered = std::mem::take(&mut *state_buffer.lock());
                    echo.merge_state(buffered);
                    usage_acc.lock().add(&outcome.usage);
                    summaries.lock().push(CellRunSummary {
                        cell: cell.name.clone(),
                        status: "completed".into(),
                        turns: outcome.turns,
                        duration_ms: phase_duration,
                        tokens_in: outcome.usage.tokens_in,
                        tokens_out: outcome.usage.tokens_out,
                        cost: outcome.usage.cost,
                        output_preview: Some(truncate_str(
                            &outcome.output.to_string(),
                            200,
                        )),
                    });
                    echo.add_lineage(LineageEntry {
                        cell: cell.name.clone(),
                        output: outcome.output.clone(),
                        trace_id: uuid::Uuid::new_v4().to_string(),
                        tool_calls: outcome.tool_calls.clone(),
                        reasoning: outcome.reasoning.clone(),
                    });

                    let mut end_row = LogRow::new(NodeType::PhaseEnd)
                        .with_role("system")
                        .with_content(
                            json!({
                                "cell": cell.name,
                                "status": "completed",
                                "turns": outcome.turns,
                            })
                            .to_string(),
                        )
                        .with_usage(&outcome.usage)
                        .with_duration_ms(phase_duration);
                    end_row.content_type = "phase".into();
                    self.logger.log(&ctx, end_row);

                    // Cascade-level early termination.
                    if let Some(condition) = &cascade.rules.loop_until {
                        let scope = Scope::new()
                            .with("outputs", echo.outputs_scope())
                            .with("state", echo.state_scope());
                        if is_truthy(&render_value(condition, &scope)) {
                            break;
                        }
                    }

                    idx = next_cell_index(cascade, cell, idx, &outcome, echo);
                }
                Err(e) => {
                    echo.add_error(&cell.name, e.kind(), mask_secrets(&e.to_string()));
                    summaries.lock().push(CellRunSummary {
                        cell: cell.name.clone(),
                        status: "failed".into(),
                        turns: 0,
                        duration_ms: phase_duration,
                        tokens_in: 0,
                        tokens_out: 0,
                        cost: 0.0,
                        output_preview: None,
                    });
                    let error_row = LogRow::new(NodeType::Error)
                        .with_role("system")
                        .with_content(mask_secrets(&e.to_string()));
                    self.logger.log(&ctx, error_row);

                    let mut end_row = LogRow::new(NodeType::PhaseEnd)
                        .with_role("system")
                        .with_content(
                            json!({"cell": cell.name, "status": "failed"}).to_string(),
                        )
                        .with_duration_ms(phase_duration);
                    end_row.content_type = "phase".into();
                    self.logger.log(&ctx, end_row);

                    match e {
                        // Turn/schema exhaustion fails the cell, not the
                        // cascade.
                        Error::Validation(_) => {
                            idx += 1;
                        }
                        other => {
                            return Some(CascadeFailure {
                                kind: other.kind().into(),
                                message: mask_secrets(&other.to_string()),
                                cell: cell.name.clone(),
                                cascade: cascade.cascade_id.clone(),
                            });
                        }
                    }
                }
            }
        }

        None
    }

    // ── One cell (with on_error recovery) ─────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn run_single_cell<'a>(
        &'a self,
        cascade: &'a Cascade,
        cell: &'a Cell,
        echo: &'a Echo,
        input: &'a Value,
        env: &'a Value,
        ctx: ExecutionContext,
        cancel: CancelToken,
        state_buffer: StateBuffer,
        phase_index: u32,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = casc_domain::Result<CellOutcome>> + Send + 'a>> {
        Box::pin(async move {
            if cell.is_deterministic() {
                let started = Instant::now();
                match self.executor.execute(cell, echo, input, env).await {
                    Ok(det) => {
                        let tool_name = cell.tool.clone().unwrap_or_default();
                        let record = ToolCallRecord {
                            tool_name: tool_name.clone(),
                            arguments: Value::Object(cell.inputs.clone()),
                            result: det.output.clone(),
                            is_error: det.route == casc_tools::Route::Error,
                        };
                        // One tool_call / tool_result pair sharing a trace.
                        let mut call_row = LogRow::new(NodeType::ToolCall)
                            .with_role("system")
                            .with_content(
                                serde_json::to_string(&cell.inputs).unwrap_or_default(),
                            );
                        call_row.content_type = tool_name.clone();
                        let call_trace = call_row.trace_id.clone();
                        self.logger.log(&ctx, call_row);

                        let mut result_row = LogRow::new(NodeType::ToolResult)
                            .with_role("tool")
                            .with_content(
                                serde_json::to_string(&det.output).unwrap_or_default(),
                            )
                            .with_duration_ms(started.elapsed().as_millis() as u64);
                        result_row.trace_id = call_trace;
                        result_row.content_type = tool_name;
                        self.logger.log(&ctx, result_row);

                        Ok(CellOutcome {
                            output: det.output,
                            reasoning: None,
                            tool_calls: vec![record],
                            usage: Usage::default(),
                            duration_ms: started.elapsed().as_millis() as u64,
                            turns: 0,
                            requested_route: None,
                            context_cost: 0.0,
                        })
                    }
                    Err(e) => match &cell.rules.on_error {
                        Some(recovery) => {
                            echo.add_error(&cell.name, e.kind(), e.to_string());
                            echo.update_state(
                                "_error",
                                json!({
                                    "cell": cell.name,
                                    "kind": e.kind(),
                                    "message": e.to_string(),
                                }),
                            );
                            let recovery_ctx = ctx.for_cell(
                                &recovery.name,
                                ctx.cell_index,
                                &hash::species_hash(recovery, input),
                            );
                            self.run_single_cell(
                                cascade,
                                recovery,
                                echo,
                                input,
                                env,
                                recovery_ctx,
                                cancel,
                                state_buffer,
                                phase_index,
                                depth,
                            )
                            .await
                        }
                        None => Err(e),
                    },
                }
            } else {
                let args = CellRunArgs {
                    engine: self,
                    cascade,
                    cell,
                    echo,
                    input,
                    env,
                    ctx,
                    cancel,
                    state_buffer,
                    phase_index,
                    depth,
                };
                if cell.candidates.is_some() {
                    candidates::run_with_candidates(args).await
                } else {
                    cell::run_llm_cell(args).await
                }
            }
        })
    }

    // ── Sub-cascades ──────────────────────────────────────────────

    /// Launch a registered cascade as a child session; the parent cell
    /// awaits it and the child echo merges back on return. Failures are
    /// rewrapped with the sub-cascade's id as a path prefix.
    pub(crate) async fn run_sub_cascade(
        &self,
        parent: &Echo,
        cascade_id: &str,
        inputs: Value,
        env: Value,
        depth: usize,
    ) -> casc_domain::Result<Value> {
        if depth + 1 > self.config.sub_cascade_depth {
            return Err(Error::Other(format!(
                "sub-cascade depth limit ({}) exceeded at {cascade_id}",
                self.config.sub_cascade_depth
            )));
        }
        let cascade = self
            .library
            .read()
            .get(cascade_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no registered cascade {cascade_id}")))?;

        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        let child_session = format!("{}-sub-{suffix}", parent.session_id);
        EngineEvent::SubCascadeLaunched {
            parent_session_id: parent.session_id.clone(),
            child_session_id: child_session.clone(),
            cascade_id: cascade_id.to_string(),
            depth: depth + 1,
        }
        .emit();

        let result = self
            .run_cascade_at_depth(
                &cascade,
                inputs,
                RunOptions {
                    session_id: Some(child_session.clone()),
                    caller_id: parent.caller_id.clone(),
                    parent_session_id: Some(parent.session_id.clone()),
                    env,
                    start_at: None,
                },
                depth + 1,
            )
            .await;

        if let Some(child_echo) = self.sessions.get(&child_session) {
            parent.merge(&child_echo, cascade_id);
        }

        match result.status {
            CascadeStatus::Success => Ok(json!({
                "status": "success",
                "final_state": result.final_state,
                "cost": result.cost,
            })),
            CascadeStatus::Failed => {
                let detail = result
                    .error
                    .map(|e| format!("{} at cell {}: {}", e.kind, e.cell, e.message))
                    .unwrap_or_else(|| "unknown failure".into());
                Err(Error::Other(format!("sub-cascade {cascade_id}: {detail}")))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pick the next cell index after a completed cell.
///
/// Explicit `route_to` wins; otherwise the first listed handoff (chosen
/// for determinism); a self-handoff re-enters the cell until its
/// `loop_until` turns truthy; no handoffs means declaration order.
fn next_cell_index(
    cascade: &Cascade,
    cell: &Cell,
    current: usize,
    outcome: &CellOutcome,
    echo: &Echo,
) -> usize {
    if let Some(target) = &outcome.requested_route {
        if let Some(index) = cascade.cell_index(target) {
            return index;
        }
    }

    match cell.handoffs.first() {
        Some(first) if first == &cell.name => {
            let done = cell
                .rules
                .loop_until
                .as_ref()
                .map(|condition| {
                    let scope = Scope::new()
                        .with("outputs", echo.outputs_scope())
                        .with("state", echo.state_scope());
                    is_truthy(&render_value(condition, &scope))
                })
                .unwrap_or(true);
            if done {
                current + 1
            } else {
                current
            }
        }
        Some(first) => cascade.cell_index(first).unwrap_or(current + 1),
        None => current + 1,
    }
}

fn prevalidation_failure(cascade: &Cascade, session_id: &str, e: Error) -> CascadeResult {
    CascadeResult {
        status: CascadeStatus::Failed,
        session_id: session_id.to_string(),
        lineage: Vec::new(),
        cells: Vec::new(),
        final_state: json!({}),
        cost: 0.0,
        duration_ms: 0,
        error: Some(CascadeFailure {
            kind: e.kind().into(),
            message: e.to_string(),
            cell: String::new(),
            cascade: cascade.cascade_id.clone(),
        }),
    }
}

/// Truncate at a char boundary, appending an ellipsis when shortened.
pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("abcdefgh", 4), "abcd...");
        // Multi-byte char straddling the cut.
        let s = "ab\u{00e9}cd";
        let cut = truncate_str(s, 3);
        assert!(cut.starts_with("ab"));
    }

    #[test]
    fn routing_prefers_explicit_route() {
        let cascade: Cascade = serde_json::from_value(json!({
            "cascade_id": "r",
            "cells": [
                {"name": "a", "instructions": "x", "handoffs": ["c", "b"]},
                {"name": "b", "instructions": "x"},
                {"name": "c", "instructions": "x"}
            ]
        }))
        .unwrap();
        let echo = Echo::new("s", None, None);
        let outcome = |route: Option<&str>| CellOutcome {
            output: json!("done"),
            reasoning: None,
            tool_calls: Vec::new(),
            usage: Usage::default(),
            duration_ms: 0,
            turns: 1,
            requested_route: route.map(str::to_string),
            context_cost: 0.0,
        };

        // route_to("b") beats the first-listed "c".
        assert_eq!(
            next_cell_index(&cascade, &cascade.cells[0], 0, &outcome(Some("b")), &echo),
            1
        );
        // No explicit route: first listed wins.
        assert_eq!(
            next_cell_index(&cascade, &cascade.cells[0], 0, &outcome(None), &echo),
            2
        );
        // No handoffs: declaration order.
        assert_eq!(
            next_cell_index(&cascade, &cascade.cells[1], 1, &outcome(None), &echo),
            2
        );
    }

    #[test]
    fn self_handoff_loops_until_truthy() {
        let cascade: Cascade = serde_json::from_value(json!({
            "cascade_id": "r",
            "cells": [
                {
                    "name": "research",
                    "instructions": "x",
                    "handoffs": ["research"],
                    "rules": {"loop_until": "{{state.done}}", "max_turns": 5}
                }
            ]
        }))
        .unwrap();
        let echo = Echo::new("s", None, None);
        let outcome = CellOutcome {
            output: json!("pass"),
            reasoning: None,
            tool_calls: Vec::new(),
            usage: Usage::default(),
            duration_ms: 0,
            turns: 1,
            requested_route: None,
            context_cost: 0.0,
        };

        // Not done: re-enter the same cell.
        assert_eq!(
            next_cell_index(&cascade, &cascade.cells[0], 0, &outcome, &echo),
            0
        );
        echo.update_state("done", json!(true));
        assert_eq!(
            next_cell_index(&cascade, &cascade.cells[0], 0, &outcome, &echo),
            1
        );
    }
}
