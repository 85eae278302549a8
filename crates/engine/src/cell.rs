//! The cell loop — the turn machine around one LLM cell.
//!
//! Per turn: assemble the prompt, call the provider (with transient-retry
//! that does not consume turns), dispatch tool calls, validate structured
//! output and wards, and loop until done or the turn budget runs out.
//! Control tools (`route_to`, `request_decision`, `launch_sub_cascade`)
//! are intercepted here rather than dispatched through the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use casc_domain::cascade::{Cascade, Cell};
use casc_domain::error::{Error, Result};
use casc_domain::event::EngineEvent;
use casc_domain::logrow::{LogRow, NodeType};
use casc_domain::message::{
    estimate_tokens, ContentPart, Message, MessageContent, ToolCall, ToolDefinition, Usage,
};
use casc_echo::{Echo, ToolCallRecord};
use casc_providers::{with_retry, ChatRequest, ChatResponse};
use casc_store::ExecutionContext;
use casc_template::{is_truthy, render_str, render_value, Scope};
use casc_tools::{Tool, ToolContext};
use tracing::Instrument;

use crate::cancel::CancelToken;
use crate::context;
use crate::scheduler::Engine;
use crate::wards;

/// Buffered state writes, merged into the echo only when the run commits
/// (immediately for plain cells, on winning for candidates).
pub(crate) type StateBuffer = Arc<Mutex<Map<String, Value>>>;

/// Result of one completed cell run.
#[derive(Debug, Clone)]
pub struct CellOutcome {
    pub output: Value,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Usage,
    pub duration_ms: u64,
    pub turns: u32,
    /// Handoff target requested via the `route_to` control tool.
    pub requested_route: Option<String>,
    /// Estimated cost of the context injected into this run.
    pub context_cost: f64,
}

pub(crate) struct CellRunArgs<'a> {
    pub engine: &'a Engine,
    pub cascade: &'a Cascade,
    pub cell: &'a Cell,
    pub echo: &'a Echo,
    pub input: &'a Value,
    pub env: &'a Value,
    pub ctx: ExecutionContext,
    pub cancel: CancelToken,
    pub state_buffer: StateBuffer,
    pub phase_index: u32,
    pub depth: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) async fn run_llm_cell(args: CellRunArgs<'_>) -> Result<CellOutcome> {
    let CellRunArgs {
        engine,
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
    } = args;

    let started = Instant::now();
    let max_turns = cell.rules.max_turns;
    if max_turns == 0 {
        return Err(Error::Validation(format!(
            "cell {}: max_turns is 0",
            cell.name
        )));
    }

    // Model: cell override → cascade default → engine default.
    let model_spec = cell
        .model
        .as_deref()
        .or(cascade.model.as_deref())
        .or(engine.config.default_model.as_deref());
    let (provider, model) = engine.providers.resolve(model_spec)?;
    let pricing = engine.config.pricing_for(&model).copied();

    // Context messages, with per-message cost accounting.
    let assembled = context::assemble(
        cell,
        ctx.cell_index,
        |name| cascade.cell_index(name).map(|i| i as u32),
        echo,
        pricing.as_ref(),
    );
    for record in &assembled.records {
        engine.logger.log(&ctx, context_log_row(record));
    }

    // Rendered instructions become the user prompt.
    let scope = cell_scope(echo, &state_buffer, input, env, None);
    let instructions = render_str(cell.instructions.as_deref().unwrap_or_default(), &scope);
    let mut messages: Vec<Message> = assembled.messages.clone();
    messages.push(Message::user(&instructions));
    {
        let row = LogRow::new(NodeType::User)
            .with_role("user")
            .with_content(&instructions);
        echo.add_history("user", &instructions, &row.trace_id, None, NodeType::User);
        engine.logger.log(&ctx, row);
    }

    // Tool catalog: registry selection per traits, plus control tools.
    let selected = engine.tools.select(cell.traits.as_ref());
    let catalog: HashMap<String, Arc<dyn Tool>> = selected
        .iter()
        .map(|t| (t.name().to_string(), t.clone()))
        .collect();
    let mut tool_defs: Vec<ToolDefinition> = selected.iter().map(|t| t.describe()).collect();
    tool_defs.extend(control_tool_defs(engine, cell));

    let mut total_usage = Usage::default();
    let mut tool_records: Vec<ToolCallRecord> = Vec::new();
    let mut reasoning: Option<String> = None;
    let mut requested_route: Option<String> = None;
    let mut turns: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Timeout(format!("cell {} cancelled", cell.name)));
        }
        if turns >= max_turns {
            return Err(Error::Validation(format!(
                "cell {}: max_turns ({max_turns}) exhausted",
                cell.name
            )));
        }
        turns += 1;

        // ── SENDING ──────────────────────────────────────────────
        let req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            model: Some(model.clone()),
            ..Default::default()
        };
        let turn_started = Instant::now();
        let turn_span = tracing::info_span!("turn", cell = %cell.name, turn = turns, model = %model);
        let response: ChatResponse = tokio::select! {
            result = with_retry(
                engine.config.provider_attempts,
                Duration::from_millis(engine.config.provider_backoff_ms),
                || provider.chat(req.clone()),
            ).instrument(turn_span) => result?,
            _ = cancel.cancelled() => {
                return Err(Error::Timeout(format!("cell {} cancelled", cell.name)));
            }
        };
        let turn_duration = turn_started.elapsed().as_millis() as u64;

        let mut usage = response
            .usage
            .unwrap_or_else(|| estimated_usage(&req, &response));
        if usage.cost == 0.0 {
            if let Some(pricing) = &pricing {
                usage.cost = pricing.estimate_cost(usage.tokens_in, usage.tokens_out);
            }
        }
        total_usage.add(&usage);
        if let Some(text) = &response.reasoning {
            match &mut reasoning {
                Some(acc) => {
                    acc.push('\n');
                    acc.push_str(text);
                }
                None => reasoning = Some(text.clone()),
            }
        }

        let turn_row = LogRow::new(NodeType::Turn)
            .with_role("assistant")
            .with_content(&response.content)
            .with_usage(&usage)
            .with_duration_ms(turn_duration)
            .with_model(&model);
        let turn_trace = turn_row.trace_id.clone();
        engine.logger.log(&ctx, turn_row);
        echo.add_history(
            "assistant",
            &response.content,
            &turn_trace,
            None,
            NodeType::Assistant,
        );
        EngineEvent::ProviderCall {
            cell_name: cell.name.clone(),
            model: model.clone(),
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost: usage.cost,
            duration_ms: turn_duration,
        }
        .emit();

        // ── AWAITING_TOOLS ───────────────────────────────────────
        if !response.tool_calls.is_empty() {
            messages.push(assistant_tool_message(&response));
            let dispatches = dispatch_tools(ToolDispatchArgs {
                engine,
                cell,
                echo,
                env,
                ctx: &ctx,
                cancel: &cancel,
                state_buffer: &state_buffer,
                turn_trace: &turn_trace,
                calls: &response.tool_calls,
                catalog: &catalog,
                phase_index,
                depth,
            })
            .await?;
            for dispatch in dispatches {
                if dispatch.is_error {
                    messages.push(Message::tool_error(&dispatch.call_id, &dispatch.content));
                } else {
                    messages.push(Message::tool_result(&dispatch.call_id, &dispatch.content));
                }
                if let Some(route) = dispatch.route {
                    requested_route = Some(route);
                }
                tool_records.push(dispatch.record);
            }
            continue;
        }

        // ── VALIDATING ───────────────────────────────────────────
        let output = match &cell.output_schema {
            Some(schema) => {
                let parsed: std::result::Result<Value, String> =
                    serde_json::from_str(response.content.trim())
                        .map_err(|e| format!("output is not valid JSON: {e}"));
                let violation = match &parsed {
                    Ok(value) => wards::validate_schema(schema, value).err(),
                    Err(e) => Some(e.clone()),
                };
                if let Some(violation) = violation {
                    messages.push(Message::system(format!(
                        "Your last response violated the output schema: {violation}. \
                         Respond again with JSON matching the schema."
                    )));
                    continue;
                }
                parsed.unwrap_or(Value::Null)
            }
            None => Value::String(response.content.clone()),
        };

        let state_now = state_view(echo, &state_buffer);
        if let Err(failure) = wards::check_wards(&cell.wards, &output, &response.content, &state_now)
        {
            EngineEvent::WardFailed {
                cell_name: cell.name.clone(),
                kind: format!("{:?}", failure.kind).to_lowercase(),
                action: format!("{:?}", failure.action).to_lowercase(),
            }
            .emit();
            match failure.action {
                casc_domain::cascade::WardAction::Fail => {
                    return Err(Error::WardFatal(format!(
                        "cell {}: {}",
                        cell.name, failure.message
                    )));
                }
                casc_domain::cascade::WardAction::Retry => {
                    messages.push(Message::system(format!(
                        "A guardrail rejected your last response: {}. Try again.",
                        failure.message
                    )));
                    continue;
                }
            }
        }

        // A self-handoff hands the loop to the phase scheduler, which
        // re-enters the cell with a fresh turn budget; only plain cells
        // spend turns on loop_until here.
        let scheduler_owns_loop = cell.handoffs.iter().any(|h| h == &cell.name);
        if let Some(condition) = cell.rules.loop_until.as_ref().filter(|_| !scheduler_owns_loop) {
            let mut outputs = match echo.outputs_scope() {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            outputs.insert(cell.name.clone(), output.clone());
            let scope = Scope::new()
                .with("outputs", Value::Object(outputs))
                .with("state", state_now.clone());
            if !is_truthy(&render_value(condition, &scope)) {
                messages.push(Message::system(
                    "The completion condition is not yet met. Continue.",
                ));
                continue;
            }
        }

        // ── DONE ─────────────────────────────────────────────────
        return Ok(CellOutcome {
            output,
            reasoning: reasoning.clone(),
            tool_calls: tool_records,
            usage: total_usage,
            duration_ms: started.elapsed().as_millis() as u64,
            turns,
            requested_route,
            context_cost: assembled.estimated_cost(),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ToolDispatch {
    call_id: String,
    content: String,
    is_error: bool,
    /// Handoff requested by a `route_to` call.
    route: Option<String>,
    record: ToolCallRecord,
}

struct ToolDispatchArgs<'a> {
    engine: &'a Engine,
    cell: &'a Cell,
    echo: &'a Echo,
    env: &'a Value,
    ctx: &'a ExecutionContext,
    cancel: &'a CancelToken,
    state_buffer: &'a StateBuffer,
    turn_trace: &'a str,
    calls: &'a [ToolCall],
    catalog: &'a HashMap<String, Arc<dyn Tool>>,
    phase_index: u32,
    depth: usize,
}

async fn dispatch_tools(args: ToolDispatchArgs<'_>) -> Result<Vec<ToolDispatch>> {
    // Tool calls execute sequentially unless every call in the turn names
    // a parallel-safe registry tool; then they fan out under the per-turn
    // pool.
    let all_parallel_safe = args.calls.len() > 1
        && args.calls.iter().all(|c| {
            args.catalog
                .get(&c.tool_name)
                .map(|t| t.parallel_safe())
                .unwrap_or(false)
        });

    if all_parallel_safe {
        let futures: Vec<_> = args
            .calls
            .iter()
            .map(|call| dispatch_parallel_registry_call(&args, call))
            .collect();
        return Ok(futures_util::future::join_all(futures).await);
    }

    let mut dispatches = Vec::with_capacity(args.calls.len());
    for call in args.calls {
        if args.cancel.is_cancelled() {
            return Err(Error::Timeout(format!(
                "cell {} cancelled during tool dispatch",
                args.cell.name
            )));
        }
        let dispatch = dispatch_one(&args, call).await;
        dispatches.push(dispatch);
    }
    Ok(dispatches)
}

async fn dispatch_parallel_registry_call(
    args: &ToolDispatchArgs<'_>,
    call: &ToolCall,
) -> ToolDispatch {
    let _permit = args.engine.tool_pool.acquire().await;
    dispatch_one(args, call).await
}

async fn dispatch_one(args: &ToolDispatchArgs<'_>, call: &ToolCall) -> ToolDispatch {
    let call_started = Instant::now();
    let call_trace = uuid::Uuid::new_v4().to_string();

    let mut call_row = LogRow::new(NodeType::ToolCall)
        .with_role("assistant")
        .with_content(serde_json::to_string(&call.arguments).unwrap_or_default())
        .with_parent(args.turn_trace);
    call_row.trace_id = call_trace.clone();
    call_row.content_type = call.tool_name.clone();
    args.engine.logger.log(args.ctx, call_row);

    let result = invoke_call(args, call).await;

    let (content, is_error, route, result_value) = match result {
        Ok(value) => {
            let route = value
                .get("routing_to")
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|_| call.tool_name == "route_to");
            (
                serde_json::to_string(&value).unwrap_or_default(),
                false,
                route,
                value,
            )
        }
        Err(e) => {
            // Tool failures return to the model as error results; the turn
            // continues and the model decides the next step.
            let payload = json!({"error": e.to_string()});
            (payload.to_string(), true, None, payload)
        }
    };

    let mut result_row = LogRow::new(NodeType::ToolResult)
        .with_role("tool")
        .with_content(&content)
        .with_parent(args.turn_trace)
        .with_duration_ms(call_started.elapsed().as_millis() as u64);
    result_row.trace_id = call_trace;
    result_row.content_type = call.tool_name.clone();
    args.engine.logger.log(args.ctx, result_row);

    ToolDispatch {
        call_id: call.call_id.clone(),
        content,
        is_error,
        route,
        record: ToolCallRecord {
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            result: result_value,
            is_error,
        },
    }
}

async fn invoke_call(args: &ToolDispatchArgs<'_>, call: &ToolCall) -> Result<Value> {
    match call.tool_name.as_str() {
        "route_to" => {
            let target = call
                .arguments
                .get("next_cell")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Tool {
                    tool: "route_to".into(),
                    message: "missing next_cell".into(),
                })?;
            if !args.cell.handoffs.iter().any(|h| h == target) {
                return Err(Error::Tool {
                    tool: "route_to".into(),
                    message: format!(
                        "{target} is not a declared handoff of cell {}",
                        args.cell.name
                    ),
                });
            }
            Ok(json!({"routing_to": target}))
        }
        "request_decision" => request_decision(args, call).await,
        "launch_sub_cascade" => {
            let cascade_id = call
                .arguments
                .get("cascade_id")
                .or_else(|| call.arguments.get("path"))
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Tool {
                    tool: "launch_sub_cascade".into(),
                    message: "missing cascade_id".into(),
                })?;
            let inputs = call
                .arguments
                .get("inputs")
                .cloned()
                .unwrap_or_else(|| json!({}));
            args.engine
                .run_sub_cascade(args.echo, cascade_id, inputs, args.env.clone(), args.depth)
                .await
        }
        name => {
            let tool = args.catalog.get(name).ok_or_else(|| Error::Tool {
                tool: name.to_string(),
                message: "tool is not exposed to this cell".into(),
            })?;
            let tool_ctx = ToolContext::new(
                &args.echo.session_id,
                &args.cell.name,
                state_view(args.echo, args.state_buffer),
            )
            .with_cancel_flag(args.cancel.flag());
            let tool_span = tracing::info_span!("tool.call", tool_name = %name);
            tokio::select! {
                result = tool.invoke(call.arguments.clone(), &tool_ctx).instrument(tool_span) => result,
                _ = args.cancel.cancelled() => Err(Error::Timeout(format!(
                    "tool {name} cancelled"
                ))),
            }
        }
    }
}

async fn request_decision(args: &ToolDispatchArgs<'_>, call: &ToolCall) -> Result<Value> {
    let (record, rx) = args.engine.checkpoints.open(
        &args.echo.session_id,
        &args.cell.name,
        args.phase_index,
        call.arguments.clone(),
    );

    let mut row = LogRow::new(NodeType::Checkpoint)
        .with_role("system")
        .with_content(serde_json::to_string(&record).unwrap_or_default())
        .with_parent(args.turn_trace);
    row.content_type = "checkpoint".into();
    let trace_id = row.trace_id.clone();
    args.engine.logger.log(args.ctx, row);
    args.echo.add_history(
        "system",
        serde_json::to_string(&record).unwrap_or_default(),
        &trace_id,
        Some(args.turn_trace.to_string()),
        NodeType::Checkpoint,
    );

    let timeout = call
        .arguments
        .get("timeout_ms")
        .and_then(Value::as_u64)
        .map(Duration::from_millis);
    let response = tokio::select! {
        result = args.engine.checkpoints.wait(&record.id, rx, timeout) => result?,
        _ = args.cancel.cancelled() => {
            let _ = args.engine.checkpoints.cancel(&record.id, Some("cell cancelled".into()));
            return Err(Error::CheckpointCancelled(format!(
                "checkpoint {} cancelled with its cell",
                record.id
            )));
        }
    };

    args.state_buffer
        .lock()
        .insert(format!("_decision_{}", args.cell.name), response.clone());
    Ok(response)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn cell_scope(
    echo: &Echo,
    state_buffer: &StateBuffer,
    input: &Value,
    env: &Value,
    checkpoint_id: Option<&str>,
) -> Scope {
    let mut scope = Scope::new()
        .with("input", input.clone())
        .with("state", state_view(echo, state_buffer))
        .with("outputs", echo.outputs_scope())
        .with("env", env.clone())
        .with("session_id", json!(echo.session_id));
    if let Some(id) = checkpoint_id {
        scope.set("checkpoint_id", json!(id));
    }
    scope
}

pub(crate) fn state_view(echo: &Echo, state_buffer: &StateBuffer) -> Value {
    let mut map = echo.state_snapshot();
    for (key, value) in state_buffer.lock().iter() {
        map.insert(key.clone(), value.clone());
    }
    Value::Object(map)
}

fn estimated_usage(req: &ChatRequest, response: &ChatResponse) -> Usage {
    let tokens_in = req
        .messages
        .iter()
        .map(|m| estimate_tokens(&m.content.extract_all_text()))
        .sum();
    Usage {
        tokens_in,
        tokens_out: estimate_tokens(&response.content),
        cost: 0.0,
    }
}

fn assistant_tool_message(response: &ChatResponse) -> Message {
    let mut parts = Vec::new();
    if !response.content.is_empty() {
        parts.push(ContentPart::Text {
            text: response.content.clone(),
        });
    }
    for call in &response.tool_calls {
        parts.push(ContentPart::ToolUse {
            id: call.call_id.clone(),
            name: call.tool_name.clone(),
            input: call.arguments.clone(),
        });
    }
    Message {
        role: casc_domain::message::Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}

fn control_tool_defs(engine: &Engine, cell: &Cell) -> Vec<ToolDefinition> {
    let mut defs = Vec::new();
    if !cell.handoffs.is_empty() {
        defs.push(ToolDefinition {
            name: "route_to".into(),
            description: "Hand execution off to one of this cell's declared next cells.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "next_cell": {"type": "string", "enum": cell.handoffs}
                },
                "required": ["next_cell"]
            }),
        });
    }
    defs.push(ToolDefinition {
        name: "request_decision".into(),
        description: "Pause and ask the human operator for a decision. Blocks until answered."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string"},
                "expected_shape": {"type": "object"},
                "timeout_ms": {"type": "integer"}
            },
            "required": ["prompt"]
        }),
    });
    if engine.has_cascades() {
        defs.push(ToolDefinition {
            name: "launch_sub_cascade".into(),
            description: "Run a registered cascade as a child session and wait for its result."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "cascade_id": {"type": "string"},
                    "inputs": {"type": "object"}
                },
                "required": ["cascade_id"]
            }),
        });
    }
    defs
}

fn context_log_row(record: &context::ContextRecord) -> LogRow {
    let node_type = match record.role {
        casc_domain::message::Role::System => NodeType::System,
        casc_domain::message::Role::Assistant => NodeType::Assistant,
        _ => NodeType::User,
    };
    let mut row = LogRow::new(node_type)
        .with_role(record.role.as_str())
        .with_content(&record.content);
    row.content_type = "context".into();
    row.context_source = Some(record.source_cell.clone());
    row.data_format = record.data_format.clone();
    row.data_size_json = record.data_size_json;
    row.data_size_toon = record.data_size_toon;
    row.data_token_savings_pct = record.data_token_savings_pct;
    row.tokens_in = record.estimated_tokens;
    row.cost = record.estimated_cost;
    row
}
