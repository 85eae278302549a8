//! Candidate fan-out: N parallel variants of one cell.
//!
//! Variants run concurrently under the global candidate pool, each against
//! an isolated state buffer. Selection follows the configured mode:
//! `first` (first success wins, siblings cancelled), `evaluate` (an
//! embedded evaluator scores all outputs, arg-max wins, ties broken by
//! lowest cost then lowest index), or `aggregate` (all outputs onward).
//! Only a winner's buffered state writes are committed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use casc_domain::cascade::{CandidateMode, CandidatesConfig, EvaluatorConfig, Factor};
use casc_domain::error::{Error, Result};
use casc_domain::event::EngineEvent;
use casc_domain::message::{estimate_tokens, Message, Usage};
use casc_providers::{with_retry, ChatRequest};
use casc_template::{render_str, render_value, Scope};

use crate::cell::{self, CellOutcome, CellRunArgs, StateBuffer};
use crate::cancel::CancelToken;

type CandidateResult = (usize, Result<CellOutcome>, StateBuffer);

pub(crate) async fn run_with_candidates(args: CellRunArgs<'_>) -> Result<CellOutcome> {
    let config: CandidatesConfig = args
        .cell
        .candidates
        .clone()
        .expect("caller checked candidates");

    let factor = resolve_factor(&config.factor, &args)?;

    if factor == 0 {
        // Explicit no-op: the scheduler records a skipped lineage entry.
        return Ok(CellOutcome {
            output: json!({"skipped": true}),
            reasoning: None,
            tool_calls: Vec::new(),
            usage: Usage::default(),
            duration_ms: 0,
            turns: 0,
            requested_route: None,
            context_cost: 0.0,
        });
    }
    if factor == 1 {
        return cell::run_llm_cell(args).await;
    }

    let tokens: Vec<CancelToken> = (0..factor).map(|_| CancelToken::new()).collect();
    let parent_cancel = args.cancel.clone();

    let futures: Vec<_> = (0..factor as usize)
        .map(|index| {
            let buffer: StateBuffer = Arc::new(Mutex::new(Map::new()));
            let token = tokens[index].clone();
            let parent_cancel = parent_cancel.clone();
            let child_args = CellRunArgs {
                engine: args.engine,
                cascade: args.cascade,
                cell: args.cell,
                echo: args.echo,
                input: args.input,
                env: args.env,
                ctx: args.ctx.clone(),
                cancel: token,
                state_buffer: buffer.clone(),
                phase_index: args.phase_index,
                depth: args.depth,
            };
            let pool = args.engine.candidate_pool.clone();
            async move {
                let _permit = pool.acquire().await;
                let outcome = tokio::select! {
                    result = cell::run_llm_cell(child_args) => result,
                    _ = parent_cancel.cancelled() => {
                        Err(Error::Timeout("candidate cancelled with its cell".into()))
                    }
                };
                let result: CandidateResult = (index, outcome, buffer);
                result
            }
        })
        .collect();

    let outcome = match config.mode {
        CandidateMode::First => run_first(&args, factor, tokens, futures).await,
        CandidateMode::Aggregate => run_aggregate(&args, factor, futures).await,
        CandidateMode::Evaluate => {
            let evaluator = config
                .evaluator
                .as_ref()
                .expect("validated: evaluate mode carries an evaluator");
            run_evaluate(&args, factor, evaluator, futures).await
        }
    }?;

    Ok(outcome)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Modes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_first<'f>(
    args: &CellRunArgs<'_>,
    factor: u32,
    tokens: Vec<CancelToken>,
    futures: Vec<impl std::future::Future<Output = CandidateResult> + Send + 'f>,
) -> Result<CellOutcome> {
    let mut remaining: Vec<
        std::pin::Pin<Box<dyn std::future::Future<Output = CandidateResult> + Send + 'f>>,
    > = futures
        .into_iter()
        .map(|f| {
            Box::pin(f)
                as std::pin::Pin<Box<dyn std::future::Future<Output = CandidateResult> + Send + 'f>>
        })
        .collect();

    let mut winner: Option<(usize, CellOutcome, StateBuffer)> = None;
    let mut late_usage = Usage::default();
    let mut first_error: Option<Error> = None;

    while !remaining.is_empty() {
        let (result, _idx, rest) = futures_util::future::select_all(remaining).await;
        remaining = rest;
        let (index, outcome, buffer) = result;
        match outcome {
            Ok(outcome) if winner.is_none() => {
                // First success: cancel the siblings and drain them.
                for token in &tokens {
                    token.cancel();
                }
                winner = Some((index, outcome, buffer));
            }
            Ok(outcome) => {
                // Finished before cancellation landed: its spend still
                // belongs to the cell.
                late_usage.add(&outcome.usage);
            }
            Err(e) => {
                if winner.is_none() && first_error.is_none() && !matches!(e, Error::Timeout(_)) {
                    first_error = Some(e);
                }
            }
        }
    }

    match winner {
        Some((index, mut outcome, buffer)) => {
            outcome.usage.add(&late_usage);
            commit_buffer(args, buffer);
            EngineEvent::CandidateSelected {
                cell_name: args.cell.name.clone(),
                mode: "first".into(),
                factor,
                winner_index: Some(index),
            }
            .emit();
            Ok(outcome)
        }
        None => Err(first_error.unwrap_or_else(|| {
            Error::Validation(format!("cell {}: all candidates failed", args.cell.name))
        })),
    }
}

async fn run_aggregate(
    args: &CellRunArgs<'_>,
    factor: u32,
    futures: Vec<impl std::future::Future<Output = CandidateResult>>,
) -> Result<CellOutcome> {
    let (successes, first_error) = join_candidates(args, futures).await;
    if successes.is_empty() {
        return Err(first_error.unwrap_or_else(|| {
            Error::Validation(format!("cell {}: all candidates failed", args.cell.name))
        }));
    }

    let mut usage = Usage::default();
    let mut outputs = Vec::with_capacity(successes.len());
    let mut tool_calls = Vec::new();
    let mut duration_ms = 0;
    let mut turns = 0;
    let mut context_cost = 0.0;
    for (_, outcome, _) in &successes {
        usage.add(&outcome.usage);
        outputs.push(outcome.output.clone());
        tool_calls.extend(outcome.tool_calls.iter().cloned());
        duration_ms = duration_ms.max(outcome.duration_ms);
        turns += outcome.turns;
        context_cost += outcome.context_cost;
    }

    EngineEvent::CandidateSelected {
        cell_name: args.cell.name.clone(),
        mode: "aggregate".into(),
        factor,
        winner_index: None,
    }
    .emit();

    Ok(CellOutcome {
        output: Value::Array(outputs),
        reasoning: None,
        tool_calls,
        usage,
        duration_ms,
        turns,
        requested_route: None,
        context_cost,
    })
}

async fn run_evaluate(
    args: &CellRunArgs<'_>,
    factor: u32,
    evaluator: &EvaluatorConfig,
    futures: Vec<impl std::future::Future<Output = CandidateResult>>,
) -> Result<CellOutcome> {
    let (successes, first_error) = join_candidates(args, futures).await;
    if successes.is_empty() {
        return Err(first_error.unwrap_or_else(|| {
            Error::Validation(format!("cell {}: all candidates failed", args.cell.name))
        }));
    }

    let outputs: Vec<Value> = successes.iter().map(|(_, o, _)| o.output.clone()).collect();
    let (scores, evaluator_usage) = score_candidates(args, evaluator, &outputs).await?;

    // Winner: highest score; ties break on lowest cost, then lowest index.
    let mut winner_pos = 0;
    for pos in 1..successes.len() {
        let score = scores.get(pos).copied().unwrap_or(0.0);
        let best = scores.get(winner_pos).copied().unwrap_or(0.0);
        if score > best
            || (score == best
                && successes[pos].1.usage.cost < successes[winner_pos].1.usage.cost)
        {
            winner_pos = pos;
        }
    }

    let mut total_usage = Usage::default();
    for (_, outcome, _) in &successes {
        total_usage.add(&outcome.usage);
    }
    total_usage.add(&evaluator_usage);

    let (winner_index, mut outcome, buffer) = {
        let (index, outcome, buffer) = &successes[winner_pos];
        (*index, outcome.clone(), buffer.clone())
    };
    // The cell's cost is every variant plus the evaluator.
    outcome.usage = total_usage;
    commit_buffer(args, buffer);

    EngineEvent::CandidateSelected {
        cell_name: args.cell.name.clone(),
        mode: "evaluate".into(),
        factor,
        winner_index: Some(winner_index),
    }
    .emit();

    Ok(outcome)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Join all candidates; sibling errors never fail the cell while another
/// sibling succeeds, but they are recorded on the echo.
async fn join_candidates(
    args: &CellRunArgs<'_>,
    futures: Vec<impl std::future::Future<Output = CandidateResult>>,
) -> (Vec<(usize, CellOutcome, StateBuffer)>, Option<Error>) {
    let mut results = futures_util::future::join_all(futures).await;
    results.sort_by_key(|(index, _, _)| *index);

    let mut successes = Vec::new();
    let mut first_error = None;
    for (index, outcome, buffer) in results {
        match outcome {
            Ok(outcome) => successes.push((index, outcome, buffer)),
            Err(e) => {
                args.echo.add_error(
                    &args.cell.name,
                    e.kind(),
                    format!("candidate {index}: {e}"),
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    (successes, first_error)
}

fn commit_buffer(args: &CellRunArgs<'_>, buffer: StateBuffer) {
    let mut parent = args.state_buffer.lock();
    for (key, value) in buffer.lock().iter() {
        parent.insert(key.clone(), value.clone());
    }
}

fn resolve_factor(factor: &Factor, args: &CellRunArgs<'_>) -> Result<u32> {
    match factor {
        Factor::Count(n) => Ok(*n),
        Factor::Expr(expr) => {
            let scope = Scope::new()
                .with("input", args.input.clone())
                .with("state", cell::state_view(args.echo, &args.state_buffer))
                .with("outputs", args.echo.outputs_scope());
            let value = render_value(expr, &scope);
            let resolved = match &value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            };
            resolved.map(|n| n as u32).ok_or_else(|| {
                Error::Validation(format!(
                    "cell {}: candidate factor expression {expr} did not resolve to an integer",
                    args.cell.name
                ))
            })
        }
    }
}

/// One evaluator call over all candidate outputs; returns per-candidate
/// scores clamped to [0, 1].
async fn score_candidates(
    args: &CellRunArgs<'_>,
    evaluator: &EvaluatorConfig,
    outputs: &[Value],
) -> Result<(Vec<f64>, Usage)> {
    let engine = args.engine;
    let model_spec = evaluator
        .model
        .as_deref()
        .or(args.cell.model.as_deref())
        .or(args.cascade.model.as_deref())
        .or(engine.config.default_model.as_deref());
    let (provider, model) = engine.providers.resolve(model_spec)?;
    let pricing = engine.config.pricing_for(&model).copied();

    let scope = Scope::new()
        .with("candidates", Value::Array(outputs.to_vec()))
        .with("input", args.input.clone())
        .with("state", cell::state_view(args.echo, &args.state_buffer));
    let prompt = render_str(&evaluator.instructions, &scope);

    let req = ChatRequest {
        messages: vec![Message::user(&prompt)],
        model: Some(model.clone()),
        ..Default::default()
    };
    let response = tokio::select! {
        result = with_retry(
            engine.config.provider_attempts,
            Duration::from_millis(engine.config.provider_backoff_ms),
            || provider.chat(req.clone()),
        ) => result?,
        _ = args.cancel.cancelled() => {
            return Err(Error::Timeout(format!(
                "cell {}: evaluator cancelled",
                args.cell.name
            )));
        }
    };

    let mut usage = response.usage.unwrap_or(Usage {
        tokens_in: estimate_tokens(&prompt),
        tokens_out: estimate_tokens(&response.content),
        cost: 0.0,
    });
    if usage.cost == 0.0 {
        if let Some(pricing) = &pricing {
            usage.cost = pricing.estimate_cost(usage.tokens_in, usage.tokens_out);
        }
    }

    let scores = parse_scores(&response.content, outputs.len()).ok_or_else(|| {
        Error::Validation(format!(
            "cell {}: evaluator did not return {} scores",
            args.cell.name,
            outputs.len()
        ))
    })?;
    Ok((scores, usage))
}

fn parse_scores(content: &str, expected: usize) -> Option<Vec<f64>> {
    let value: Value = serde_json::from_str(content.trim()).ok()?;
    let raw = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map.get("scores")?.as_array()?.clone(),
        _ => return None,
    };
    if raw.len() < expected {
        return None;
    }
    let scores: Vec<f64> = raw
        .iter()
        .take(expected)
        .filter_map(Value::as_f64)
        .map(|s| s.clamp(0.0, 1.0))
        .collect();
    (scores.len() == expected).then_some(scores)
}
