//! Context assembly for LLM cells.
//!
//! Walks the cell's declared context sources in order, pulls each source
//! cell's record (output / tool calls / reasoning) from the echo lineage,
//! chooses an encoding, and wraps everything into role-tagged messages.
//! Every injected message is measured — bytes as JSON, bytes as TOON,
//! estimated tokens and estimated input-side cost — because this is where
//! the hidden token spend lives and the analytics worker must attribute
//! it.

use serde_json::Value;

use casc_domain::cascade::{Cell, ContextAspect, ContextFormat};
use casc_domain::config::Pricing;
use casc_domain::event::EngineEvent;
use casc_domain::hash;
use casc_domain::message::{estimate_tokens, Message, MessageContent, Role};
use casc_echo::Echo;
use casc_template::toon;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accounting for one injected context message.
#[derive(Debug, Clone)]
pub struct ContextRecord {
    pub source_cell: String,
    pub role: Role,
    pub content: String,
    pub content_hash: String,
    /// `json`, `toon`, or empty for pass-through text.
    pub data_format: String,
    pub data_size_json: u64,
    pub data_size_toon: u64,
    pub data_token_savings_pct: f64,
    pub estimated_tokens: u64,
    pub estimated_cost: f64,
    /// Distance in cells between the source and the receiving cell.
    pub depth: u32,
}

/// Assembled prompt context plus its accounting.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub messages: Vec<Message>,
    pub records: Vec<ContextRecord>,
}

impl AssembledContext {
    pub fn estimated_cost(&self) -> f64 {
        self.records.iter().map(|r| r.estimated_cost).sum()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the context message list for `cell`.
///
/// Sources whose cell never completed are skipped with a warning rather
/// than failing the receiving cell. `pricing` is the downstream model's
/// price table; without it cost estimates stay zero.
pub fn assemble(
    cell: &Cell,
    cell_index: u32,
    source_index: impl Fn(&str) -> Option<u32>,
    echo: &Echo,
    pricing: Option<&Pricing>,
) -> AssembledContext {
    let mut assembled = AssembledContext::default();

    for source in &cell.context {
        let record = match echo.lineage_record(&source.name) {
            Some(record) => record,
            None => {
                tracing::warn!(
                    cell = %cell.name,
                    source = %source.name,
                    "context source has no completed record, skipping"
                );
                continue;
            }
        };
        let depth = source_index(&source.name)
            .map(|i| cell_index.saturating_sub(i))
            .unwrap_or(0);

        for aspect in &source.include {
            let payload = match aspect {
                ContextAspect::Output => {
                    Some(encode_output(&record.output, source.format))
                }
                ContextAspect::ToolCalls => {
                    if record.tool_calls.is_empty() {
                        None
                    } else {
                        let text = serde_json::to_string_pretty(&record.tool_calls)
                            .unwrap_or_default();
                        let size = text.len() as u64;
                        Some(Encoded {
                            text,
                            data_format: "json".into(),
                            json_size: size,
                            toon_size: 0,
                        })
                    }
                }
                ContextAspect::Reasoning => record.reasoning.as_ref().map(|text| Encoded {
                    text: text.clone(),
                    data_format: String::new(),
                    json_size: 0,
                    toon_size: 0,
                }),
            };
            let Some(encoded) = payload else { continue };

            let label = match aspect {
                ContextAspect::Output => "Output",
                ContextAspect::ToolCalls => "Tool calls",
                ContextAspect::Reasoning => "Reasoning",
            };
            let content = format!("[{label} from {}]:\n{}", source.name, encoded.text);
            let estimated_tokens = estimate_tokens(&content);
            let estimated_cost = pricing.map(|p| p.input_cost(estimated_tokens)).unwrap_or(0.0);
            let savings = if encoded.json_size > 0 && encoded.toon_size > 0 {
                (1.0 - encoded.toon_size as f64 / encoded.json_size as f64) * 100.0
            } else {
                0.0
            };

            assembled.records.push(ContextRecord {
                source_cell: source.name.clone(),
                role: source.as_role,
                content: content.clone(),
                content_hash: hash::content_hash(&content),
                data_format: encoded.data_format,
                data_size_json: encoded.json_size,
                data_size_toon: encoded.toon_size,
                data_token_savings_pct: savings,
                estimated_tokens,
                estimated_cost,
                depth,
            });
            assembled.messages.push(Message {
                role: source.as_role,
                content: MessageContent::Text(content),
            });
        }
    }

    EngineEvent::ContextAssembled {
        cell_name: cell.name.clone(),
        sources: cell.context.len(),
        injected_chars: assembled.messages.iter().map(|m| m.content.extract_all_text().len()).sum(),
        estimated_tokens: assembled.records.iter().map(|r| r.estimated_tokens).sum(),
    }
    .emit();

    assembled
}

struct Encoded {
    text: String,
    data_format: String,
    json_size: u64,
    toon_size: u64,
}

/// Encode a source cell's output per the declared format.
fn encode_output(output: &Value, format: ContextFormat) -> Encoded {
    // Pre-encoded pass-through: `{format: "toon", rows: "…"}`.
    if let Some(pre) = preencoded(output) {
        return pre;
    }

    let json_text = serde_json::to_string(output).unwrap_or_default();
    let json_size = json_text.len() as u64;

    match format {
        ContextFormat::Repr => Encoded {
            text: match output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            data_format: String::new(),
            json_size,
            toon_size: 0,
        },
        ContextFormat::Json => Encoded {
            text: json_text,
            data_format: "json".into(),
            json_size,
            toon_size: 0,
        },
        ContextFormat::Toon => match toon::encode_forced(output) {
            Some(text) => toon_encoded(text, json_size),
            None => json_fallback(json_text, json_size),
        },
        ContextFormat::Auto => match toon::encode(output) {
            Some(text) => toon_encoded(text, json_size),
            None => json_fallback(json_text, json_size),
        },
    }
}

fn preencoded(output: &Value) -> Option<Encoded> {
    let obj = output.as_object()?;
    if obj.get("format")?.as_str()? != "toon" {
        return None;
    }
    let rows = obj.get("rows")?.as_str()?;
    Some(Encoded {
        text: rows.to_string(),
        data_format: "toon".into(),
        json_size: 0,
        toon_size: rows.len() as u64,
    })
}

fn toon_encoded(text: String, json_size: u64) -> Encoded {
    let toon_size = text.len() as u64;
    Encoded {
        text,
        data_format: "toon".into(),
        json_size,
        toon_size,
    }
}

fn json_fallback(text: String, json_size: u64) -> Encoded {
    Encoded {
        text,
        data_format: "json".into(),
        json_size,
        toon_size: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casc_domain::cascade::ContextSource;
    use casc_echo::{LineageEntry, ToolCallRecord};
    use serde_json::json;

    fn echo_with_load(output: Value) -> Echo {
        let echo = Echo::new("s1", None, None);
        echo.add_lineage(LineageEntry {
            cell: "load".into(),
            output,
            trace_id: "t1".into(),
            tool_calls: vec![ToolCallRecord {
                tool_name: "sql_data".into(),
                arguments: json!({"query": "SELECT 1"}),
                result: json!({"rows": []}),
                is_error: false,
            }],
            reasoning: Some("picked the cheap plan".into()),
        });
        echo
    }

    fn cell_with_source(source: ContextSource) -> Cell {
        Cell {
            name: "summarize".into(),
            instructions: Some("go".into()),
            context: vec![source],
            ..Default::default()
        }
    }

    fn source(include: Vec<ContextAspect>, format: ContextFormat) -> ContextSource {
        ContextSource {
            name: "load".into(),
            include,
            as_role: Role::User,
            format,
        }
    }

    fn index_of(name: &str) -> Option<u32> {
        (name == "load").then_some(0)
    }

    #[test]
    fn tabular_output_uses_toon_under_auto() {
        let rows: Vec<Value> = (0..6).map(|i| json!({"n": i})).collect();
        let echo = echo_with_load(Value::Array(rows));
        let cell = cell_with_source(source(vec![ContextAspect::Output], ContextFormat::Auto));

        let assembled = assemble(&cell, 1, index_of, &echo, None);
        assert_eq!(assembled.messages.len(), 1);
        let record = &assembled.records[0];
        assert_eq!(record.data_format, "toon");
        assert!(record.content.contains("[Output from load]:"));
        assert!(record.content.contains("[6]{n}:"));
        assert!(record.data_token_savings_pct > 0.0);
        assert_eq!(record.depth, 1);
    }

    #[test]
    fn small_output_stays_json_under_auto() {
        let echo = echo_with_load(json!([{"n": 1}]));
        let cell = cell_with_source(source(vec![ContextAspect::Output], ContextFormat::Auto));
        let assembled = assemble(&cell, 1, index_of, &echo, None);
        assert_eq!(assembled.records[0].data_format, "json");
    }

    #[test]
    fn tool_calls_and_reasoning_aspects() {
        let echo = echo_with_load(json!("output"));
        let cell = cell_with_source(source(
            vec![
                ContextAspect::Output,
                ContextAspect::ToolCalls,
                ContextAspect::Reasoning,
            ],
            ContextFormat::Auto,
        ));
        let assembled = assemble(&cell, 1, index_of, &echo, None);
        assert_eq!(assembled.messages.len(), 3);
        assert!(assembled.records[1].content.contains("[Tool calls from load]:"));
        assert!(assembled.records[1].content.contains("sql_data"));
        assert!(assembled.records[2].content.contains("picked the cheap plan"));
    }

    #[test]
    fn preencoded_toon_passes_through() {
        let echo = echo_with_load(json!({"format": "toon", "rows": "[1]{n}:\n  1"}));
        let cell = cell_with_source(source(vec![ContextAspect::Output], ContextFormat::Auto));
        let assembled = assemble(&cell, 1, index_of, &echo, None);
        let record = &assembled.records[0];
        assert_eq!(record.data_format, "toon");
        assert!(record.content.ends_with("[1]{n}:\n  1"));
    }

    #[test]
    fn missing_source_is_skipped() {
        let echo = Echo::new("s1", None, None);
        let cell = cell_with_source(source(vec![ContextAspect::Output], ContextFormat::Auto));
        let assembled = assemble(&cell, 1, index_of, &echo, None);
        assert!(assembled.messages.is_empty());
    }

    #[test]
    fn cost_estimated_from_pricing() {
        let echo = echo_with_load(json!("x".repeat(4000)));
        let cell = cell_with_source(source(vec![ContextAspect::Output], ContextFormat::Json));
        let pricing = Pricing {
            input_per_mtok: 1_000_000.0, // 1 USD per token, keeps math visible
            output_per_mtok: 0.0,
        };
        let assembled = assemble(&cell, 1, index_of, &echo, Some(&pricing));
        let record = &assembled.records[0];
        assert!(record.estimated_tokens >= 1000);
        assert!((assembled.estimated_cost() - record.estimated_tokens as f64).abs() < 1e-9);
    }
}
