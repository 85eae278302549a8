//! Declarative cascade model.
//!
//! A cascade is an immutable, validated pipeline of cells. Cells are either
//! LLM cells (instructions + optional schema/wards/candidates/context) or
//! deterministic cells (a tool target + templated inputs). The embedder
//! deserializes cascade files and calls [`Cascade::validate`] before handing
//! the value to the scheduler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::message::Role;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cascade
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An ordered, declarative pipeline of cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cascade {
    pub cascade_id: String,
    pub cells: Vec<Cell>,
    /// Optional JSON Schema the top-level input must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_schema: Option<Value>,
    /// Default model for cells that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub rules: CascadeRules,
}

/// Cascade-level execution bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeRules {
    /// Total phase executions allowed, including handoff re-entries.
    #[serde(default = "default_cascade_max_turns")]
    pub max_turns: u32,
    /// Template expression; a truthy result ends the cascade early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_until: Option<String>,
}

fn default_cascade_max_turns() -> u32 {
    50
}

impl Default for CascadeRules {
    fn default() -> Self {
        Self {
            max_turns: default_cascade_max_turns(),
            loop_until: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cell
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One execution unit: an LLM call or a deterministic tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cell {
    /// Unique per cascade.
    pub name: String,

    // ── LLM cell ──────────────────────────────────────────────────
    /// Templated instructions. Present iff this is an LLM cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// JSON Schema the assistant's structured output must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Tool catalog exposed to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traits: Option<Traits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<CandidatesConfig>,
    /// Which prior cells feed this cell's prompt, in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextSource>,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wards: Vec<WardConfig>,
    /// Routing targets this cell may hand off to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handoffs: Vec<String>,

    // ── Deterministic cell ────────────────────────────────────────
    /// Tool target: a registered name or `python:`/`sql:`/`shell:` prefixed.
    /// Present iff this is a deterministic cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Templated input map rendered against the evaluation scope.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub inputs: serde_json::Map<String, Value>,
}

impl Cell {
    pub fn is_deterministic(&self) -> bool {
        self.tool.is_some()
    }
}

/// Tool catalog selection for an LLM cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Traits {
    /// Exactly these registered tools.
    Explicit(Vec<String>),
    /// The string `"manifest"`: expose the registry's manifest selection.
    Mode(String),
}

impl Traits {
    pub fn is_manifest(&self) -> bool {
        matches!(self, Traits::Mode(s) if s == "manifest")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Candidates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parallel fan-out configuration for a cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatesConfig {
    /// Variant count: a literal or a template expression resolving to one.
    pub factor: Factor,
    #[serde(default)]
    pub mode: CandidateMode,
    /// Embedded evaluator, required for `mode: evaluate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<EvaluatorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Factor {
    Count(u32),
    /// Template expression over `{input, state, outputs}` resolving to an int.
    Expr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateMode {
    /// Score all candidates with the evaluator; winner = arg-max.
    Evaluate,
    /// Pass all candidate outputs onward as a list.
    Aggregate,
    /// First successful candidate wins; siblings are cancelled.
    #[default]
    First,
}

/// A nested single-shot LLM call that scores all candidate outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Templated instructions; rendered with `candidates` in scope.
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rules / wards
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-cell execution bounds and recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Template expression over `{outputs, state}`; the cell loops until
    /// it evaluates truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_until: Option<String>,
    /// Recovery sub-cell entered when a deterministic cell fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Box<Cell>>,
}

fn default_max_turns() -> u32 {
    10
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            loop_until: None,
            on_error: None,
        }
    }
}

/// A guardrail evaluated after each turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardConfig {
    pub kind: WardKind,
    /// Pattern string (regex), schema object (jsonschema), or template
    /// expression (predicate).
    pub spec: Value,
    #[serde(default)]
    pub on_fail: WardAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WardKind {
    Regex,
    Jsonschema,
    Predicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WardAction {
    #[default]
    Retry,
    Fail,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context sources
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Declares one prior cell whose record feeds this cell's prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSource {
    /// Name of a previously scheduled cell.
    pub name: String,
    #[serde(default = "default_include")]
    pub include: Vec<ContextAspect>,
    #[serde(default = "default_as_role")]
    pub as_role: Role,
    #[serde(default)]
    pub format: ContextFormat,
}

fn default_include() -> Vec<ContextAspect> {
    vec![ContextAspect::Output]
}

fn default_as_role() -> Role {
    Role::User
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextAspect {
    Output,
    ToolCalls,
    Reasoning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextFormat {
    /// TOON for tabular outputs, JSON otherwise.
    #[default]
    Auto,
    Json,
    Toon,
    /// Debug representation; for small scalar outputs.
    Repr,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Cascade {
    /// Validate the structural invariants before execution.
    ///
    /// Checked here: unique cell names; each cell is exactly one of LLM or
    /// deterministic; handoff targets name cells in this cascade; context
    /// sources reference cells declared earlier; `mode: evaluate` carries an
    /// evaluator; a `traits` string is exactly `"manifest"`.
    pub fn validate(&self) -> Result<()> {
        if self.cells.is_empty() {
            return Err(Error::Config(format!(
                "cascade {}: no cells",
                self.cascade_id
            )));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for cell in &self.cells {
            if !seen.insert(cell.name.as_str()) {
                return Err(Error::Config(format!(
                    "cascade {}: duplicate cell name {}",
                    self.cascade_id, cell.name
                )));
            }
        }

        let names: HashSet<&str> = self.cells.iter().map(|c| c.name.as_str()).collect();

        for (idx, cell) in self.cells.iter().enumerate() {
            match (&cell.instructions, &cell.tool) {
                (Some(_), Some(_)) => {
                    return Err(Error::Config(format!(
                        "cell {}: both instructions and tool set",
                        cell.name
                    )));
                }
                (None, None) => {
                    return Err(Error::Config(format!(
                        "cell {}: neither instructions nor tool set",
                        cell.name
                    )));
                }
                _ => {}
            }

            for target in &cell.handoffs {
                if !names.contains(target.as_str()) {
                    return Err(Error::Config(format!(
                        "cell {}: handoff target {} is not a cell in cascade {}",
                        cell.name, target, self.cascade_id
                    )));
                }
            }

            let prior: HashSet<&str> = self.cells[..idx].iter().map(|c| c.name.as_str()).collect();
            for source in &cell.context {
                if !prior.contains(source.name.as_str()) {
                    return Err(Error::Config(format!(
                        "cell {}: context source {} does not name a prior cell",
                        cell.name, source.name
                    )));
                }
                if source.include.is_empty() {
                    return Err(Error::Config(format!(
                        "cell {}: context source {} has an empty include set",
                        cell.name, source.name
                    )));
                }
            }

            if let Some(candidates) = &cell.candidates {
                if candidates.mode == CandidateMode::Evaluate && candidates.evaluator.is_none() {
                    return Err(Error::Config(format!(
                        "cell {}: candidates mode evaluate requires an evaluator",
                        cell.name
                    )));
                }
            }

            if let Some(traits) = &cell.traits {
                if let Traits::Mode(mode) = traits {
                    if mode != "manifest" {
                        return Err(Error::Config(format!(
                            "cell {}: unknown traits mode {mode}",
                            cell.name
                        )));
                    }
                }
            }
        }

        if self.rules.max_turns == 0 {
            return Err(Error::Config(format!(
                "cascade {}: rules.max_turns must be at least 1",
                self.cascade_id
            )));
        }

        Ok(())
    }

    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.name == name)
    }

    pub fn cell_index(&self, name: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.name == name)
    }
}
