//! Universal append-only log row.
//!
//! One row per message, tool call, phase event, or cost sample. Identity
//! fields the emitter leaves empty are auto-injected by the logger from the
//! current execution context; analytics queries deduplicate on `trace_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash;
use crate::message::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NodeType
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    CascadeStart,
    CascadeCompleted,
    PhaseStart,
    PhaseEnd,
    Turn,
    ToolCall,
    ToolResult,
    #[serde(alias = "agent")]
    Assistant,
    User,
    System,
    Error,
    Checkpoint,
    McpProgress,
}

impl NodeType {
    /// Drop priority under logger backpressure: lower severities are shed
    /// first when the queue exceeds its high-water mark.
    pub fn severity(&self) -> u8 {
        match self {
            NodeType::McpProgress => 0,
            NodeType::Turn => 1,
            NodeType::Error | NodeType::CascadeCompleted => 3,
            _ => 2,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LogRow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One columnar telemetry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRow {
    // ── Identity ──────────────────────────────────────────────────
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub cascade_id: String,
    #[serde(default)]
    pub cell_name: String,
    #[serde(default)]
    pub cell_index: u32,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub genus_hash: String,
    #[serde(default)]
    pub species_hash: String,
    #[serde(default)]
    pub content_hash: String,

    // ── Type ──────────────────────────────────────────────────────
    pub node_type: NodeType,

    // ── Payload ───────────────────────────────────────────────────
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_type: String,
    /// `json`, `toon`, or empty.
    #[serde(default)]
    pub data_format: String,
    #[serde(default)]
    pub data_size_json: u64,
    #[serde(default)]
    pub data_size_toon: u64,
    #[serde(default)]
    pub data_token_savings_pct: f64,
    /// For injected context rows: the cell whose record was injected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_source: Option<String>,

    // ── Cost ──────────────────────────────────────────────────────
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub model: String,

    // ── Timing ────────────────────────────────────────────────────
    pub timestamp: DateTime<Utc>,
}

impl LogRow {
    /// New row with a fresh trace id and the current timestamp; identity
    /// fields left empty for the logger to inject.
    pub fn new(node_type: NodeType) -> Self {
        Self {
            session_id: String::new(),
            parent_session_id: None,
            caller_id: None,
            cascade_id: String::new(),
            cell_name: String::new(),
            cell_index: 0,
            trace_id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            genus_hash: String::new(),
            species_hash: String::new(),
            content_hash: String::new(),
            node_type,
            role: String::new(),
            content: String::new(),
            content_type: String::new(),
            data_format: String::new(),
            data_size_json: 0,
            data_size_toon: 0,
            data_token_savings_pct: 0.0,
            context_source: None,
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            duration_ms: 0,
            model: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set content and stamp its normalized hash.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self.content_hash = hash::content_hash(&self.content);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_usage(mut self, usage: &Usage) -> Self {
        self.tokens_in = usage.tokens_in;
        self.tokens_out = usage.tokens_out;
        self.cost = usage.cost;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}
