//! The per-session state container.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use casc_domain::logrow::NodeType;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One message in the append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub node_type: NodeType,
    pub timestamp: DateTime<Utc>,
}

/// One tool invocation recorded on a cell's lineage entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub result: Value,
    #[serde(default)]
    pub is_error: bool,
}

/// A completed cell's record: output plus the tool calls and reasoning
/// that produced it. Later cells pull these through their context config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEntry {
    pub cell: String,
    pub output: Value,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// A non-fatal error record. Never blocks other cells on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub cell: String,
    pub error_type: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct EchoState {
    state: Map<String, Value>,
    history: Vec<HistoryEntry>,
    lineage: Vec<LineageEntry>,
    errors: Vec<ErrorEntry>,
    genus_hash: String,
    current_cascade_id: String,
    current_cell_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branch_point_checkpoint_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Echo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-session container. All mutation goes through the internal lock;
/// reads hand out snapshot copies.
pub struct Echo {
    pub session_id: String,
    pub caller_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    inner: RwLock<EchoState>,
}

impl Echo {
    pub fn new(
        session_id: impl Into<String>,
        caller_id: Option<String>,
        parent_session_id: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            caller_id,
            parent_session_id,
            created_at: Utc::now(),
            inner: RwLock::new(EchoState::default()),
        }
    }

    // ── State map ─────────────────────────────────────────────────

    /// Overwrite a state key. No merge semantics.
    pub fn update_state(&self, key: impl Into<String>, value: Value) {
        self.inner.write().state.insert(key.into(), value);
    }

    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.inner.read().state.get(key).cloned()
    }

    /// Copy-on-write snapshot of the whole state map, used by candidate
    /// variants. Mutations to the snapshot are invisible to this echo.
    pub fn state_snapshot(&self) -> Map<String, Value> {
        self.inner.read().state.clone()
    }

    /// Commit a buffered state map (e.g. a winning candidate's writes).
    pub fn merge_state(&self, buffered: Map<String, Value>) {
        let mut inner = self.inner.write();
        for (key, value) in buffered {
            inner.state.insert(key, value);
        }
    }

    // ── Append-only collections ───────────────────────────────────

    /// Append a history entry, stamping trace metadata.
    pub fn add_history(
        &self,
        role: impl Into<String>,
        content: impl Into<String>,
        trace_id: impl Into<String>,
        parent_id: Option<String>,
        node_type: NodeType,
    ) {
        self.inner.write().history.push(HistoryEntry {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
            trace_id: trace_id.into(),
            parent_id,
            node_type,
            timestamp: Utc::now(),
        });
    }

    pub fn add_lineage(&self, entry: LineageEntry) {
        self.inner.write().lineage.push(entry);
    }

    pub fn add_error(&self, cell: impl Into<String>, error_type: impl Into<String>, message: impl Into<String>) {
        self.inner.write().errors.push(ErrorEntry {
            cell: cell.into(),
            error_type: error_type.into(),
            message: message.into(),
            at: Utc::now(),
        });
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn history_snapshot(&self) -> Vec<HistoryEntry> {
        self.inner.read().history.clone()
    }

    pub fn lineage_snapshot(&self) -> Vec<LineageEntry> {
        self.inner.read().lineage.clone()
    }

    pub fn errors_snapshot(&self) -> Vec<ErrorEntry> {
        self.inner.read().errors.clone()
    }

    /// The most recent lineage record for a cell, if it has completed.
    pub fn lineage_record(&self, cell: &str) -> Option<LineageEntry> {
        self.inner
            .read()
            .lineage
            .iter()
            .rev()
            .find(|e| e.cell == cell)
            .cloned()
    }

    /// Map of cell name → output for the template `outputs` scope root.
    pub fn outputs_scope(&self) -> Value {
        let inner = self.inner.read();
        let mut map = Map::new();
        for entry in &inner.lineage {
            map.insert(entry.cell.clone(), entry.output.clone());
        }
        Value::Object(map)
    }

    pub fn state_scope(&self) -> Value {
        Value::Object(self.inner.read().state.clone())
    }

    // ── Execution pointers / identity ─────────────────────────────

    pub fn set_genus_hash(&self, genus_hash: impl Into<String>) {
        self.inner.write().genus_hash = genus_hash.into();
    }

    pub fn genus_hash(&self) -> String {
        self.inner.read().genus_hash.clone()
    }

    pub fn set_current(&self, cascade_id: impl Into<String>, cell_name: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.current_cascade_id = cascade_id.into();
        inner.current_cell_name = cell_name.into();
    }

    pub fn current_cascade_id(&self) -> String {
        self.inner.read().current_cascade_id.clone()
    }

    pub fn set_branch_point(&self, checkpoint_id: impl Into<String>) {
        self.inner.write().branch_point_checkpoint_id = Some(checkpoint_id.into());
    }

    pub fn branch_point(&self) -> Option<String> {
        self.inner.read().branch_point_checkpoint_id.clone()
    }

    // ── Sub-cascade merge ─────────────────────────────────────────

    /// Absorb a completed child echo: child state overwrites parent keys,
    /// lineage and errors concatenate, and a synthetic lineage entry
    /// carries the child's final state under the sub-cascade's name.
    pub fn merge(&self, child: &Echo, sub_cascade_name: &str) {
        let child_inner = child.inner.read().clone();
        let mut inner = self.inner.write();
        for (key, value) in child_inner.state.clone() {
            inner.state.insert(key, value);
        }
        inner.lineage.extend(child_inner.lineage);
        inner.errors.extend(child_inner.errors);
        inner.lineage.push(LineageEntry {
            cell: sub_cascade_name.to_string(),
            output: Value::Object(child_inner.state),
            trace_id: uuid::Uuid::new_v4().to_string(),
            tool_calls: Vec::new(),
            reasoning: None,
        });
    }

    // ── Persistence ───────────────────────────────────────────────

    pub fn snapshot(&self) -> EchoSnapshot {
        let inner = self.inner.read();
        EchoSnapshot {
            session_id: self.session_id.clone(),
            caller_id: self.caller_id.clone(),
            parent_session_id: self.parent_session_id.clone(),
            created_at: self.created_at,
            state: inner.state.clone(),
            history: inner.history.clone(),
            lineage: inner.lineage.clone(),
            errors: inner.errors.clone(),
            genus_hash: inner.genus_hash.clone(),
            branch_point_checkpoint_id: inner.branch_point_checkpoint_id.clone(),
        }
    }

    pub fn from_snapshot(snapshot: EchoSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            caller_id: snapshot.caller_id,
            parent_session_id: snapshot.parent_session_id,
            created_at: snapshot.created_at,
            inner: RwLock::new(EchoState {
                state: snapshot.state,
                history: snapshot.history,
                lineage: snapshot.lineage,
                errors: snapshot.errors,
                genus_hash: snapshot.genus_hash,
                current_cascade_id: String::new(),
                current_cell_name: String::new(),
                branch_point_checkpoint_id: snapshot.branch_point_checkpoint_id,
            }),
        }
    }
}

/// Serializable image of an echo, written to the state dir on flush and
/// used by the branch manager to reconstruct sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoSnapshot {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: Map<String, Value>,
    pub history: Vec<HistoryEntry>,
    pub lineage: Vec<LineageEntry>,
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub genus_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_point_checkpoint_id: Option<String>,
}
