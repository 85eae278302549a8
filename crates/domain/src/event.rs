use serde::Serialize;

/// Structured engine events emitted through `tracing` for live
/// observability. These complement — never replace — the append-only log
/// rows, which are the queryable record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    SessionResolved {
        session_id: String,
        is_new: bool,
    },
    CascadeStarted {
        session_id: String,
        cascade_id: String,
        genus_hash: String,
    },
    CascadeFinished {
        session_id: String,
        cascade_id: String,
        status: String,
        total_cost: f64,
        duration_ms: u64,
    },
    ContextAssembled {
        cell_name: String,
        sources: usize,
        injected_chars: usize,
        estimated_tokens: u64,
    },
    ProviderCall {
        cell_name: String,
        model: String,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
        duration_ms: u64,
    },
    WardFailed {
        cell_name: String,
        kind: String,
        action: String,
    },
    CandidateSelected {
        cell_name: String,
        mode: String,
        factor: u32,
        winner_index: Option<usize>,
    },
    SubCascadeLaunched {
        parent_session_id: String,
        child_session_id: String,
        cascade_id: String,
        depth: usize,
    },
    CheckpointPending {
        checkpoint_id: String,
        session_id: String,
        cell_name: String,
    },
    CheckpointResolved {
        checkpoint_id: String,
        cancelled: bool,
    },
    LogRowsDropped {
        dropped: usize,
    },
    AnalyticsWritten {
        session_id: String,
        duration_ms: u64,
    },
}

impl EngineEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(engine_event = %json, "casc_event");
    }
}
