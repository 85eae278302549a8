//! Branching: reconstruct a session at a checkpoint and re-run from there
//! with a different decision.
//!
//! The parent's history is truncated at the chosen checkpoint's timestamp,
//! the new response is injected as if the operator had answered that
//! checkpoint, and the scheduler resumes at the cell after it. The
//! original top-level input is recovered from the parent's
//! `cascade_start` log row.

use std::sync::Arc;

use serde_json::Value;

use casc_domain::cascade::Cascade;
use casc_domain::error::{Error, Result};
use casc_domain::logrow::NodeType;
use casc_echo::Echo;

use crate::scheduler::{CascadeResult, CascadeStatus, Engine, RunOptions};

pub struct BranchManager<'e> {
    engine: &'e Engine,
}

impl<'e> BranchManager<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    /// Launch a branch of `parent_session_id` from its `checkpoint_index`-th
    /// checkpoint (0-based), answering it with `new_response`.
    pub async fn create_branch(
        &self,
        cascade: &Cascade,
        parent_session_id: &str,
        checkpoint_index: usize,
        new_response: Value,
    ) -> Result<CascadeResult> {
        // 1. Parent snapshot: live session or persisted image.
        let mut snapshot = match self.engine.sessions.get(parent_session_id) {
            Some(echo) => echo.snapshot(),
            None => self.engine.sessions.load_snapshot(parent_session_id)?,
        };

        // 2. Locate the checkpoint in the parent's history.
        let checkpoints: Vec<_> = snapshot
            .history
            .iter()
            .filter(|h| h.node_type == NodeType::Checkpoint)
            .cloned()
            .collect();
        let entry = checkpoints.get(checkpoint_index).ok_or_else(|| {
            Error::Other(format!(
                "session {parent_session_id} has {} checkpoints, index {checkpoint_index} does not exist",
                checkpoints.len()
            ))
        })?;
        let record: Value = serde_json::from_str(&entry.content)?;
        let checkpoint_id = record
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let cell_name = record
            .get("cell_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let cut = entry.timestamp;

        // 3. Truncate at the checkpoint: history by timestamp, lineage to
        //    cells declared before the checkpointed cell.
        snapshot.history.retain(|h| h.timestamp <= cut);
        if let Some(checkpoint_cell) = cascade.cell_index(&cell_name) {
            snapshot
                .lineage
                .retain(|entry| match cascade.cell_index(&entry.cell) {
                    Some(index) => index < checkpoint_cell,
                    None => true,
                });
        }

        // 4. New echo linked to the parent.
        let branch_session = format!(
            "{parent_session_id}-branch-{}",
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        snapshot.session_id = branch_session.clone();
        snapshot.parent_session_id = Some(parent_session_id.to_string());
        snapshot.branch_point_checkpoint_id = Some(checkpoint_id);
        snapshot
            .state
            .insert(format!("_decision_{cell_name}"), new_response);

        let echo = Arc::new(Echo::from_snapshot(snapshot));
        self.engine.sessions.insert(echo.clone());

        // 5. Recover the original input and resume after the checkpoint.
        let input = self.original_input(parent_session_id).await?;
        let next_cell = cascade
            .cell_index(&cell_name)
            .and_then(|i| cascade.cells.get(i + 1))
            .map(|c| c.name.clone());

        match next_cell {
            Some(start_at) => Ok(self
                .engine
                .run_cascade(
                    cascade,
                    input,
                    RunOptions {
                        session_id: Some(branch_session),
                        caller_id: echo.caller_id.clone(),
                        parent_session_id: Some(parent_session_id.to_string()),
                        env: Value::Null,
                        start_at: Some(start_at),
                    },
                )
                .await),
            // The checkpoint sat on the last cell: nothing left to run.
            None => Ok(CascadeResult {
                status: CascadeStatus::Success,
                session_id: branch_session,
                lineage: echo.lineage_snapshot(),
                cells: Vec::new(),
                final_state: echo.state_scope(),
                cost: 0.0,
                duration_ms: 0,
                error: None,
            }),
        }
    }

    /// All transitive branches of a session.
    pub fn descendants(&self, session_id: &str) -> Vec<String> {
        self.engine.sessions.descendants(session_id)
    }

    async fn original_input(&self, session_id: &str) -> Result<Value> {
        self.engine.logger.flush().await;
        let rows = self.engine.store.rows_for_session(session_id)?;
        let start = rows
            .iter()
            .find(|r| r.node_type == NodeType::CascadeStart)
            .ok_or_else(|| {
                Error::Other(format!("session {session_id} has no cascade_start row"))
            })?;
        Ok(serde_json::from_str(&start.content)?)
    }
}
