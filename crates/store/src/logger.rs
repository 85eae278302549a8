//! Asynchronous logger with bounded backpressure.
//!
//! `log()` injects identity fields from the caller's execution context and
//! enqueues the row; a dedicated drain task writes to the store. The
//! cascade never blocks beyond the enqueue step. Past the high-water mark
//! the queue sheds its lowest-severity rows (`mcp_progress` first, then
//! `turn`) — `error` and `cascade_completed` rows are never shed.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use casc_domain::event::EngineEvent;
use casc_domain::logrow::LogRow;

use crate::store::LogStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ExecutionContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identity of the currently executing cell, established by the scheduler
/// before any work inside the cell runs. The logger copies these onto any
/// row field the emitter left empty.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub session_id: String,
    pub parent_session_id: Option<String>,
    pub caller_id: Option<String>,
    pub cascade_id: String,
    pub cell_name: String,
    pub cell_index: u32,
    pub genus_hash: String,
    pub species_hash: String,
}

impl ExecutionContext {
    /// Narrow this context to a specific cell.
    pub fn for_cell(&self, cell_name: &str, cell_index: u32, species_hash: &str) -> Self {
        let mut ctx = self.clone();
        ctx.cell_name = cell_name.to_string();
        ctx.cell_index = cell_index;
        ctx.species_hash = species_hash.to_string();
        ctx
    }

    fn inject(&self, row: &mut LogRow) {
        if row.session_id.is_empty() {
            row.session_id = self.session_id.clone();
        }
        if row.parent_session_id.is_none() {
            row.parent_session_id = self.parent_session_id.clone();
        }
        if row.caller_id.is_none() {
            row.caller_id = self.caller_id.clone();
        }
        if row.cascade_id.is_empty() {
            row.cascade_id = self.cascade_id.clone();
        }
        if row.cell_name.is_empty() {
            row.cell_name = self.cell_name.clone();
            row.cell_index = self.cell_index;
        }
        if row.genus_hash.is_empty() {
            row.genus_hash = self.genus_hash.clone();
        }
        if row.species_hash.is_empty() {
            row.species_hash = self.species_hash.clone();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Queue {
    rows: VecDeque<LogRow>,
    dropped: usize,
}

pub struct Logger {
    store: Arc<dyn LogStore>,
    queue: Mutex<Queue>,
    notify: Notify,
    high_water: usize,
}

impl Logger {
    /// Create the logger and spawn its drain task on the current runtime.
    pub fn spawn(store: Arc<dyn LogStore>, high_water: usize) -> Arc<Self> {
        let logger = Arc::new(Self {
            store,
            queue: Mutex::new(Queue {
                rows: VecDeque::new(),
                dropped: 0,
            }),
            notify: Notify::new(),
            high_water: high_water.max(1),
        });
        let drain = logger.clone();
        tokio::spawn(async move {
            drain.drain_loop().await;
        });
        logger
    }

    /// Enqueue one row, injecting identity fields from `ctx`.
    pub fn log(&self, ctx: &ExecutionContext, mut row: LogRow) {
        ctx.inject(&mut row);
        {
            let mut queue = self.queue.lock();
            if queue.rows.len() >= self.high_water {
                if !shed_one(&mut queue.rows, row.node_type.severity()) {
                    // Incoming row is itself the lowest severity present.
                    queue.dropped += 1;
                    EngineEvent::LogRowsDropped {
                        dropped: queue.dropped,
                    }
                    .emit();
                    return;
                }
                queue.dropped += 1;
            }
            queue.rows.push_back(row);
        }
        self.notify.notify_one();
    }

    /// Rows shed so far under backpressure.
    pub fn dropped(&self) -> usize {
        self.queue.lock().dropped
    }

    /// Wait until every enqueued row has reached the store. Used at
    /// cascade completion so the analytics worker reads a complete log.
    pub async fn flush(&self) {
        loop {
            if self.queue.lock().rows.is_empty() {
                return;
            }
            self.notify.notify_one();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            let batch: Vec<LogRow> = {
                let mut queue = self.queue.lock();
                queue.rows.drain(..).collect()
            };
            if batch.is_empty() {
                self.notify.notified().await;
                continue;
            }
            for row in batch {
                // At-least-once: one retry, then the row is reported lost.
                if let Err(first) = self.store.append_row(&row) {
                    if let Err(second) = self.store.append_row(&row) {
                        tracing::warn!(
                            trace_id = %row.trace_id,
                            first = %first,
                            second = %second,
                            "log row lost after retry"
                        );
                    }
                }
            }
        }
    }
}

/// Remove one queued row with severity strictly below `incoming`.
/// Returns false when nothing lower-severity is queued.
fn shed_one(rows: &mut VecDeque<LogRow>, incoming: u8) -> bool {
    let mut lowest: Option<(usize, u8)> = None;
    for (i, row) in rows.iter().enumerate() {
        let severity = row.node_type.severity();
        if severity < incoming && lowest.map(|(_, s)| severity < s).unwrap_or(true) {
            lowest = Some((i, severity));
            if severity == 0 {
                break;
            }
        }
    }
    match lowest {
        Some((i, _)) => {
            rows.remove(i);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLogStore;
    use casc_domain::logrow::NodeType;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            session_id: "s1".into(),
            parent_session_id: None,
            caller_id: Some("test".into()),
            cascade_id: "casc".into(),
            cell_name: "cell".into(),
            cell_index: 2,
            genus_hash: "g".into(),
            species_hash: "sp".into(),
        }
    }

    #[tokio::test]
    async fn injects_identity_and_delivers() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = Logger::spawn(store.clone(), 100);

        logger.log(&ctx(), LogRow::new(NodeType::Turn).with_content("hello"));
        logger.flush().await;

        let rows = store.rows_for_session("s1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cascade_id, "casc");
        assert_eq!(rows[0].cell_name, "cell");
        assert_eq!(rows[0].cell_index, 2);
        assert_eq!(rows[0].genus_hash, "g");
        assert_eq!(rows[0].species_hash, "sp");
        assert_eq!(rows[0].caller_id.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn emitter_fields_win_over_context() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = Logger::spawn(store.clone(), 100);

        let mut row = LogRow::new(NodeType::Error);
        row.cell_name = "explicit".into();
        row.cell_index = 9;
        logger.log(&ctx(), row);
        logger.flush().await;

        let rows = store.all_rows();
        assert_eq!(rows[0].cell_name, "explicit");
        assert_eq!(rows[0].cell_index, 9);
    }

    #[test]
    fn shed_prefers_mcp_progress_then_turn() {
        let mut rows: VecDeque<LogRow> = VecDeque::new();
        rows.push_back(LogRow::new(NodeType::Turn));
        rows.push_back(LogRow::new(NodeType::McpProgress));
        rows.push_back(LogRow::new(NodeType::PhaseEnd));

        assert!(shed_one(&mut rows, NodeType::Error.severity()));
        assert!(rows.iter().all(|r| r.node_type != NodeType::McpProgress));

        assert!(shed_one(&mut rows, NodeType::Error.severity()));
        assert!(rows.iter().all(|r| r.node_type != NodeType::Turn));

        // Nothing below error severity except phase_end — still sheddable.
        assert!(shed_one(&mut rows, NodeType::Error.severity()));
        assert!(rows.is_empty());

        // An mcp_progress row arriving at a queue of errors is dropped.
        rows.push_back(LogRow::new(NodeType::Error));
        assert!(!shed_one(&mut rows, NodeType::McpProgress.severity()));
    }

    #[tokio::test]
    async fn high_water_never_sheds_critical_rows() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = Logger::spawn(store.clone(), 4);

        // Saturate the queue synchronously so the drain task cannot keep up
        // deterministically; critical rows must survive regardless.
        {
            let mut queue = logger.queue.lock();
            for _ in 0..4 {
                queue.rows.push_back(LogRow::new(NodeType::McpProgress));
            }
        }
        logger.log(&ctx(), LogRow::new(NodeType::Error).with_content("boom"));
        logger.flush().await;

        let rows = store.rows_for_session("s1").unwrap();
        assert!(rows.iter().any(|r| r.node_type == NodeType::Error));
        assert_eq!(logger.dropped(), 1);
    }
}
