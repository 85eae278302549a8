//! Log store backends.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use casc_domain::analytics::{CascadeAnalyticsRow, CellAnalyticsRow, CellContextBreakdownRow};
use casc_domain::error::{Error, Result};
use casc_domain::logrow::{LogRow, NodeType};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Columnar append-only store with the four engine tables.
pub trait LogStore: Send + Sync {
    fn append_row(&self, row: &LogRow) -> Result<()>;

    /// All rows for a session ordered by timestamp, deduplicated on
    /// `(trace_id, node_type)` — the at-least-once contract tolerates one
    /// duplicate per row.
    fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>>;

    fn append_cascade_analytics(&self, row: &CascadeAnalyticsRow) -> Result<()>;
    fn append_cell_analytics(&self, row: &CellAnalyticsRow) -> Result<()>;
    fn append_context_breakdown(&self, row: &CellContextBreakdownRow) -> Result<()>;

    /// Prior session aggregates for the same cascade id (global baseline).
    fn cascade_analytics_for(&self, cascade_id: &str) -> Result<Vec<CascadeAnalyticsRow>>;
    /// Prior session aggregates for the same genus hash.
    fn cascade_analytics_for_genus(&self, genus_hash: &str) -> Result<Vec<CascadeAnalyticsRow>>;
    /// Prior cell aggregates for the same species hash.
    fn cell_analytics_for_species(&self, species_hash: &str) -> Result<Vec<CellAnalyticsRow>>;
}

fn dedup_rows(mut rows: Vec<LogRow>) -> Vec<LogRow> {
    rows.sort_by_key(|r| r.timestamp);
    let mut seen: HashSet<(String, NodeType)> = HashSet::new();
    rows.retain(|r| seen.insert((r.trace_id.clone(), r.node_type)));
    rows
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory store for tests and ephemeral embedders.
#[derive(Default)]
pub struct MemoryLogStore {
    rows: RwLock<Vec<LogRow>>,
    cascade_analytics: RwLock<Vec<CascadeAnalyticsRow>>,
    cell_analytics: RwLock<Vec<CellAnalyticsRow>>,
    context_breakdown: RwLock<Vec<CellContextBreakdownRow>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored row, in append order (tests).
    pub fn all_rows(&self) -> Vec<LogRow> {
        self.rows.read().clone()
    }

    pub fn context_breakdown_for(&self, session_id: &str) -> Vec<CellContextBreakdownRow> {
        self.context_breakdown
            .read()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn cell_analytics_for_session(&self, session_id: &str) -> Vec<CellAnalyticsRow> {
        self.cell_analytics
            .read()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn cascade_analytics_for_session(&self, session_id: &str) -> Option<CascadeAnalyticsRow> {
        self.cascade_analytics
            .read()
            .iter()
            .find(|r| r.session_id == session_id)
            .cloned()
    }
}

impl LogStore for MemoryLogStore {
    fn append_row(&self, row: &LogRow) -> Result<()> {
        self.rows.write().push(row.clone());
        Ok(())
    }

    fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>> {
        let rows = self
            .rows
            .read()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        Ok(dedup_rows(rows))
    }

    fn append_cascade_analytics(&self, row: &CascadeAnalyticsRow) -> Result<()> {
        self.cascade_analytics.write().push(row.clone());
        Ok(())
    }

    fn append_cell_analytics(&self, row: &CellAnalyticsRow) -> Result<()> {
        self.cell_analytics.write().push(row.clone());
        Ok(())
    }

    fn append_context_breakdown(&self, row: &CellContextBreakdownRow) -> Result<()> {
        self.context_breakdown.write().push(row.clone());
        Ok(())
    }

    fn cascade_analytics_for(&self, cascade_id: &str) -> Result<Vec<CascadeAnalyticsRow>> {
        Ok(self
            .cascade_analytics
            .read()
            .iter()
            .filter(|r| r.cascade_id == cascade_id)
            .cloned()
            .collect())
    }

    fn cascade_analytics_for_genus(&self, genus_hash: &str) -> Result<Vec<CascadeAnalyticsRow>> {
        Ok(self
            .cascade_analytics
            .read()
            .iter()
            .filter(|r| r.genus_hash == genus_hash)
            .cloned()
            .collect())
    }

    fn cell_analytics_for_species(&self, species_hash: &str) -> Result<Vec<CellAnalyticsRow>> {
        Ok(self
            .cell_analytics
            .read()
            .iter()
            .filter(|r| r.species_hash == species_hash)
            .cloned()
            .collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSONL backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reference file backend: one `rows/<session>.jsonl` per session plus one
/// JSONL file per analytics table. Malformed lines are skipped on read.
pub struct JsonlLogStore {
    rows_dir: PathBuf,
    cascade_analytics_path: PathBuf,
    cell_analytics_path: PathBuf,
    context_breakdown_path: PathBuf,
    // Serializes appends across threads; the OS append mode alone does not
    // guarantee line atomicity.
    write_lock: parking_lot::Mutex<()>,
}

impl JsonlLogStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let rows_dir = base_dir.join("rows");
        std::fs::create_dir_all(&rows_dir).map_err(Error::Io)?;
        Ok(Self {
            rows_dir,
            cascade_analytics_path: base_dir.join("cascade_analytics.jsonl"),
            cell_analytics_path: base_dir.join("cell_analytics.jsonl"),
            context_breakdown_path: base_dir.join("cell_context_breakdown.jsonl"),
            write_lock: parking_lot::Mutex::new(()),
        })
    }

    fn append_line(&self, path: &Path, json: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::Io)?;
        file.write_all(json.as_bytes()).map_err(Error::Io)?;
        file.write_all(b"\n").map_err(Error::Io)?;
        Ok(())
    }

    fn read_lines<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        let mut out = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(value) => out.push(value),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed store line");
                }
            }
        }
        Ok(out)
    }
}

impl LogStore for JsonlLogStore {
    fn append_row(&self, row: &LogRow) -> Result<()> {
        let path = self.rows_dir.join(format!("{}.jsonl", row.session_id));
        self.append_line(&path, &serde_json::to_string(row)?)
    }

    fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>> {
        let path = self.rows_dir.join(format!("{session_id}.jsonl"));
        Ok(dedup_rows(self.read_lines(&path)?))
    }

    fn append_cascade_analytics(&self, row: &CascadeAnalyticsRow) -> Result<()> {
        self.append_line(&self.cascade_analytics_path, &serde_json::to_string(row)?)
    }

    fn append_cell_analytics(&self, row: &CellAnalyticsRow) -> Result<()> {
        self.append_line(&self.cell_analytics_path, &serde_json::to_string(row)?)
    }

    fn append_context_breakdown(&self, row: &CellContextBreakdownRow) -> Result<()> {
        self.append_line(&self.context_breakdown_path, &serde_json::to_string(row)?)
    }

    fn cascade_analytics_for(&self, cascade_id: &str) -> Result<Vec<CascadeAnalyticsRow>> {
        let mut rows: Vec<CascadeAnalyticsRow> = self.read_lines(&self.cascade_analytics_path)?;
        rows.retain(|r| r.cascade_id == cascade_id);
        Ok(rows)
    }

    fn cascade_analytics_for_genus(&self, genus_hash: &str) -> Result<Vec<CascadeAnalyticsRow>> {
        let mut rows: Vec<CascadeAnalyticsRow> = self.read_lines(&self.cascade_analytics_path)?;
        rows.retain(|r| r.genus_hash == genus_hash);
        Ok(rows)
    }

    fn cell_analytics_for_species(&self, species_hash: &str) -> Result<Vec<CellAnalyticsRow>> {
        let mut rows: Vec<CellAnalyticsRow> = self.read_lines(&self.cell_analytics_path)?;
        rows.retain(|r| r.species_hash == species_hash);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(session: &str, node_type: NodeType) -> LogRow {
        let mut row = LogRow::new(node_type).with_content("x");
        row.session_id = session.to_string();
        row
    }

    #[test]
    fn memory_store_filters_by_session() {
        let store = MemoryLogStore::new();
        store.append_row(&row("a", NodeType::Turn)).unwrap();
        store.append_row(&row("b", NodeType::Turn)).unwrap();
        store.append_row(&row("a", NodeType::PhaseEnd)).unwrap();
        assert_eq!(store.rows_for_session("a").unwrap().len(), 2);
        assert_eq!(store.rows_for_session("b").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_trace_ids_deduplicate_on_read() {
        let store = MemoryLogStore::new();
        let once = row("a", NodeType::Turn);
        store.append_row(&once).unwrap();
        store.append_row(&once).unwrap();
        assert_eq!(store.rows_for_session("a").unwrap().len(), 1);

        // A tool_call / tool_result pair shares a trace id and must survive.
        let call = row("a", NodeType::ToolCall);
        let mut result = row("a", NodeType::ToolResult);
        result.trace_id = call.trace_id.clone();
        store.append_row(&call).unwrap();
        store.append_row(&result).unwrap();
        assert_eq!(store.rows_for_session("a").unwrap().len(), 3);
    }

    #[test]
    fn jsonl_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlLogStore::new(dir.path()).unwrap();
        store.append_row(&row("s1", NodeType::CascadeStart)).unwrap();
        store.append_row(&row("s1", NodeType::Turn)).unwrap();
        let rows = store.rows_for_session("s1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].node_type, NodeType::CascadeStart);
        assert!(store.rows_for_session("other").unwrap().is_empty());
    }

    #[test]
    fn jsonl_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlLogStore::new(dir.path()).unwrap();
        store.append_row(&row("s1", NodeType::Turn)).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("rows/s1.jsonl"))
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        store.append_row(&row("s1", NodeType::PhaseEnd)).unwrap();
        assert_eq!(store.rows_for_session("s1").unwrap().len(), 2);
    }
}
