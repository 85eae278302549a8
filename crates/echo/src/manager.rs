//! Process-wide session manager.
//!
//! A bounded cache of live echoes keyed by session id, with JSON snapshot
//! persistence under a state dir. There is no module-level state anywhere
//! in the engine — session lookup goes through an instance of this.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use casc_domain::error::{Error, Result};
use casc_domain::event::EngineEvent;

use crate::echo::{Echo, EchoSnapshot};

/// Default cap on live sessions held in memory.
const DEFAULT_CAPACITY: usize = 1024;

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Echo>>>,
    state_dir: Option<PathBuf>,
    capacity: usize,
}

impl SessionManager {
    /// In-memory only manager (tests, embedders that persist elsewhere).
    pub fn in_memory() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            state_dir: None,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Manager persisting snapshots under `state_dir/sessions/`.
    pub fn new(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("sessions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        tracing::info!(path = %dir.display(), "session manager ready");
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            state_dir: Some(dir),
            capacity: DEFAULT_CAPACITY,
        })
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Singleton per session within the process. Returns `(echo, is_new)`.
    pub fn get_or_create(
        &self,
        session_id: &str,
        caller_id: Option<String>,
        parent_session_id: Option<String>,
    ) -> (Arc<Echo>, bool) {
        // Fast path: session already live.
        {
            let sessions = self.sessions.read();
            if let Some(echo) = sessions.get(session_id) {
                return (echo.clone(), false);
            }
        }

        let echo = Arc::new(Echo::new(session_id, caller_id, parent_session_id));
        let mut sessions = self.sessions.write();
        // Lost the race: another caller inserted first.
        if let Some(existing) = sessions.get(session_id) {
            return (existing.clone(), false);
        }
        if sessions.len() >= self.capacity {
            evict_oldest(&mut sessions);
        }
        sessions.insert(session_id.to_string(), echo.clone());

        EngineEvent::SessionResolved {
            session_id: session_id.to_string(),
            is_new: true,
        }
        .emit();

        (echo, true)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Echo>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Register an already-built echo (branch reconstruction).
    pub fn insert(&self, echo: Arc<Echo>) {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.capacity {
            evict_oldest(&mut sessions);
        }
        sessions.insert(echo.session_id.clone(), echo);
    }

    /// Drop a live session from the cache. Persisted snapshots survive.
    pub fn release(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    /// All direct and transitive children of a session, by parent link.
    pub fn descendants(&self, session_id: &str) -> Vec<String> {
        let sessions = self.sessions.read();
        let mut found = Vec::new();
        let mut frontier = vec![session_id.to_string()];
        while let Some(current) = frontier.pop() {
            for echo in sessions.values() {
                if echo.parent_session_id.as_deref() == Some(current.as_str()) {
                    found.push(echo.session_id.clone());
                    frontier.push(echo.session_id.clone());
                }
            }
        }
        found.sort();
        found
    }

    // ── Persistence ───────────────────────────────────────────────

    fn snapshot_path(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self
            .state_dir
            .as_ref()
            .ok_or_else(|| Error::Config("session manager has no state dir".into()))?;
        Ok(dir.join(format!("{session_id}.json")))
    }

    /// Write a session's snapshot to disk.
    pub fn flush(&self, session_id: &str) -> Result<()> {
        let echo = self
            .get(session_id)
            .ok_or_else(|| Error::Other(format!("unknown session {session_id}")))?;
        let path = self.snapshot_path(session_id)?;
        let json = serde_json::to_string_pretty(&echo.snapshot())?;
        std::fs::write(&path, json).map_err(Error::Io)?;
        Ok(())
    }

    /// Load a persisted snapshot without inserting it into the cache.
    pub fn load_snapshot(&self, session_id: &str) -> Result<EchoSnapshot> {
        let path = self.snapshot_path(session_id)?;
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load a persisted session into the cache.
    pub fn load(&self, session_id: &str) -> Result<Arc<Echo>> {
        if let Some(live) = self.get(session_id) {
            return Ok(live);
        }
        let snapshot = self.load_snapshot(session_id)?;
        let echo = Arc::new(Echo::from_snapshot(snapshot));
        self.insert(echo.clone());
        Ok(echo)
    }
}

fn evict_oldest(sessions: &mut HashMap<String, Arc<Echo>>) {
    if let Some(oldest) = sessions
        .values()
        .min_by_key(|e| e.created_at)
        .map(|e| e.session_id.clone())
    {
        tracing::debug!(session_id = %oldest, "evicting oldest session from cache");
        sessions.remove(&oldest);
    }
}
