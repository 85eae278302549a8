//! Per-session cancellation tokens with group fan-out.
//!
//! Each running cascade gets a `CancelToken`. Cancelling a session cancels
//! its token and cascades to every child registered in its group — this is
//! how sub-cascades and `mode: first` candidate siblings are torn down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A cancellation token checked (and awaited) by the engine loops.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signal cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolve when cancellation is signalled. Used in `select!` around
    /// provider calls and tool fan-out so in-flight work is abandoned.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }

    /// The raw flag, shared with tool contexts for cooperative checks.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks active tokens per session id, with parent→child groups for
/// cascading cancellation.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    /// parent session id → child session ids.
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token for a session.
    pub fn register(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .insert(session_id.to_owned(), token.clone());
        token
    }

    /// Cancel a session and all children in its group. Returns true when a
    /// token was found.
    pub fn cancel(&self, session_id: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(session_id) {
            token.cancel();
            true
        } else {
            false
        };

        let children: Vec<String> = self
            .groups
            .lock()
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for child in children {
            self.cancel(&child);
        }

        found
    }

    /// Remove a session's token and group (called when the cascade ends).
    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
        self.groups.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }

    /// Register a child session in a parent's cancel group.
    pub fn add_to_group(&self, parent: &str, child: &str) {
        self.groups
            .lock()
            .entry(parent.to_owned())
            .or_default()
            .insert(child.to_owned());
    }

    pub fn remove_from_group(&self, parent: &str, child: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                groups.remove(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.flag().load(std::sync::atomic::Ordering::Acquire));
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::task::yield_now().await;
        token.cancel();
        assert!(handle.await.unwrap());
    }

    #[test]
    fn cancel_cascades_through_nested_groups() {
        let map = CancelMap::new();
        let parent = map.register("parent");
        let child = map.register("child");
        let grandchild = map.register("grandchild");
        map.add_to_group("parent", "child");
        map.add_to_group("child", "grandchild");

        map.cancel("parent");
        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn remove_from_group_stops_cascade() {
        let map = CancelMap::new();
        map.register("p");
        let child = map.register("c");
        map.add_to_group("p", "c");
        map.remove_from_group("p", "c");
        map.cancel("p");
        assert!(!child.is_cancelled());
    }

    #[test]
    fn cancel_unknown_session_is_false() {
        let map = CancelMap::new();
        assert!(!map.cancel("ghost"));
        assert!(!map.is_running("ghost"));
    }
}
