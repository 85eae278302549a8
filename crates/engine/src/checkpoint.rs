//! Human-in-the-loop checkpoint broker.
//!
//! A cell calling `request_decision` suspends its turn on a oneshot keyed
//! by checkpoint id. An external surface (HTTP, TUI — out of scope here)
//! posts a response or a cancellation, which wakes the waiting cell.
//! `respond` is idempotent per id.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use casc_domain::error::{Error, Result};
use casc_domain::event::EngineEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub session_id: String,
    pub cell_name: String,
    pub phase_index: u32,
    pub created_at: DateTime<Utc>,
    /// What the asking cell expects back (free-form spec or rendered
    /// prompt/html for the deciding surface).
    pub expected_shape: Value,
    pub status: CheckpointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

/// External reply payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointResponse {
    pub response: Value,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// What wakes a suspended cell.
pub enum Signal {
    Response(Value),
    Cancelled(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct CheckpointBroker {
    records: Mutex<HashMap<String, CheckpointRecord>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Signal>>>,
}

impl CheckpointBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pending checkpoint and return its id plus the wait handle.
    pub fn open(
        &self,
        session_id: &str,
        cell_name: &str,
        phase_index: u32,
        expected_shape: Value,
    ) -> (CheckpointRecord, oneshot::Receiver<Signal>) {
        let record = CheckpointRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            cell_name: cell_name.to_string(),
            phase_index,
            created_at: Utc::now(),
            expected_shape,
            status: CheckpointStatus::Pending,
            response: None,
        };
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(record.id.clone(), tx);
        self.records.lock().insert(record.id.clone(), record.clone());

        EngineEvent::CheckpointPending {
            checkpoint_id: record.id.clone(),
            session_id: session_id.to_string(),
            cell_name: cell_name.to_string(),
        }
        .emit();

        (record, rx)
    }

    /// Await the external decision. A `timeout` of `None` waits forever.
    pub async fn wait(
        &self,
        checkpoint_id: &str,
        rx: oneshot::Receiver<Signal>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let signal = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                self.finish(checkpoint_id, CheckpointStatus::Cancelled, None);
                Error::Timeout(format!("checkpoint {checkpoint_id} timed out"))
            })?,
            None => rx.await,
        };
        match signal {
            Ok(Signal::Response(value)) => Ok(value),
            Ok(Signal::Cancelled(reason)) => Err(Error::CheckpointCancelled(reason)),
            Err(_) => Err(Error::CheckpointCancelled(format!(
                "checkpoint {checkpoint_id} dropped"
            ))),
        }
    }

    /// Post a response. Idempotent: responding to a completed checkpoint
    /// is a no-op; responding to a cancelled or unknown one is an error.
    pub fn respond(&self, checkpoint_id: &str, payload: CheckpointResponse) -> Result<()> {
        {
            let records = self.records.lock();
            match records.get(checkpoint_id) {
                None => {
                    return Err(Error::Other(format!(
                        "unknown checkpoint {checkpoint_id}"
                    )))
                }
                Some(r) if r.status == CheckpointStatus::Completed => return Ok(()),
                Some(r) if r.status == CheckpointStatus::Cancelled => {
                    return Err(Error::CheckpointCancelled(format!(
                        "checkpoint {checkpoint_id} already cancelled"
                    )))
                }
                Some(_) => {}
            }
        }

        self.finish(
            checkpoint_id,
            CheckpointStatus::Completed,
            Some(payload.response.clone()),
        );
        if let Some(tx) = self.waiters.lock().remove(checkpoint_id) {
            let _ = tx.send(Signal::Response(payload.response));
        }
        EngineEvent::CheckpointResolved {
            checkpoint_id: checkpoint_id.to_string(),
            cancelled: false,
        }
        .emit();
        Ok(())
    }

    /// Cancel a pending checkpoint; the waiting cell receives an explicit
    /// cancellation error.
    pub fn cancel(&self, checkpoint_id: &str, reason: Option<String>) -> Result<()> {
        if !self.records.lock().contains_key(checkpoint_id) {
            return Err(Error::Other(format!("unknown checkpoint {checkpoint_id}")));
        }
        self.finish(checkpoint_id, CheckpointStatus::Cancelled, None);
        if let Some(tx) = self.waiters.lock().remove(checkpoint_id) {
            let _ = tx.send(Signal::Cancelled(
                reason.unwrap_or_else(|| "cancelled by operator".to_string()),
            ));
        }
        EngineEvent::CheckpointResolved {
            checkpoint_id: checkpoint_id.to_string(),
            cancelled: true,
        }
        .emit();
        Ok(())
    }

    pub fn list_pending(&self) -> Vec<CheckpointRecord> {
        let mut pending: Vec<CheckpointRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.status == CheckpointStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub fn get(&self, checkpoint_id: &str) -> Option<CheckpointRecord> {
        self.records.lock().get(checkpoint_id).cloned()
    }

    fn finish(&self, checkpoint_id: &str, status: CheckpointStatus, response: Option<Value>) {
        if let Some(record) = self.records.lock().get_mut(checkpoint_id) {
            record.status = status;
            record.response = response;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn respond_wakes_waiter() {
        let broker = CheckpointBroker::new();
        let (record, rx) = broker.open("s1", "approve", 2, json!({"type": "boolean"}));
        assert_eq!(broker.list_pending().len(), 1);

        let id = record.id.clone();
        let broker_ref = &broker;
        let (wait_result, respond_result) = tokio::join!(
            broker_ref.wait(&id, rx, None),
            async {
                broker_ref.respond(
                    &id,
                    CheckpointResponse {
                        response: json!({"approved": true}),
                        reasoning: None,
                        confidence: Some(0.9),
                    },
                )
            }
        );
        respond_result.unwrap();
        assert_eq!(wait_result.unwrap(), json!({"approved": true}));
        assert!(broker.list_pending().is_empty());
        assert_eq!(
            broker.get(&record.id).unwrap().status,
            CheckpointStatus::Completed
        );
    }

    #[tokio::test]
    async fn respond_is_idempotent() {
        let broker = CheckpointBroker::new();
        let (record, _rx) = broker.open("s1", "approve", 0, json!({}));
        let payload = || CheckpointResponse {
            response: json!(1),
            reasoning: None,
            confidence: None,
        };
        broker.respond(&record.id, payload()).unwrap();
        broker.respond(&record.id, payload()).unwrap();
        assert!(broker.respond("nope", payload()).is_err());
    }

    #[tokio::test]
    async fn cancel_surfaces_explicit_error() {
        let broker = CheckpointBroker::new();
        let (record, rx) = broker.open("s1", "approve", 0, json!({}));
        broker
            .cancel(&record.id, Some("operator declined".into()))
            .unwrap();
        let err = broker.wait(&record.id, rx, None).await.unwrap_err();
        assert!(matches!(err, Error::CheckpointCancelled(_)));
        assert!(err.to_string().contains("operator declined"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_wait() {
        let broker = CheckpointBroker::new();
        let (record, rx) = broker.open("s1", "approve", 0, json!({}));
        let err = broker
            .wait(&record.id, rx, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(
            broker.get(&record.id).unwrap().status,
            CheckpointStatus::Cancelled
        );
    }
}
