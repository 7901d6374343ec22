use serde_json::Value;
use tokio::sync::broadcast;

use super::db::DbHandle;
use super::models::ActivityEvent;

/// Publishes audit events to the persisted log and to ambient listeners.
///
/// Both sinks are best effort: a failed write or a broadcast with no
/// subscribers never affects the run that produced the event.
#[derive(Clone)]
pub struct ActivityPublisher {
    db: DbHandle,
    tx: broadcast::Sender<String>,
}

impl ActivityPublisher {
    pub fn new(db: DbHandle, tx: broadcast::Sender<String>) -> Self {
        Self { db, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub async fn publish(&self, event_type: &str, summary: impl Into<String>, metadata: Value) {
        let event = ActivityEvent::new(event_type, summary, metadata);
        broadcast_event(&self.tx, &event);
        let persisted = event.clone();
        if let Err(e) = self
            .db
            .call(move |db| db.append_activity(&persisted))
            .await
        {
            tracing::warn!(event_type = %event.event_type, error = %e, "failed to persist activity event");
        }
    }
}

/// Serialize and send an event to all connected activity listeners.
pub fn broadcast_event(tx: &broadcast::Sender<String>, event: &ActivityEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            // No receivers is fine
            let _ = tx.send(json);
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize activity event"),
    }
}
