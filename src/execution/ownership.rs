//! Registry of which engine instance currently drives which run.
//!
//! A run may be driven by at most one live engine task, and a session may have
//! at most one run being driven. `claim` checks both and inserts atomically under
//! one lock; the returned [`RunLease`] releases the slot when dropped, whatever
//! path the engine task exits through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::errors::ExecutionError;

#[derive(Debug, Clone)]
struct RunSlot {
    session_id: String,
    token: Uuid,
}

#[derive(Debug, Default)]
pub struct RunRegistry {
    slots: Mutex<HashMap<String, RunSlot>>,
}

/// Proof of ownership of one run. Dropping it releases the run.
#[derive(Debug)]
pub struct RunLease {
    registry: Arc<RunRegistry>,
    run_id: String,
    token: Uuid,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomically claim `run_id` for a new engine instance.
    ///
    /// Fails with `RunAlreadyActive` if the run, or any other run of the same
    /// session, is already held by a live instance.
    pub fn claim(
        self: &Arc<Self>,
        run_id: &str,
        session_id: &str,
    ) -> Result<RunLease, ExecutionError> {
        let mut slots = self.slots.lock().map_err(|_| ExecutionError::LockPoisoned)?;
        if let Some((held, _)) = slots
            .iter()
            .find(|(id, slot)| id.as_str() == run_id || slot.session_id == session_id)
        {
            return Err(ExecutionError::RunAlreadyActive {
                session_id: session_id.to_string(),
                run_id: held.clone(),
            });
        }
        let token = Uuid::new_v4();
        slots.insert(
            run_id.to_string(),
            RunSlot {
                session_id: session_id.to_string(),
                token,
            },
        );
        tracing::debug!(run_id, session_id, "claimed run");
        Ok(RunLease {
            registry: Arc::clone(self),
            run_id: run_id.to_string(),
            token,
        })
    }

    pub fn is_live(&self, run_id: &str) -> bool {
        self.slots
            .lock()
            .map(|slots| slots.contains_key(run_id))
            .unwrap_or(false)
    }

    fn release(&self, run_id: &str, token: Uuid) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        // A stale lease must not evict a newer owner.
        if slots.get(run_id).is_some_and(|slot| slot.token == token) {
            slots.remove(run_id);
            tracing::debug!(run_id, "released run");
        }
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.registry.release(&self.run_id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_release_on_drop() {
        let registry = RunRegistry::new();
        let lease = registry.claim("r-1", "s-1").unwrap();
        assert!(registry.is_live("r-1"));
        drop(lease);
        assert!(!registry.is_live("r-1"));
        // The session slot is free again
        assert!(registry.claim("r-2", "s-1").is_ok());
    }

    #[test]
    fn test_second_claim_for_same_run_is_rejected() {
        let registry = RunRegistry::new();
        let _lease = registry.claim("r-1", "s-1").unwrap();
        let err = registry.claim("r-1", "s-1").unwrap_err();
        assert!(matches!(err, ExecutionError::RunAlreadyActive { ref run_id, .. } if run_id == "r-1"));
    }

    #[test]
    fn test_second_run_for_same_session_is_rejected() {
        let registry = RunRegistry::new();
        let _lease = registry.claim("r-1", "s-1").unwrap();
        assert!(registry.claim("r-2", "s-1").is_err());
        // Other sessions are independent
        assert!(registry.claim("r-3", "s-2").is_ok());
    }

    #[test]
    fn test_claim_after_release_succeeds() {
        let registry = RunRegistry::new();
        drop(registry.claim("r-1", "s-1").unwrap());
        let _lease = registry.claim("r-1", "s-1").unwrap();
        assert!(registry.is_live("r-1"));
    }

    #[test]
    fn test_concurrent_claims_have_exactly_one_winner() {
        let registry = RunRegistry::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.claim("r-1", "s-1").map(std::mem::forget).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
