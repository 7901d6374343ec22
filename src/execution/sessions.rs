use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use super::models::Session;

/// Lookup of the tasks that runs belong to.
///
/// Sessions are external task metadata. The directory only answers whether a
/// session exists; the engine never mutates it.
pub trait SessionDirectory: Send + Sync {
    fn get(&self, session_id: &str) -> Result<Option<Session>>;

    fn register(&self, session: Session) -> Result<Session>;
}

/// Process-local session directory. Everything in it is lost on restart.
#[derive(Default)]
pub struct InMemorySessions {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session with a generated id.
    pub fn create(&self, title: &str, agent_id: Option<String>) -> Result<Session> {
        self.register(Session {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            agent_id,
            created_at: Utc::now(),
        })
    }
}

impl SessionDirectory for InMemorySessions {
    fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Session lock poisoned: {}", e))?;
        Ok(sessions.get(session_id).cloned())
    }

    fn register(&self, session: Session) -> Result<Session> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Session lock poisoned: {}", e))?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get() {
        let dir = InMemorySessions::new();
        let session = dir.create("Write report", Some("agent-execution".into())).unwrap();
        let fetched = dir.get(&session.id).unwrap().unwrap();
        assert_eq!(fetched.title, "Write report");
        assert_eq!(fetched.agent_id.as_deref(), Some("agent-execution"));
    }

    #[test]
    fn test_unknown_session_is_none() {
        let dir = InMemorySessions::new();
        assert!(dir.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_register_keeps_caller_id() {
        let dir = InMemorySessions::new();
        dir.register(Session {
            id: "task-42".into(),
            title: "t".into(),
            agent_id: None,
            created_at: Utc::now(),
        })
        .unwrap();
        assert!(dir.get("task-42").unwrap().is_some());
    }
}
