use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Ended,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub project_dir: String,
    pub nickname: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub has_pending: bool,
    pub pending_count: usize,
}

/// In-memory registry of agent sessions, keyed by the opaque session id
/// the agent supplies in every hook payload. Never performs I/O.
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Create the session on first sight, or stamp `last_event_at` and
    /// re-activate it. `ended` is terminal: later hooks still stamp the
    /// clock but never revive the status.
    pub fn upsert(&self, id: &str, project_dir: &str, nickname: &str) -> Session {
        let mut sessions = self.inner.write().expect("session registry poisoned");
        let now = Utc::now();
        let session = sessions.entry(id.to_string()).or_insert_with(|| Session {
            id: id.to_string(),
            project_dir: project_dir.to_string(),
            nickname: nickname.to_string(),
            status: SessionStatus::Active,
            started_at: now,
            last_event_at: now,
            has_pending: false,
            pending_count: 0,
        });
        session.last_event_at = now;
        if session.status != SessionStatus::Ended {
            session.status = SessionStatus::Active;
        }
        session.clone()
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner
            .read()
            .expect("session registry poisoned")
            .get(id)
            .cloned()
    }

    /// Snapshot of every session, most recently active first.
    pub fn all(&self) -> Vec<Session> {
        let sessions = self.inner.read().expect("session registry poisoned");
        let mut result: Vec<Session> = sessions.values().cloned().collect();
        result.sort_by(|a, b| b.last_event_at.cmp(&a.last_event_at));
        result
    }

    /// No-op when the id is unknown or the session has already ended.
    pub fn update_status(&self, id: &str, status: SessionStatus) {
        let mut sessions = self.inner.write().expect("session registry poisoned");
        if let Some(session) = sessions.get_mut(id) {
            if session.status == SessionStatus::Ended {
                return;
            }
            session.status = status;
            session.last_event_at = Utc::now();
        }
    }

    /// Counter updates are deltas so concurrent approval registrations
    /// and removals commute regardless of apply order.
    pub fn increment_pending(&self, id: &str) {
        let mut sessions = self.inner.write().expect("session registry poisoned");
        if let Some(session) = sessions.get_mut(id) {
            session.pending_count += 1;
            session.has_pending = true;
        }
    }

    pub fn decrement_pending(&self, id: &str) {
        let mut sessions = self.inner.write().expect("session registry poisoned");
        if let Some(session) = sessions.get_mut(id) {
            session.pending_count = session.pending_count.saturating_sub(1);
            session.has_pending = session.pending_count > 0;
        }
    }

    pub fn set_nickname(&self, id: &str, nickname: &str) -> Option<Session> {
        let mut sessions = self.inner.write().expect("session registry poisoned");
        let session = sessions.get_mut(id)?;
        session.nickname = nickname.to_string();
        Some(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_then_touches() {
        let registry = SessionRegistry::new();
        let first = registry.upsert("s1", "/tmp/project", "project");
        assert_eq!(first.status, SessionStatus::Active);
        assert_eq!(first.pending_count, 0);

        registry.update_status("s1", SessionStatus::Idle);
        let revived = registry.upsert("s1", "/tmp/project", "project");
        assert_eq!(revived.status, SessionStatus::Active);
        assert_eq!(revived.started_at, first.started_at);
    }

    #[test]
    fn ended_is_terminal() {
        let registry = SessionRegistry::new();
        registry.upsert("s1", "/tmp/project", "project");
        registry.update_status("s1", SessionStatus::Ended);

        registry.update_status("s1", SessionStatus::Idle);
        assert_eq!(registry.get("s1").unwrap().status, SessionStatus::Ended);

        let touched = registry.upsert("s1", "/tmp/project", "project");
        assert_eq!(touched.status, SessionStatus::Ended);
    }

    #[test]
    fn pending_counter_tracks_has_pending() {
        let registry = SessionRegistry::new();
        registry.upsert("s1", "/tmp/project", "project");

        registry.increment_pending("s1");
        registry.increment_pending("s1");
        let session = registry.get("s1").unwrap();
        assert!(session.has_pending);
        assert_eq!(session.pending_count, 2);

        registry.decrement_pending("s1");
        registry.decrement_pending("s1");
        let session = registry.get("s1").unwrap();
        assert!(!session.has_pending);
        assert_eq!(session.pending_count, 0);

        // A stray decrement never underflows.
        registry.decrement_pending("s1");
        assert_eq!(registry.get("s1").unwrap().pending_count, 0);
    }

    #[test]
    fn update_status_ignores_unknown_session() {
        let registry = SessionRegistry::new();
        registry.update_status("missing", SessionStatus::Idle);
        assert!(registry.get("missing").is_none());
    }
}
