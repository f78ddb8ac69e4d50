use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{Local, Utc};
use serde::Serialize;

/// Global cap on retained events across all sessions.
const MAX_EVENTS: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct EventEntry {
    pub id: String,
    pub session_id: String,
    pub timestamp: String,
    pub event_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_input: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Bounded in-memory ring of recent hook events.
///
/// When the cap is exceeded, the oldest event belonging to the same
/// session as the newest entry is evicted, so one chatty session cannot
/// push every other session's history out. If the newest entry is the
/// only record of its session, the global oldest falls instead.
pub struct EventLog {
    entries: Mutex<VecDeque<EventEntry>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(128)),
        }
    }

    pub fn add(
        &self,
        session_id: &str,
        event_name: &str,
        tool_name: &str,
        tool_input: &str,
        detail: &str,
    ) {
        let entry = EventEntry {
            id: generate_event_id(),
            session_id: session_id.to_string(),
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            event_name: event_name.to_string(),
            tool_name: tool_name.to_string(),
            tool_input: tool_input.to_string(),
            detail: detail.to_string(),
        };

        let mut entries = self.entries.lock().expect("event log poisoned");
        entries.push_back(entry);
        if entries.len() > MAX_EVENTS {
            let newest_session = entries
                .back()
                .map(|e| e.session_id.clone())
                .unwrap_or_default();
            let victim = entries
                .iter()
                .position(|e| e.session_id == newest_session)
                .filter(|&idx| idx + 1 < entries.len());
            match victim {
                Some(idx) => {
                    entries.remove(idx);
                }
                None => {
                    entries.pop_front();
                }
            }
        }
    }

    /// Most recent events for a session, newest first.
    pub fn by_session(&self, session_id: &str, limit: usize) -> Vec<EventEntry> {
        let entries = self.entries.lock().expect("event log poisoned");
        entries
            .iter()
            .rev()
            .filter(|e| e.session_id == session_id)
            .take(limit)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("event log poisoned").len()
    }
}

fn generate_event_id() -> String {
    Utc::now().format("%Y%m%d%H%M%S%.9f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_session_returns_newest_first_up_to_limit() {
        let log = EventLog::new();
        for i in 0..5 {
            log.add("s1", &format!("Event{i}"), "", "", "");
        }
        log.add("s2", "Other", "", "", "");

        let events = log.by_session("s1", 3);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_name, "Event4");
        assert_eq!(events[2].event_name, "Event2");
    }

    #[test]
    fn overflow_evicts_oldest_event_of_newest_session() {
        let log = EventLog::new();
        log.add("noisy", "First", "", "", "");
        for i in 0..MAX_EVENTS - 1 {
            log.add("quiet", &format!("Q{i}"), "", "", "");
        }
        assert_eq!(log.len(), MAX_EVENTS);

        log.add("noisy", "Second", "", "", "");
        assert_eq!(log.len(), MAX_EVENTS);

        let noisy = log.by_session("noisy", 10);
        assert_eq!(noisy.len(), 1);
        assert_eq!(noisy[0].event_name, "Second");
        assert_eq!(log.by_session("quiet", MAX_EVENTS).len(), MAX_EVENTS - 1);
    }

    #[test]
    fn overflow_falls_back_to_global_oldest_for_fresh_session() {
        let log = EventLog::new();
        for i in 0..MAX_EVENTS {
            log.add("old", &format!("O{i}"), "", "", "");
        }
        log.add("fresh", "Only", "", "", "");

        assert_eq!(log.len(), MAX_EVENTS);
        assert_eq!(log.by_session("fresh", 10).len(), 1);
        let oldest = log.by_session("old", MAX_EVENTS);
        assert_eq!(oldest.len(), MAX_EVENTS - 1);
        assert_eq!(oldest.last().unwrap().event_name, "O1");
    }
}
