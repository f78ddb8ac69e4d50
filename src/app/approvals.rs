use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::app::model::Decision;
use crate::app::sessions::SessionRegistry;
use crate::hub::{Hub, Message};

/// A registered approval awaiting an operator decision.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub tool_name: String,
    pub tool_input: Value,
    pub prompt: String,
}

/// Snapshot of a pending approval for dashboard rendering.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalView {
    pub id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remaining_seconds: i64,
}

impl ApprovalView {
    fn from_record(record: &PendingApproval, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id.clone(),
            tool_name: record.tool_name.clone(),
            tool_input: record.tool_input.clone(),
            prompt: record.prompt.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            remaining_seconds: (record.expires_at - now).num_seconds().max(0),
        }
    }
}

/// What a submitted hook request ultimately observes.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Decision(Decision),
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    NotFound,
    AlreadyResolved,
}

struct PendingEntry {
    record: PendingApproval,
    /// Single-slot response mailbox. Taken under the registry write lock;
    /// once gone, the approval is resolved and stays resolved.
    slot: Option<oneshot::Sender<Decision>>,
}

/// The approval rendezvous engine.
///
/// Pairs hook requests that park in [`ApprovalEngine::submit`] with
/// operator decisions arriving through [`ApprovalEngine::resolve`]. Each
/// approval resolves exactly once, to a decision, a timeout, or a
/// cancellation; session pending counters and hub broadcasts are kept
/// consistent with the registry on every path.
pub struct ApprovalEngine {
    pending: RwLock<HashMap<String, PendingEntry>>,
    sessions: Arc<SessionRegistry>,
    hub: Arc<Hub>,
}

impl ApprovalEngine {
    pub fn new(sessions: Arc<SessionRegistry>, hub: Arc<Hub>) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            sessions,
            hub,
        }
    }

    /// Register an approval and park until the first of: operator
    /// decision, deadline, or caller cancellation (future drop). The
    /// registry entry is removed on every exit path; counters follow.
    pub async fn submit(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: Value,
        prompt: &str,
        timeout: Duration,
    ) -> Verdict {
        let id = generate_approval_id();
        let now = Utc::now();
        let record = PendingApproval {
            id: id.clone(),
            session_id: session_id.to_string(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero()),
            tool_name: tool_name.to_string(),
            tool_input,
            prompt: prompt.to_string(),
        };

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().expect("approval registry poisoned");
            pending.insert(
                id.clone(),
                PendingEntry {
                    record: record.clone(),
                    slot: Some(tx),
                },
            );
        }
        self.sessions.increment_pending(session_id);

        info!(
            approval_id = %id,
            session_id = %session_id,
            tool_name = %record.tool_name,
            timeout_seconds = timeout.as_secs(),
            "permission request pending"
        );

        self.hub.broadcast(Message::new(
            "approval_request",
            Some(session_id.to_string()),
            json!({
                "approval_id": id,
                "tool_name": record.tool_name,
                "tool_input": record.tool_input,
                "prompt": record.prompt,
                "expires_at": record.expires_at,
            }),
        ));

        let mut guard = CancelGuard {
            engine: self,
            id: id.clone(),
            session_id: session_id.to_string(),
            armed: true,
        };

        let received = tokio::select! {
            decision = &mut rx => decision.ok(),
            _ = tokio::time::sleep(timeout) => None,
        };
        guard.armed = false;

        let entry = self.remove(&id);
        if entry.is_some() {
            self.sessions.decrement_pending(session_id);
        }

        match received {
            Some(decision) => {
                info!(approval_id = %id, behavior = ?decision.behavior, "permission request resolved");
                Verdict::Decision(decision)
            }
            None => {
                // A resolver may have taken the slot in the same instant
                // the deadline fired; its send happened under the registry
                // lock, so the decision is already in the mailbox.
                if entry.as_ref().map_or(true, |e| e.slot.is_none()) {
                    if let Ok(decision) = rx.try_recv() {
                        info!(approval_id = %id, behavior = ?decision.behavior, "permission request resolved");
                        return Verdict::Decision(decision);
                    }
                }
                warn!(approval_id = %id, "permission request timed out");
                self.hub.broadcast(Message::new(
                    "approval_resolved",
                    None,
                    json!({ "approval_id": id, "decision": "timeout" }),
                ));
                Verdict::Timeout
            }
        }
    }

    /// Deliver an operator decision to the waiting hook request.
    pub fn resolve(&self, id: &str, decision: Decision) -> ResolveOutcome {
        let outcome = {
            let mut pending = self.pending.write().expect("approval registry poisoned");
            match pending.get_mut(id) {
                None => ResolveOutcome::NotFound,
                Some(entry) => match entry.slot.take() {
                    None => ResolveOutcome::AlreadyResolved,
                    Some(tx) => match tx.send(decision.clone()) {
                        Ok(()) => ResolveOutcome::Resolved,
                        Err(_) => ResolveOutcome::AlreadyResolved,
                    },
                },
            }
        };

        if outcome == ResolveOutcome::Resolved {
            info!(approval_id = %id, behavior = ?decision.behavior, "approval decision delivered");
            self.hub.broadcast(Message::new(
                "approval_resolved",
                None,
                json!({ "approval_id": id, "decision": decision.behavior }),
            ));
        }
        outcome
    }

    pub fn list_by_session(&self, session_id: &str) -> Vec<ApprovalView> {
        let now = Utc::now();
        let pending = self.pending.read().expect("approval registry poisoned");
        let mut result: Vec<ApprovalView> = pending
            .values()
            .filter(|e| e.record.session_id == session_id)
            .map(|e| ApprovalView::from_record(&e.record, now))
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        result
    }

    pub fn count_by_session(&self, session_id: &str) -> usize {
        let pending = self.pending.read().expect("approval registry poisoned");
        count_for_session(&pending, session_id)
    }

    fn remove(&self, id: &str) -> Option<PendingEntry> {
        self.pending
            .write()
            .expect("approval registry poisoned")
            .remove(id)
    }
}

fn count_for_session(pending: &HashMap<String, PendingEntry>, session_id: &str) -> usize {
    pending
        .values()
        .filter(|e| e.record.session_id == session_id)
        .count()
}

fn generate_approval_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Cleans up a parked approval whose request future was dropped, e.g. on
/// hook client disconnect. Disarmed on every ordinary exit path.
struct CancelGuard<'a> {
    engine: &'a ApprovalEngine,
    id: String,
    session_id: String,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(entry) = self.engine.remove(&self.id) else {
            return;
        };
        self.engine.sessions.decrement_pending(&self.session_id);
        if entry.slot.is_some() {
            warn!(approval_id = %self.id, "hook request cancelled while approval pending");
            self.engine.hub.broadcast(Message::new(
                "approval_resolved",
                None,
                json!({ "approval_id": self.id, "reason": "cancelled" }),
            ));
        }
    }
}
