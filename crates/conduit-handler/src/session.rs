//! Per-sub-intent session table.
//!
//! Makes `accept` idempotent: the first call for an id claims it, every
//! later call gets the recorded answer back.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_core::{Acceptance, LifecycleState};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// State of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Claimed; the accept call has not answered yet.
    Pending,
    /// Accepted and being realized.
    Active,
    /// Refused.
    Rejected,
    /// Realization reached a terminal report.
    Finished(LifecycleState),
    /// Withdrawn by the router.
    Withdrawn,
}

/// Result of claiming a sub-intent id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// First delivery; the caller now owns the session.
    Fresh,
    /// Repeated delivery; answer with the recorded acceptance.
    Known(Acceptance),
    /// Another delivery of the same id is still being answered.
    Pending,
}

struct Session {
    acceptance: Option<Acceptance>,
    state: SessionState,
    next_sequence: u64,
    task: Option<JoinHandle<()>>,
}

/// Idempotency table shared by an adapter and its progress tasks.
#[derive(Clone, Default)]
pub struct AdapterSessions {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl AdapterSessions {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a first delivery, or report what is already known.
    pub async fn claim(&self, id: Uuid) -> Claim {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&id) {
            Some(Session { acceptance: Some(a), .. }) => Claim::Known(a.clone()),
            Some(_) => Claim::Pending,
            None => {
                sessions.insert(
                    id,
                    Session {
                        acceptance: None,
                        state: SessionState::Pending,
                        next_sequence: 1,
                        task: None,
                    },
                );
                Claim::Fresh
            }
        }
    }

    /// Drop a pending claim so the next delivery starts over.
    pub async fn release(&self, id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if matches!(sessions.get(&id), Some(s) if s.state == SessionState::Pending) {
            sessions.remove(&id);
        }
    }

    /// Record the answer to a claimed delivery.
    pub async fn settle(&self, id: Uuid, acceptance: Acceptance) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&id) {
            session.state = if acceptance.is_accepted() {
                SessionState::Active
            } else {
                SessionState::Rejected
            };
            session.acceptance = Some(acceptance);
        }
    }

    /// Attach the progress task so a withdrawal can abort it.
    pub async fn attach(&self, id: Uuid, task: JoinHandle<()>) {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) if session.state == SessionState::Active => session.task = Some(task),
            _ => task.abort(),
        }
    }

    /// Allocate the next report sequence number for `id`, starting at 1.
    pub async fn next_sequence(&self, id: Uuid) -> Option<u64> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id)?;
        let sequence = session.next_sequence;
        session.next_sequence += 1;
        Some(sequence)
    }

    /// Mark an active session as finished. Returns false if it was not active.
    pub async fn finish(&self, id: Uuid, state: LifecycleState) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) if session.state == SessionState::Active => {
                session.state = SessionState::Finished(state);
                session.task = None;
                true
            }
            _ => false,
        }
    }

    /// Withdraw a session, aborting its progress task.
    ///
    /// `None` if unknown; `Some(false)` if there was nothing left to withdraw.
    pub async fn withdraw(&self, id: Uuid) -> Option<bool> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id)?;
        match session.state {
            SessionState::Active | SessionState::Finished(_) => {
                if let Some(task) = session.task.take() {
                    task.abort();
                }
                session.state = SessionState::Withdrawn;
                Some(true)
            }
            SessionState::Pending | SessionState::Rejected | SessionState::Withdrawn => Some(false),
        }
    }

    /// Current state of a session.
    pub async fn state(&self, id: Uuid) -> Option<SessionState> {
        self.sessions.read().await.get(&id).map(|s| s.state)
    }

    /// Number of known sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
