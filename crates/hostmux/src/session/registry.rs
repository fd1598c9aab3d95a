//! Session registry.
//!
//! Shared map of all known sessions, keyed by [`SessionId`]. Entries are
//! registered while still `Connecting` so in-flight dials are visible, and
//! failed sessions stay listed until explicitly removed so their errors can
//! be inspected.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use thiserror::Error;

use super::shell::{Session, SessionId, SessionState};

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No session with this id.
    #[error("no session with id {0:?}")]
    NotFound(SessionId),

    /// A session with this id is already registered.
    #[error("a session with id {0:?} already exists")]
    Duplicate(SessionId),
}

/// Registry of live (and recently failed) sessions.
///
/// `order` remembers insertion order so listings and focus fallback are
/// deterministic; `sessions` carries the actual entries.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    order: Mutex<Vec<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. Rejects duplicates without touching the
    /// existing entry.
    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let id = session.id().clone();
        let mut order = self.order.lock().expect("order lock");
        if self.sessions.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.sessions.insert(id.clone(), session);
        order.push(id);
        Ok(())
    }

    /// Looks up a session by id.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Point-in-time snapshot of all sessions, in registration order.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let order = self.order.lock().expect("order lock");
        order
            .iter()
            .filter_map(|id| self.sessions.get(id).map(|entry| Arc::clone(&entry)))
            .collect()
    }

    /// Removes a session from the registry. The session itself is not
    /// touched; tear it down first.
    pub fn remove(&self, id: &str) -> Result<Arc<Session>, RegistryError> {
        let mut order = self.order.lock().expect("order lock");
        match self.sessions.remove(id) {
            Some((_, session)) => {
                order.retain(|entry| entry != id);
                Ok(session)
            }
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tears down every session: requests close on all of them, waits up
    /// to `grace` for each to reach a terminal state, and force-releases
    /// any that do not converge. Returns the ids that needed forcing.
    /// The registry is empty afterwards.
    pub async fn close_all(&self, grace: Duration) -> Vec<SessionId> {
        let sessions = self.list();
        for session in &sessions {
            let _ = session.close();
        }

        let waits = sessions
            .iter()
            .map(|session| session.wait_terminal(grace));
        let outcomes = join_all(waits).await;

        let mut forced = Vec::new();
        for (session, outcome) in sessions.iter().zip(outcomes) {
            if outcome.is_err() {
                session.force_release().await;
                forced.push(session.id().clone());
            }
        }

        for session in &sessions {
            let _ = self.remove(session.id());
        }

        if !forced.is_empty() {
            tracing::warn!(count = forced.len(), "Force-released unresponsive sessions");
        }
        forced
    }

    /// Ids of sessions currently in the given state.
    pub fn ids_in_state(&self, state: SessionState) -> Vec<SessionId> {
        self.list()
            .into_iter()
            .filter(|session| session.state() == state)
            .map(|session| session.id().clone())
            .collect()
    }
}
