//! Focus and broadcast multiplexing over a set of sessions.
//!
//! The [`Multiplexer`] ties the connection factory, the session registry
//! and a focus target together: hosts are added through it, local input is
//! routed through it, and all remote output converges on the single
//! channel it hands out at construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::HostProfile;
use crate::connect::{ConnectError, ConnectionFactory};
use crate::session::{
    OutputChunk, QueueConfig, RegistryError, Session, SessionError, SessionId, SessionRegistry,
    SessionState,
};
use crate::transport::PtyRequest;

/// Where local input goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Focus {
    /// One session receives input.
    Session(SessionId),
    /// Every active session receives input.
    #[default]
    Broadcast,
}

/// Multiplexer tuning.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Pseudo-terminal parameters requested for every new session.
    pub pty: PtyRequest,
    /// Input queue configuration applied to every new session.
    pub queue: QueueConfig,
    /// Capacity of the merged output channel.
    pub output_capacity: usize,
    /// How long teardown waits per session before force-releasing it.
    pub grace: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            pty: PtyRequest::default(),
            queue: QueueConfig::default(),
            output_capacity: 256,
            grace: Duration::from_secs(5),
        }
    }
}

/// Errors from multiplexer operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The dial for a host failed after all retries.
    #[error("failed to connect host {id:?}: {source}")]
    Connect {
        id: SessionId,
        #[source]
        source: ConnectError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The multiplexer was already shut down.
    #[error("multiplexer is shut down")]
    ShutDown,
}

/// Outcome of routing one input chunk.
#[derive(Debug)]
pub struct DeliveryReport {
    /// Sessions the chunk was queued for.
    pub delivered: usize,
    /// Sessions that rejected the chunk, with the reason.
    pub failed: Vec<(SessionId, SessionError)>,
}

/// One row of [`Multiplexer::list`].
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub label: String,
    pub addr: String,
    pub state: SessionState,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
}

pub struct Multiplexer {
    factory: ConnectionFactory,
    registry: Arc<SessionRegistry>,
    focus: Mutex<Focus>,
    output_tx: mpsc::Sender<OutputChunk>,
    cfg: MuxConfig,
    shut_down: AtomicBool,
}

impl Multiplexer {
    /// Creates a multiplexer and the receiving end of the merged output
    /// stream. Drain the receiver for as long as sessions run; output
    /// pumps block once it fills up.
    pub fn new(cfg: MuxConfig, factory: ConnectionFactory) -> (Self, mpsc::Receiver<OutputChunk>) {
        let (output_tx, output_rx) = mpsc::channel(cfg.output_capacity);
        let mux = Self {
            factory,
            registry: Arc::new(SessionRegistry::new()),
            focus: Mutex::new(Focus::Broadcast),
            output_tx,
            cfg,
            shut_down: AtomicBool::new(false),
        };
        (mux, output_rx)
    }

    /// The shared registry, for listing and lookups outside the mux.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Connects a host and starts a session for it.
    ///
    /// The session is registered before the dial so it is visible as
    /// `Connecting` while retries run. On dial or shell failure the entry
    /// stays registered as `Failed` with the error retained, and the same
    /// error is returned.
    pub async fn add_host(&self, profile: HostProfile) -> Result<Arc<Session>, MuxError> {
        self.ensure_running()?;

        let id = profile.id.clone();
        let session = Arc::new(Session::new(
            id.clone(),
            profile.clone(),
            self.cfg.queue.clone(),
        ));
        self.registry.register(Arc::clone(&session))?;

        let transport = match self.factory.connect(&profile).await {
            Ok(transport) => transport,
            Err(source) => {
                session.fail(&source.to_string());
                return Err(MuxError::Connect { id, source });
            }
        };

        session
            .activate(transport, self.cfg.pty.clone(), self.output_tx.clone())
            .await?;

        // The first session that comes up takes focus.
        let mut focus = self.focus.lock().expect("focus lock");
        if *focus == Focus::Broadcast && self.active_sessions().len() == 1 {
            *focus = Focus::Session(id);
        }
        Ok(session)
    }

    /// Current focus target.
    pub fn focus(&self) -> Focus {
        self.focus.lock().expect("focus lock").clone()
    }

    /// Points input at one session, or at all of them.
    pub fn set_focus(&self, focus: Focus) -> Result<(), MuxError> {
        if let Focus::Session(id) = &focus {
            let session = self
                .registry
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            if session.state() != SessionState::Active {
                return Err(SessionError::NotActive(id.clone()).into());
            }
        }
        tracing::debug!(focus = ?focus, "Focus changed");
        *self.focus.lock().expect("focus lock") = focus;
        Ok(())
    }

    /// Routes one chunk of local input according to the current focus.
    ///
    /// Broadcast delivery is concurrent and independent: one slow or dead
    /// session never blocks delivery to the others, and per-session
    /// failures are reported rather than aborting the fan-out.
    pub async fn route_input(&self, bytes: &[u8]) -> Result<DeliveryReport, MuxError> {
        self.ensure_running()?;

        match self.focus() {
            Focus::Session(id) => {
                let session = self
                    .registry
                    .get(&id)
                    .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
                match session.send_input(bytes.to_vec()).await {
                    Ok(()) => Ok(DeliveryReport {
                        delivered: 1,
                        failed: Vec::new(),
                    }),
                    Err(err) => Ok(DeliveryReport {
                        delivered: 0,
                        failed: vec![(id, err)],
                    }),
                }
            }
            Focus::Broadcast => {
                let targets = self.active_sessions();
                let sends = targets
                    .iter()
                    .map(|session| session.send_input(bytes.to_vec()));
                let outcomes = join_all(sends).await;

                let mut report = DeliveryReport {
                    delivered: 0,
                    failed: Vec::new(),
                };
                for (session, outcome) in targets.iter().zip(outcomes) {
                    match outcome {
                        Ok(()) => report.delivered += 1,
                        Err(err) => report.failed.push((session.id().clone(), err)),
                    }
                }
                Ok(report)
            }
        }
    }

    /// Propagates a local terminal resize according to the current focus.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), MuxError> {
        self.ensure_running()?;

        match self.focus() {
            Focus::Session(id) => {
                let session = self
                    .registry
                    .get(&id)
                    .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
                session.resize(cols, rows).await?;
            }
            Focus::Broadcast => {
                for session in self.active_sessions() {
                    if let Err(err) = session.resize(cols, rows).await {
                        tracing::warn!(session_id = %session.id(), error = %err, "Resize failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Tears one session down and drops it from the registry.
    ///
    /// If the removed session held focus, focus falls back to the first
    /// remaining session in registration order, or to broadcast when none
    /// are left.
    pub async fn remove_host(&self, id: &str) -> Result<(), MuxError> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        session.close()?;
        if session.wait_terminal(self.cfg.grace).await.is_err() {
            session.force_release().await;
        }
        self.registry.remove(id)?;

        let mut focus = self.focus.lock().expect("focus lock");
        if *focus == Focus::Session(id.to_string()) {
            *focus = match self.registry.list().first() {
                Some(next) => Focus::Session(next.id().clone()),
                None => Focus::Broadcast,
            };
            tracing::debug!(focus = ?*focus, "Focus fell back after removal");
        }
        Ok(())
    }

    /// Tears down every session and refuses further work. Idempotent;
    /// returns the ids of sessions that had to be force-released.
    pub async fn shutdown(&self) -> Vec<SessionId> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        tracing::info!(sessions = self.registry.count(), "Shutting down");
        let forced = self.registry.close_all(self.cfg.grace).await;
        *self.focus.lock().expect("focus lock") = Focus::Broadcast;
        forced
    }

    /// Point-in-time summaries of every known session, in registration
    /// order.
    pub fn list(&self) -> Vec<SessionSummary> {
        self.registry
            .list()
            .iter()
            .map(|session| SessionSummary {
                id: session.id().clone(),
                label: session.label().to_string(),
                addr: session.profile().addr(),
                state: session.state(),
                exit_code: session.exit_code(),
                last_error: session.last_error(),
            })
            .collect()
    }

    fn active_sessions(&self) -> Vec<Arc<Session>> {
        self.registry
            .list()
            .into_iter()
            .filter(|session| session.state() == SessionState::Active)
            .collect()
    }

    fn ensure_running(&self) -> Result<(), MuxError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(MuxError::ShutDown)
        } else {
            Ok(())
        }
    }
}
