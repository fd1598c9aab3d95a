//! Remote shell sessions.
//!
//! A [`Session`] owns one transport, the remote shell opened on it, and the
//! two pumps that move bytes between the local side and the remote shell.
//! Lifecycle: `Connecting -> Active -> Closing -> Closed`, with `Failed`
//! terminal from `Connecting` or `Active`. The session's own tasks are the
//! sole writer of its state; the transport is closed exactly once, during
//! teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::{self, InputError, InputReceiver, InputSender, QueueConfig};
use crate::config::HostProfile;
use crate::transport::{PtyRequest, ShellIo, Transport, TransportError};

/// Stable session identifier. Registries key sessions by it.
pub type SessionId = String;

/// How long teardown waits for the pumps to drain after cancellation.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long teardown waits for an exit status after the shell ends.
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(100);

/// How long teardown waits for the transport to close before force-releasing.
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; transport not yet established or shell not yet open.
    Connecting,
    /// Shell open, pumps running.
    Active,
    /// Teardown in progress.
    Closing,
    /// Torn down cleanly. Terminal.
    Closed,
    /// Never became active, or was force-failed. Terminal.
    Failed,
}

impl SessionState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// One chunk of remote output, tagged with its origin session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Session the bytes came from.
    pub session_id: SessionId,
    /// The session's human-facing label.
    pub label: String,
    /// Raw shell output. Opaque bytes; per-session order preserved.
    pub data: Vec<u8>,
}

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation needs an `Active` session.
    #[error("session {0} is not active")]
    NotActive(SessionId),

    /// The session was already activated once.
    #[error("session {0} already started")]
    AlreadyStarted(SessionId),

    /// The shell request failed during activation.
    #[error("session {id} failed to open a shell: {source}")]
    Shell {
        id: SessionId,
        #[source]
        source: TransportError,
    },

    /// A transport operation failed mid-session.
    #[error("transport error in session {id}: {source}")]
    Transport {
        id: SessionId,
        #[source]
        source: TransportError,
    },

    /// The session's input queue stayed full past the configured timeout.
    #[error("input to session {id} timed out after {timeout:?}")]
    InputTimeout { id: SessionId, timeout: Duration },

    /// The session's input pump is gone.
    #[error("input queue for session {0} closed")]
    InputClosed(SessionId),

    /// The session did not reach a terminal state within the grace period.
    #[error("session {0} did not reach a terminal state within the grace period")]
    GraceExpired(SessionId),
}

/// A remote shell session.
///
/// Construct with [`Session::new`] (state `Connecting`, visible in the
/// registry while the dial is in flight), then [`Session::activate`] with
/// the established transport.
pub struct Session {
    id: SessionId,
    profile: HostProfile,
    state_tx: watch::Sender<SessionState>,
    input_tx: InputSender,
    input_rx: Mutex<Option<InputReceiver>>,
    cancel: CancellationToken,
    transport: Arc<tokio::sync::Mutex<Option<Box<dyn Transport>>>>,
    created_at: SystemTime,
    last_activity: AtomicU64,
    last_error: Mutex<Option<String>>,
    exit_code: Mutex<Option<i32>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Creates a session in `Connecting` state.
    pub fn new(id: SessionId, profile: HostProfile, queue: QueueConfig) -> Self {
        let (input_tx, input_rx) = queue::channel(queue);
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        Self {
            id,
            profile,
            state_tx,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            cancel: CancellationToken::new(),
            transport: Arc::new(tokio::sync::Mutex::new(None)),
            created_at: SystemTime::now(),
            last_activity: AtomicU64::new(now_millis()),
            last_error: Mutex::new(None),
            exit_code: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    /// The session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The profile this session was built from.
    pub fn profile(&self) -> &HostProfile {
        &self.profile
    }

    /// The session's human-facing label.
    pub fn label(&self) -> &str {
        &self.profile.label
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Creation time.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Unix milliseconds of the last byte moved in either direction.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// The last error recorded on this session, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error lock").clone()
    }

    /// Remote exit code, recorded at teardown when obtainable.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().expect("exit_code lock")
    }

    /// Input chunks dropped by the queue's overflow policy so far.
    pub fn input_dropped(&self) -> u64 {
        self.input_tx.dropped()
    }

    /// Opens the remote shell on `transport` and starts the pumps.
    ///
    /// `Connecting -> Active` happens only once the shell request succeeds;
    /// on failure the session becomes `Failed` and the transport is
    /// released.
    pub async fn activate(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
        pty: PtyRequest,
        sink: mpsc::Sender<OutputChunk>,
    ) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            self.fail("closed before activation");
            let mut transport = transport;
            let _ = tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, transport.close()).await;
            return Err(SessionError::NotActive(self.id.clone()));
        }

        let input_rx = self
            .input_rx
            .lock()
            .expect("input_rx lock")
            .take()
            .ok_or_else(|| SessionError::AlreadyStarted(self.id.clone()))?;

        *self.transport.lock().await = Some(transport);

        let shell = {
            let mut guard = self.transport.lock().await;
            let transport = guard.as_mut().ok_or_else(|| SessionError::Shell {
                id: self.id.clone(),
                source: TransportError::Closed,
            })?;
            match transport.open_shell(pty).await {
                Ok(shell) => shell,
                Err(source) => {
                    drop(guard);
                    self.fail(&format!("shell request failed: {source}"));
                    if let Some(mut transport) = self.transport.lock().await.take() {
                        let _ =
                            tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, transport.close()).await;
                    }
                    return Err(SessionError::Shell {
                        id: self.id.clone(),
                        source,
                    });
                }
            }
        };

        self.transition(SessionState::Active);
        tracing::info!(session_id = %self.id, host = %self.profile.addr(), "Session active");
        self.spawn_pumps(shell, sink, input_rx);
        Ok(())
    }

    /// Marks a never-activated session as `Failed`, retaining the error.
    pub fn fail(&self, reason: &str) {
        self.record_error(reason);
        self.transition(SessionState::Failed);
        self.cancel.cancel();
        tracing::warn!(session_id = %self.id, reason = %reason, "Session failed");
    }

    /// Queues local input for the remote shell.
    pub async fn send_input(&self, chunk: Vec<u8>) -> Result<(), SessionError> {
        if self.state() != SessionState::Active {
            return Err(SessionError::NotActive(self.id.clone()));
        }
        self.input_tx.send(chunk).await.map_err(|err| match err {
            InputError::Timeout(timeout) => SessionError::InputTimeout {
                id: self.id.clone(),
                timeout,
            },
            InputError::Closed => SessionError::InputClosed(self.id.clone()),
        })
    }

    /// Sends a terminal-size-change notification.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.state() != SessionState::Active {
            return Err(SessionError::NotActive(self.id.clone()));
        }
        let mut guard = self.transport.lock().await;
        match guard.as_mut() {
            Some(transport) => {
                transport
                    .resize(cols, rows)
                    .await
                    .map_err(|source| SessionError::Transport {
                        id: self.id.clone(),
                        source,
                    })
            }
            None => Err(SessionError::NotActive(self.id.clone())),
        }
    }

    /// Requests teardown. Idempotent: closing an already closing, closed
    /// or failed session is a no-op.
    pub fn close(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_terminal() || state == SessionState::Closing {
            return Ok(());
        }
        tracing::debug!(session_id = %self.id, "Close requested");
        self.cancel.cancel();
        Ok(())
    }

    /// Waits until the session reaches a terminal state.
    pub async fn wait_terminal(&self, grace: Duration) -> Result<SessionState, SessionError> {
        let mut rx = self.state_tx.subscribe();
        let waited = tokio::time::timeout(grace, async {
            loop {
                let state = *rx.borrow_and_update();
                if state.is_terminal() {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        })
        .await;
        waited.map_err(|_| SessionError::GraceExpired(self.id.clone()))
    }

    /// Force-releases a session that did not converge within the grace
    /// period: aborts its tasks, closes the transport best-effort, and
    /// marks it `Closed`.
    pub async fn force_release(&self) {
        tracing::warn!(session_id = %self.id, "Force-releasing session");
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.lock().expect("supervisor lock").take() {
            handle.abort();
        }
        if let Ok(mut guard) =
            tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, self.transport.lock()).await
        {
            if let Some(mut transport) = guard.take() {
                let _ = tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, transport.close()).await;
            }
        }
        self.transition(SessionState::Closed);
    }

    fn spawn_pumps(
        self: &Arc<Self>,
        shell: ShellIo,
        sink: mpsc::Sender<OutputChunk>,
        mut input_rx: InputReceiver,
    ) {
        let ShellIo {
            input: shell_in,
            output: mut shell_out,
            exit: mut exit_rx,
        } = shell;

        // Either pump finishing triggers teardown in the supervisor.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

        let input_pump = tokio::spawn({
            let session = Arc::clone(self);
            let done = done_tx.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = session.cancel.cancelled() => break,
                        chunk = input_rx.recv() => match chunk {
                            Some(bytes) => {
                                if shell_in.send(bytes).await.is_err() {
                                    session.record_error("remote shell input closed");
                                    break;
                                }
                                session.touch();
                            }
                            None => break,
                        },
                    }
                }
                let _ = done.send(()).await;
            }
        });

        let output_pump = tokio::spawn({
            let session = Arc::clone(self);
            let done = done_tx;
            async move {
                loop {
                    tokio::select! {
                        _ = session.cancel.cancelled() => break,
                        out = shell_out.recv() => match out {
                            Some(data) => {
                                session.touch();
                                let chunk = OutputChunk {
                                    session_id: session.id.clone(),
                                    label: session.profile.label.clone(),
                                    data,
                                };
                                if sink.send(chunk).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                tracing::debug!(session_id = %session.id, "Remote shell EOF");
                                break;
                            }
                        },
                    }
                }
                let _ = done.send(()).await;
            }
        });

        let supervisor = tokio::spawn({
            let session = Arc::clone(self);
            let mut input_pump = input_pump;
            let mut output_pump = output_pump;
            async move {
                tokio::select! {
                    _ = session.cancel.cancelled() => {}
                    _ = done_rx.recv() => {}
                }
                session.transition(SessionState::Closing);
                session.cancel.cancel();

                if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut input_pump)
                    .await
                    .is_err()
                {
                    input_pump.abort();
                }
                if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut output_pump)
                    .await
                    .is_err()
                {
                    output_pump.abort();
                }

                // The exit status usually trails the shell's EOF slightly.
                if exit_rx.borrow().is_none() {
                    let _ = tokio::time::timeout(EXIT_STATUS_WAIT, exit_rx.changed()).await;
                }
                if let Some(code) = *exit_rx.borrow() {
                    *session.exit_code.lock().expect("exit_code lock") = Some(code);
                }

                // Close the transport exactly once; a transport that does
                // not answer within the timeout is force-released.
                if let Some(mut transport) = session.transport.lock().await.take() {
                    if tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, transport.close())
                        .await
                        .is_err()
                    {
                        tracing::warn!(
                            session_id = %session.id,
                            "Transport unresponsive on close, force-released"
                        );
                    }
                }

                session.transition(SessionState::Closed);
                tracing::info!(
                    session_id = %session.id,
                    exit_code = ?session.exit_code(),
                    "Session closed"
                );
            }
        });

        *self.supervisor.lock().expect("supervisor lock") = Some(supervisor);
    }

    /// Applies a transition unless a terminal state was already reached.
    fn transition(&self, to: SessionState) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == to {
                false
            } else {
                tracing::debug!(session_id = %self.id, from = ?state, to = ?to, "State transition");
                *state = to;
                true
            }
        });
    }

    fn record_error(&self, reason: &str) {
        *self.last_error.lock().expect("last_error lock") = Some(reason.to_string());
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::queue::Overflow;
    use crate::transport::memory::{MemoryOptions, MemoryTransport};

    fn profile() -> HostProfile {
        HostProfile::password("h1", "h1", 22, "alice", "pw")
    }

    fn new_session() -> Arc<Session> {
        Arc::new(Session::new(
            "h1".to_string(),
            profile(),
            QueueConfig::default(),
        ))
    }

    async fn active_session() -> (
        Arc<Session>,
        crate::transport::memory::RemoteHarness,
        mpsc::Receiver<OutputChunk>,
    ) {
        let session = new_session();
        let (transport, harness) = MemoryTransport::new("h1:22", MemoryOptions::default());
        let (sink, sink_rx) = mpsc::channel(64);
        session
            .activate(
                Box::new(transport),
                PtyRequest::default(),
                sink,
            )
            .await
            .unwrap();
        (session, harness, sink_rx)
    }

    #[tokio::test]
    async fn test_activation_reaches_active() {
        let (session, mut harness, _rx) = active_session().await;
        assert_eq!(session.state(), SessionState::Active);

        let pty = harness.ptys.recv().await.unwrap();
        assert_eq!(pty, PtyRequest::default());
    }

    #[tokio::test]
    async fn test_shell_failure_becomes_failed() {
        let session = new_session();
        let options = MemoryOptions {
            fail_shell: true,
            ..Default::default()
        };
        let (transport, harness) = MemoryTransport::new("h1:22", options);
        let (sink, _rx) = mpsc::channel(8);

        let err = session
            .activate(Box::new(transport), PtyRequest::default(), sink)
            .await
            .err()
            .expect("activation must fail");
        assert!(matches!(err, SessionError::Shell { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.last_error().unwrap().contains("shell request"));
        // The transport was released.
        assert!(harness.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_double_activation_rejected() {
        let (session, _harness, _rx) = active_session().await;
        let (transport, _h2) = MemoryTransport::new("h1:22", MemoryOptions::default());
        let (sink, _sink_rx) = mpsc::channel(8);
        let err = session
            .activate(Box::new(transport), PtyRequest::default(), sink)
            .await
            .err()
            .expect("second activation must fail");
        assert!(matches!(err, SessionError::AlreadyStarted(_)));
    }

    #[tokio::test]
    async fn test_input_reaches_remote_in_order() {
        let (session, mut harness, _rx) = active_session().await;
        let before = session.last_activity();

        session.send_input(b"ls".to_vec()).await.unwrap();
        session.send_input(b" -l\n".to_vec()).await.unwrap();

        let mut got = Vec::new();
        while got.len() < 6 {
            let chunk = harness
                .next_received(Duration::from_secs(1))
                .await
                .expect("input must arrive");
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, b"ls -l\n");
        assert!(session.last_activity() >= before);
        assert!(session.created_at() <= SystemTime::now());

        let _ = session.close();
    }

    #[tokio::test]
    async fn test_input_overflow_is_counted() {
        let session = Arc::new(Session::new(
            "h1".to_string(),
            profile(),
            QueueConfig {
                capacity: 2,
                overflow: Overflow::DropOldest,
            },
        ));
        let options = MemoryOptions {
            shell_capacity: 1,
            ..Default::default()
        };
        let (transport, mut harness) = MemoryTransport::new("h1:22", options);
        let (sink, _rx) = mpsc::channel(8);
        session
            .activate(Box::new(transport), PtyRequest::default(), sink)
            .await
            .unwrap();

        // The remote never reads, so the pump stalls and the queue
        // evicts oldest chunks without ever blocking the sender.
        for i in 0..16u8 {
            session.send_input(vec![i]).await.unwrap();
        }

        // Draining unblocks the pump, which then observes the overflow.
        let mut drained = 0;
        while session.input_dropped() == 0 && drained < 16 {
            match harness.next_received(Duration::from_millis(500)).await {
                Some(_) => drained += 1,
                None => break,
            }
        }
        assert!(session.input_dropped() > 0);
    }

    #[tokio::test]
    async fn test_subscribe_observes_teardown() {
        let (session, _harness, _rx) = active_session().await;
        let mut states = session.subscribe();
        assert_eq!(*states.borrow_and_update(), SessionState::Active);

        session.close().unwrap();
        loop {
            states.changed().await.unwrap();
            let state = *states.borrow_and_update();
            if state == SessionState::Closed {
                break;
            }
            assert_eq!(state, SessionState::Closing);
        }
    }

    #[tokio::test]
    async fn test_output_tagged_and_ordered() {
        let (session, harness, mut rx) = active_session().await;

        harness.inject.send(b"one ".to_vec()).await.unwrap();
        harness.inject.send(b"two".to_vec()).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.session_id, "h1");
        assert_eq!(first.label, "h1");
        assert_eq!(first.data, b"one ");
        assert_eq!(second.data, b"two");

        let _ = session.close();
    }

    #[tokio::test]
    async fn test_remote_eof_closes_session() {
        let (session, harness, _rx) = active_session().await;

        harness.exit.send(Some(42)).unwrap();
        drop(harness.inject); // remote output ends

        let state = session.wait_terminal(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, SessionState::Closed);
        assert_eq!(session.exit_code(), Some(42));
        assert!(harness.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _harness, _rx) = active_session().await;

        session.close().unwrap();
        let state = session.wait_terminal(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, SessionState::Closed);

        // Closing again is a silent no-op.
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_input_after_close_rejected() {
        let (session, _harness, _rx) = active_session().await;
        session.close().unwrap();
        session.wait_terminal(Duration::from_secs(5)).await.unwrap();

        let err = session.send_input(b"x".to_vec()).await.err();
        assert!(matches!(err, Some(SessionError::NotActive(_))));
    }

    #[tokio::test]
    async fn test_resize_only_when_active() {
        let session = new_session();
        let err = session.resize(100, 40).await.err();
        assert!(matches!(err, Some(SessionError::NotActive(_))));

        let (session, mut harness, _rx) = active_session().await;
        session.resize(120, 50).await.unwrap();
        assert_eq!(harness.resizes.recv().await, Some((120, 50)));

        session.close().unwrap();
        session.wait_terminal(Duration::from_secs(5)).await.unwrap();
        let err = session.resize(80, 24).await.err();
        assert!(matches!(err, Some(SessionError::NotActive(_))));
    }

    #[tokio::test]
    async fn test_stays_active_without_traffic() {
        let (session, _harness, _rx) = active_session().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_transport_still_closes() {
        let session = new_session();
        let options = MemoryOptions {
            hang_on_close: true,
            ..Default::default()
        };
        let (transport, _harness) = MemoryTransport::new("h1:22", options);
        let (sink, _rx) = mpsc::channel(8);
        session
            .activate(Box::new(transport), PtyRequest::default(), sink)
            .await
            .unwrap();

        session.close().unwrap();
        let state = session.wait_terminal(Duration::from_secs(10)).await.unwrap();
        assert_eq!(state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_fail_records_reason() {
        let session = new_session();
        session.fail("authentication failed for alice@h1:22");
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.last_error().unwrap().contains("authentication"));

        // Terminal state is sticky.
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Failed);
    }
}
