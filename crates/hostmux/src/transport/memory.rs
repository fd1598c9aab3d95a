//! In-process loopback transport.
//!
//! Backs the test suite: a [`MemoryTransport`] wires the session's shell
//! channels straight to a [`RemoteHarness`] that the test holds, so tests
//! can observe exactly what the "remote shell" received, inject output,
//! and script dial failures without any network.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{PtyRequest, ShellIo, Transport, TransportError};
use crate::config::HostProfile;
use crate::connect::{ConnectError, Dial};

/// Default capacity of the local-to-remote data channel.
const DEFAULT_SHELL_CAPACITY: usize = 32;

/// Behavior knobs for one scripted successful dial.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Capacity of the local-to-remote data channel. A tiny capacity with
    /// a harness that never drains models an unresponsive remote.
    pub shell_capacity: usize,
    /// Fail the shell request after a successful dial.
    pub fail_shell: bool,
    /// Make `close` hang forever, modeling an unresponsive transport.
    pub hang_on_close: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            shell_capacity: DEFAULT_SHELL_CAPACITY,
            fail_shell: false,
            hang_on_close: false,
        }
    }
}

/// Scripted outcome of one dial attempt.
#[derive(Debug, Clone)]
pub enum DialPlan {
    /// Produce a working transport.
    Succeed(MemoryOptions),
    /// Fail with a dial timeout (transient).
    Timeout,
    /// Fail with connection refused (transient).
    Refused,
    /// Fail authentication (not transient).
    AuthFailed,
    /// Fail host verification (not transient).
    HostRejected,
}

impl DialPlan {
    /// A plain successful dial.
    pub fn succeed() -> Self {
        DialPlan::Succeed(MemoryOptions::default())
    }
}

/// The far end of a memory transport, held by the test.
pub struct RemoteHarness {
    /// Bytes the local side wrote to the remote shell's stdin.
    pub received: mpsc::Receiver<Vec<u8>>,
    /// Injects remote shell output toward the local side.
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Publishes the remote exit code.
    pub exit: watch::Sender<Option<i32>>,
    /// Window-change notifications, in order.
    pub resizes: mpsc::UnboundedReceiver<(u16, u16)>,
    /// Pty requests made on this transport.
    pub ptys: mpsc::UnboundedReceiver<PtyRequest>,
    /// Set once the transport has been closed.
    pub closed: Arc<AtomicBool>,
}

impl RemoteHarness {
    /// Drains everything received so far into one buffer.
    pub fn drain_received(&mut self) -> Vec<u8> {
        let mut all = Vec::new();
        while let Ok(chunk) = self.received.try_recv() {
            all.extend_from_slice(&chunk);
        }
        all
    }

    /// Waits for the next received chunk.
    pub async fn next_received(&mut self, wait: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(wait, self.received.recv()).await.ok()?
    }
}

struct ShellParts {
    input_tx: mpsc::Sender<Vec<u8>>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

/// An in-process transport whose far end is a [`RemoteHarness`].
pub struct MemoryTransport {
    addr: String,
    options: MemoryOptions,
    parts: Option<ShellParts>,
    resize_tx: mpsc::UnboundedSender<(u16, u16)>,
    pty_tx: mpsc::UnboundedSender<PtyRequest>,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Creates a transport and its far-end harness.
    pub fn new(addr: impl Into<String>, options: MemoryOptions) -> (Self, RemoteHarness) {
        let (input_tx, received_rx) = mpsc::channel(options.shell_capacity);
        let (inject_tx, output_rx) = mpsc::channel(DEFAULT_SHELL_CAPACITY.max(256));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (resize_tx, resizes_rx) = mpsc::unbounded_channel();
        let (pty_tx, ptys_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Self {
            addr: addr.into(),
            options,
            parts: Some(ShellParts {
                input_tx,
                output_rx,
                exit_rx,
            }),
            resize_tx,
            pty_tx,
            closed: Arc::clone(&closed),
        };
        let harness = RemoteHarness {
            received: received_rx,
            inject: inject_tx,
            exit: exit_tx,
            resizes: resizes_rx,
            ptys: ptys_rx,
            closed,
        };
        (transport, harness)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_shell(&mut self, pty: PtyRequest) -> Result<ShellIo, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.options.fail_shell {
            return Err(TransportError::ShellRequest(
                "scripted shell failure".to_string(),
            ));
        }
        let parts = self.parts.take().ok_or(TransportError::ChannelOpen(
            "shell already open".to_string(),
        ))?;
        let _ = self.pty_tx.send(pty);
        Ok(ShellIo {
            input: parts.input_tx,
            output: parts.output_rx,
            exit: parts.exit_rx,
        })
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.resize_tx
            .send((cols, rows))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.options.hang_on_close {
            tracing::debug!(addr = %self.addr, "Memory transport hanging on close (scripted)");
            std::future::pending::<()>().await;
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted dialer over memory transports.
///
/// Outcomes are scripted per profile id and consumed in order; an empty
/// script dials successfully with default options. Clones share state so
/// a test can keep a handle while the factory owns another.
#[derive(Clone)]
pub struct MemoryDialer {
    plans: Arc<Mutex<HashMap<String, VecDeque<DialPlan>>>>,
    remotes: Arc<Mutex<HashMap<String, RemoteHarness>>>,
    attempts: Arc<AtomicU32>,
}

impl MemoryDialer {
    /// Creates a dialer with no scripted outcomes.
    pub fn new() -> Self {
        Self {
            plans: Arc::new(Mutex::new(HashMap::new())),
            remotes: Arc::new(Mutex::new(HashMap::new())),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Scripts the outcomes of the next dials for `id`, consumed in order.
    pub fn script(&self, id: impl Into<String>, outcomes: Vec<DialPlan>) {
        self.plans
            .lock()
            .expect("dialer plans lock")
            .entry(id.into())
            .or_default()
            .extend(outcomes);
    }

    /// Total dial attempts across all profiles.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Takes the remote harness of the last successful dial for `id`.
    pub fn take_remote(&self, id: &str) -> Option<RemoteHarness> {
        self.remotes.lock().expect("dialer remotes lock").remove(id)
    }
}

impl Default for MemoryDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dial for MemoryDialer {
    async fn dial(&self, profile: &HostProfile) -> Result<Box<dyn Transport>, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .expect("dialer plans lock")
            .get_mut(&profile.id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(DialPlan::succeed);

        let addr = profile.addr();
        match plan {
            DialPlan::Succeed(options) => {
                let (transport, harness) = MemoryTransport::new(addr, options);
                self.remotes
                    .lock()
                    .expect("dialer remotes lock")
                    .insert(profile.id.clone(), harness);
                Ok(Box::new(transport))
            }
            DialPlan::Timeout => Err(ConnectError::DialTimeout {
                addr,
                timeout: Duration::from_secs(10),
            }),
            DialPlan::Refused => Err(ConnectError::Io {
                addr,
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            }),
            DialPlan::AuthFailed => Err(ConnectError::AuthFailed {
                addr,
                user: profile.username.clone(),
            }),
            DialPlan::HostRejected => Err(ConnectError::HostRejected { addr }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_io_roundtrip() {
        let (mut transport, mut harness) =
            MemoryTransport::new("h1:22", MemoryOptions::default());
        let mut io = transport.open_shell(PtyRequest::default()).await.unwrap();

        io.input.send(b"ls\n".to_vec()).await.unwrap();
        let got = harness.next_received(Duration::from_secs(1)).await;
        assert_eq!(got.as_deref(), Some(&b"ls\n"[..]));

        harness.inject.send(b"file.txt\n".to_vec()).await.unwrap();
        assert_eq!(io.output.recv().await.as_deref(), Some(&b"file.txt\n"[..]));

        let pty = harness.ptys.recv().await.unwrap();
        assert_eq!(pty.term, "xterm-256color");
    }

    #[tokio::test]
    async fn test_open_shell_only_once() {
        let (mut transport, _harness) =
            MemoryTransport::new("h1:22", MemoryOptions::default());
        assert!(transport.open_shell(PtyRequest::default()).await.is_ok());
        assert!(matches!(
            transport.open_shell(PtyRequest::default()).await,
            Err(TransportError::ChannelOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_shell_failure() {
        let options = MemoryOptions {
            fail_shell: true,
            ..Default::default()
        };
        let (mut transport, _harness) = MemoryTransport::new("h1:22", options);
        assert!(matches!(
            transport.open_shell(PtyRequest::default()).await,
            Err(TransportError::ShellRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_resize_reaches_harness() {
        let (mut transport, mut harness) =
            MemoryTransport::new("h1:22", MemoryOptions::default());
        transport.resize(120, 40).await.unwrap();
        assert_eq!(harness.resizes.recv().await, Some((120, 40)));
    }

    #[tokio::test]
    async fn test_close_marks_closed() {
        let (mut transport, harness) =
            MemoryTransport::new("h1:22", MemoryOptions::default());
        transport.close().await.unwrap();
        assert!(harness.closed.load(Ordering::SeqCst));
        assert!(matches!(
            transport.open_shell(PtyRequest::default()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dialer_scripts_consumed_in_order() {
        let dialer = MemoryDialer::new();
        dialer.script("h1", vec![DialPlan::Refused, DialPlan::succeed()]);
        let profile = HostProfile::password("h1", "h1", 22, "alice", "pw");

        assert!(dialer.dial(&profile).await.is_err());
        assert!(dialer.dial(&profile).await.is_ok());
        assert_eq!(dialer.attempts(), 2);
        assert!(dialer.take_remote("h1").is_some());
        assert!(dialer.take_remote("h1").is_none());
    }
}
