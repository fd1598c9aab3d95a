//! Transports: authenticated connections to remote hosts.
//!
//! A [`Transport`] is one open, authenticated connection. It is owned
//! exclusively by the session that created it and closed exactly once, on
//! session teardown. The trait hides the wire protocol behind a pair of
//! byte channels so the session layer never touches SSH types directly.

pub mod memory;
pub mod ssh;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use memory::{MemoryDialer, MemoryTransport, RemoteHarness};
pub use ssh::SshDialer;

/// Errors that can occur on an established transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote side refused to open a session channel.
    #[error("failed to open session channel: {0}")]
    ChannelOpen(String),

    /// The pseudo-terminal request was rejected.
    #[error("pty request rejected: {0}")]
    PtyRequest(String),

    /// The shell request was rejected.
    #[error("shell request rejected: {0}")]
    ShellRequest(String),

    /// An operation was attempted before a shell was opened.
    #[error("no shell is open on this transport")]
    NoShell,

    /// The transport is closed.
    #[error("transport is closed")]
    Closed,

    /// I/O error on the underlying connection.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for the remote pseudo-terminal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal type advertised to the remote side, e.g. `xterm-256color`.
    pub term: String,
    /// Initial width in columns.
    pub cols: u16,
    /// Initial height in rows.
    pub rows: u16,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Byte channels of one open remote shell.
///
/// `input` carries local bytes to the remote shell's stdin. `output`
/// carries the shell's stdout and stderr, in arrival order. `exit`
/// publishes the remote exit code once known.
pub struct ShellIo {
    /// Local-to-remote byte stream.
    pub input: mpsc::Sender<Vec<u8>>,
    /// Remote-to-local byte stream. Closed when the remote side ends.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Remote process exit code, once observed.
    pub exit: watch::Receiver<Option<i32>>,
}

/// One authenticated connection to a remote host.
///
/// Implementations must unblock any pending shell I/O when [`close`] is
/// called, so a stuck pump can always be cancelled.
///
/// [`close`]: Transport::close
#[async_trait]
pub trait Transport: Send + Sync {
    /// Requests a pseudo-terminal and interactive shell.
    ///
    /// Succeeds at most once per transport.
    async fn open_shell(&mut self, pty: PtyRequest) -> Result<ShellIo, TransportError>;

    /// Sends a terminal-size-change notification for the open shell.
    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TransportError>;

    /// Closes the connection. Called exactly once by the owning session.
    async fn close(&mut self) -> Result<(), TransportError>;
}
