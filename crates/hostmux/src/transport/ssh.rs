//! SSH transport backed by russh.
//!
//! Each transport owns one authenticated `russh` client handle. Opening a
//! shell requests a pty and an interactive shell on a session channel, then
//! spawns a driver task that owns the channel: it forwards queued input,
//! window-change requests and remote output between the channel and the
//! [`ShellIo`] byte channels.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect, Pty};
use tokio::sync::{mpsc, watch};

use super::{PtyRequest, ShellIo, Transport, TransportError};
use crate::config::{Credential, HostProfile};
use crate::connect::{ConnectError, Dial, HostVerification};

/// Capacity of the local-to-remote input channel.
const INPUT_CAPACITY: usize = 64;

/// Capacity of the remote-to-local output channel.
const OUTPUT_CAPACITY: usize = 256;

/// Terminal modes requested with the pty, matching a plain interactive
/// client: echo on, 14.4k in/out speed.
const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Commands forwarded to the channel driver task.
enum ShellCtrl {
    Data(Vec<u8>),
    Resize(u16, u16),
}

/// russh client handler that applies the host verification policy.
struct HostCheck {
    host: String,
    port: u16,
    verification: HostVerification,
}

#[async_trait]
impl client::Handler for HostCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.verification {
            HostVerification::AcceptAll => {
                tracing::warn!(
                    host = %self.host,
                    port = self.port,
                    "Accepting host key without verification (accept-all policy)"
                );
                Ok(true)
            }
            HostVerification::RejectUnknown { known_hosts } => {
                let known = match known_hosts {
                    Some(path) => russh_keys::check_known_hosts_path(
                        &self.host,
                        self.port,
                        server_public_key,
                        path,
                    ),
                    None => {
                        russh_keys::check_known_hosts(&self.host, self.port, server_public_key)
                    }
                };
                match known {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        tracing::warn!(
                            host = %self.host,
                            port = self.port,
                            "Host key not present in known hosts, rejecting"
                        );
                        Ok(false)
                    }
                    Err(err) => {
                        tracing::warn!(
                            host = %self.host,
                            port = self.port,
                            error = %err,
                            "Known-hosts check failed, rejecting"
                        );
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Dials SSH transports with a fixed host verification policy.
pub struct SshDialer {
    verification: HostVerification,
}

impl SshDialer {
    /// Creates a dialer with the given trust policy.
    pub fn new(verification: HostVerification) -> Self {
        Self { verification }
    }
}

#[async_trait]
impl Dial for SshDialer {
    async fn dial(&self, profile: &HostProfile) -> Result<Box<dyn Transport>, ConnectError> {
        let transport = SshTransport::establish(profile, self.verification.clone()).await?;
        Ok(Box::new(transport))
    }
}

/// One authenticated SSH connection.
pub struct SshTransport {
    handle: client::Handle<HostCheck>,
    addr: String,
    ctrl: Option<mpsc::Sender<ShellCtrl>>,
    closed: bool,
}

impl SshTransport {
    /// Dials `profile` and authenticates. A single attempt, no retries.
    pub async fn establish(
        profile: &HostProfile,
        verification: HostVerification,
    ) -> Result<Self, ConnectError> {
        let addr = profile.addr();
        let config = Arc::new(client::Config::default());
        let handler = HostCheck {
            host: profile.host.clone(),
            port: profile.port,
            verification,
        };

        let mut handle =
            client::connect(config, (profile.host.as_str(), profile.port), handler)
                .await
                .map_err(|err| map_ssh_error(&addr, err))?;

        let authenticated = match &profile.credential {
            Credential::Password(password) => handle
                .authenticate_password(&profile.username, password)
                .await
                .map_err(|err| map_ssh_error(&addr, err))?,
            Credential::KeyFile { path, passphrase } => {
                let key = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(
                    |err| ConnectError::Credential {
                        path: path.clone(),
                        reason: err.to_string(),
                    },
                )?;
                handle
                    .authenticate_publickey(&profile.username, Arc::new(key))
                    .await
                    .map_err(|err| map_ssh_error(&addr, err))?
            }
        };

        if !authenticated {
            return Err(ConnectError::AuthFailed {
                addr,
                user: profile.username.clone(),
            });
        }

        tracing::debug!(addr = %addr, user = %profile.username, "SSH authentication succeeded");

        Ok(Self {
            handle,
            addr,
            ctrl: None,
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_shell(&mut self, pty: PtyRequest) -> Result<ShellIo, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|err| TransportError::ChannelOpen(err.to_string()))?;

        channel
            .request_pty(
                false,
                &pty.term,
                u32::from(pty.cols),
                u32::from(pty.rows),
                0,
                0,
                TERMINAL_MODES,
            )
            .await
            .map_err(|err| TransportError::PtyRequest(err.to_string()))?;

        channel
            .request_shell(false)
            .await
            .map_err(|err| TransportError::ShellRequest(err.to_string()))?;

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CAPACITY);
        let (ctrl_tx, ctrl_rx) = mpsc::channel::<ShellCtrl>(INPUT_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        self.ctrl = Some(ctrl_tx.clone());

        // Bridge the plain input channel onto the ctrl channel so the
        // driver has a single command stream.
        tokio::spawn(async move {
            let mut input_rx = input_rx;
            while let Some(bytes) = input_rx.recv().await {
                if ctrl_tx.send(ShellCtrl::Data(bytes)).await.is_err() {
                    break;
                }
            }
        });

        let addr = self.addr.clone();
        tokio::spawn(drive_channel(channel, ctrl_rx, output_tx, exit_tx, addr));

        tracing::debug!(addr = %self.addr, term = %pty.term, cols = pty.cols, rows = pty.rows, "Opened remote shell");

        Ok(ShellIo {
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let ctrl = self.ctrl.as_ref().ok_or(TransportError::NoShell)?;
        ctrl.send(ShellCtrl::Resize(cols, rows))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Dropping the ctrl sender stops the driver, which closes the
        // channel; the disconnect below unblocks anything still pending.
        self.ctrl = None;
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            tracing::debug!(addr = %self.addr, error = %err, "Disconnect error ignored");
        }
        tracing::debug!(addr = %self.addr, "SSH transport closed");
        Ok(())
    }
}

/// Owns the session channel: forwards input and resize requests out,
/// output and exit status back. Ends when either side closes.
async fn drive_channel(
    mut channel: russh::Channel<client::Msg>,
    mut ctrl_rx: mpsc::Receiver<ShellCtrl>,
    output_tx: mpsc::Sender<Vec<u8>>,
    exit_tx: watch::Sender<Option<i32>>,
    addr: String,
) {
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if output_tx.send(data.to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    // Remote stderr; same local sink, arrival order kept.
                    if output_tx.send(data.to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    let _ = exit_tx.send(Some(exit_status as i32));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                    tracing::debug!(addr = %addr, "Remote shell closed");
                    break;
                }
                Some(_) => {}
                None => break,
            },
            cmd = ctrl_rx.recv() => match cmd {
                Some(ShellCtrl::Data(bytes)) => {
                    if channel.data(&bytes[..]).await.is_err() {
                        tracing::debug!(addr = %addr, "Channel write failed");
                        break;
                    }
                }
                Some(ShellCtrl::Resize(cols, rows)) => {
                    if let Err(err) = channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await
                    {
                        tracing::debug!(addr = %addr, error = %err, "Window change failed");
                    }
                }
                None => {
                    // Input side closed: signal EOF and stop driving.
                    let _ = channel.eof().await;
                    break;
                }
            },
        }
    }
    let _ = channel.close().await;
    // output_tx drops here; the session sees remote EOF.
}

fn map_ssh_error(addr: &str, err: russh::Error) -> ConnectError {
    match err {
        russh::Error::UnknownKey => ConnectError::HostRejected {
            addr: addr.to_string(),
        },
        russh::Error::IO(source) => ConnectError::Io {
            addr: addr.to_string(),
            source,
        },
        other => ConnectError::Ssh {
            addr: addr.to_string(),
            source: other,
        },
    }
}
