//! Connection establishment with timeout, retry and host trust policy.
//!
//! The [`ConnectionFactory`] wraps a [`Dial`] implementation with the retry
//! policy: a bounded number of attempts with exponential backoff, retrying
//! only transient failures. Authentication failures and host-key rejections
//! surface immediately.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::HostProfile;
use crate::transport::Transport;

/// How server host keys are verified during the handshake.
///
/// There is no silent accept-all default: trusting every host key is an
/// explicit, caller-chosen opt-in for lab use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostVerification {
    /// Reject keys not present in the known-hosts file. The default.
    RejectUnknown {
        /// Known-hosts file to check against. `None` uses the standard
        /// per-user location.
        known_hosts: Option<PathBuf>,
    },
    /// Accept any host key. Lab use only.
    AcceptAll,
}

impl Default for HostVerification {
    fn default() -> Self {
        HostVerification::RejectUnknown { known_hosts: None }
    }
}

/// Errors from connection establishment.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The dial did not complete within the configured timeout.
    #[error("dial to {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    /// The server rejected the offered credentials. Never retried.
    #[error("authentication failed for {user}@{addr}")]
    AuthFailed { addr: String, user: String },

    /// The server's host key failed the verification policy. Never retried.
    #[error("host key for {addr} rejected by verification policy")]
    HostRejected { addr: String },

    /// Credential material could not be loaded. Never retried.
    #[error("cannot load key file {path}: {reason}")]
    Credential { path: PathBuf, reason: String },

    /// All attempts failed; carries the last attempt's error.
    #[error("all {attempts} connection attempts to {addr} failed: {last}")]
    RetriesExhausted {
        addr: String,
        attempts: u32,
        #[source]
        last: Box<ConnectError>,
    },

    /// Network-level I/O failure while dialing. Retried as transient.
    #[error("I/O error dialing {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Protocol-level SSH failure.
    #[error("ssh error dialing {addr}: {source}")]
    Ssh {
        addr: String,
        #[source]
        source: russh::Error,
    },
}

impl ConnectError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Dial-phase I/O errors (refused, reset, unreachable, failed name
    /// lookup) count as transient; rejections by policy or by the server
    /// do not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectError::DialTimeout { .. } | ConnectError::Io { .. }
        )
    }
}

/// Establishes one authenticated transport to one host.
///
/// Separated from [`ConnectionFactory`] so the retry policy can be tested
/// against scripted dialers and so lab setups can swap the wire protocol.
#[async_trait]
pub trait Dial: Send + Sync {
    /// Dials and authenticates a single attempt. No retry logic here.
    async fn dial(&self, profile: &HostProfile) -> Result<Box<dyn Transport>, ConnectError>;
}

/// Retry and timeout policy for connection establishment.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Per-attempt timeout covering dial plus authentication.
    pub timeout: Duration,
    /// Retries after the first attempt; `max_retries = 2` means three
    /// attempts in total.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
        }
    }
}

/// Dial plus retry policy.
pub struct ConnectionFactory {
    dialer: Box<dyn Dial>,
    policy: RetryPolicy,
}

impl ConnectionFactory {
    /// Creates a factory around an arbitrary dialer.
    pub fn new(dialer: Box<dyn Dial>, policy: RetryPolicy) -> Self {
        Self { dialer, policy }
    }

    /// Creates an SSH-backed factory with the given trust policy.
    pub fn ssh(verification: HostVerification, policy: RetryPolicy) -> Self {
        Self::new(
            Box::new(crate::transport::SshDialer::new(verification)),
            policy,
        )
    }

    /// The configured policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Establishes an authenticated transport to `profile`.
    ///
    /// Transient failures are retried up to `max_retries` times with
    /// exponential backoff; non-transient failures return immediately.
    pub async fn connect(&self, profile: &HostProfile) -> Result<Box<dyn Transport>, ConnectError> {
        let addr = profile.addr();
        let mut delay = self.policy.backoff_base;
        let mut last: Option<ConnectError> = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                tracing::debug!(addr = %addr, attempt, delay = ?delay, "Backing off before retry");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.policy.backoff_cap);
            }

            match tokio::time::timeout(self.policy.timeout, self.dialer.dial(profile)).await {
                Ok(Ok(transport)) => {
                    tracing::info!(addr = %addr, attempt, "Connected");
                    return Ok(transport);
                }
                Ok(Err(err)) if err.is_transient() => {
                    tracing::warn!(addr = %addr, attempt, error = %err, "Transient dial failure");
                    last = Some(err);
                }
                Ok(Err(err)) => {
                    tracing::warn!(addr = %addr, attempt, error = %err, "Dial rejected");
                    return Err(err);
                }
                Err(_) => {
                    tracing::warn!(addr = %addr, attempt, timeout = ?self.policy.timeout, "Dial timed out");
                    last = Some(ConnectError::DialTimeout {
                        addr: addr.clone(),
                        timeout: self.policy.timeout,
                    });
                }
            }
        }

        match last {
            Some(err) => Err(ConnectError::RetriesExhausted {
                addr,
                attempts: self.policy.max_retries + 1,
                last: Box::new(err),
            }),
            // The loop always runs at least once and every continue sets
            // `last`, so this arm is unreachable in practice.
            None => Err(ConnectError::DialTimeout {
                addr,
                timeout: self.policy.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{DialPlan, MemoryDialer};

    fn profile() -> HostProfile {
        HostProfile::password("h1", "h1", 22, "alice", "pw")
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
        }
    }

    #[test]
    fn test_transient_classification() {
        let timeout = ConnectError::DialTimeout {
            addr: "h:22".into(),
            timeout: Duration::from_secs(1),
        };
        let refused = ConnectError::Io {
            addr: "h:22".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        let auth = ConnectError::AuthFailed {
            addr: "h:22".into(),
            user: "alice".into(),
        };
        let rejected = ConnectError::HostRejected { addr: "h:22".into() };

        assert!(timeout.is_transient());
        assert!(refused.is_transient());
        assert!(!auth.is_transient());
        assert!(!rejected.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_after_three_attempts() {
        let dialer = MemoryDialer::new();
        dialer.script("h1", vec![DialPlan::Timeout; 5]);
        let factory = ConnectionFactory::new(Box::new(dialer.clone()), policy());

        let err = factory.connect(&profile()).await.err().expect("must fail");
        assert_eq!(dialer.attempts(), 3);
        match err {
            ConnectError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ConnectError::DialTimeout { .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_not_retried() {
        let dialer = MemoryDialer::new();
        dialer.script("h1", vec![DialPlan::AuthFailed]);
        let factory = ConnectionFactory::new(Box::new(dialer.clone()), policy());

        let err = factory.connect(&profile()).await.err().expect("must fail");
        assert_eq!(dialer.attempts(), 1);
        assert!(matches!(err, ConnectError::AuthFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_rejection_not_retried() {
        let dialer = MemoryDialer::new();
        dialer.script("h1", vec![DialPlan::HostRejected]);
        let factory = ConnectionFactory::new(Box::new(dialer.clone()), policy());

        let err = factory.connect(&profile()).await.err().expect("must fail");
        assert_eq!(dialer.attempts(), 1);
        assert!(matches!(err, ConnectError::HostRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let dialer = MemoryDialer::new();
        dialer.script("h1", vec![DialPlan::Refused, DialPlan::succeed()]);
        let factory = ConnectionFactory::new(Box::new(dialer.clone()), policy());

        let transport = factory.connect(&profile()).await;
        assert!(transport.is_ok());
        assert_eq!(dialer.attempts(), 2);
    }

    #[test]
    fn test_verification_default_rejects_unknown() {
        assert_eq!(
            HostVerification::default(),
            HostVerification::RejectUnknown { known_hosts: None }
        );
    }
}
