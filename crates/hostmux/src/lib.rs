//! # hostmux
//!
//! Interactive SSH session manager for a fleet of hosts: connect to many
//! machines at once, type into one of them or all of them, and watch their
//! output stream back tagged by origin.
//!
//! ## Overview
//!
//! - **Host profiles**: one-line `k=v` records describing how to reach and
//!   authenticate against each host
//! - **Connection factory**: dials with a per-attempt timeout and bounded
//!   exponential-backoff retries for transient failures
//! - **Sessions**: one remote shell per host, with a pseudo-terminal, a
//!   bounded input queue, and concurrent input/output pumps
//! - **Multiplexer**: routes local keystrokes to the focused session or
//!   broadcasts them to every active one
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       Multiplexer                          │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────┐  │
//! │  │  Connection  │   │   Session    │   │    Focus /    │  │
//! │  │   Factory    │   │   Registry   │   │   Broadcast   │  │
//! │  └──────────────┘   └──────────────┘   └───────────────┘  │
//! │                                                            │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │   Session: input queue ─ pumps ─ remote shell (pty)  │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                                                            │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │          Transport: ssh (russh) / in-memory          │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hostmux::{
//!     load_profiles, ConnectionFactory, HostVerification, Multiplexer, MuxConfig, RetryPolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let outcome = load_profiles("hosts.conf")?;
//!     let factory =
//!         ConnectionFactory::ssh(HostVerification::default(), RetryPolicy::default());
//!     let (mux, mut output) = Multiplexer::new(MuxConfig::default(), factory);
//!
//!     for profile in outcome.profiles {
//!         mux.add_host(profile).await?;
//!     }
//!     while let Some(chunk) = output.recv().await {
//!         print!("[{}] {}", chunk.label, String::from_utf8_lossy(&chunk.data));
//!     }
//!     mux.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: host profile records and config file loading
//! - [`connect`]: connection factory, retry policy, host key verification
//! - [`transport`]: the shell transport trait, its SSH and in-memory backends
//! - [`session`]: per-host sessions, input queues, and the registry
//! - [`mux`]: focus and broadcast input routing over all sessions

pub mod config;
pub mod connect;
pub mod mux;
pub mod session;
pub mod transport;

// Re-export config types for convenience
pub use config::{load_profiles, Credential, HostProfile, LoadOutcome};

// Re-export connection types for convenience
pub use connect::{ConnectError, ConnectionFactory, Dial, HostVerification, RetryPolicy};

// Re-export transport types for convenience
pub use transport::{PtyRequest, ShellIo, Transport, TransportError};

// Re-export session types for convenience
pub use session::{
    OutputChunk, Overflow, QueueConfig, Session, SessionError, SessionId, SessionRegistry,
    SessionState,
};

// Re-export multiplexer types for convenience
pub use mux::{DeliveryReport, Focus, Multiplexer, MuxConfig, MuxError, SessionSummary};
