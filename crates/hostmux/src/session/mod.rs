//! Session layer: per-host shell sessions, their input queues, and the
//! registry that tracks them.

pub mod queue;
pub mod registry;
pub mod shell;

pub use queue::{InputError, Overflow, QueueConfig};
pub use registry::{RegistryError, SessionRegistry};
pub use shell::{OutputChunk, Session, SessionError, SessionId, SessionState};
