//! Chat connection multiplexing: typed connections to the upstream chat
//! server, per-account sessions that pool them, and the process-wide
//! join scheduler.

pub mod connection;
pub mod error;
pub mod parser;
pub mod scheduler;
pub mod session;
pub mod types;

#[cfg(test)]
pub mod testutil;

pub use error::{ChatError, Result};
pub use scheduler::JoinSchedulerHandle;
pub use session::{SessionHandle, SessionSnapshot};
pub use types::{ConnKind, Identity, Limits};
