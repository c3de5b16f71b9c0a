//! `execbridge` session runtime
//!
//! Bridges a child process to an event-based duplex channel:
//! - Spawns commands through a shell with piped stdio
//! - Streams stdout/stderr tokens to a [`SessionHandler`]
//! - Forwards inbound transport events to stdin
//! - Enforces an execution timeout with interrupt-then-kill escalation
//! - Tracks active sessions in a [`SessionRegistry`]

#[cfg(not(unix))]
compile_error!("execbridge-session requires a Unix platform");

pub mod session;
pub mod transport;

pub use session::{
    ExecSession, SessionError, SessionHandle, SessionHandler, SessionManager, SessionRegistry,
    TIMEOUT_EXIT_CODE,
};
pub use transport::{LocalTransport, RelayHandler, Transport, TransportError};
