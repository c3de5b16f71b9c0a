//! Process sessions: spawn a command, pump its output, feed it input and
//! clean up when it ends.

mod controller;
mod input_pump;
mod output_pump;
mod process;
mod registry;
mod types;

pub use controller::{DEFAULT_SHELL, SessionManager};
pub use registry::SessionRegistry;
pub use types::{
    ExecSession, HandlerError, NoopHandler, SIGNALED_EXIT_CODE, SessionError, SessionHandle,
    SessionHandler, TIMEOUT_EXIT_CODE,
};
