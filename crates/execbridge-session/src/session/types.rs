//! Session types: start parameters, the live session handle, callbacks, errors.

use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;

use execbridge_core::OutputSplit;
use execbridge_core::config::SessionDefaults;

use crate::transport::Transport;

/// Exit code reported when a session hits its execution timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -999;

/// Exit code reported when the process was terminated by a signal or its
/// status could not be read.
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// Stand-in for "no timeout": one year keeps every wait finite.
pub(crate) const UNBOUNDED_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Grace period between interrupt and forced kill. Also bounds the reap and
/// drain waits during cleanup.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(1);

/// Error returned by a [`SessionHandler`] input transform.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session already active: {session_id}")]
    DuplicateSession { session_id: String },

    #[error("Pipe {stream} error: {source}")]
    PipeSetup {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Process start error: {source}")]
    Spawn {
        #[source]
        source: io::Error,
    },

    #[error("Exit timeout for session {session_id} after {}s", .timeout.as_secs())]
    Timeout {
        session_id: String,
        timeout: Duration,
    },

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}

/// Callbacks invoked by a running session.
///
/// `emit_output` and `notify_exit` run on the session's pump and controller
/// tasks; they should hand work off rather than block.
pub trait SessionHandler: Send + Sync {
    /// Turn one inbound message into bytes for the process's stdin.
    ///
    /// Returning an error closes stdin and stops further input for the session.
    fn transform_input(&self, _session: &SessionHandle, input: &str) -> Result<String, HandlerError> {
        Ok(input.to_string())
    }

    /// One output token; exactly one of `stdout` / `stderr` is populated.
    fn emit_output(&self, session: &SessionHandle, stdout: &str, stderr: &str);

    /// Called exactly once per session.
    fn notify_exit(&self, session: &SessionHandle, code: i32, error: Option<&SessionError>);
}

/// Handler that drops output and exit notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl SessionHandler for NoopHandler {
    fn emit_output(&self, session: &SessionHandle, stdout: &str, stderr: &str) {
        tracing::trace!(
            session_id = session.session_id(),
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Discarding output"
        );
    }

    fn notify_exit(&self, session: &SessionHandle, code: i32, _error: Option<&SessionError>) {
        tracing::trace!(session_id = session.session_id(), code, "Discarding exit");
    }
}

/// Parameters for starting a session.
pub struct ExecSession {
    pub command: String,
    pub args: Vec<String>,
    pub transport: Arc<dyn Transport>,
    pub peer_id: String,
    pub session_id: String,
    /// `KEY=VALUE` overrides merged over the inherited environment.
    pub env: Vec<String>,
    /// `None` or negative means unbounded.
    pub timeout_secs: Option<i64>,
    pub output_split: OutputSplit,
    /// Inbound event carrying stdin data. Empty disables remote input.
    pub input_event: String,
    pub handler: Arc<dyn SessionHandler>,
    pub user_data: Map<String, Value>,
}

impl ExecSession {
    /// Create session parameters with no timeout, line output and no remote input.
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        transport: Arc<dyn Transport>,
        peer_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            transport,
            peer_id: peer_id.into(),
            session_id: session_id.into(),
            env: Vec::new(),
            timeout_secs: None,
            output_split: OutputSplit::default(),
            input_event: String::new(),
            handler: Arc::new(NoopHandler),
            user_data: Map::new(),
        }
    }

    /// Apply configured session defaults.
    #[must_use]
    pub fn with_defaults(mut self, defaults: &SessionDefaults) -> Self {
        self.timeout_secs = defaults.timeout_secs;
        self.output_split = defaults.output_split;
        self.input_event.clone_from(&defaults.input_event);
        self
    }

    #[must_use]
    pub fn with_env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env.extend(env.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: i64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub const fn with_output_split(mut self, split: OutputSplit) -> Self {
        self.output_split = split;
        self
    }

    #[must_use]
    pub fn with_input_event(mut self, event: impl Into<String>) -> Self {
        self.input_event = event.into();
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn SessionHandler>) -> Self {
        self.handler = handler;
        self
    }

    #[must_use]
    pub fn with_user_data(mut self, user_data: Map<String, Value>) -> Self {
        self.user_data = user_data;
        self
    }

    /// Execution timeout with the unbounded sentinel normalised.
    pub fn effective_timeout(&self) -> Duration {
        match self.timeout_secs {
            Some(secs) if secs >= 0 => Duration::from_secs(secs.unsigned_abs()),
            _ => UNBOUNDED_TIMEOUT,
        }
    }

    /// Command line handed to the shell.
    pub fn shell_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

impl fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecSession")
            .field("session_id", &self.session_id)
            .field("peer_id", &self.peer_id)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("timeout_secs", &self.timeout_secs)
            .field("output_split", &self.output_split)
            .field("input_event", &self.input_event)
            .finish_non_exhaustive()
    }
}

/// A running session, as stored in the registry and passed to callbacks.
pub struct SessionHandle {
    session_id: String,
    peer_id: String,
    command: String,
    args: Vec<String>,
    transport: Arc<dyn Transport>,
    user_data: Map<String, Value>,
    pid: OnceLock<u32>,
    kill_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

impl SessionHandle {
    /// Build the handle plus the receiver the controller watches for kill requests.
    pub(crate) fn new(session: &ExecSession) -> (Arc<Self>, watch::Receiver<bool>) {
        let (kill_tx, kill_rx) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);
        let handle = Self {
            session_id: session.session_id.clone(),
            peer_id: session.peer_id.clone(),
            command: session.command.clone(),
            args: session.args.clone(),
            transport: Arc::clone(&session.transport),
            user_data: session.user_data.clone(),
            pid: OnceLock::new(),
            kill_tx,
            closed_tx,
        };
        (Arc::new(handle), kill_rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Transport endpoint this session is bound to.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Caller data, never interpreted by the session.
    pub const fn user_data(&self) -> &Map<String, Value> {
        &self.user_data
    }

    /// OS process id, once spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        let _ = self.pid.set(pid);
    }

    /// Request forced termination.
    ///
    /// Returns `false` if the session has already finished.
    pub fn kill(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.kill_tx.send_replace(true);
        true
    }

    pub fn kill_requested(&self) -> bool {
        *self.kill_tx.borrow()
    }

    /// Whether cleanup has completed.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Wait until the session has been cleaned up and unregistered.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // The sender lives in `self`, so this only ends once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("peer_id", &self.peer_id)
            .field("command", &self.command)
            .field("pid", &self.pid())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
