//! Session handler that relays output and exit back over the session's transport.

use tracing::warn;

use crate::session::{HandlerError, SessionError, SessionHandle, SessionHandler};

/// Emits `<prefix>:output` with `(stdout, stderr)` per token and
/// `<prefix>:exit` with `(code, error)` once.
#[derive(Debug, Clone)]
pub struct RelayHandler {
    prefix: String,
    append_newline: bool,
}

impl RelayHandler {
    /// Relay handler that terminates each inbound message with a newline.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            append_newline: true,
        }
    }

    /// Forward inbound messages to stdin byte-for-byte.
    #[must_use]
    pub const fn verbatim(mut self) -> Self {
        self.append_newline = false;
        self
    }

    pub fn output_event(&self) -> String {
        format!("{}:output", self.prefix)
    }

    pub fn exit_event(&self) -> String {
        format!("{}:exit", self.prefix)
    }
}

impl SessionHandler for RelayHandler {
    fn transform_input(&self, _session: &SessionHandle, input: &str) -> Result<String, HandlerError> {
        if self.append_newline && !input.ends_with('\n') {
            Ok(format!("{input}\n"))
        } else {
            Ok(input.to_string())
        }
    }

    fn emit_output(&self, session: &SessionHandle, stdout: &str, stderr: &str) {
        if let Err(e) = session.transport().emit(&self.output_event(), stdout, stderr) {
            warn!(session_id = session.session_id(), error = %e, "Failed to relay output");
        }
    }

    fn notify_exit(&self, session: &SessionHandle, code: i32, error: Option<&SessionError>) {
        let message = error.map(ToString::to_string).unwrap_or_default();
        if let Err(e) = session
            .transport()
            .emit(&self.exit_event(), &code.to_string(), &message)
        {
            warn!(session_id = session.session_id(), error = %e, "Failed to relay exit");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::session::ExecSession;
    use crate::transport::{EmittedEvent, LocalTransport};

    #[tokio::test]
    async fn relays_output_and_exit_events() {
        let (transport, mut emitted) = LocalTransport::new();
        let session = ExecSession::new("true", vec![], Arc::new(transport), "peer", "r-1");
        let handle = SessionHandle::new(&session).0;
        let relay = RelayHandler::new("exec");

        relay.emit_output(&handle, "out", "");
        relay.notify_exit(
            &handle,
            -999,
            Some(&SessionError::Timeout {
                session_id: "r-1".into(),
                timeout: Duration::from_secs(2),
            }),
        );

        assert_eq!(
            emitted.recv().await.unwrap(),
            EmittedEvent {
                event: "exec:output".into(),
                first: "out".into(),
                second: String::new(),
            }
        );
        let exit = emitted.recv().await.unwrap();
        assert_eq!(exit.event, "exec:exit");
        assert_eq!(exit.first, "-999");
        assert_eq!(exit.second, "Exit timeout for session r-1 after 2s");
    }

    #[test]
    fn input_gets_a_trailing_newline() {
        let (transport, _emitted) = LocalTransport::new();
        let session = ExecSession::new("true", vec![], Arc::new(transport), "peer", "r-2");
        let handle = SessionHandle::new(&session).0;

        let relay = RelayHandler::new("exec");
        assert_eq!(relay.transform_input(&handle, "ping").unwrap(), "ping\n");
        assert_eq!(relay.transform_input(&handle, "pong\n").unwrap(), "pong\n");

        let verbatim = RelayHandler::new("exec").verbatim();
        assert_eq!(verbatim.transform_input(&handle, "ping").unwrap(), "ping");
    }
}
