//! Input pump: forwards inbound transport messages to the process's stdin
//! while racing process exit against the execution timeout.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::process::{is_closed_pipe, signal_group};
use super::types::{SIGNALED_EXIT_CODE, SessionError, SessionHandle, SessionHandler};

/// How the input pump ended.
#[derive(Debug)]
pub(crate) enum InputOutcome {
    /// The process exited on its own (or after an explicit kill).
    Exited {
        code: i32,
        error: Option<SessionError>,
    },
    /// The execution timeout elapsed first.
    TimedOut,
}

/// Start the task that owns the stdin pipe. Data queued on the returned
/// sender is written in order; dropping the sender closes stdin.
pub(crate) fn spawn_stdin_writer(
    stdin: pipe::Sender,
    session_id: String,
) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
    let task = tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(data) = stdin_rx.recv().await {
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                if is_closed_pipe(&e) {
                    debug!(session_id = %session_id, error = %e, "Stdin closed by process");
                } else {
                    error!(session_id = %session_id, error = %e, "Failed to write to stdin");
                }
            }
        }
        debug!(session_id = %session_id, "Stdin writer finished");
    });
    (stdin_tx, task)
}

/// Subscribe to the session's inbound event. `None` means the session runs
/// without remote input.
pub(crate) fn subscribe(
    session: &SessionHandle,
    event: &str,
) -> Option<mpsc::UnboundedReceiver<String>> {
    if event.is_empty() {
        return None;
    }
    match session.transport().subscribe(event) {
        Ok(rx) => Some(rx),
        Err(e) => {
            warn!(
                session_id = session.session_id(),
                event,
                error = %e,
                "Input subscription failed; continuing without input"
            );
            None
        }
    }
}

/// Forward input until the process exits or `timeout` elapses.
///
/// A transform error drops `stdin_tx`, closing stdin. Kill requests received
/// on `kill_rx` force-kill the process group; the resulting exit is reported
/// through the normal exit branch.
pub(crate) async fn run(
    session: &SessionHandle,
    handler: &dyn SessionHandler,
    child: &mut Child,
    stdin_tx: &mut Option<mpsc::UnboundedSender<String>>,
    mut inbound: Option<mpsc::UnboundedReceiver<String>>,
    kill_rx: &mut watch::Receiver<bool>,
    timeout: Duration,
) -> InputOutcome {
    let session_id = session.session_id();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut watching_kill = true;

    loop {
        tokio::select! {
            biased;

            status = child.wait() => {
                return match status {
                    Ok(status) => InputOutcome::Exited { code: exit_code(status), error: None },
                    Err(e) => {
                        error!(session_id, error = %e, "Failed to wait for process");
                        InputOutcome::Exited {
                            code: SIGNALED_EXIT_CODE,
                            error: Some(SessionError::Wait(e)),
                        }
                    }
                };
            }

            () = &mut deadline => {
                info!(session_id, timeout_secs = timeout.as_secs(), "Session timed out");
                return InputOutcome::TimedOut;
            }

            changed = kill_rx.changed(), if watching_kill => {
                if changed.is_err() {
                    watching_kill = false;
                } else if *kill_rx.borrow_and_update() {
                    watching_kill = false;
                    info!(session_id, "Kill requested");
                    match signal_group(child, libc::SIGKILL) {
                        Ok(true) => {}
                        Ok(false) => debug!(session_id, "Process already gone"),
                        Err(e) => error!(session_id, error = %e, "Failed to kill process"),
                    }
                }
            }

            message = next_message(&mut inbound) => {
                let Some(raw) = message else {
                    debug!(session_id, "Input subscription closed");
                    inbound = None;
                    continue;
                };
                match handler.transform_input(session, &raw) {
                    Ok(data) => {
                        let sent = stdin_tx.as_ref().is_some_and(|tx| tx.send(data).is_ok());
                        if !sent {
                            debug!(session_id, "Stdin closed; dropping input");
                        }
                    }
                    Err(e) => {
                        warn!(session_id, error = %e, "Input transform failed; closing stdin");
                        *stdin_tx = None;
                        inbound = None;
                    }
                }
            }
        }
    }
}

async fn next_message(inbound: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Exit code of a finished process; signal termination maps to `-1`.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SIGNALED_EXIT_CODE)
}
