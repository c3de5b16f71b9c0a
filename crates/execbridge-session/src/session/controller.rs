//! Session controller: spawns the process, runs the pumps, enforces the
//! timeout and drives termination and cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::input_pump::{self, InputOutcome};
use super::output_pump::{self, OutputStream};
use super::process::{self, SpawnedProcess, signal_group, signal_process_group};
use super::registry::SessionRegistry;
use super::types::{ExecSession, KILL_GRACE, SessionError, SessionHandle, TIMEOUT_EXIT_CODE};

/// Default shell used to interpret session command lines.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Starts sessions and owns the registry they are tracked in.
#[derive(Clone)]
pub struct SessionManager {
    registry: SessionRegistry,
    shell: PathBuf,
}

impl SessionManager {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            shell: PathBuf::from(DEFAULT_SHELL),
        }
    }

    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    pub async fn lookup(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.registry.lookup(session_id).await
    }

    /// Start a session.
    ///
    /// Returns once the process is spawned; pumping, timeout enforcement and
    /// cleanup continue on a background task. Setup failures are returned
    /// here and leave nothing registered.
    pub async fn start(&self, session: ExecSession) -> Result<Arc<SessionHandle>, SessionError> {
        let (handle, kill_rx) = SessionHandle::new(&session);
        self.registry.register(Arc::clone(&handle)).await?;

        let spawned = match process::spawn(&self.shell, &session) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "Failed to start session");
                self.registry.remove_entry(&handle).await;
                handle.mark_closed();
                return Err(e);
            }
        };
        if let Some(pid) = spawned.child.id() {
            handle.set_pid(pid);
        }

        tokio::spawn(run_session(
            self.registry.clone(),
            Arc::clone(&handle),
            session,
            spawned,
            kill_rx,
        ));
        Ok(handle)
    }
}

/// Stream pump tasks. A slot is cleared once its pump has finished.
struct Pumps {
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl Pumps {
    fn is_finished(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none()
    }

    /// Wait for both pumps to reach end-of-stream. Cancel-safe: an interrupted
    /// wait leaves unfinished pumps running and in place.
    async fn join(&mut self) {
        for slot in [&mut self.stdout, &mut self.stderr] {
            if let Some(task) = slot.as_mut() {
                let _ = task.await;
                *slot = None;
            }
        }
    }

    /// Wait up to `KILL_GRACE` for the pumps without cancelling them.
    async fn settle(&mut self) {
        let _ = tokio::time::timeout(KILL_GRACE, self.join()).await;
    }

    /// Wait up to `KILL_GRACE`, then abort whatever is left. Only used once the
    /// process group has been force-killed.
    async fn drain_or_abort(&mut self, session_id: &str) {
        self.settle().await;
        for (name, slot) in [("stdout", &mut self.stdout), ("stderr", &mut self.stderr)] {
            if let Some(task) = slot.take() {
                warn!(session_id, stream = name, "Output pump did not drain; aborting");
                task.abort();
            }
        }
    }
}

async fn run_session(
    registry: SessionRegistry,
    handle: Arc<SessionHandle>,
    session: ExecSession,
    spawned: SpawnedProcess,
    mut kill_rx: watch::Receiver<bool>,
) {
    let session_id = handle.session_id();
    let handler = Arc::clone(&session.handler);
    let SpawnedProcess {
        mut child,
        stdin,
        stdout,
        stderr,
    } = spawned;

    let mut pumps = Pumps {
        stdout: Some(tokio::spawn(output_pump::run(
            stdout,
            OutputStream::Stdout,
            session.output_split,
            Arc::clone(&handle),
            Arc::clone(&handler),
        ))),
        stderr: Some(tokio::spawn(output_pump::run(
            stderr,
            OutputStream::Stderr,
            session.output_split,
            Arc::clone(&handle),
            Arc::clone(&handler),
        ))),
    };

    let inbound = input_pump::subscribe(&handle, &session.input_event);
    let (stdin_tx, stdin_writer) = input_pump::spawn_stdin_writer(stdin, session_id.to_string());
    let mut stdin_tx = Some(stdin_tx);

    let timeout = session.effective_timeout();
    let outcome = input_pump::run(
        &handle,
        handler.as_ref(),
        &mut child,
        &mut stdin_tx,
        inbound,
        &mut kill_rx,
        timeout,
    )
    .await;

    let timed_out = match outcome {
        InputOutcome::Exited { code, error } => {
            info!(session_id, code, "Session process exited");
            pumps.settle().await;
            handler.notify_exit(&handle, code, error.as_ref());
            false
        }
        InputOutcome::TimedOut => {
            let error = SessionError::Timeout {
                session_id: session_id.to_string(),
                timeout,
            };
            handler.notify_exit(&handle, TIMEOUT_EXIT_CODE, Some(&error));
            true
        }
    };

    drop(stdin_tx);
    terminate(session_id, &mut child, &mut pumps).await;
    if timed_out {
        if !pumps.is_finished() {
            send_group_signal(session_id, handle.pid(), libc::SIGKILL);
        }
        pumps.drain_or_abort(session_id).await;
    } else {
        finish_pumps(session_id, handle.pid(), &mut pumps, &mut kill_rx).await;
    }
    stdin_writer.abort();
    let _ = stdin_writer.await;

    registry.remove_entry(&handle).await;
    handle.mark_closed();
    info!(session_id, "Session closed");
}

/// Let the pumps run to end-of-stream after a natural exit. Descendants can
/// keep the pipes open past the shell; a kill request force-kills the process
/// group and bounds the remaining wait.
async fn finish_pumps(
    session_id: &str,
    pgid: Option<u32>,
    pumps: &mut Pumps,
    kill_rx: &mut watch::Receiver<bool>,
) {
    if pumps.is_finished() {
        return;
    }
    debug!(session_id, "Process exited; output still open");
    tokio::select! {
        () = pumps.join() => return,
        () = kill_requested(kill_rx) => {}
    }
    info!(session_id, "Kill requested while draining output");
    send_group_signal(session_id, pgid, libc::SIGKILL);
    pumps.drain_or_abort(session_id).await;
}

async fn kill_requested(kill_rx: &mut watch::Receiver<bool>) {
    if kill_rx.wait_for(|kill| *kill).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Interrupt a still-running process, force-kill it if stdout has not closed
/// within the grace period, then reap it.
async fn terminate(session_id: &str, child: &mut Child, pumps: &mut Pumps) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    debug!(session_id, "Interrupting session process");
    send_signal(session_id, child, libc::SIGINT);

    if let Some(mut stdout) = pumps.stdout.take() {
        tokio::select! {
            _ = &mut stdout => {}
            () = tokio::time::sleep(KILL_GRACE) => {
                warn!(session_id, "Process ignored interrupt; killing");
                send_signal(session_id, child, libc::SIGKILL);
                let _ = stdout.await;
            }
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(session_id, ?status, "Session process reaped"),
        Ok(Err(e)) => error!(session_id, error = %e, "Failed to reap session process"),
        Err(_) => {
            warn!(session_id, "Process still running after grace period; killing");
            send_signal(session_id, child, libc::SIGKILL);
            if let Err(e) = child.wait().await {
                error!(session_id, error = %e, "Failed to reap session process");
            }
        }
    }
}

/// Signal the session's process group after its leader has been reaped.
fn send_group_signal(session_id: &str, pgid: Option<u32>, signal: libc::c_int) {
    let Some(pgid) = pgid else {
        return;
    };
    match signal_process_group(pgid, signal) {
        Ok(true) => {}
        Ok(false) => debug!(session_id, signal, "Process group already gone"),
        Err(e) => error!(session_id, signal, error = %e, "Failed to signal process group"),
    }
}

fn send_signal(session_id: &str, child: &Child, signal: libc::c_int) {
    match signal_group(child, signal) {
        Ok(true) => {}
        Ok(false) => debug!(session_id, signal, "Process already gone"),
        Err(e) => error!(session_id, signal, error = %e, "Failed to signal process"),
    }
}
