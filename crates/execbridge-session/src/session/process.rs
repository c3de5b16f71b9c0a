//! Pipe allocation, shell spawn and signal delivery for session processes.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::Path;

use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use super::types::{ExecSession, SessionError};

/// A spawned child plus the parent's ends of its three pipes.
pub(crate) struct SpawnedProcess {
    pub child: Child,
    pub stdin: pipe::Sender,
    pub stdout: pipe::Receiver,
    pub stderr: pipe::Receiver,
}

fn open_pipe(stream: &'static str) -> Result<(io::PipeReader, io::PipeWriter), SessionError> {
    io::pipe().map_err(|source| SessionError::PipeSetup { stream, source })
}

/// Allocate the stdio pipes and spawn `<shell> -c "<command> <args>"`.
///
/// Every pipe end is an owned value, so any early return closes whatever
/// was opened so far.
pub(crate) fn spawn(shell: &Path, session: &ExecSession) -> Result<SpawnedProcess, SessionError> {
    let (stdin_r, stdin_w) = open_pipe("stdin")?;
    let (stdout_r, stdout_w) = open_pipe("stdout")?;
    let (stderr_r, stderr_w) = open_pipe("stderr")?;

    let stdin = pipe::Sender::from_owned_fd(OwnedFd::from(stdin_w))
        .map_err(|source| SessionError::PipeSetup { stream: "stdin", source })?;
    let stdout = pipe::Receiver::from_owned_fd(OwnedFd::from(stdout_r))
        .map_err(|source| SessionError::PipeSetup { stream: "stdout", source })?;
    let stderr = pipe::Receiver::from_owned_fd(OwnedFd::from(stderr_r))
        .map_err(|source| SessionError::PipeSetup { stream: "stderr", source })?;

    let line = session.shell_line();
    let child = {
        let mut std_cmd = std::process::Command::new(shell);
        std_cmd
            .arg("-c")
            .arg(&line)
            .stdin(stdin_r)
            .stdout(stdout_w)
            .stderr(stderr_w)
            // Own process group so escalation reaches everything the shell starts.
            .process_group(0);
        for (key, value) in parse_env(&session.env) {
            std_cmd.env(key, value);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.spawn().map_err(|source| SessionError::Spawn { source })?
        // `cmd` drops here, closing the parent's copies of the child-side ends
        // so the output pipes report end-of-stream once the process exits.
    };

    info!(
        session_id = %session.session_id,
        pid = ?child.id(),
        shell = %shell.display(),
        command = %line,
        "Spawned session process"
    );

    Ok(SpawnedProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Split `KEY=VALUE` overrides, skipping malformed entries.
pub(crate) fn parse_env(env: &[String]) -> Vec<(&str, &str)> {
    env.iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Some((key, value)),
            _ => {
                warn!(entry = %entry, "Ignoring malformed environment override");
                None
            }
        })
        .collect()
}

/// Send `signal` to the child's process group, falling back to the child
/// itself if the group is gone.
///
/// Returns `Ok(false)` when the child has already been reaped or no longer
/// exists.
pub(crate) fn signal_group(child: &Child, signal: libc::c_int) -> io::Result<bool> {
    let Some(pid) = child.id() else {
        return Ok(false);
    };
    let pid = libc::pid_t::try_from(pid).map_err(io::Error::other)?;

    // SAFETY: `pid` belongs to a child we spawned with `process_group(0)` and
    // have not reaped yet (`Child::id` is `Some`), so neither the pid nor the
    // group id can have been recycled. kill(2) has no memory-safety
    // preconditions.
    #[allow(unsafe_code)]
    let (group_err, pid_ret) = unsafe {
        if libc::kill(-pid, signal) == 0 {
            return Ok(true);
        }
        (io::Error::last_os_error(), libc::kill(pid, signal))
    };
    if pid_ret == 0 {
        return Ok(true);
    }
    let pid_err = io::Error::last_os_error();
    if is_no_such_process(&group_err) && is_no_such_process(&pid_err) {
        return Ok(false);
    }
    Err(io::Error::new(
        pid_err.kind(),
        format!("group(-{pid}) signal failed: {group_err}; pid({pid}) signal failed: {pid_err}"),
    ))
}

/// Send `signal` to process group `pgid` only.
///
/// Used after the group leader has been reaped, while descendants may still
/// hold the output pipes. Returns `Ok(false)` when the group is empty.
pub(crate) fn signal_process_group(pgid: u32, signal: libc::c_int) -> io::Result<bool> {
    let pgid = libc::pid_t::try_from(pgid).map_err(io::Error::other)?;

    // SAFETY: kill(2) has no memory-safety preconditions. A group id is not
    // recycled while any member is alive, and an empty group reports ESRCH.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if is_no_such_process(&err) {
        return Ok(false);
    }
    Err(err)
}

fn is_no_such_process(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

/// Errors from a pipe the other side (or our own cleanup) already closed.
pub(crate) fn is_closed_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
    ) || err.raw_os_error() == Some(libc::EBADF)
}
