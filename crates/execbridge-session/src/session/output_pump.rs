//! Stream pumps: drain a process output pipe into `emit_output` callbacks.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, error};

use execbridge_core::OutputSplit;

use super::process::is_closed_pipe;
use super::types::{SessionHandle, SessionHandler};

/// Bytes requested per read in raw-block mode.
const READ_CHUNK_SIZE: usize = 8192;

/// Longest line delivered as one token in line mode.
const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    const fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn emit(self, handler: &dyn SessionHandler, session: &SessionHandle, token: &str) {
        match self {
            Self::Stdout => handler.emit_output(session, token, ""),
            Self::Stderr => handler.emit_output(session, "", token),
        }
    }
}

/// Pump `reader` until end-of-stream, delivering tokens in read order.
pub(crate) async fn run<R>(
    reader: R,
    stream: OutputStream,
    split: OutputSplit,
    session: Arc<SessionHandle>,
    handler: Arc<dyn SessionHandler>,
) where
    R: AsyncRead + Unpin,
{
    let emit = |token: &str| stream.emit(handler.as_ref(), &session, token);
    let result = match split {
        OutputSplit::LineDelimited => pump_lines(reader, emit).await,
        OutputSplit::RawBlock => pump_blocks(reader, emit).await,
    };

    let session_id = session.session_id();
    match result {
        Ok(()) => debug!(session_id, stream = stream.name(), "Output pump reached end of stream"),
        Err(e) if is_closed_pipe(&e) => {
            debug!(session_id, stream = stream.name(), error = %e, "Output pipe closed");
        }
        Err(e) => error!(session_id, stream = stream.name(), error = %e, "Output pump read failed"),
    }
}

/// One token per line with the line ending stripped. A trailing line without
/// a newline is still delivered; a line longer than `MAX_LINE_LEN` is
/// delivered in pieces.
async fn pump_lines<R, F>(reader: R, mut emit: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let limit = MAX_LINE_LEN.saturating_sub(buf.len()) as u64;
        let n = (&mut reader).take(limit).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            if !buf.is_empty() {
                emit(&String::from_utf8_lossy(&buf));
            }
            return Ok(());
        }
        if let Some(line) = buf.strip_suffix(b"\n") {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            emit(&String::from_utf8_lossy(line));
            buf.clear();
        } else if buf.len() >= MAX_LINE_LEN {
            let complete = complete_utf8_len(&buf);
            emit(&String::from_utf8_lossy(&buf[..complete]));
            buf.drain(..complete);
        }
    }
}

/// Forward whatever each read returns, holding back only an incomplete UTF-8
/// sequence at the end of a chunk.
async fn pump_blocks<R, F>(mut reader: R, mut emit: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if !pending.is_empty() {
                emit(&String::from_utf8_lossy(&pending));
            }
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);
        let complete = complete_utf8_len(&pending);
        if complete > 0 {
            emit(&String::from_utf8_lossy(&pending[..complete]));
            pending.drain(..complete);
        }
    }
}

/// Length of the prefix of `bytes` that does not end in a truncated UTF-8
/// sequence. Invalid bytes elsewhere are left for lossy decoding.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => bytes.len(),
    }
}
