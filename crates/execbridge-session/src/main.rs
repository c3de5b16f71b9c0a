//! `execbridge` runner
//!
//! Runs one command as a session over an in-process transport: terminal
//! stdin lines become inbound events, relayed output goes to the terminal.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use execbridge_core::config::{self, Config};
use execbridge_core::{OutputSplit, pathutil, tracing_init};
use execbridge_session::transport::EmittedEvent;
use execbridge_session::session::SIGNALED_EXIT_CODE;
use execbridge_session::{
    ExecSession, LocalTransport, RelayHandler, SessionManager, SessionRegistry, TIMEOUT_EXIT_CODE,
    Transport,
};

/// Process exit status used when the session timed out.
const TIMEOUT_STATUS: i32 = 124;

#[derive(Parser, Debug)]
#[command(name = "execbridge")]
#[command(version, about = "execbridge - run a command bridged to an event channel")]
struct Args {
    /// Execution timeout in seconds (negative for none)
    #[arg(long, allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Forward output as it is read instead of line by line
    #[arg(long)]
    raw: bool,

    /// Environment override for the command (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Inbound event name carrying stdin data (empty disables input)
    #[arg(long)]
    input_event: Option<String>,

    /// Settings file used instead of the global/project hierarchy
    #[arg(long)]
    config: Option<String>,

    /// Shell that interprets the command line
    #[arg(long)]
    shell: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "EXECBRIDGE_LOG_JSON")]
    log_json: bool,

    /// Command and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let status = run(args).await?;
    // Exit directly: the terminal stdin reader may still be parked on a
    // blocking read that would stall runtime shutdown.
    std::process::exit(status)
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let config = load_config(args.config.as_deref())?;

    let level = args.log_level.as_deref().unwrap_or(&config.runner.log_level);
    tracing_init::init_tracing(
        &tracing_init::log_filter(&["execbridge", "execbridge_session", "execbridge_core"], level),
        args.log_json || config.runner.log_json,
    )?;

    let Some((command, command_args)) = args.command.split_first() else {
        anyhow::bail!("No command given");
    };

    let (transport, mut emitted) = LocalTransport::new();
    let transport = Arc::new(transport);
    let relay = RelayHandler::new("exec");
    let output_event = relay.output_event();
    let exit_event = relay.exit_event();

    let mut session = ExecSession::new(
        command.clone(),
        command_args.to_vec(),
        Arc::clone(&transport) as Arc<dyn Transport>,
        "local",
        uuid::Uuid::new_v4().to_string(),
    )
    .with_defaults(&config.sessions)
    .with_env(args.env)
    .with_handler(Arc::new(relay));
    if let Some(secs) = args.timeout {
        session = session.with_timeout_secs(secs);
    }
    if args.raw {
        session = session.with_output_split(OutputSplit::RawBlock);
    }
    if let Some(event) = args.input_event {
        session = session.with_input_event(event);
    }
    let raw = session.output_split == OutputSplit::RawBlock;
    let input_event = session.input_event.clone();

    let shell = args.shell.unwrap_or(config.runner.shell);
    let manager = SessionManager::new(SessionRegistry::new()).with_shell(shell);
    let handle = manager.start(session).await?;
    info!(
        session_id = handle.session_id(),
        pid = ?handle.pid(),
        command = handle.command(),
        "Session started"
    );

    let stdin_task = (!input_event.is_empty())
        .then(|| tokio::spawn(forward_terminal_input(Arc::clone(&transport), input_event)));

    let mut exit_code = None;
    loop {
        tokio::select! {
            Some(event) = emitted.recv() => {
                exit_code = exit_code.or(print_event(&event, &output_event, &exit_event, raw)?);
            }
            _ = tokio::signal::ctrl_c() => {
                let registry = manager.registry();
                let sessions = registry.ids().await;
                let killed = registry.kill_all().await;
                info!(?sessions, killed, "Received Ctrl+C; killing sessions");
            }
            () = handle.wait_closed() => break,
        }
    }
    while let Ok(event) = emitted.try_recv() {
        exit_code = exit_code.or(print_event(&event, &output_event, &exit_event, raw)?);
    }
    if let Some(task) = stdin_task {
        task.abort();
    }

    debug!(code = ?exit_code, "Session finished");
    Ok(session_status(exit_code))
}

fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        let cwd = std::env::current_dir().ok();
        return Ok(config::load_config(cwd.as_deref())?);
    };
    let resolved = pathutil::resolve_env_vars(path)?;
    let mut config = config::load_config_file(Path::new(&resolved))?;
    config::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Publish each terminal stdin line as an inbound event.
async fn forward_terminal_input(transport: Arc<LocalTransport>, event: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if transport.publish(&event, &line) == 0 {
                    debug!(event = %event, "No input subscriber; dropping line");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read terminal input");
                break;
            }
        }
    }
}

/// Write a relayed event to the terminal. Returns the exit code for exit events.
fn print_event(
    event: &EmittedEvent,
    output_event: &str,
    exit_event: &str,
    raw: bool,
) -> std::io::Result<Option<i32>> {
    let terminator = if raw { "" } else { "\n" };
    if event.event == output_event {
        if !event.first.is_empty() {
            let mut out = std::io::stdout().lock();
            write!(out, "{}{terminator}", event.first)?;
            out.flush()?;
        }
        if !event.second.is_empty() {
            let mut err = std::io::stderr().lock();
            write!(err, "{}{terminator}", event.second)?;
            err.flush()?;
        }
        return Ok(None);
    }
    if event.event == exit_event {
        if !event.second.is_empty() {
            writeln!(std::io::stderr().lock(), "execbridge: {}", event.second)?;
        }
        let code = event.first.parse().unwrap_or_else(|e| {
            warn!(code = %event.first, error = %e, "Unparsable exit code");
            SIGNALED_EXIT_CODE
        });
        return Ok(Some(code));
    }
    debug!(event = %event.event, "Ignoring unknown event");
    Ok(None)
}

/// Process exit status for a finished session. A session that never reported
/// its exit counts as abnormally terminated.
const fn session_status(exit_code: Option<i32>) -> i32 {
    match exit_code {
        Some(code) => exit_status(code),
        None => exit_status(SIGNALED_EXIT_CODE),
    }
}

/// Map a session exit code to a process exit status.
const fn exit_status(code: i32) -> i32 {
    match code {
        TIMEOUT_EXIT_CODE => TIMEOUT_STATUS,
        c if c < 0 => 1,
        c => c,
    }
}
