#![allow(clippy::unwrap_used, clippy::expect_used)] // Integration tests use unwrap for brevity

//! End-to-end session tests against real `/bin/bash` children.
//!
//! Verifies that `SessionManager` correctly wires together:
//! - process spawn with piped stdio
//! - stdout/stderr pumps in both tokenisation modes
//! - inbound events forwarded to stdin
//! - timeout, kill and interrupt-then-kill escalation
//! - registry cleanup

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use execbridge_core::OutputSplit;
use execbridge_session::session::{HandlerError, SIGNALED_EXIT_CODE};
use execbridge_session::transport::EmittedEvent;
use execbridge_session::{
    ExecSession, LocalTransport, RelayHandler, SessionError, SessionHandle, SessionHandler,
    SessionManager, SessionRegistry, TIMEOUT_EXIT_CODE,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Output(String, String),
    Exit(i32, Option<String>),
}

/// Records callbacks; input is newline-terminated and `"fail"` is rejected.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn outputs(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Output(o, e) => Some((o, e)),
                Event::Exit(..) => None,
            })
            .collect()
    }

    fn exits(&self) -> Vec<(i32, Option<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Exit(code, err) => Some((code, err)),
                Event::Output(..) => None,
            })
            .collect()
    }
}

impl SessionHandler for Recorder {
    fn transform_input(&self, _session: &SessionHandle, input: &str) -> Result<String, HandlerError> {
        if input == "fail" {
            return Err("rejected input".into());
        }
        Ok(format!("{input}\n"))
    }

    fn emit_output(&self, _session: &SessionHandle, stdout: &str, stderr: &str) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Output(stdout.to_string(), stderr.to_string()));
    }

    fn notify_exit(&self, _session: &SessionHandle, code: i32, error: Option<&SessionError>) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Exit(code, error.map(ToString::to_string)));
    }
}

struct Harness {
    manager: SessionManager,
    transport: Arc<LocalTransport>,
    recorder: Arc<Recorder>,
}

impl Harness {
    fn new() -> Self {
        let (transport, _emitted) = LocalTransport::new();
        Self {
            manager: SessionManager::new(SessionRegistry::new()),
            transport: Arc::new(transport),
            recorder: Arc::new(Recorder::default()),
        }
    }

    fn session(&self, command: &str, id: &str) -> ExecSession {
        ExecSession::new(command, vec![], self.transport.clone(), "peer-1", id)
            .with_handler(self.recorder.clone())
    }

    async fn run(&self, session: ExecSession) -> Arc<SessionHandle> {
        let handle = self.manager.start(session).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle.wait_closed())
            .await
            .expect("session should close");
        handle
    }

    /// Sessions subscribe on their own task; wait until the subscription exists.
    async fn wait_for_subscriber(&self, event: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.transport.subscriber_count(event) == 0 {
            assert!(Instant::now() < deadline, "no subscriber for {event}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn echo_reports_output_then_exit() {
    let h = Harness::new();
    let mut session = h.session("echo", "s-echo");
    session.args = vec!["hello".to_string()];
    h.run(session).await;

    assert_eq!(
        h.recorder.events(),
        vec![
            Event::Output("hello".into(), String::new()),
            Event::Exit(0, None),
        ]
    );
}

#[tokio::test]
async fn lines_are_delivered_in_order() {
    let h = Harness::new();
    h.run(h.session("printf 'one\\ntwo\\nthree\\n'", "s-lines")).await;

    let stdout: Vec<String> = h.recorder.outputs().into_iter().map(|(o, _)| o).collect();
    assert_eq!(stdout, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn stderr_uses_second_slot() {
    let h = Harness::new();
    h.run(h.session("echo oops 1>&2", "s-stderr")).await;

    assert_eq!(h.recorder.outputs(), vec![(String::new(), "oops".to_string())]);
}

#[tokio::test]
async fn raw_block_forwards_writes_separately() {
    let h = Harness::new();
    let session = h
        .session("printf a; sleep 0.3; printf b", "s-raw")
        .with_output_split(OutputSplit::RawBlock);
    h.run(session).await;

    assert_eq!(
        h.recorder.outputs(),
        vec![("a".to_string(), String::new()), ("b".to_string(), String::new())]
    );
}

#[tokio::test]
async fn non_zero_exit_code_is_reported() {
    let h = Harness::new();
    h.run(h.session("exit 7", "s-exit")).await;

    assert_eq!(h.recorder.exits(), vec![(7, None)]);
}

#[tokio::test]
async fn timeout_reports_sentinel_and_kills_process() {
    let h = Harness::new();
    let started = Instant::now();
    let session = h.session("sleep 10", "s-timeout").with_timeout_secs(1);
    h.run(session).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    let exits = h.recorder.exits();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].0, TIMEOUT_EXIT_CODE);
    assert_eq!(
        exits[0].1.as_deref(),
        Some("Exit timeout for session s-timeout after 1s")
    );
    assert!(h.recorder.outputs().is_empty());
}

#[tokio::test]
async fn interrupt_ignoring_process_is_killed_after_grace() {
    let h = Harness::new();
    let started = Instant::now();
    let session = h
        .session("trap '' INT; sleep 30", "s-stubborn")
        .with_timeout_secs(1);
    h.run(session).await;

    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(h.recorder.exits()[0].0, TIMEOUT_EXIT_CODE);
}

#[tokio::test]
async fn explicit_kill_terminates_session() {
    let h = Harness::new();
    let handle = h.manager.start(h.session("sleep 30", "s-kill")).await.unwrap();
    assert!(handle.kill());

    tokio::time::timeout(Duration::from_secs(5), handle.wait_closed())
        .await
        .unwrap();
    assert_eq!(h.recorder.exits(), vec![(SIGNALED_EXIT_CODE, None)]);
    assert!(!handle.kill());
}

#[tokio::test]
async fn output_written_after_exit_is_still_delivered() {
    let h = Harness::new();
    let session = h.session("(sleep 1.5; echo late) & echo early", "s-late");
    h.run(session).await;

    let stdout: Vec<String> = h.recorder.outputs().into_iter().map(|(o, _)| o).collect();
    assert_eq!(stdout, vec!["early", "late"]);
    assert_eq!(h.recorder.exits(), vec![(0, None)]);
}

#[tokio::test]
async fn kill_stops_background_writers_after_exit() {
    let h = Harness::new();
    let handle = h
        .manager
        .start(h.session("(sleep 30; echo never) & echo early", "s-linger"))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.recorder.exits().is_empty() {
        assert!(Instant::now() < deadline, "exit was not reported");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!handle.is_closed());
    assert!(h.manager.lookup("s-linger").await.is_some());

    assert!(handle.kill());
    tokio::time::timeout(Duration::from_secs(5), handle.wait_closed())
        .await
        .expect("session should close after kill");
    assert_eq!(h.recorder.exits(), vec![(0, None)]);
    assert!(h.recorder.outputs().iter().all(|(o, _)| o != "never"));
}

#[tokio::test]
async fn kill_all_terminates_every_active_session() {
    let h = Harness::new();
    let first = h.manager.start(h.session("sleep 30", "s-all-1")).await.unwrap();
    let second = h.manager.start(h.session("sleep 30", "s-all-2")).await.unwrap();

    let registry = h.manager.registry();
    let mut ids = registry.ids().await;
    ids.sort();
    assert_eq!(ids, vec!["s-all-1", "s-all-2"]);
    assert_eq!(registry.kill_all().await, 2);

    for handle in [first, second] {
        tokio::time::timeout(Duration::from_secs(5), handle.wait_closed())
            .await
            .unwrap();
    }
    assert!(registry.is_empty().await);
    assert_eq!(h.recorder.exits().len(), 2);
}

#[tokio::test]
async fn inbound_input_reaches_stdin() {
    let h = Harness::new();
    let dir = tempfile::TempDir::new().unwrap();
    let out = dir.path().join("stdin.txt");
    let session = h
        .session(&format!("head -c 5 > {}", out.display()), "s-ping")
        .with_input_event("input");
    let handle = h.manager.start(session).await.unwrap();

    h.wait_for_subscriber("input").await;
    assert_eq!(h.transport.publish("input", "ping"), 1);
    tokio::time::timeout(Duration::from_secs(5), handle.wait_closed())
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&out).unwrap(), "ping\n");
    assert_eq!(h.recorder.exits(), vec![(0, None)]);
}

#[tokio::test]
async fn inbound_messages_keep_arrival_order() {
    let h = Harness::new();
    let dir = tempfile::TempDir::new().unwrap();
    let out = dir.path().join("ordered.txt");
    let session = h
        .session(&format!("head -n 3 > {}", out.display()), "s-order")
        .with_input_event("input");
    let handle = h.manager.start(session).await.unwrap();

    h.wait_for_subscriber("input").await;
    for msg in ["first", "second", "third"] {
        h.transport.publish("input", msg);
    }
    tokio::time::timeout(Duration::from_secs(5), handle.wait_closed())
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&out).unwrap(), "first\nsecond\nthird\n");
}

#[tokio::test]
async fn transform_error_closes_stdin() {
    let h = Harness::new();
    let session = h.session("cat", "s-reject").with_input_event("input");
    let handle = h.manager.start(session).await.unwrap();

    h.wait_for_subscriber("input").await;
    h.transport.publish("input", "fail");
    // `cat` only exits once its stdin reaches end-of-file.
    tokio::time::timeout(Duration::from_secs(5), handle.wait_closed())
        .await
        .unwrap();

    assert!(h.recorder.outputs().is_empty());
    assert_eq!(h.recorder.exits(), vec![(0, None)]);
}

#[tokio::test]
async fn environment_overrides_are_visible() {
    let h = Harness::new();
    let session = h
        .session("echo \"$EXECBRIDGE_TEST_VAR\"", "s-env")
        .with_env(["EXECBRIDGE_TEST_VAR=bridged", "MALFORMED"]);
    h.run(session).await;

    assert_eq!(h.recorder.outputs(), vec![("bridged".to_string(), String::new())]);
}

#[tokio::test]
async fn session_is_unregistered_after_close() {
    let h = Harness::new();
    let handle = h.manager.start(h.session("sleep 0.2", "s-lookup")).await.unwrap();
    assert!(h.manager.lookup("s-lookup").await.is_some());

    handle.wait_closed().await;
    assert!(h.manager.lookup("s-lookup").await.is_none());
    assert!(h.manager.registry().is_empty().await);
}

#[tokio::test]
async fn duplicate_active_id_is_rejected() {
    let h = Harness::new();
    let first = h.manager.start(h.session("sleep 30", "s-dup")).await.unwrap();

    let err = h
        .manager
        .start(h.session("true", "s-dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::DuplicateSession { .. }));

    first.kill();
    first.wait_closed().await;
    assert_eq!(h.recorder.exits().len(), 1);
}

#[tokio::test]
async fn spawn_failure_registers_nothing() {
    let mut h = Harness::new();
    h.manager = h.manager.clone().with_shell("/nonexistent/shell");

    let err = h
        .manager
        .start(h.session("true", "s-bad"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Spawn { .. }));
    assert!(h.manager.lookup("s-bad").await.is_none());
    assert!(h.recorder.events().is_empty());
}

#[tokio::test]
async fn relay_handler_emits_output_and_exit_events() {
    let (transport, mut emitted) = LocalTransport::new();
    let manager = SessionManager::new(SessionRegistry::new());
    let session = ExecSession::new("echo hi", vec![], Arc::new(transport), "peer-1", "s-relay")
        .with_handler(Arc::new(RelayHandler::new("exec")));
    let handle = manager.start(session).await.unwrap();
    handle.wait_closed().await;

    assert_eq!(
        emitted.recv().await.unwrap(),
        EmittedEvent {
            event: "exec:output".into(),
            first: "hi".into(),
            second: String::new(),
        }
    );
    assert_eq!(
        emitted.recv().await.unwrap(),
        EmittedEvent {
            event: "exec:exit".into(),
            first: "0".into(),
            second: String::new(),
        }
    );
}
