#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use futures::future::BoxFuture;
use kiln_core::CallRunner;
use kiln_core::Result;
use kiln_core::execute_batch;
use kiln_protocol::ToolCall;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Span {
    call_id: String,
    started: Instant,
    ended: Instant,
}

/// Runner that sleeps per call and records start/end timestamps, failing
/// calls whose name is `boom`.
struct TimingRunner {
    delay: Duration,
    spans: Mutex<Vec<Span>>,
}

impl TimingRunner {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            spans: Mutex::new(Vec::new()),
        }
    }

    fn span_for(&self, call_id: &str) -> Span {
        self.spans
            .lock()
            .expect("spans lock")
            .iter()
            .find(|span| span.call_id == call_id)
            .cloned()
            .unwrap_or_else(|| panic!("no span recorded for {call_id}"))
    }
}

impl CallRunner for TimingRunner {
    fn run<'a>(&'a self, call: &'a ToolCall) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let started = Instant::now();
            tokio::time::sleep(self.delay).await;
            self.spans.lock().expect("spans lock").push(Span {
                call_id: call.id.clone(),
                started,
                ended: Instant::now(),
            });
            if call.name == "boom" {
                return Err(std::io::Error::other("tool exploded").into());
            }
            Ok(format!("ran {}", call.id))
        })
    }
}

fn shell(id: &str, command: &str) -> ToolCall {
    ToolCall::new(id, "shell", format!(r#"{{"command":"{command}"}}"#))
}

fn edit(id: &str, path: &str) -> ToolCall {
    ToolCall::new(id, "edit_file", format!(r#"{{"path":"{path}"}}"#))
}

#[tokio::test]
async fn results_preserve_original_batch_order() {
    let calls = vec![
        shell("c1", "ls"),
        edit("c2", "a.ts"),
        edit("c3", "b.ts"),
        shell("c4", "pwd"),
        ToolCall::new("c5", "web_search", r#"{"query":"rust"}"#),
    ];
    let runner = TimingRunner::new(Duration::from_millis(5));
    let results = execute_batch(&calls, &runner, &CancellationToken::new()).await;

    assert_eq!(results.len(), calls.len());
    for (result, call) in results.iter().zip(&calls) {
        assert_eq!(result.call_id, call.id);
    }
}

#[tokio::test]
async fn same_resource_calls_run_sequentially() {
    let calls = vec![shell("c1", "ls"), shell("c2", "pwd")];
    let runner = TimingRunner::new(Duration::from_millis(30));
    execute_batch(&calls, &runner, &CancellationToken::new()).await;

    let first = runner.span_for("c1");
    let second = runner.span_for("c2");
    assert!(second.started >= first.ended);
}

#[tokio::test]
async fn different_resources_overlap() {
    let calls = vec![edit("c1", "a.ts"), edit("c2", "b.ts")];
    let runner = TimingRunner::new(Duration::from_millis(80));
    execute_batch(&calls, &runner, &CancellationToken::new()).await;

    let first = runner.span_for("c1");
    let second = runner.span_for("c2");
    assert!(second.started < first.ended);
}

#[tokio::test]
async fn failing_call_never_aborts_siblings() {
    let calls = vec![
        shell("c1", "ls"),
        ToolCall::new("c2", "boom", "{}"),
        shell("c3", "pwd"),
    ];
    let runner = TimingRunner::new(Duration::from_millis(1));
    let results = execute_batch(&calls, &runner, &CancellationToken::new()).await;

    assert_eq!(results[0].output.success, Some(true));
    assert_eq!(results[1].output.success, Some(false));
    assert!(results[1].output.content.contains("tool exploded"));
    assert_eq!(results[2].output.success, Some(true));
}

#[tokio::test]
async fn cancellation_interrupts_current_and_aborts_rest() {
    let calls = vec![shell("c1", "ls"), shell("c2", "pwd"), shell("c3", "whoami")];
    let runner = TimingRunner::new(Duration::from_millis(100));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let results = execute_batch(&calls, &runner, &cancel).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].output.content, "execution interrupted");
    assert_eq!(results[1].output.content, "aborted before execution");
    assert_eq!(results[2].output.content, "aborted before execution");
}

#[tokio::test]
async fn empty_batch_yields_no_results() {
    let runner = TimingRunner::new(Duration::from_millis(1));
    let results = execute_batch(&[], &runner, &CancellationToken::new()).await;
    assert!(results.is_empty());
}
