#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use kiln_core::ApprovalHandler;
use kiln_core::CompletionEvent;
use kiln_core::ModelStream;
use kiln_core::Result;
use kiln_core::ToolRouter;
use kiln_protocol::ReviewDecision;
use kiln_protocol::TokenUsage;
use kiln_protocol::ToolCall;
use kiln_protocol::TranscriptItem;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Model client scripted with one event list per completion call, served
/// in order.
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Result<CompletionEvent>>>>,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<Result<CompletionEvent>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn completions_requested(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelStream for ScriptedModel {
    fn stream_completion<'a>(
        &'a self,
        _items: &'a [TranscriptItem],
        _cancel: &'a CancellationToken,
    ) -> BoxStream<'a, Result<CompletionEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_else(|| vec![Ok(CompletionEvent::Completed { token_usage: None })]);
        futures::stream::iter(script).boxed()
    }
}

pub fn completed(token_usage: Option<TokenUsage>) -> Result<CompletionEvent> {
    Ok(CompletionEvent::Completed { token_usage })
}

pub fn text(delta: &str) -> Result<CompletionEvent> {
    Ok(CompletionEvent::TextDelta(delta.to_string()))
}

pub fn tool_call(call: ToolCall) -> Result<CompletionEvent> {
    Ok(CompletionEvent::ToolCall(call))
}

pub fn usage(input_tokens: u64) -> Option<TokenUsage> {
    Some(TokenUsage {
        input_tokens,
        output_tokens: 0,
    })
}

/// Tool registry over a temp directory: `write_file` writes, `shell`
/// pretends to run, `boom` always fails.
pub struct FsRouter {
    pub root: PathBuf,
}

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    #[serde(default)]
    content: String,
}

impl ToolRouter for FsRouter {
    fn invoke<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            match name {
                "write_file" => {
                    let args: WriteFileArgs = serde_json::from_str(arguments)?;
                    tokio::fs::write(self.root.join(&args.path), args.content).await?;
                    Ok("ok".to_string())
                }
                "shell" => Ok("ran".to_string()),
                "boom" => Err(std::io::Error::other("tool exploded").into()),
                other => Err(std::io::Error::other(format!("unknown tool: {other}")).into()),
            }
        })
    }
}

/// Confirmation surface scripted with one decision per request; records
/// the call ids it was asked about.
pub struct ScriptedApprovals {
    decisions: Mutex<VecDeque<ReviewDecision>>,
    pub requested: Mutex<Vec<String>>,
}

impl ScriptedApprovals {
    pub fn new(decisions: Vec<ReviewDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested_call_ids(&self) -> Vec<String> {
        self.requested.lock().expect("requested lock").clone()
    }
}

impl ApprovalHandler for ScriptedApprovals {
    fn request_approval<'a>(
        &'a self,
        call: &'a ToolCall,
        _siblings: &'a [ToolCall],
    ) -> BoxFuture<'a, ReviewDecision> {
        Box::pin(async move {
            self.requested
                .lock()
                .expect("requested lock")
                .push(call.id.clone());
            self.decisions
                .lock()
                .expect("decisions lock")
                .pop_front()
                .unwrap_or_default()
        })
    }
}
