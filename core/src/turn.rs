use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_channel::Receiver;
use async_channel::Sender;
use futures::StreamExt;
use futures::future::BoxFuture;
use kiln_protocol::ReviewDecision;
use kiln_protocol::SessionId;
use kiln_protocol::TokenUsage;
use kiln_protocol::ToolCall;
use kiln_protocol::ToolCallKind;
use kiln_protocol::ToolResult;
use kiln_protocol::TranscriptItem;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::checkpoint::CheckpointManager;
use crate::client::CompletionEvent;
use crate::client::ModelStream;
use crate::compact;
use crate::compact::COMPACT_TRIGGER_PERCENT;
use crate::compact::CompactParams;
use crate::compact::CompactionPhase;
use crate::compact::SUMMARIZATION_INSTRUCTIONS;
use crate::compact::context_percent;
use crate::config::TurnConfig;
use crate::error::KilnErr;
use crate::error::Result;
use crate::resource::mutated_path;
use crate::safety::partition_by_sensitivity;
use crate::safety::shell_argv;
use crate::scheduler::CallRunner;
use crate::scheduler::execute_batch;
use crate::tools::ApprovalHandler;
use crate::tools::ToolRouter;
use crate::undo::UndoLog;
use crate::undo::UndoOp;
use crate::undo::UndoStore;

pub const SUBAGENT_SUMMARIZATION_INSTRUCTIONS: &str = "Summarize this sub-task's progress so \
that work can continue from the summary alone. Keep the goal, completed steps, file paths and \
unresolved errors. Respond with the summary text only.";

const ABORTED_BY_USER_CONTENT: &str = "aborted by user";

/// Progress events surfaced to the caller while a turn runs. The receiver
/// half is returned by [`Session::new`]; dropping it is harmless.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    TaskStarted,
    AgentMessage(String),
    Compacted { phase: CompactionPhase },
    ToolBatchCompleted { results: Vec<ToolResult> },
    TurnCompleted { last_agent_message: Option<String> },
    TurnAborted,
    Error { message: String },
}

/// Long-lived per-conversation state: remembered approvals, the file
/// checkpoint manager and the undo log. Turn-scoped state lives in
/// [`TurnContext`].
pub struct Session {
    id: SessionId,
    approved_commands: Arc<Mutex<HashSet<Vec<String>>>>,
    checkpoints: Arc<CheckpointManager>,
    undo_log: Mutex<UndoLog>,
    tx_event: Sender<TurnEvent>,
}

impl Session {
    pub fn new(config: &TurnConfig) -> (Arc<Self>, Receiver<TurnEvent>) {
        let (tx_event, rx_event) = async_channel::unbounded();
        let session = Arc::new(Self {
            id: SessionId::new(),
            approved_commands: Arc::new(Mutex::new(HashSet::new())),
            checkpoints: Arc::new(CheckpointManager::new(&config.state_dir)),
            undo_log: Mutex::new(UndoLog::new()),
            tx_event,
        });
        (session, rx_event)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Restore all file mutations of the most recent uncommitted turn.
    /// Returns the message index to truncate the transcript back to.
    pub async fn rollback_files(&self) -> Result<Option<u64>> {
        self.checkpoints.rollback(self.id).await
    }

    /// Record one reversible structured side effect at `message_index`.
    pub async fn append_undo(&self, message_index: u64, op: UndoOp) -> u64 {
        self.undo_log.lock().await.append(self.id, message_index, op)
    }

    /// Undo every structured side effect recorded at or after
    /// `target_index`, most recent first.
    pub async fn rollback_undo_to<S: UndoStore>(&self, target_index: u64, store: &mut S) -> usize {
        self.undo_log
            .lock()
            .await
            .rollback_to(self.id, target_index, store)
            .await
    }

    /// Child scope for a sub-agent turn: fresh id (so its checkpoint never
    /// clobbers the parent's), fresh undo log, shared approvals and event
    /// feed.
    fn subagent_scope(&self) -> Arc<Session> {
        Arc::new(Session {
            id: SessionId::new(),
            approved_commands: Arc::clone(&self.approved_commands),
            checkpoints: Arc::clone(&self.checkpoints),
            undo_log: Mutex::new(UndoLog::new()),
            tx_event: self.tx_event.clone(),
        })
    }

    async fn send_event(&self, event: TurnEvent) {
        if self.tx_event.send(event).await.is_err() {
            debug!("turn event receiver dropped");
        }
    }

    async fn is_command_approved(&self, argv: &[String]) -> bool {
        self.approved_commands.lock().await.contains(argv)
    }

    async fn remember_approved(&self, argv: Vec<String>) {
        self.approved_commands.lock().await.insert(argv);
    }
}

/// Everything one turn needs, passed explicitly (no ambient globals): the
/// configuration, the three external seams and the cancellation token
/// threaded into every long-running operation.
pub struct TurnContext {
    pub config: TurnConfig,
    pub client: Arc<dyn ModelStream>,
    pub tools: Arc<dyn ToolRouter>,
    pub approvals: Arc<dyn ApprovalHandler>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub last_agent_message: Option<String>,
    pub aborted: bool,
}

/// Drive one conversational turn: stream a completion, execute the
/// requested tool batch under the permission gate, merge results into the
/// transcript, repeat until the model stops requesting tools.
///
/// On clean completion the turn's file checkpoint is committed. On abort
/// or error it is left open: cancellation alone never rolls anything back,
/// the caller decides by invoking [`Session::rollback_files`].
pub async fn run_turn(
    session: &Arc<Session>,
    ctx: &Arc<TurnContext>,
    transcript: &mut Vec<TranscriptItem>,
    user_input: impl Into<String>,
) -> Result<TurnOutcome> {
    let turn_start_index = transcript.len() as u64;
    transcript.push(TranscriptItem::user(user_input));
    session.send_event(TurnEvent::TaskStarted).await;

    let params = CompactParams {
        max_context_tokens: ctx.config.max_context_tokens,
        keep_recent_rounds: ctx.config.keep_recent_rounds,
        instructions: SUMMARIZATION_INSTRUCTIONS.to_string(),
    };
    match run_loop(session, ctx, transcript, &params, turn_start_index).await {
        Ok(outcome) => {
            if outcome.aborted {
                session.send_event(TurnEvent::TurnAborted).await;
            } else {
                session.checkpoints.commit(session.id).await?;
                session
                    .send_event(TurnEvent::TurnCompleted {
                        last_agent_message: outcome.last_agent_message.clone(),
                    })
                    .await;
            }
            Ok(outcome)
        }
        Err(err) => {
            info!("turn error: {err}");
            session
                .send_event(TurnEvent::Error {
                    message: err.to_string(),
                })
                .await;
            Err(err)
        }
    }
}

/// Nested turn for a sub-agent call: same loop, isolated transcript and
/// checkpoint scope, own compaction state. Confirmations flow through the
/// parent's handler, so the user sees one surface at any nesting depth.
async fn run_subagent_turn(
    session: &Arc<Session>,
    ctx: &Arc<TurnContext>,
    call: &ToolCall,
) -> Result<String> {
    #[derive(Deserialize)]
    struct SubAgentArgs {
        task: String,
    }
    let args = serde_json::from_str::<SubAgentArgs>(&call.arguments)
        .map_err(|err| KilnErr::InvalidSubAgentArgs(err.to_string()))?;

    let scope = session.subagent_scope();
    let mut transcript = vec![TranscriptItem::user(args.task)];
    let params = CompactParams {
        max_context_tokens: ctx.config.max_context_tokens,
        keep_recent_rounds: ctx.config.keep_recent_rounds,
        instructions: SUBAGENT_SUMMARIZATION_INSTRUCTIONS.to_string(),
    };
    let outcome = run_loop(&scope, ctx, &mut transcript, &params, 0).await?;
    if outcome.aborted {
        return Err(KilnErr::Interrupted);
    }
    scope.checkpoints.commit(scope.id).await?;
    outcome.last_agent_message.ok_or(KilnErr::EmptyResponse)
}

struct SessionCallRunner<'a> {
    session: &'a Arc<Session>,
    ctx: &'a Arc<TurnContext>,
}

impl CallRunner for SessionCallRunner<'_> {
    fn run<'b>(&'b self, call: &'b ToolCall) -> BoxFuture<'b, Result<String>> {
        Box::pin(async move {
            match call.kind {
                ToolCallKind::Direct => {
                    self.ctx
                        .tools
                        .invoke(&call.name, &call.arguments, &self.ctx.cancel)
                        .await
                }
                ToolCallKind::SubAgent => run_subagent_turn(self.session, self.ctx, call).await,
            }
        })
    }
}

async fn run_loop(
    session: &Arc<Session>,
    ctx: &Arc<TurnContext>,
    transcript: &mut Vec<TranscriptItem>,
    params: &CompactParams,
    turn_start_index: u64,
) -> Result<TurnOutcome> {
    let mut last_prompt_tokens = 0u64;
    let mut compact_attempted = false;
    let mut give_up_on_pressure = false;
    let mut last_agent_message: Option<String> = None;

    loop {
        if give_up_on_pressure {
            // One compression pass already ran and usage is still at the
            // trigger; stop instead of looping on an unshrinkable window.
            return Err(KilnErr::ContextOverflow);
        }

        let compaction = compact::compact(
            transcript,
            last_prompt_tokens,
            params,
            ctx.client.as_ref(),
            &ctx.cancel,
        )
        .await;
        if compaction.compressed {
            *transcript = compaction.items;
            compact_attempted = true;
            session
                .send_event(TurnEvent::Compacted {
                    phase: compaction.phase,
                })
                .await;
        }

        let (text, calls, usage) = drain_completion(ctx, transcript).await?;
        if let Some(usage) = usage {
            last_prompt_tokens = usage.tokens_in_context_window();
            let percent = context_percent(last_prompt_tokens, ctx.config.max_context_tokens);
            if percent >= COMPACT_TRIGGER_PERCENT {
                if compact_attempted {
                    give_up_on_pressure = true;
                }
            } else {
                compact_attempted = false;
            }
        }

        if !text.is_empty() {
            transcript.push(TranscriptItem::assistant(text.clone()));
            last_agent_message = Some(text.clone());
            session.send_event(TurnEvent::AgentMessage(text)).await;
        }
        if calls.is_empty() {
            break;
        }
        for call in &calls {
            transcript.push(TranscriptItem::ToolCall(call.clone()));
        }

        let plan = resolve_confirmations(session, ctx, &calls).await;
        let results = match plan {
            BatchPlan::Aborted => {
                let results: Vec<ToolResult> = calls
                    .iter()
                    .map(|call| ToolResult::failure(&call.id, ABORTED_BY_USER_CONTENT))
                    .collect();
                for result in &results {
                    transcript.push(TranscriptItem::ToolOutput(result.clone()));
                }
                session
                    .send_event(TurnEvent::ToolBatchCompleted { results })
                    .await;
                return Ok(TurnOutcome {
                    last_agent_message,
                    aborted: true,
                });
            }
            BatchPlan::Resolved { rejected } => {
                let execute: Vec<ToolCall> = calls
                    .iter()
                    .filter(|call| !rejected.contains_key(&call.id))
                    .cloned()
                    .collect();

                protect_mutations(session, &execute, turn_start_index).await;

                let runner = SessionCallRunner { session, ctx };
                let executed = execute_batch(&execute, &runner, &ctx.cancel).await;
                merge_results(&calls, executed, &rejected)
            }
        };

        for result in &results {
            transcript.push(TranscriptItem::ToolOutput(result.clone()));
        }
        session
            .send_event(TurnEvent::ToolBatchCompleted { results })
            .await;

        if ctx.cancel.is_cancelled() {
            return Ok(TurnOutcome {
                last_agent_message,
                aborted: true,
            });
        }
    }

    Ok(TurnOutcome {
        last_agent_message,
        aborted: false,
    })
}

enum BatchPlan {
    /// User aborted: nothing in the batch executes.
    Aborted,
    /// Calls rejected per-call, keyed by call id with the rejection text.
    Resolved { rejected: HashMap<String, String> },
}

/// Resolve every needed confirmation before anything executes, so a late
/// rejection can never race an early mutation.
async fn resolve_confirmations(
    session: &Arc<Session>,
    ctx: &Arc<TurnContext>,
    calls: &[ToolCall],
) -> BatchPlan {
    let partition = partition_by_sensitivity(calls, ctx.config.unattended);
    let mut rejected = HashMap::new();
    for call in partition.sensitive {
        if let Some(argv) = shell_argv(call)
            && session.is_command_approved(&argv).await
        {
            // An explicit earlier per-call confirmation covers this one.
            continue;
        }
        match ctx.approvals.request_approval(call, calls).await {
            ReviewDecision::Approved => {}
            ReviewDecision::ApprovedForSession => {
                if let Some(argv) = shell_argv(call) {
                    session.remember_approved(argv).await;
                }
            }
            ReviewDecision::Denied { reason } => {
                let text = match reason {
                    Some(reason) => format!("rejected by user: {reason}"),
                    None => "rejected by user".to_string(),
                };
                rejected.insert(call.id.clone(), text);
            }
            ReviewDecision::Abort => return BatchPlan::Aborted,
        }
    }
    BatchPlan::Resolved { rejected }
}

/// Give the checkpoint manager first right-of-refusal on every file about
/// to be mutated. The checkpoint is opened lazily at the turn's first
/// mutating call. Snapshot failures are logged and skipped so one
/// unreadable file does not block the batch; the affected file simply
/// loses undo coverage for this turn.
async fn protect_mutations(session: &Arc<Session>, execute: &[ToolCall], turn_start_index: u64) {
    for call in execute {
        let Some(path) = mutated_path(call) else {
            continue;
        };
        if !session.checkpoints.is_active(session.id).await {
            if let Err(err) = session.checkpoints.create(session.id, turn_start_index).await {
                warn!("failed to open checkpoint: {err}");
                return;
            }
        }
        if let Err(err) = session.checkpoints.record_snapshot(session.id, &path).await {
            warn!("failed to snapshot {path}: {err}");
        }
    }
}

/// Reassemble the final result list in original batch order from the
/// executed sublist and the per-call rejections.
fn merge_results(
    calls: &[ToolCall],
    executed: Vec<ToolResult>,
    rejected: &HashMap<String, String>,
) -> Vec<ToolResult> {
    let mut executed = executed.into_iter();
    calls
        .iter()
        .map(|call| match rejected.get(&call.id) {
            Some(text) => ToolResult::failure(&call.id, text.clone()),
            None => executed
                .next()
                .unwrap_or_else(|| ToolResult::failure(&call.id, "missing tool result")),
        })
        .collect()
}

async fn drain_completion(
    ctx: &TurnContext,
    items: &[TranscriptItem],
) -> Result<(String, Vec<ToolCall>, Option<TokenUsage>)> {
    let mut stream = ctx.client.stream_completion(items, &ctx.cancel);
    let mut text = String::new();
    let mut calls: Vec<ToolCall> = Vec::new();
    let mut usage: Option<TokenUsage> = None;
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(KilnErr::Interrupted),
            event = stream.next() => event,
        };
        match event {
            Some(Ok(CompletionEvent::TextDelta(delta))) => text.push_str(&delta),
            Some(Ok(CompletionEvent::ToolCall(call))) => calls.push(call),
            Some(Ok(CompletionEvent::Completed { token_usage })) => {
                usage = token_usage;
                break;
            }
            Some(Err(err)) => return Err(err),
            None => {
                return Err(KilnErr::Stream(
                    "stream closed before emitting completion".to_string(),
                ));
            }
        }
    }
    Ok((text, calls, usage))
}
