use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::future::join_all;
use kiln_protocol::ToolCall;
use kiln_protocol::ToolResult;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::KilnErr;
use crate::error::Result;
use crate::resource::ResourceId;
use crate::resource::resource_id;

/// Executes one tool call to completion. The turn coordinator supplies the
/// implementation: direct calls route to the external tool registry,
/// sub-agent calls to a nested turn over an isolated transcript.
pub trait CallRunner: Send + Sync {
    fn run<'a>(&'a self, call: &'a ToolCall) -> BoxFuture<'a, Result<String>>;
}

const INTERRUPTED_CONTENT: &str = "execution interrupted";
const ABORTED_CONTENT: &str = "aborted before execution";

/// Execute a batch of tool calls with resource-grouped concurrency.
///
/// Calls are grouped by [`resource_id`]; groups run concurrently while
/// calls within a group run strictly sequentially in batch order. A
/// failing call never aborts its group, the batch, or sibling groups: the
/// failure becomes the content of that call's result. The returned vector
/// is always in the original batch order with exactly one result per call.
pub async fn execute_batch(
    calls: &[ToolCall],
    runner: &dyn CallRunner,
    cancel: &CancellationToken,
) -> Vec<ToolResult> {
    let mut order: Vec<ResourceId> = Vec::new();
    let mut groups: HashMap<ResourceId, Vec<(usize, &ToolCall)>> = HashMap::new();
    for (index, call) in calls.iter().enumerate() {
        let id = resource_id(call);
        match groups.get_mut(&id) {
            Some(members) => members.push((index, call)),
            None => {
                order.push(id.clone());
                groups.insert(id, vec![(index, call)]);
            }
        }
    }

    let group_futures = order.iter().filter_map(|id| groups.get(id)).map(|members| async move {
        let mut results: Vec<(usize, ToolResult)> = Vec::with_capacity(members.len());
        for (index, call) in members {
            if cancel.is_cancelled() {
                results.push((*index, ToolResult::failure(&call.id, ABORTED_CONTENT)));
                continue;
            }
            results.push((*index, run_one(*call, runner, cancel).await));
        }
        results
    });

    let mut indexed: Vec<(usize, ToolResult)> =
        join_all(group_futures).await.into_iter().flatten().collect();
    // Callers must never observe scheduling artifacts: reassemble the
    // original request order regardless of group completion order.
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, result)| result).collect()
}

async fn run_one(
    call: &ToolCall,
    runner: &dyn CallRunner,
    cancel: &CancellationToken,
) -> ToolResult {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KilnErr::Interrupted),
        outcome = runner.run(call) => outcome,
    };
    match outcome {
        Ok(content) => ToolResult::success(&call.id, content),
        Err(KilnErr::Interrupted) => {
            warn!("tool call {} interrupted", call.id);
            ToolResult::failure(&call.id, INTERRUPTED_CONTENT)
        }
        Err(err) => {
            warn!("tool call {} ({}) failed: {err}", call.id, call.name);
            ToolResult::failure(&call.id, format!("tool execution failed: {err}"))
        }
    }
}
