use futures::future::BoxFuture;
use kiln_protocol::ReviewDecision;
use kiln_protocol::ToolCall;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// External capability registry (filesystem, shell, web, IDE bridge, ...).
/// An `Err` from `invoke` never escapes the scheduler: it is converted
/// into an error-content tool result for the originating call.
pub trait ToolRouter: Send + Sync {
    fn invoke<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String>>;
}

/// User-facing confirmation surface. Called only for tool calls the
/// permission gate marked as needing confirmation; sub-agent turns forward
/// their confirmations through the parent's handler so the user sees one
/// surface regardless of nesting depth.
pub trait ApprovalHandler: Send + Sync {
    /// `siblings` is the rest of the batch the call arrived in, for
    /// display context.
    fn request_approval<'a>(
        &'a self,
        call: &'a ToolCall,
        siblings: &'a [ToolCall],
    ) -> BoxFuture<'a, ReviewDecision>;
}
