use futures::stream::BoxStream;
use kiln_protocol::TokenUsage;
use kiln_protocol::ToolCall;
use kiln_protocol::TranscriptItem;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// One event from a streaming completion. Providers emit any number of
/// `TextDelta`/`ToolCall` events and finish with exactly one `Completed`.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    TextDelta(String),
    ToolCall(ToolCall),
    Completed { token_usage: Option<TokenUsage> },
}

/// Streaming text-generation seam. The core stays agnostic to provider
/// wire protocols; implementations live outside this crate.
pub trait ModelStream: Send + Sync {
    /// Stream one completion for `items`. Implementations should abort
    /// in-flight network work when `cancel` fires; the core additionally
    /// guards every poll site with the same token.
    fn stream_completion<'a>(
        &'a self,
        items: &'a [TranscriptItem],
        cancel: &'a CancellationToken,
    ) -> BoxStream<'a, Result<CompletionEvent>>;
}
