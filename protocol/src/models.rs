use serde::Deserialize;
use serde::Serialize;

/// A single capability invocation requested by the model.
///
/// Immutable once produced: the turn that received it owns it and every
/// downstream component (classifier, gate, scheduler, checkpoint layer)
/// only ever borrows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id; results are matched back by this id.
    pub id: String,
    pub name: String,
    /// Raw JSON arguments exactly as the model produced them. May be
    /// malformed; consumers must degrade safely when parsing fails.
    pub arguments: String,
    #[serde(default)]
    pub kind: ToolCallKind,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            kind: ToolCallKind::Direct,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    #[default]
    Direct,
    /// The call drives a nested conversation loop over an isolated
    /// transcript rather than a plain capability invocation.
    SubAgent,
}

/// Payload of a completed (or failed) tool call. On failure `content`
/// carries the error description and `success` is `Some(false)`; `None`
/// means success could not be determined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutputPayload {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// One result per [`ToolCall`], always produced. The scheduler guarantees
/// a 1:1, order-preserving mapping back to the originating batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub output: ToolOutputPayload,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: ToolOutputPayload {
                content: content.into(),
                success: Some(true),
            },
        }
    }

    pub fn failure(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: ToolOutputPayload {
                content: content.into(),
                success: Some(false),
            },
        }
    }
}

/// One item of conversation history, in the order the model saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptItem {
    Message { role: String, content: String },
    ToolCall(ToolCall),
    ToolOutput(ToolResult),
}

impl TranscriptItem {
    pub fn message(role: impl Into<String>, content: impl Into<String>) -> Self {
        TranscriptItem::Message {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::message(ContentText::USER, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::message(ContentText::ASSISTANT, content)
    }
}

/// User's verdict on a confirmation request raised by the permission gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Run the call this one time.
    Approved,
    /// Run the call and skip confirmation for the identical command for
    /// the rest of the session.
    ApprovedForSession,
    /// Skip the call; the model sees a structured rejection so it can
    /// adapt instead of retrying blindly.
    Denied { reason: Option<String> },
    /// Stop here: the remaining calls in the batch are not executed.
    Abort,
}

impl Default for ReviewDecision {
    fn default() -> Self {
        ReviewDecision::Denied { reason: None }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Tokens occupying the context window ahead of the next request.
    pub fn tokens_in_context_window(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Role strings for [`TranscriptItem::Message`]; kept here so every
/// producer and consumer of transcripts agrees on the exact values.
pub struct ContentText;

impl ContentText {
    pub const SYSTEM: &'static str = "system";
    pub const USER: &'static str = "user";
    pub const ASSISTANT: &'static str = "assistant";
}
