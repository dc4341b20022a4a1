//! Serializable data model shared between the orchestration core and its
//! callers (UI front-ends, provider adapters, tool hosts).
//!
//! This crate is deliberately I/O-free: plain types plus serde.

mod models;
mod session_id;

pub use models::ContentText;
pub use models::ReviewDecision;
pub use models::TokenUsage;
pub use models::ToolCall;
pub use models::ToolCallKind;
pub use models::ToolOutputPayload;
pub use models::ToolResult;
pub use models::TranscriptItem;
pub use session_id::SessionId;
