use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KilnErr>;

#[derive(Error, Debug)]
pub enum KilnErr {
    /// The completion stream disconnected or errored out before it emitted
    /// its final `Completed` event. The turn loop treats this as fatal for
    /// the current turn; compaction treats it as a soft failure and falls
    /// back to the structural-truncation result.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    /// The completion stream finished without producing any text where
    /// text was required (e.g. an empty summarization response).
    #[error("stream completed without content")]
    EmptyResponse,

    /// Cooperative cancellation. Surfaced to the model as an "interrupted"
    /// tool result; a partially written checkpoint is left in place for the
    /// caller to roll back explicitly.
    #[error("interrupted")]
    Interrupted,

    /// Prompt usage stayed at or above the compaction trigger even after a
    /// compression pass. The turn stops rather than looping on a context
    /// window it cannot shrink.
    #[error(
        "conversation is still above the context limit after automatic \
         summarization; start a new session or trim your input"
    )]
    ContextOverflow,

    /// A sub-agent call carried arguments the coordinator could not parse.
    #[error("invalid sub-agent arguments: {0}")]
    InvalidSubAgentArgs(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
