use std::path::PathBuf;

use crate::compact::DEFAULT_KEEP_RECENT_ROUNDS;

/// Per-turn configuration, passed down explicitly rather than read from
/// ambient globals so that permission behavior stays testable without
/// setup/teardown.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Unattended ("YOLO") mode: tool calls run without per-call
    /// confirmation except where the sensitive-command rules override.
    pub unattended: bool,

    /// Context window of the configured model, in tokens.
    pub max_context_tokens: u64,

    /// Complete rounds preserved untouched at the tail of the transcript
    /// during compaction.
    pub keep_recent_rounds: usize,

    /// Directory holding session state (checkpoint files).
    pub state_dir: PathBuf,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            unattended: false,
            max_context_tokens: 128_000,
            keep_recent_rounds: DEFAULT_KEEP_RECENT_ROUNDS,
            state_dir: default_state_dir(),
        }
    }
}

/// `~/.kiln`, falling back to a relative `.kiln` when the home directory
/// cannot be determined (e.g. stripped-down containers).
pub fn default_state_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".kiln"),
        None => PathBuf::from(".kiln"),
    }
}
