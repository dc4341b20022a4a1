//! Two-phase context compression.
//!
//! Phase 1 is structural truncation: old oversized tool outputs are
//! replaced with short placeholders, which costs nothing. Phase 2 pays for
//! one summarization completion and only runs when truncation alone does
//! not bring the estimated context pressure back under the trigger. The
//! same engine serves the primary conversation and isolated sub-agent
//! transcripts; only the instruction text differs.

use std::collections::HashMap;

use futures::StreamExt;
use kiln_protocol::ContentText;
use kiln_protocol::TranscriptItem;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::client::CompletionEvent;
use crate::client::ModelStream;
use crate::error::KilnErr;
use crate::error::Result;

/// Compression triggers when prompt tokens reach this share of the model's
/// context window. The Phase-1 estimate is re-checked against the same
/// threshold before deciding on Phase 2.
pub const COMPACT_TRIGGER_PERCENT: f64 = 70.0;

/// Complete rounds preserved untouched at the transcript tail.
pub const DEFAULT_KEEP_RECENT_ROUNDS: usize = 3;

/// Eligible tool outputs shorter than this are left as-is in Phase 1.
pub const TRUNCATION_MIN_CHARS: usize = 500;

/// Hard per-message cap applied to tool outputs when rendering the
/// summarization request, to bound its size.
pub const SUMMARY_INPUT_CAP_CHARS: usize = 300;

pub const SUMMARIZATION_INSTRUCTIONS: &str = "Summarize the conversation so far so that work \
can continue from the summary alone. Keep decisions, file paths, code changes, task status \
and unresolved errors; drop tool output detail and pleasantries. Respond with the summary \
text only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionPhase {
    None,
    Truncation,
    AiSummary,
}

/// Pure transformation result; the input transcript is never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Compaction {
    pub compressed: bool,
    pub phase: CompactionPhase,
    pub items: Vec<TranscriptItem>,
}

#[derive(Debug, Clone)]
pub struct CompactParams {
    pub max_context_tokens: u64,
    pub keep_recent_rounds: usize,
    /// Instruction text for the Phase-2 summarization call. Sub-agent
    /// transcripts substitute their own.
    pub instructions: String,
}

impl Default for CompactParams {
    fn default() -> Self {
        Self {
            max_context_tokens: 128_000,
            keep_recent_rounds: DEFAULT_KEEP_RECENT_ROUNDS,
            instructions: SUMMARIZATION_INSTRUCTIONS.to_string(),
        }
    }
}

pub fn context_percent(tokens: u64, max_context_tokens: u64) -> f64 {
    if max_context_tokens == 0 {
        return 0.0;
    }
    tokens as f64 / max_context_tokens as f64 * 100.0
}

/// Compress `items` if context pressure demands it.
///
/// Degrades gracefully: a Phase-2 failure returns the Phase-1 result, and
/// no compression path ever returns an error that would block the turn.
pub async fn compact(
    items: &[TranscriptItem],
    last_prompt_tokens: u64,
    params: &CompactParams,
    client: &dyn ModelStream,
    cancel: &CancellationToken,
) -> Compaction {
    let percent = context_percent(last_prompt_tokens, params.max_context_tokens);
    if percent < COMPACT_TRIGGER_PERCENT {
        return Compaction {
            compressed: false,
            phase: CompactionPhase::None,
            items: items.to_vec(),
        };
    }

    // Phase 1: zero-cost structural truncation of old tool outputs.
    let boundary = preserved_boundary(items, params.keep_recent_rounds);
    let chars_before = total_chars(items);
    let (truncated, changed) = truncate_eligible(items, boundary);
    let chars_after = total_chars(&truncated);
    let estimated = estimate_tokens(last_prompt_tokens, chars_before, chars_after);
    debug!(
        "compaction: {last_prompt_tokens} tokens ({percent:.0}%), estimated {estimated} after truncation"
    );
    if changed && context_percent(estimated, params.max_context_tokens) < COMPACT_TRIGGER_PERCENT {
        return Compaction {
            compressed: true,
            phase: CompactionPhase::Truncation,
            items: truncated,
        };
    }

    // Phase 2: paid summarization of everything before the preserved
    // region, re-located on the truncated transcript.
    let boundary = preserved_boundary(&truncated, params.keep_recent_rounds);
    if boundary == 0 {
        // Nothing eligible: the recent rounds span the whole transcript.
        return phase_one_outcome(truncated, changed);
    }
    let flattened = flatten_for_summary(&truncated[..boundary]);
    match summarize(&flattened, &params.instructions, client, cancel).await {
        Ok(summary) => {
            let mut compacted = Vec::with_capacity(truncated.len() - boundary + 1);
            compacted.push(TranscriptItem::user(format!(
                "Summary of the earlier conversation:\n{summary}"
            )));
            compacted.extend_from_slice(&truncated[boundary..]);
            Compaction {
                compressed: true,
                phase: CompactionPhase::AiSummary,
                items: compacted,
            }
        }
        Err(err) => {
            warn!("summarization failed, keeping truncated transcript: {err}");
            phase_one_outcome(truncated, changed)
        }
    }
}

fn phase_one_outcome(items: Vec<TranscriptItem>, changed: bool) -> Compaction {
    Compaction {
        compressed: changed,
        phase: if changed {
            CompactionPhase::Truncation
        } else {
            CompactionPhase::None
        },
        items,
    }
}

fn is_assistant_message(item: &TranscriptItem) -> bool {
    matches!(item, TranscriptItem::Message { role, .. } if role == ContentText::ASSISTANT)
}

/// Ascending start indices of rounds: each run of tool-call items (plus
/// the assistant message directly preceding it, if any) begins one round.
fn round_starts(items: &[TranscriptItem]) -> Vec<usize> {
    let mut starts = Vec::new();
    for idx in 0..items.len() {
        let is_call = matches!(items[idx], TranscriptItem::ToolCall(_));
        let prev_is_call = idx > 0 && matches!(items[idx - 1], TranscriptItem::ToolCall(_));
        if is_call && !prev_is_call {
            let start = if idx > 0 && is_assistant_message(&items[idx - 1]) {
                idx - 1
            } else {
                idx
            };
            starts.push(start);
        }
    }
    starts
}

/// Index of the first item of the preserved region: everything at or after
/// it stays untouched, everything before it is eligible for reduction.
/// Returns 0 (nothing eligible) when fewer than `keep_recent_rounds`
/// complete rounds exist.
pub(crate) fn preserved_boundary(items: &[TranscriptItem], keep_recent_rounds: usize) -> usize {
    if keep_recent_rounds == 0 {
        return items.len();
    }
    let starts = round_starts(items);
    if starts.len() < keep_recent_rounds {
        0
    } else {
        starts[starts.len() - keep_recent_rounds]
    }
}

fn tool_names_by_call_id(items: &[TranscriptItem]) -> HashMap<&str, &str> {
    items
        .iter()
        .filter_map(|item| match item {
            TranscriptItem::ToolCall(call) => Some((call.id.as_str(), call.name.as_str())),
            _ => None,
        })
        .collect()
}

fn truncate_eligible(items: &[TranscriptItem], boundary: usize) -> (Vec<TranscriptItem>, bool) {
    let names = tool_names_by_call_id(items);
    let mut out = items.to_vec();
    let mut changed = false;
    for item in &mut out[..boundary] {
        if let TranscriptItem::ToolOutput(result) = item {
            let chars = result.output.content.chars().count();
            if chars > TRUNCATION_MIN_CHARS {
                let name = names
                    .get(result.call_id.as_str())
                    .copied()
                    .unwrap_or("unknown tool");
                result.output.content = format!("[{name} output elided: {chars} chars]");
                changed = true;
            }
        }
    }
    (out, changed)
}

fn total_chars(items: &[TranscriptItem]) -> usize {
    items
        .iter()
        .map(|item| match item {
            TranscriptItem::Message { content, .. } => content.chars().count(),
            TranscriptItem::ToolCall(call) => {
                call.name.chars().count() + call.arguments.chars().count()
            }
            TranscriptItem::ToolOutput(result) => result.output.content.chars().count(),
        })
        .sum()
}

/// Character-length ratio as a proxy for token savings. A deliberate
/// approximation: a real tokenizer may be substituted without changing the
/// trigger contract.
fn estimate_tokens(last_prompt_tokens: u64, chars_before: usize, chars_after: usize) -> u64 {
    if chars_before == 0 {
        return last_prompt_tokens;
    }
    (last_prompt_tokens as f64 * chars_after as f64 / chars_before as f64) as u64
}

fn cap_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let capped: String = text.chars().take(max_chars).collect();
    format!("{capped}…")
}

/// Render the eligible region as one flat transcript string for the
/// summarization request. System messages are dropped; tool outputs are
/// hard-capped to bound the request size.
fn flatten_for_summary(items: &[TranscriptItem]) -> String {
    let names = tool_names_by_call_id(items);
    items
        .iter()
        .filter_map(|item| match item {
            TranscriptItem::Message { role, .. } if role == ContentText::SYSTEM => None,
            TranscriptItem::Message { role, content } => Some(format!("{role}: {content}")),
            TranscriptItem::ToolCall(call) => Some(format!("{}({})", call.name, call.arguments)),
            TranscriptItem::ToolOutput(result) => {
                let name = names.get(result.call_id.as_str()).copied().unwrap_or("tool");
                Some(format!(
                    "{name} -> {}",
                    cap_chars(&result.output.content, SUMMARY_INPUT_CAP_CHARS)
                ))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn summarize(
    flattened: &str,
    instructions: &str,
    client: &dyn ModelStream,
    cancel: &CancellationToken,
) -> Result<String> {
    let request = vec![
        TranscriptItem::message(ContentText::SYSTEM, instructions),
        TranscriptItem::user(flattened),
    ];
    let mut stream = client.stream_completion(&request, cancel);
    let mut summary = String::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KilnErr::Interrupted),
            event = stream.next() => event,
        };
        match event {
            Some(Ok(CompletionEvent::TextDelta(delta))) => summary.push_str(&delta),
            Some(Ok(CompletionEvent::ToolCall(call))) => {
                debug!("ignoring tool call {} in summarization stream", call.id);
            }
            Some(Ok(CompletionEvent::Completed { .. })) | None => break,
            Some(Err(err)) => return Err(err),
        }
    }
    let summary = summary.trim();
    if summary.is_empty() {
        return Err(KilnErr::EmptyResponse);
    }
    Ok(summary.to_string())
}
