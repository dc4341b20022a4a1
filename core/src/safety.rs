use std::sync::LazyLock;

use kiln_protocol::ToolCall;
use regex_lite::Regex;
use serde::Deserialize;
use tracing::error;

use crate::resource::is_shell_tool;

/// Outcome of the permission gate for a single tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub needs_confirmation: bool,
    pub is_sensitive: bool,
    /// Human-readable name of the sensitive rule that fired, for display
    /// alongside the confirmation prompt.
    pub matched_rule: Option<&'static str>,
}

impl PermissionDecision {
    fn auto() -> Self {
        Self {
            needs_confirmation: false,
            is_sensitive: false,
            matched_rule: None,
        }
    }

    fn confirm() -> Self {
        Self {
            needs_confirmation: true,
            is_sensitive: false,
            matched_rule: None,
        }
    }

    fn sensitive(rule: &'static str) -> Self {
        Self {
            needs_confirmation: true,
            is_sensitive: true,
            matched_rule: Some(rule),
        }
    }
}

struct SensitiveRule {
    name: &'static str,
    pattern: Regex,
}

const RULE_DEFS: &[(&str, &str)] = &[
    ("filesystem format", r"\bmkfs\b"),
    ("raw device write", r"\bdd\b.*\bof=/dev/|>\s*/dev/sd"),
    (
        "privilege escalation",
        r"^(sudo|doas|su)\b|[;&|]\s*(sudo|doas|su)\b",
    ),
    ("world-writable permissions", r"\bchmod\b.*\b777\b"),
    ("fork bomb", r":\(\)\s*\{"),
    ("shell history exposure", r"\bhistory\b"),
    (
        "credential file access",
        r"\.ssh/|\.aws/credentials|/etc/shadow|\.netrc|\bid_rsa\b",
    ),
    (
        "remote script execution",
        r"\b(curl|wget)\b[^|]*\|\s*(ba|z|da)?sh\b",
    ),
];

/// `None` when any rule pattern failed to compile; callers must then fail
/// closed rather than treating commands as safe.
static SENSITIVE_RULES: LazyLock<Option<Vec<SensitiveRule>>> = LazyLock::new(|| {
    RULE_DEFS
        .iter()
        .map(|(name, pattern)| match Regex::new(pattern) {
            Ok(pattern) => Some(SensitiveRule { name, pattern }),
            Err(err) => {
                error!("sensitive rule {name} failed to compile: {err}");
                None
            }
        })
        .collect()
});

const RULE_EVALUATION_FAILED: &str = "sensitive-rule evaluation failed";
const UNPARSEABLE_COMMAND: &str = "unparseable command";
const RECURSIVE_FORCE_DELETE: &str = "recursive force delete";

/// `rm` with both a recursive and a force flag, in any spelling: combined
/// short clusters (`-rf`, `-fR`), separate tokens (`-r -f`), or long flags
/// (`--recursive --force`). Flag clusters cannot be matched reliably by a
/// token regex, so this one rule classifies from the parsed argv. The scan
/// stops at shell separators so flags on a later command never combine
/// with an earlier `rm`.
fn is_recursive_force_delete(argv: &[String]) -> bool {
    for (idx, token) in argv.iter().enumerate() {
        if token != "rm" {
            continue;
        }
        let mut recursive = false;
        let mut force = false;
        for arg in &argv[idx + 1..] {
            if matches!(arg.as_str(), ";" | "&" | "&&" | "|" | "||") {
                break;
            }
            if let Some(long) = arg.strip_prefix("--") {
                recursive |= long.eq_ignore_ascii_case("recursive");
                force |= long.eq_ignore_ascii_case("force");
            } else if let Some(short) = arg.strip_prefix('-') {
                recursive |= short.contains(['r', 'R']);
                force |= short.contains('f');
            }
        }
        if recursive && force {
            return true;
        }
    }
    false
}

#[derive(Deserialize)]
struct ShellArgs {
    command: CommandField,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandField {
    Argv(Vec<String>),
    Line(String),
}

impl CommandField {
    fn as_text(&self) -> String {
        match self {
            CommandField::Argv(argv) => argv.join(" "),
            CommandField::Line(line) => line.clone(),
        }
    }
}

fn match_sensitive_command(command: &str) -> Option<&'static str> {
    let Some(rules) = SENSITIVE_RULES.as_ref() else {
        // A broken rule table must never fail open.
        return Some(RULE_EVALUATION_FAILED);
    };
    // A command we cannot tokenize (unbalanced quoting, trailing escapes)
    // is a command we cannot reason about.
    let Some(argv) = shlex::split(command) else {
        return Some(UNPARSEABLE_COMMAND);
    };
    if is_recursive_force_delete(&argv) {
        return Some(RECURSIVE_FORCE_DELETE);
    }
    rules
        .iter()
        .find(|rule| rule.pattern.is_match(command))
        .map(|rule| rule.name)
}

/// Permission gate for one tool call.
///
/// Attended mode is conservative: everything needs confirmation.
/// Unattended mode auto-approves except for shell invocations matching the
/// sensitive rule set, which always require confirmation regardless of
/// configuration. Any failure along the way fails closed.
pub fn assess_tool_call(call: &ToolCall, unattended: bool) -> PermissionDecision {
    if !unattended {
        return PermissionDecision::confirm();
    }
    if !is_shell_tool(&call.name) {
        return PermissionDecision::auto();
    }
    let Ok(args) = serde_json::from_str::<ShellArgs>(&call.arguments) else {
        return PermissionDecision::sensitive(UNPARSEABLE_COMMAND);
    };
    match match_sensitive_command(&args.command.as_text()) {
        Some(rule) => PermissionDecision::sensitive(rule),
        None => PermissionDecision::auto(),
    }
}

/// A batch split by the per-call decision, preserving batch order within
/// each half. The coordinator auto-runs `auto` and prompts for `sensitive`.
#[derive(Debug, Default)]
pub struct BatchPartition<'a> {
    pub sensitive: Vec<&'a ToolCall>,
    pub auto: Vec<&'a ToolCall>,
}

pub fn partition_by_sensitivity(calls: &[ToolCall], unattended: bool) -> BatchPartition<'_> {
    let mut partition = BatchPartition::default();
    for call in calls {
        if assess_tool_call(call, unattended).needs_confirmation {
            partition.sensitive.push(call);
        } else {
            partition.auto.push(call);
        }
    }
    partition
}

/// Normalized argv for a shell call, used to key the session-scoped
/// approved-command set. `None` for non-shell calls or commands that do
/// not tokenize.
pub fn shell_argv(call: &ToolCall) -> Option<Vec<String>> {
    if !is_shell_tool(&call.name) {
        return None;
    }
    let args = serde_json::from_str::<ShellArgs>(&call.arguments).ok()?;
    match args.command {
        CommandField::Argv(argv) => Some(argv),
        CommandField::Line(line) => shlex::split(&line),
    }
}
