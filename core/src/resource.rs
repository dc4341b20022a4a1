use std::fmt;

use kiln_protocol::ToolCall;
use serde::Deserialize;

/// All todo-list mutations read-modify-write one shared list, so the whole
/// batch serializes against this id.
pub const TODO_STATE_RESOURCE: &str = "todo-state";

/// Shell state, working directory and port/file locks make concurrent
/// shell commands unsafe, so every terminal invocation shares this id.
pub const TERMINAL_RESOURCE: &str = "terminal-execution";

/// Opaque contention key. Two calls with equal ids must execute in batch
/// order; calls with different ids may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    fn fixed(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
struct SingleFileArgs {
    #[serde(alias = "file_path")]
    path: String,
}

pub(crate) fn is_todo_tool(name: &str) -> bool {
    name == "update_plan" || name.starts_with("todo_")
}

pub(crate) fn is_shell_tool(name: &str) -> bool {
    matches!(name, "shell" | "container.exec" | "exec_command" | "write_stdin")
}

fn is_single_file_tool(name: &str) -> bool {
    matches!(name, "write_file" | "edit_file" | "create_file" | "delete_file")
}

fn is_batch_file_tool(name: &str) -> bool {
    // Multi-path edit tools serialize their own writes internally, so one
    // batch call never contends with another.
    matches!(name, "multi_edit" | "apply_patch")
}

/// Pure contention classifier. Malformed arguments degrade to the
/// independent case rather than failing the batch.
pub fn resource_id(call: &ToolCall) -> ResourceId {
    if is_todo_tool(&call.name) {
        return ResourceId::fixed(TODO_STATE_RESOURCE);
    }
    if is_shell_tool(&call.name) {
        return ResourceId::fixed(TERMINAL_RESOURCE);
    }
    if is_single_file_tool(&call.name) {
        if let Ok(args) = serde_json::from_str::<SingleFileArgs>(&call.arguments) {
            return ResourceId(format!("filesystem:{}", args.path));
        }
        return ResourceId(format!("independent:{}", call.id));
    }
    if is_batch_file_tool(&call.name) {
        return ResourceId(format!("filesystem-batch:{}", call.id));
    }
    ResourceId(format!("independent:{}", call.id))
}

/// Path mutated by a single-file tool call, when one can be determined.
/// Used by the turn coordinator to offer the checkpoint manager first
/// right-of-refusal before the call runs.
pub(crate) fn mutated_path(call: &ToolCall) -> Option<String> {
    if !is_single_file_tool(&call.name) {
        return None;
    }
    serde_json::from_str::<SingleFileArgs>(&call.arguments)
        .ok()
        .map(|args| args.path)
}
