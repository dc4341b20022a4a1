//! Orchestration core for a terminal coding agent: resilient tool-call
//! execution, unattended-mode permission gating, two-phase context
//! compression and checkpoint/undo based state recovery.
//!
//! Rendering, provider wire protocols and the tool implementations
//! themselves live outside this crate, behind the seams in [`client`] and
//! [`tools`].

pub mod checkpoint;
pub mod client;
pub mod compact;
pub mod config;
pub mod error;
pub mod resource;
pub mod safety;
pub mod scheduler;
pub mod tools;
pub mod turn;
pub mod undo;

pub use checkpoint::CheckpointManager;
pub use checkpoint::FileSnapshot;
pub use client::CompletionEvent;
pub use client::ModelStream;
pub use compact::Compaction;
pub use compact::CompactionPhase;
pub use config::TurnConfig;
pub use error::KilnErr;
pub use error::Result;
pub use resource::ResourceId;
pub use resource::resource_id;
pub use safety::PermissionDecision;
pub use safety::assess_tool_call;
pub use safety::partition_by_sensitivity;
pub use scheduler::CallRunner;
pub use scheduler::execute_batch;
pub use tools::ApprovalHandler;
pub use tools::ToolRouter;
pub use turn::Session;
pub use turn::TurnContext;
pub use turn::TurnEvent;
pub use turn::TurnOutcome;
pub use turn::run_turn;
pub use undo::UndoLog;
pub use undo::UndoLogEntry;
pub use undo::UndoOp;
pub use undo::UndoStore;
