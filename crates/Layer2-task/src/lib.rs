//! # pilot-task
//!
//! Task execution for Pilot.
//! Drives planned steps through a state machine, holds destructive steps for
//! operator approval and executes the rest through a tool invoker.
//!
//! ## Features
//!
//! - Task state machine with run / cancel / retry (`TaskEngine`)
//! - Approval gate with per-session "don't ask again" allowlist
//! - Closed action set with typed payloads (`Action`, `ActionStep`)
//! - Local tool invocation (processes, files, git, docker, artifacts)
//! - Durable store for sessions, tasks, approvals and log lines (memory / SQLite)

pub mod action;
pub mod approval;
pub mod artifact;
pub mod engine;
pub mod executor;
pub mod lock;
pub mod log;
pub mod state;
pub mod store;
pub mod task;

// Actions
pub use action::{parse_plan, validate_plan, Action, ActionKind, ActionStep};

// Task system
pub use engine::{requires_approval, TaskEngine, TASK_CANCELLED};
pub use state::TaskStatus;
pub use task::{Task, INTERRUPTED, REJECTED_BY_OPERATOR};

// Approvals
pub use approval::{Allowlist, Approval, ApprovalGate, ApprovalOutcome, ApprovalStatus};

// Execution
pub use artifact::{ArtifactKey, ArtifactStore, MemoryArtifactStore};
pub use executor::{
    LocalToolInvoker, LocalToolInvokerConfig, StepContext, StepFailure, StepOutput, ToolHandler,
    ToolInvoker,
};

// Storage and logs
pub use log::{LogEntry, LogLevel};
pub use store::{MemoryStore, SqliteStore, Store};
