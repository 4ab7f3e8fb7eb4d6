//! Tool invocation traits

use crate::action::ActionStep;
use async_trait::async_trait;
use pilot_foundation::{SessionId, StepMode, TaskId};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// Where and how a step runs
#[derive(Debug, Clone)]
pub struct StepContext {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub step_index: usize,
    /// Working directory for commands and base for relative paths
    pub workspace_dir: PathBuf,
    /// Mode captured when the step began
    pub mode: StepMode,
}

/// Successful step result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub stdout: String,
    pub stderr: String,
    /// Structured result (file content, artifact value, exit code ...)
    pub data: Value,
}

impl StepOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn text(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Typed step failure; fails only the owning task
#[derive(Error, Debug)]
pub enum StepFailure {
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("process exited with code {code}: {stderr}")]
    NonZeroExit {
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Executes one planned step
///
/// Implementations never see dry-run steps; the engine simulates those.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, step: &ActionStep, ctx: &StepContext) -> Result<StepOutput, StepFailure>;

    /// Invoker name (for logs)
    fn name(&self) -> &'static str;
}

/// Backend for `call_tool` steps, registered by name
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, args: &Value, ctx: &StepContext) -> Result<StepOutput, StepFailure>;
}
