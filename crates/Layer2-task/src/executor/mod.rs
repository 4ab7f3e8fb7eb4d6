//! Step executors
//!
//! - `ToolInvoker` - executes one `ActionStep` and reports typed failures
//! - `ToolHandler` - named backend behind `call_tool`
//! - `LocalToolInvoker` - runs steps on this machine (processes, files, artifacts)

pub mod local;
pub mod r#trait;

pub use local::{LocalToolInvoker, LocalToolInvokerConfig};
pub use r#trait::{StepContext, StepFailure, StepOutput, ToolHandler, ToolInvoker};
