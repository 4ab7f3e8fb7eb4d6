//! Plan actions
//!
//! A plan is an ordered list of [`ActionStep`]s. Each step carries one
//! [`Action`], a closed tagged enum so dispatch over action kinds is
//! exhaustive. On the wire a step looks like
//! `{"action": "shell_exec", "command": "echo hi", "description": "..."}`;
//! the primary field of every variant also accepts the generic `target` key.

use pilot_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Action names, without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CheckTool,
    InstallTool,
    CallTool,
    ReadFile,
    WriteFile,
    DeleteFile,
    GitClone,
    GitCommit,
    GitPush,
    GitCreateBranch,
    GitCreatePr,
    SaveArtifact,
    GetArtifact,
    ShellExec,
    PythonExec,
    DockerRun,
    WaitApproval,
}

impl ActionKind {
    pub const ALL: [ActionKind; 17] = [
        Self::CheckTool,
        Self::InstallTool,
        Self::CallTool,
        Self::ReadFile,
        Self::WriteFile,
        Self::DeleteFile,
        Self::GitClone,
        Self::GitCommit,
        Self::GitPush,
        Self::GitCreateBranch,
        Self::GitCreatePr,
        Self::SaveArtifact,
        Self::GetArtifact,
        Self::ShellExec,
        Self::PythonExec,
        Self::DockerRun,
        Self::WaitApproval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckTool => "check_tool",
            Self::InstallTool => "install_tool",
            Self::CallTool => "call_tool",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::DeleteFile => "delete_file",
            Self::GitClone => "git_clone",
            Self::GitCommit => "git_commit",
            Self::GitPush => "git_push",
            Self::GitCreateBranch => "git_create_branch",
            Self::GitCreatePr => "git_create_pr",
            Self::SaveArtifact => "save_artifact",
            Self::GetArtifact => "get_artifact",
            Self::ShellExec => "shell_exec",
            Self::PythonExec => "python_exec",
            Self::DockerRun => "docker_run",
            Self::WaitApproval => "wait_approval",
        }
    }

    /// Side-effecting actions that are held for operator approval
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::DeleteFile | Self::GitPush | Self::ShellExec | Self::DockerRun
        )
    }

    /// Destructive actions plus the explicit approval checkpoint
    pub fn is_gated(&self) -> bool {
        self.is_destructive() || matches!(self, Self::WaitApproval)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown action: {}", s)))
    }
}

/// One action with its typed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CheckTool {
        #[serde(alias = "target")]
        tool: String,
    },
    InstallTool {
        #[serde(alias = "target")]
        tool: String,
        /// Install command prefix, e.g. `pip install` or `cargo install`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        manager: Option<String>,
    },
    CallTool {
        #[serde(alias = "target")]
        tool: String,
        #[serde(default)]
        args: Value,
    },
    ReadFile {
        #[serde(alias = "target")]
        path: String,
    },
    WriteFile {
        #[serde(alias = "target")]
        path: String,
        #[serde(default)]
        content: String,
    },
    DeleteFile {
        #[serde(alias = "target")]
        path: String,
    },
    GitClone {
        #[serde(alias = "target")]
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
    },
    GitCommit {
        #[serde(alias = "target")]
        message: String,
        /// Stage every change before committing
        #[serde(default)]
        all: bool,
    },
    GitPush {
        #[serde(default, alias = "target", skip_serializing_if = "Option::is_none")]
        remote: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    GitCreateBranch {
        #[serde(alias = "target")]
        name: String,
    },
    GitCreatePr {
        #[serde(alias = "target")]
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<String>,
    },
    SaveArtifact {
        provider: String,
        #[serde(alias = "target", alias = "ref")]
        reference: String,
        #[serde(default)]
        content: Value,
    },
    GetArtifact {
        provider: String,
        #[serde(alias = "target", alias = "ref")]
        reference: String,
    },
    ShellExec {
        #[serde(alias = "target")]
        command: String,
    },
    PythonExec {
        #[serde(alias = "target")]
        code: String,
    },
    DockerRun {
        #[serde(alias = "target")]
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    WaitApproval {
        #[serde(default, alias = "target", skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::CheckTool { .. } => ActionKind::CheckTool,
            Self::InstallTool { .. } => ActionKind::InstallTool,
            Self::CallTool { .. } => ActionKind::CallTool,
            Self::ReadFile { .. } => ActionKind::ReadFile,
            Self::WriteFile { .. } => ActionKind::WriteFile,
            Self::DeleteFile { .. } => ActionKind::DeleteFile,
            Self::GitClone { .. } => ActionKind::GitClone,
            Self::GitCommit { .. } => ActionKind::GitCommit,
            Self::GitPush { .. } => ActionKind::GitPush,
            Self::GitCreateBranch { .. } => ActionKind::GitCreateBranch,
            Self::GitCreatePr { .. } => ActionKind::GitCreatePr,
            Self::SaveArtifact { .. } => ActionKind::SaveArtifact,
            Self::GetArtifact { .. } => ActionKind::GetArtifact,
            Self::ShellExec { .. } => ActionKind::ShellExec,
            Self::PythonExec { .. } => ActionKind::PythonExec,
            Self::DockerRun { .. } => ActionKind::DockerRun,
            Self::WaitApproval { .. } => ActionKind::WaitApproval,
        }
    }

    /// The primary operand of the action, if it has one
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::CheckTool { tool }
            | Self::InstallTool { tool, .. }
            | Self::CallTool { tool, .. } => Some(tool.as_str()),
            Self::ReadFile { path } | Self::WriteFile { path, .. } | Self::DeleteFile { path } => {
                Some(path.as_str())
            }
            Self::GitClone { url, .. } => Some(url.as_str()),
            Self::GitCommit { message, .. } => Some(message.as_str()),
            Self::GitPush { remote, .. } => remote.as_deref(),
            Self::GitCreateBranch { name } => Some(name.as_str()),
            Self::GitCreatePr { title, .. } => Some(title.as_str()),
            Self::SaveArtifact { reference, .. } | Self::GetArtifact { reference, .. } => {
                Some(reference.as_str())
            }
            Self::ShellExec { command } => Some(command.as_str()),
            Self::PythonExec { code } => Some(code.as_str()),
            Self::DockerRun { image, .. } => Some(image.as_str()),
            Self::WaitApproval { reason } => reason.as_deref(),
        }
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::CheckTool { tool }
            | Self::InstallTool { tool, .. }
            | Self::CallTool { tool, .. } => vec![("tool", tool.as_str())],
            Self::ReadFile { path } | Self::WriteFile { path, .. } | Self::DeleteFile { path } => {
                vec![("path", path.as_str())]
            }
            Self::GitClone { url, .. } => vec![("url", url.as_str())],
            Self::GitCommit { message, .. } => vec![("message", message.as_str())],
            Self::GitCreateBranch { name } => vec![("name", name.as_str())],
            Self::GitCreatePr { title, .. } => vec![("title", title.as_str())],
            Self::SaveArtifact {
                provider,
                reference,
                ..
            }
            | Self::GetArtifact {
                provider,
                reference,
            } => vec![("provider", provider.as_str()), ("reference", reference.as_str())],
            Self::ShellExec { command } => vec![("command", command.as_str())],
            Self::PythonExec { code } => vec![("code", code.as_str())],
            Self::DockerRun { image, .. } => vec![("image", image.as_str())],
            Self::GitPush { .. } | Self::WaitApproval { .. } => Vec::new(),
        }
    }
}

/// One planned step. Immutable once the task is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    #[serde(flatten)]
    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ActionStep {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    pub fn target(&self) -> Option<&str> {
        self.action.target()
    }

    /// Operator-facing one-liner used for approvals and logs
    pub fn details(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        match self.target() {
            Some(target) => format!("{} {}", self.kind(), target),
            None => self.kind().to_string(),
        }
    }

    /// Reject steps with empty required operands
    pub fn validate(&self) -> Result<()> {
        for (field, value) in self.action.required_fields() {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "{}: '{}' must not be empty",
                    self.kind(),
                    field
                )));
            }
        }
        Ok(())
    }

    // Shorthand constructors

    pub fn check_tool(tool: impl Into<String>) -> Self {
        Self::new(Action::CheckTool { tool: tool.into() })
    }

    pub fn shell_exec(command: impl Into<String>) -> Self {
        Self::new(Action::ShellExec {
            command: command.into(),
        })
    }

    pub fn read_file(path: impl Into<String>) -> Self {
        Self::new(Action::ReadFile { path: path.into() })
    }

    pub fn write_file(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Action::WriteFile {
            path: path.into(),
            content: content.into(),
        })
    }

    pub fn delete_file(path: impl Into<String>) -> Self {
        Self::new(Action::DeleteFile { path: path.into() })
    }

    pub fn wait_approval(reason: impl Into<String>) -> Self {
        Self::new(Action::WaitApproval {
            reason: Some(reason.into()),
        })
    }
}

/// Parse and validate a plan from JSON
pub fn parse_plan(value: Value) -> Result<Vec<ActionStep>> {
    let plan: Vec<ActionStep> = serde_json::from_value(value)
        .map_err(|e| Error::Validation(format!("malformed plan: {}", e)))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// A plan must be non-empty and every step well-formed
pub fn validate_plan(plan: &[ActionStep]) -> Result<()> {
    if plan.is_empty() {
        return Err(Error::Validation("plan must contain at least one step".into()));
    }
    for (index, step) in plan.iter().enumerate() {
        step.validate()
            .map_err(|e| Error::Validation(format!("step {}: {}", index, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_destructive_set() {
        let destructive: Vec<_> = ActionKind::ALL
            .iter()
            .filter(|k| k.is_destructive())
            .map(|k| k.as_str())
            .collect();
        assert_eq!(
            destructive,
            vec!["delete_file", "git_push", "shell_exec", "docker_run"]
        );
        assert!(ActionKind::WaitApproval.is_gated());
        assert!(!ActionKind::WaitApproval.is_destructive());
        assert!(!ActionKind::WriteFile.is_gated());
    }

    #[test]
    fn test_parse_plan_with_generic_target() {
        let plan = parse_plan(json!([
            {"action": "check_tool", "target": "git"},
            {"action": "shell_exec", "command": "echo hi", "description": "say hi"},
            {"action": "get_artifact", "provider": "github", "ref": "pr/1"}
        ]))
        .unwrap();

        assert_eq!(plan[0].action, Action::CheckTool { tool: "git".into() });
        assert_eq!(plan[1].kind(), ActionKind::ShellExec);
        assert_eq!(plan[1].details(), "say hi");
        assert_eq!(plan[2].target(), Some("pr/1"));
    }

    #[test]
    fn test_parse_plan_rejects_bad_input() {
        assert!(matches!(parse_plan(json!([])), Err(Error::Validation(_))));
        assert!(matches!(
            parse_plan(json!([{"action": "format_disk"}])),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            parse_plan(json!([{"action": "delete_file", "path": "  "}])),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_step_serializes_flat() {
        let step = ActionStep::delete_file("/x");
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value, json!({"action": "delete_file", "path": "/x"}));
        assert_eq!(step.details(), "delete_file /x");
        assert_eq!("git_push".parse::<ActionKind>().unwrap(), ActionKind::GitPush);
    }
}
