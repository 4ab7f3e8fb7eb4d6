//! Local tool invoker
//!
//! Runs steps on this machine:
//! - Processes (shell, python, git, gh, docker, installers) with a hard timeout
//! - Files through `tokio::fs`, relative to the session workspace
//! - Artifacts through an [`ArtifactStore`]
//! - `call_tool` through registered [`ToolHandler`]s

use super::r#trait::{StepContext, StepFailure, StepOutput, ToolHandler, ToolInvoker};
use crate::action::{Action, ActionStep};
use crate::artifact::{ArtifactKey, ArtifactStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use pilot_foundation::EngineConfig;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Configuration for the local invoker
#[derive(Debug, Clone)]
pub struct LocalToolInvokerConfig {
    /// Shell used for `shell_exec` (run as `<shell> -c <command>`)
    pub shell: String,
    /// Interpreter used for `python_exec` (run as `<python> -c <code>`)
    pub python: String,
    /// Hard limit for one process; the child is killed when exceeded
    pub step_timeout: Duration,
}

impl Default for LocalToolInvokerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for LocalToolInvokerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            python: config.python.clone(),
            step_timeout: Duration::from_secs(config.step_timeout_secs),
        }
    }
}

/// Executes steps against the local machine
pub struct LocalToolInvoker {
    config: LocalToolInvokerConfig,
    artifacts: Arc<dyn ArtifactStore>,
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl LocalToolInvoker {
    pub fn new(config: LocalToolInvokerConfig, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            config,
            artifacts,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a `call_tool` backend (replaces one with the same name)
    pub fn register_handler(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        debug!(tool = %name, "Registered tool handler");
        self.handlers.write().insert(name, handler);
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn resolve(ctx: &StepContext, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            ctx.workspace_dir.join(path)
        }
    }

    /// Run a process in the workspace and collect its output
    async fn run_command(
        &self,
        ctx: &StepContext,
        program: &str,
        args: &[&str],
    ) -> Result<StepOutput, StepFailure> {
        debug!(
            task_id = %ctx.task_id,
            step = ctx.step_index,
            program,
            "Spawning process"
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&ctx.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StepFailure::ToolNotFound(program.to_string()),
            _ => StepFailure::Io(e),
        })?;

        // 타임아웃 시 future가 drop되면서 kill_on_drop으로 프로세스 종료
        let output = tokio::time::timeout(self.config.step_timeout, child.wait_with_output())
            .await
            .map_err(|_| StepFailure::Timeout(self.config.step_timeout.as_secs()))??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(StepFailure::NonZeroExit {
                code,
                stdout,
                stderr: stderr.trim_end().to_string(),
            });
        }

        Ok(StepOutput {
            stdout,
            stderr,
            data: json!({ "exitCode": code }),
        })
    }

    async fn run_shell(&self, ctx: &StepContext, command: &str) -> Result<StepOutput, StepFailure> {
        let shell = self.config.shell.clone();
        self.run_command(ctx, &shell, &["-c", command]).await
    }

    fn artifact_key(ctx: &StepContext, provider: &str, reference: &str) -> ArtifactKey {
        ArtifactKey::new(ctx.session_id, provider, reference)
    }
}

#[async_trait]
impl ToolInvoker for LocalToolInvoker {
    async fn invoke(&self, step: &ActionStep, ctx: &StepContext) -> Result<StepOutput, StepFailure> {
        match &step.action {
            Action::CheckTool { tool } => {
                let path = which::which(tool)
                    .map_err(|_| StepFailure::ToolNotFound(tool.clone()))?;
                Ok(StepOutput::text(path.display().to_string())
                    .with_data(json!({ "path": path })))
            }

            Action::InstallTool { tool, manager } => {
                if which::which(tool).is_ok() {
                    return Ok(StepOutput::text(format!("{} already installed", tool)));
                }
                let manager = manager.as_deref().ok_or_else(|| {
                    StepFailure::Unsupported(format!("no package manager given for {}", tool))
                })?;
                self.run_shell(ctx, &format!("{} {}", manager, tool)).await
            }

            Action::CallTool { tool, args } => {
                let handler = self.handlers.read().get(tool).cloned();
                match handler {
                    Some(handler) => handler.call(args, ctx).await,
                    None => Err(StepFailure::ToolNotFound(tool.clone())),
                }
            }

            Action::ReadFile { path } => {
                let resolved = Self::resolve(ctx, path);
                let content = tokio::fs::read_to_string(&resolved).await?;
                Ok(StepOutput::empty().with_data(json!({
                    "path": resolved,
                    "content": content,
                })))
            }

            Action::WriteFile { path, content } => {
                let resolved = Self::resolve(ctx, path);
                if let Some(parent) = resolved.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&resolved, content).await?;
                Ok(StepOutput::empty().with_data(json!({
                    "path": resolved,
                    "bytes": content.len(),
                })))
            }

            Action::DeleteFile { path } => {
                let resolved = Self::resolve(ctx, path);
                if tokio::fs::metadata(&resolved).await?.is_dir() {
                    tokio::fs::remove_dir_all(&resolved).await?;
                } else {
                    tokio::fs::remove_file(&resolved).await?;
                }
                Ok(StepOutput::empty().with_data(json!({ "path": resolved })))
            }

            Action::GitClone { url, dest } => {
                let mut args = vec!["clone", url.as_str()];
                if let Some(dest) = dest {
                    args.push(dest.as_str());
                }
                self.run_command(ctx, "git", &args).await
            }

            Action::GitCommit { message, all } => {
                if *all {
                    self.run_command(ctx, "git", &["add", "-A"]).await?;
                }
                self.run_command(ctx, "git", &["commit", "-m", message.as_str()]).await
            }

            Action::GitPush { remote, branch } => {
                let mut args = vec!["push"];
                match (remote, branch) {
                    (Some(remote), Some(branch)) => args.extend([remote.as_str(), branch.as_str()]),
                    (Some(remote), None) => args.push(remote.as_str()),
                    (None, Some(branch)) => args.extend(["origin", branch.as_str()]),
                    (None, None) => {}
                }
                self.run_command(ctx, "git", &args).await
            }

            Action::GitCreateBranch { name } => {
                self.run_command(ctx, "git", &["checkout", "-b", name.as_str()]).await
            }

            Action::GitCreatePr { title, body, base } => {
                let body = body.as_deref().unwrap_or("");
                let mut args = vec!["pr", "create", "--title", title.as_str(), "--body", body];
                if let Some(base) = base {
                    args.extend(["--base", base.as_str()]);
                }
                self.run_command(ctx, "gh", &args).await
            }

            Action::SaveArtifact {
                provider,
                reference,
                content,
            } => {
                let key = Self::artifact_key(ctx, provider, reference);
                self.artifacts
                    .save(key.clone(), content.clone())
                    .await
                    .map_err(|e| StepFailure::Other(e.to_string()))?;
                Ok(StepOutput::text(format!("saved artifact {}", key)))
            }

            Action::GetArtifact {
                provider,
                reference,
            } => {
                let key = Self::artifact_key(ctx, provider, reference);
                let content = self
                    .artifacts
                    .get(&key)
                    .await
                    .map_err(|e| StepFailure::Other(e.to_string()))?;
                Ok(StepOutput::empty().with_data(content))
            }

            Action::ShellExec { command } => self.run_shell(ctx, command).await,

            Action::PythonExec { code } => {
                let python = self.config.python.clone();
                self.run_command(ctx, &python, &["-c", code.as_str()]).await
            }

            Action::DockerRun { image, command } => {
                let mut args = vec!["run", "--rm", image.as_str()];
                if let Some(command) = command {
                    args.extend(["sh", "-c", command.as_str()]);
                }
                self.run_command(ctx, "docker", &args).await
            }

            // 승인 자체가 이 스텝의 전부
            Action::WaitApproval { .. } => Ok(StepOutput::empty()),
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
