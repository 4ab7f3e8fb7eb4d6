//! Local plan runner (`pilot run`)
//!
//! 세션 하나를 만들고 플랜 하나를 실행하면서 이벤트를 터미널에 출력합니다.
//! 승인 요청은 stdin 프롬프트(또는 `--auto-approve`)로 처리합니다.

use anyhow::{Context, Result};
use pilot_foundation::{
    ApprovalId, ChannelObserver, SessionPatch, StreamEvent, StreamEventType, TaskId,
};
use pilot_session::Registry;
use pilot_task::{parse_plan, Task, TaskStatus};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Options of one local run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub plan: PathBuf,
    pub workspace: PathBuf,
    pub dry_run: bool,
    pub allow_destructive: bool,
    pub auto_approve: bool,
}

/// Operator answer to an approval prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    /// Approve and allowlist the action kind for the session
    Always,
    Reject,
}

impl Decision {
    /// `y` / `a` / anything else
    pub fn parse(answer: &str) -> Self {
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Decision::Approve,
            "a" | "always" => Decision::Always,
            _ => Decision::Reject,
        }
    }
}

/// Terminal rendering of one event; `None` for events not worth a line
pub fn render(event: &StreamEvent) -> Option<String> {
    let data = &event.data;
    let text = |key: &str| data[key].as_str().unwrap_or_default().to_string();
    let line = match event.event_type {
        StreamEventType::SessionStart => format!("▶ session {} started", text("name")),
        StreamEventType::SessionEnd => format!("■ session ended ({})", text("status")),
        StreamEventType::TaskStart => format!(
            "▶ task started at step {}/{}",
            data["currentStep"], data["totalSteps"]
        ),
        StreamEventType::TaskStep => format!(
            "  [{}/{}] {}",
            data["stepIndex"].as_u64().unwrap_or_default() + 1,
            data["totalSteps"],
            text("action")
        ),
        StreamEventType::TaskComplete => "✓ task completed".to_string(),
        StreamEventType::TaskError => format!("✗ task failed: {}", text("error")),
        StreamEventType::LogLine => format!("  {} {}", text("level"), text("message")),
        StreamEventType::Stdout => text("text").trim_end().to_string(),
        StreamEventType::Stderr => format!("! {}", text("text").trim_end()),
        StreamEventType::ApprovalRequired => {
            format!("? approval required: {} ({})", text("action"), text("details"))
        }
        StreamEventType::ApprovalResolved => format!("  approval {}", text("status")),
    };
    if line.trim().is_empty() {
        None
    } else {
        Some(line)
    }
}

/// One-line final status, e.g. `✗ failed at step 1/3: step rejected by operator`
pub fn summary(task: &Task) -> String {
    let mut line = format!(
        "{} {} at step {}/{}",
        task.status.symbol(),
        task.status,
        task.current_step,
        task.total_steps
    );
    if let Some(error) = &task.error {
        line.push_str(": ");
        line.push_str(error);
    }
    line
}

fn is_end_of(event: &StreamEvent, task_id: TaskId) -> bool {
    event.task_id == Some(task_id)
        && matches!(
            event.event_type,
            StreamEventType::TaskComplete | StreamEventType::TaskError
        )
}

/// Load a plan file: a JSON array of steps, or `{"title": .., "plan": [..]}`
pub fn load_plan(path: &Path) -> Result<(String, Vec<pilot_task::ActionStep>)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse plan {}", path.display()))?;

    let default_title = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "plan".to_string());
    let (title, steps) = match value {
        serde_json::Value::Object(mut object) => {
            let title = object
                .get("title")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or(default_title);
            let steps = object
                .remove("plan")
                .context("plan object has no \"plan\" array")?;
            (title, steps)
        }
        steps => (default_title, steps),
    };
    Ok((title, parse_plan(steps)?))
}

/// Create a session, run the plan to its end and return the final task
pub async fn run_plan(registry: &Registry, options: &RunOptions) -> Result<Task> {
    let (title, plan) = load_plan(&options.plan)?;
    let controller = &registry.controller;

    let session = controller.create_session(title.clone(), options.workspace.clone())?;
    controller
        .update_session(
            session.id,
            SessionPatch {
                dry_run_mode: Some(options.dry_run),
                allow_destructive: Some(options.allow_destructive),
                ..SessionPatch::default()
            },
        )
        .await?;

    let (observer, mut events) = ChannelObserver::pair("cli", registry.config.bus.observer_queue);
    let handle = registry.bus.subscribe(session.id, observer).await;

    let task = controller.create_task(session.id, title, plan)?;
    controller.run_task(task.id).await?;

    let (answers_tx, mut answers) = mpsc::channel::<String>(1);
    if !options.auto_approve {
        tokio::spawn(read_answers(answers_tx));
    }

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping session");
                let summary = controller.stop(session.id).await?;
                println!("■ stopped, {} task(s) cancelled", summary.cancelled.len());
                break;
            }
        };
        let Some(event) = event else {
            break;
        };

        if let Some(line) = render(&event) {
            println!("{}", line);
        }

        if event.event_type == StreamEventType::ApprovalRequired {
            let approval_id: ApprovalId = event.data["approvalId"]
                .as_str()
                .context("approval event without approvalId")?
                .parse()?;
            let decision = if options.auto_approve {
                Decision::Approve
            } else {
                prompt(&mut answers).await
            };
            debug!(approval_id = %approval_id, ?decision, "Resolving approval");
            controller
                .resolve_approval(
                    approval_id,
                    decision != Decision::Reject,
                    decision == Decision::Always,
                )
                .await?;
        }

        if is_end_of(&event, task.id) {
            break;
        }
    }

    registry.bus.unsubscribe(&handle).await;
    let task = registry.engine.wait(task.id).await?;
    if task.status != TaskStatus::Completed {
        debug!(task_id = %task.id, status = %task.status, "Run did not complete");
    }
    Ok(task)
}

async fn prompt(answers: &mut mpsc::Receiver<String>) -> Decision {
    println!("  approve? [y]es / [a]lways / [N]o");
    match answers.recv().await {
        Some(answer) => Decision::parse(&answer),
        None => Decision::Reject,
    }
}

async fn read_answers(tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_foundation::SessionId;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_decision_parse() {
        assert_eq!(Decision::parse("y\n"), Decision::Approve);
        assert_eq!(Decision::parse("YES"), Decision::Approve);
        assert_eq!(Decision::parse("a"), Decision::Always);
        assert_eq!(Decision::parse(""), Decision::Reject);
        assert_eq!(Decision::parse("nope"), Decision::Reject);
    }

    #[test]
    fn test_render() {
        let session = SessionId::new();
        let task = TaskId::new();

        let step = StreamEvent::task_step(session, task, 0, 2, "check_tool");
        assert_eq!(render(&step).unwrap(), "  [1/2] check_tool");

        let error = StreamEvent::task_error(session, task, 0, "step rejected by operator");
        assert_eq!(render(&error).unwrap(), "✗ task failed: step rejected by operator");
        assert!(is_end_of(&error, task));
        assert!(!is_end_of(&error, TaskId::new()));

        assert!(render(&StreamEvent::stdout(session, task, "\n")).is_none());
    }

    #[test]
    fn test_summary() {
        let plan = vec![
            pilot_task::ActionStep::check_tool("git"),
            pilot_task::ActionStep::delete_file("/x"),
        ];
        let mut task = Task::new(SessionId::new(), "setup", plan).unwrap();
        task.start();
        task.advance();
        task.fail("step rejected by operator");
        assert_eq!(
            summary(&task),
            "✗ failed at step 1/2: step rejected by operator"
        );

        task.resume();
        task.advance();
        assert_eq!(summary(&task), "✓ completed at step 2/2");
    }

    #[test]
    fn test_load_plan() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"title":"setup","plan":[{{"action":"check_tool","tool":"git"}}]}}"#
        )
        .unwrap();
        let (title, plan) = load_plan(file.path()).unwrap();
        assert_eq!(title, "setup");
        assert_eq!(plan.len(), 1);

        let mut bare = NamedTempFile::new().unwrap();
        write!(bare, r#"[{{"action":"shell_exec","command":"echo hi"}}]"#).unwrap();
        let (_, plan) = load_plan(bare.path()).unwrap();
        assert_eq!(plan[0].kind().as_str(), "shell_exec");

        let mut empty = NamedTempFile::new().unwrap();
        write!(empty, "[]").unwrap();
        assert!(load_plan(empty.path()).is_err());
    }
}
