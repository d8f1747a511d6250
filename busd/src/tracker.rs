//! Boundary to the external task tracker.
//!
//! The broker needs exactly three things from it: check that a task exists and
//! can be submitted, mark it in progress, and read its title for display. Task
//! content and final status stay in the tracker.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

pub const STATUS_OPEN: &str = "open";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_BLOCKED: &str = "blocked";
pub const STATUS_CLOSED: &str = "closed";

#[derive(Debug, Error)]
pub enum TrackerError {
    /// The tracker refused; the message is passed through verbatim.
    #[error("{0}")]
    Rejected(String),
    #[error("task {task_id} is {status} and cannot be dispatched")]
    NotSubmittable { task_id: String, status: String },
    #[error("tracker command '{command}' did not finish within {after_ms}ms")]
    Timeout { command: String, after_ms: u64 },
    #[error("failed to run tracker command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected tracker output: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedTask {
    pub id: String,
    pub title: Option<String>,
    pub status: String,
}

impl TrackedTask {
    /// Closed tasks are never dispatched. Blocked tasks only on retry, since a
    /// worker reporting failure usually blocks the task in the tracker.
    pub fn ensure_dispatchable(&self, allow_blocked: bool) -> Result<(), TrackerError> {
        let blocked = self.status == STATUS_BLOCKED && !allow_blocked;
        if self.status == STATUS_CLOSED || blocked {
            return Err(TrackerError::NotSubmittable {
                task_id: self.id.clone(),
                status: self.status.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// Read a task (title and status).
    async fn show(&self, task_id: &str) -> Result<TrackedTask, TrackerError>;

    async fn mark_in_progress(&self, task_id: &str) -> Result<(), TrackerError>;

    /// Task exists and is in a submittable state.
    async fn validate(&self, task_id: &str) -> Result<TrackedTask, TrackerError> {
        let task = self.show(task_id).await?;
        task.ensure_dispatchable(false)?;
        Ok(task)
    }
}

/// Shells out to a beads-style CLI: `<cmd> show <id> --json` and
/// `<cmd> update <id> --status in_progress`.
#[derive(Debug, Clone)]
pub struct CommandTracker {
    program: String,
    timeout: Duration,
}

impl CommandTracker {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, TrackerError> {
        let rendered = format!("{} {}", self.program, args.join(" "));
        debug!(command = %rendered, "Invoking task tracker");

        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                return Err(TrackerError::Timeout {
                    command: rendered,
                    after_ms: self.timeout.as_millis() as u64,
                })
            }
            Ok(Err(source)) => {
                return Err(TrackerError::Spawn {
                    command: rendered,
                    source,
                })
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let message = if !stderr.is_empty() {
                stderr
            } else if !stdout.is_empty() {
                stdout
            } else {
                format!("{rendered} exited with {}", output.status)
            };
            return Err(TrackerError::Rejected(message));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TaskTracker for CommandTracker {
    async fn show(&self, task_id: &str) -> Result<TrackedTask, TrackerError> {
        let stdout = self.run(&["show", task_id, "--json"]).await?;
        parse_show_output(task_id, &stdout)
    }

    async fn mark_in_progress(&self, task_id: &str) -> Result<(), TrackerError> {
        self.run(&["update", task_id, "--status", STATUS_IN_PROGRESS])
            .await
            .map(|_| ())
    }
}

#[derive(Deserialize)]
struct ShowRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// `show --json` prints either one object or a one-element array.
pub fn parse_show_output(task_id: &str, stdout: &str) -> Result<TrackedTask, TrackerError> {
    let value: Value = serde_json::from_str(stdout.trim())
        .map_err(|err| TrackerError::Malformed(format!("show {task_id}: {err}")))?;

    let record = match value {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| TrackerError::Rejected(format!("no issue found: {task_id}")))?,
        other => other,
    };

    let record: ShowRecord = serde_json::from_value(record)
        .map_err(|err| TrackerError::Malformed(format!("show {task_id}: {err}")))?;

    Ok(TrackedTask {
        id: record.id.unwrap_or_else(|| task_id.to_string()),
        title: record.title.filter(|t| !t.trim().is_empty()),
        status: record
            .status
            .unwrap_or_else(|| STATUS_OPEN.to_string()),
    })
}

/// In-process tracker. Strict mode knows only inserted tasks; permissive mode
/// treats any unknown id as an open task titled by its id.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    tasks: Mutex<HashMap<String, TrackedTask>>,
    permissive: bool,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissive() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            permissive: true,
        }
    }

    pub async fn insert(&self, id: &str, title: &str, status: &str) {
        self.tasks.lock().await.insert(
            id.to_string(),
            TrackedTask {
                id: id.to_string(),
                title: Some(title.to_string()),
                status: status.to_string(),
            },
        );
    }

    pub async fn status_of(&self, id: &str) -> Option<String> {
        self.tasks.lock().await.get(id).map(|t| t.status.clone())
    }
}

#[async_trait]
impl TaskTracker for MemoryTracker {
    async fn show(&self, task_id: &str) -> Result<TrackedTask, TrackerError> {
        let tasks = self.tasks.lock().await;
        match tasks.get(task_id) {
            Some(task) => Ok(task.clone()),
            None if self.permissive => Ok(TrackedTask {
                id: task_id.to_string(),
                title: Some(task_id.to_string()),
                status: STATUS_OPEN.to_string(),
            }),
            None => Err(TrackerError::Rejected(format!("no issue found: {task_id}"))),
        }
    }

    async fn mark_in_progress(&self, task_id: &str) -> Result<(), TrackerError> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(task_id) {
            Some(task) => {
                task.status = STATUS_IN_PROGRESS.to_string();
                Ok(())
            }
            None if self.permissive => Ok(()),
            None => Err(TrackerError::Rejected(format!("no issue found: {task_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_and_object_output() {
        let task = parse_show_output(
            "bd-1",
            r#"[{"id":"bd-1","title":"Fix the parser","status":"open","priority":2}]"#,
        )
        .unwrap();
        assert_eq!(task.title.as_deref(), Some("Fix the parser"));
        assert_eq!(task.status, "open");

        let task = parse_show_output("bd-2", r#"{"title":"Docs"}"#).unwrap();
        assert_eq!(task.id, "bd-2");
        assert_eq!(task.status, STATUS_OPEN);
    }

    #[test]
    fn empty_array_means_missing_task() {
        let err = parse_show_output("bd-3", "[]").unwrap_err();
        assert!(matches!(err, TrackerError::Rejected(msg) if msg.contains("bd-3")));
        assert!(matches!(
            parse_show_output("bd-3", "not json"),
            Err(TrackerError::Malformed(_))
        ));
    }

    #[test]
    fn closed_and_blocked_tasks_are_not_submittable() {
        let mut task = TrackedTask {
            id: "bd-4".into(),
            title: None,
            status: STATUS_CLOSED.into(),
        };
        assert!(task.ensure_dispatchable(true).is_err());
        task.status = STATUS_BLOCKED.into();
        assert!(task.ensure_dispatchable(false).is_err());
        assert!(task.ensure_dispatchable(true).is_ok());
        task.status = STATUS_IN_PROGRESS.into();
        assert!(task.ensure_dispatchable(false).is_ok());
    }

    #[tokio::test]
    async fn memory_tracker_marks_in_progress() {
        let tracker = MemoryTracker::new();
        tracker.insert("bd-5", "Ship it", STATUS_OPEN).await;
        tracker.validate("bd-5").await.unwrap();
        tracker.mark_in_progress("bd-5").await.unwrap();
        assert_eq!(tracker.status_of("bd-5").await.as_deref(), Some(STATUS_IN_PROGRESS));
        assert!(tracker.validate("bd-404").await.is_err());
        assert!(MemoryTracker::permissive().validate("bd-404").await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_tracker_runs_show_and_update() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let script = dir.path().join("fake-bd");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> '{log}'\nif [ \"$1\" = show ]; then\n  if [ \"$2\" = bd-9 ]; then echo '[{{\"id\":\"bd-9\",\"title\":\"Nine\",\"status\":\"open\"}}]'; exit 0; fi\n  echo \"Error: no issue found matching $2\" >&2; exit 1\nfi\nexit 0\n",
                log = log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tracker = CommandTracker::new(script.display().to_string(), Duration::from_secs(5));
        let task = tracker.validate("bd-9").await.unwrap();
        assert_eq!(task.title.as_deref(), Some("Nine"));
        tracker.mark_in_progress("bd-9").await.unwrap();

        let err = tracker.show("bd-10").await.unwrap_err();
        assert_eq!(err.to_string(), "Error: no issue found matching bd-10");

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("show bd-9 --json"));
        assert!(calls.contains("update bd-9 --status in_progress"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let tracker = CommandTracker::new("/nonexistent/busd-tracker", Duration::from_secs(1));
        assert!(matches!(
            tracker.show("bd-1").await,
            Err(TrackerError::Spawn { .. })
        ));
    }
}
