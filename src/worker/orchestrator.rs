//! # Agent Orchestrator
//!
//! The seam between a channel's handler and whatever actually analyzes a
//! task. [`CommandOrchestrator`] hands the task to an external agent process;
//! [`AcknowledgingOrchestrator`] completes immediately and is used when no
//! command is configured.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::handler::{HandlerError, TaskOutcome};
use crate::config::OrchestratorConfig;
use crate::messaging::message::Task;
use crate::routing::TaskKind;

/// Stderr kept in failure messages
const STDERR_TAIL_BYTES: usize = 2048;

#[async_trait]
pub trait AgentOrchestrator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, kind: TaskKind, task: &Task) -> Result<TaskOutcome, HandlerError>;
}

/// Build the orchestrator described by configuration
pub fn from_config(config: &OrchestratorConfig) -> Result<Arc<dyn AgentOrchestrator>, HandlerError> {
    if config.command.is_empty() {
        return Ok(Arc::new(AcknowledgingOrchestrator));
    }
    Ok(Arc::new(CommandOrchestrator::new(&config.command, config.timeout())?))
}

/// Completes every task without running an agent
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgingOrchestrator;

#[async_trait]
impl AgentOrchestrator for AcknowledgingOrchestrator {
    fn name(&self) -> &'static str {
        "acknowledging"
    }

    async fn run(&self, kind: TaskKind, task: &Task) -> Result<TaskOutcome, HandlerError> {
        Ok(TaskOutcome::completed(
            task.id,
            json!({ "tipo": kind.as_str(), "acknowledged": true }),
            None,
        ))
    }
}

/// Runs an external command per task
///
/// The task is written to the command's stdin as wire JSON and the command
/// prints a [`TaskOutcome`] document on stdout. Empty stdout with a zero exit
/// status is a completed outcome with no result. The process is killed if the
/// timeout elapses.
#[derive(Debug, Clone)]
pub struct CommandOrchestrator {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandOrchestrator {
    pub fn new(command: &[String], timeout: Option<Duration>) -> Result<Self, HandlerError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| HandlerError::registry("orchestrator command is empty"))?;
        if program.trim().is_empty() {
            return Err(HandlerError::registry("orchestrator program is empty"));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn execute(&self, kind: TaskKind, task: &Task) -> Result<TaskOutcome, HandlerError> {
        let input = serde_json::to_vec(task)
            .map_err(|e| HandlerError::orchestrator(format!("task serialization failed: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("TASKER_LANES_TASK_KIND", kind.as_str())
            .env("TASKER_LANES_TASK_ID", task.id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HandlerError::orchestrator(format!("failed to spawn '{}': {e}", self.program))
            })?;

        debug!(task_id = %task.id, pid = ?child.id(), program = %self.program, "Agent command started");

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that exits without reading its input is judged by its exit status
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Agent command did not consume task input");
                }
                let _ = stdin.shutdown().await;
            }
        };
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        let output = output
            .map_err(|e| HandlerError::orchestrator(format!("waiting for agent command: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail(stderr.trim(), STDERR_TAIL_BYTES);
            return Err(HandlerError::failed(
                task.id,
                format!("agent command exited with {}: {tail}", output.status),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(TaskOutcome::completed(task.id, serde_json::Value::Null, None));
        }

        let mut outcome: TaskOutcome = serde_json::from_str(stdout).map_err(|e| {
            HandlerError::orchestrator(format!("agent command printed an invalid outcome: {e}"))
        })?;
        outcome.task_id.get_or_insert(task.id);
        Ok(outcome)
    }
}

#[async_trait]
impl AgentOrchestrator for CommandOrchestrator {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn run(&self, kind: TaskKind, task: &Task) -> Result<TaskOutcome, HandlerError> {
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.execute(kind, task)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(task_id = %task.id, timeout_seconds = limit.as_secs(), "Agent command timed out; killed");
                    return Err(HandlerError::Timeout {
                        task_id: task.id,
                        seconds: limit.as_secs(),
                    });
                }
            },
            None => self.execute(kind, task).await,
        }?;

        info!(
            task_id = %task.id,
            task_type = %kind,
            status = ?outcome.status,
            "Agent command finished"
        );
        Ok(outcome)
    }
}

fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
