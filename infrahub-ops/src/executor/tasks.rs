//! Waiting for background tasks to drain before a capture.

use super::scripts::{execute_script, is_missing_command, RUNNING_TASKS_SCRIPT};
use crate::env::{service, EnvironmentBackend, ExecOptions};
use crate::runner::argv;
use crate::utils::{OpsError, Result, StepContext};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunningTask {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Cli,
    Script,
}

impl Source {
    fn describe(&self) -> &'static str {
        match self {
            Source::Cli => "infrahubctl task list output",
            Source::Script => "get_running_tasks.py output",
        }
    }
}

/// Parses the JSON task list. Empty output means no tasks.
fn parse_tasks(output: &str, source: &str) -> Result<Vec<RunningTask>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(output).map_err(|e| OpsError::Parse {
        what: source.to_string(),
        message: e.to_string(),
    })
}

/// Lists pending and running tasks, switching to the embedded script for
/// good once the worker's CLI turns out not to have the subcommand.
pub struct TaskLister<'a> {
    backend: &'a dyn EnvironmentBackend,
    source: Source,
}

impl<'a> TaskLister<'a> {
    pub fn new(backend: &'a dyn EnvironmentBackend) -> Self {
        Self {
            backend,
            source: Source::Cli,
        }
    }

    pub async fn running_tasks(&mut self) -> Result<Vec<RunningTask>> {
        if self.source == Source::Cli {
            let command = argv(&[
                "infrahubctl", "task", "list", "--json", "--state", "running", "--state", "pending",
            ]);
            match self
                .backend
                .exec(service::TASK_WORKER, &command, &ExecOptions::default())
                .await
            {
                Ok(output) if !is_missing_command(&output) => {
                    return parse_tasks(&output, self.source.describe());
                }
                Ok(_) => {}
                Err(e) if is_missing_command(e.command_output().unwrap_or_default()) => {}
                Err(e) => return Err(e.during("failed to list running tasks")),
            }
            info!("infrahubctl has no task list command; using embedded script");
            self.source = Source::Script;
        }

        let output = execute_script(self.backend, service::TASK_WORKER, RUNNING_TASKS_SCRIPT, &[])
            .await
            .step("failed to check running tasks")?;
        parse_tasks(&output, self.source.describe())
    }
}

/// Polls every `interval` until no task is pending or running. There is no deadline.
pub async fn wait_for_running_tasks(
    backend: &dyn EnvironmentBackend,
    interval: Duration,
) -> Result<()> {
    info!("Waiting for running tasks to complete");
    let mut lister = TaskLister::new(backend);
    loop {
        let tasks = lister.running_tasks().await?;
        if tasks.is_empty() {
            info!("No running tasks");
            return Ok(());
        }
        let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
        warn!(
            "Waiting for {} running task(s) to finish: {}",
            tasks.len(),
            titles.join(", ")
        );
        tokio::time::sleep(interval).await;
    }
}
