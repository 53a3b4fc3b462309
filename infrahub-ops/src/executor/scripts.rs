//! Python helpers shipped inside the binary and run in the task worker.

use crate::env::{EnvironmentBackend, ExecOptions};
use crate::runner::argv;
use crate::utils::{Result, StepContext};
use std::io::Write;
use tracing::{debug, warn};

pub const GET_RUNNING_TASKS: &str = include_str!("../../scripts/get_running_tasks.py");
pub const CLEAN_OLD_TASKS: &str = include_str!("../../scripts/clean_old_tasks.py");
pub const CLEAN_STALE_TASKS: &str = include_str!("../../scripts/clean_stale_tasks.py");

/// An embedded script and where it lands inside the target service.
#[derive(Debug, Clone, Copy)]
pub struct Script {
    pub content: &'static str,
    pub remote_path: &'static str,
}

pub const RUNNING_TASKS_SCRIPT: Script = Script {
    content: GET_RUNNING_TASKS,
    remote_path: "/tmp/get_running_tasks.py",
};

pub const FLOW_RUNS_SCRIPT: Script = Script {
    content: CLEAN_OLD_TASKS,
    remote_path: "/tmp/infrahubops_clean_old_tasks.py",
};

pub const STALE_RUNS_SCRIPT: Script = Script {
    content: CLEAN_STALE_TASKS,
    remote_path: "/tmp/infrahubops_clean_stale_tasks.py",
};

/// Copies `script` into `service`, runs it with `python -u` and removes it again.
/// Output is streamed to the log and returned.
pub async fn execute_script(
    backend: &dyn EnvironmentBackend,
    service: &str,
    script: Script,
    args: &[String],
) -> Result<String> {
    let mut local = tempfile::Builder::new()
        .prefix("infrahubops_")
        .suffix(".py")
        .tempfile()?;
    local.write_all(script.content.as_bytes())?;
    local.flush()?;

    backend
        .copy_to(service, local.path(), script.remote_path)
        .await
        .step(&format!("failed to copy script to {}", service))?;

    let mut command = argv(&["python", "-u", script.remote_path]);
    command.extend(args.iter().cloned());
    debug!(service, script = script.remote_path, "Running embedded script");
    let result = backend
        .exec_stream(service, &command, &ExecOptions::default())
        .await;

    let cleanup = argv(&["rm", "-f", script.remote_path]);
    if let Err(e) = backend.exec(service, &cleanup, &ExecOptions::default()).await {
        warn!("Failed to remove {} from {}: {}", script.remote_path, service, e);
    }
    result
}

/// True when the output of a failed command says the subcommand does not exist.
pub fn is_missing_command(output: &str) -> bool {
    output.to_lowercase().contains("no such command")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn test_scripts_are_embedded() {
        assert!(GET_RUNNING_TASKS.contains("TaskState.RUNNING"));
        assert!(CLEAN_OLD_TASKS.contains("delete_flow_run"));
        assert!(CLEAN_STALE_TASKS.contains("CRASHED"));
    }

    #[tokio::test]
    async fn test_script_is_removed_even_on_failure() {
        let backend =
            FakeBackend::new().fail("python -u /tmp/infrahubops_clean_old_tasks.py", "Traceback");

        let err = execute_script(&backend, "task-worker", FLOW_RUNS_SCRIPT, &argv(&["30", "200"]))
            .await
            .unwrap_err();
        assert_eq!(err.command_output(), Some("Traceback"));

        let calls = backend.calls();
        assert_eq!(
            calls,
            vec![
                "copy_to task-worker:/tmp/infrahubops_clean_old_tasks.py",
                "task-worker: python -u /tmp/infrahubops_clean_old_tasks.py 30 200",
                "task-worker: rm -f /tmp/infrahubops_clean_old_tasks.py",
            ]
        );
    }

    #[test]
    fn test_missing_command_detection() {
        assert!(is_missing_command("Error: No such command 'tasks'."));
        assert!(!is_missing_command("connection refused"));
    }
}
