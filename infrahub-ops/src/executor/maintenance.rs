//! Environment reporting and task-manager housekeeping.

use super::scripts::{
    execute_script, is_missing_command, Script, FLOW_RUNS_SCRIPT, STALE_RUNS_SCRIPT,
};
use super::InfrahubOps;
use crate::env::{cluster, compose, service, ExecOptions};
use crate::runner::argv;
use crate::utils::Result;
use serde::Serialize;
use tracing::{debug, info};

pub const DEFAULT_BATCH_SIZE: u32 = 200;

/// Which flow runs a flush removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    /// Finished runs past the retention window are deleted
    FlowRuns,
    /// Runs stuck in RUNNING past the retention window are marked crashed
    StaleRuns,
}

impl FlushKind {
    pub fn subcommand(&self) -> &'static str {
        match self {
            FlushKind::FlowRuns => "flow-runs",
            FlushKind::StaleRuns => "stale-runs",
        }
    }

    pub fn default_days(&self) -> u32 {
        match self {
            FlushKind::FlowRuns => 30,
            FlushKind::StaleRuns => 2,
        }
    }

    fn script(&self) -> Script {
        match self {
            FlushKind::FlowRuns => FLOW_RUNS_SCRIPT,
            FlushKind::StaleRuns => STALE_RUNS_SCRIPT,
        }
    }
}

/// What `environment detect` found. Passwords are never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentReport {
    pub backend: String,
    pub target: String,
    pub neo4j_database: String,
    pub neo4j_username: String,
    pub postgres_database: String,
    pub postgres_username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentListing {
    pub compose_projects: Vec<String>,
    pub k8s_namespaces: Vec<String>,
}

impl InfrahubOps {
    pub async fn detect_environment(&self) -> Result<EnvironmentReport> {
        let backend = self.backend().await?;
        let credentials = self.credentials().await?;
        Ok(EnvironmentReport {
            backend: backend.name().to_string(),
            target: backend.target().unwrap_or_default(),
            neo4j_database: credentials.neo4j.database.clone(),
            neo4j_username: credentials.neo4j.username.clone(),
            postgres_database: credentials.postgres.database.clone(),
            postgres_username: credentials.postgres.username.clone(),
        })
    }

    /// Every deployment either CLI can see. Discovery failures leave the
    /// corresponding list empty.
    pub async fn list_environments(&self) -> EnvironmentListing {
        let compose_projects = match compose::list_projects(self.runner.as_ref()).await {
            Ok(projects) => projects,
            Err(e) => {
                debug!("Could not list compose projects: {}", e);
                Vec::new()
            }
        };
        let k8s_namespaces = match cluster::list_namespaces(self.runner.as_ref()).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                debug!("Could not list kubernetes namespaces: {}", e);
                Vec::new()
            }
        };
        EnvironmentListing {
            compose_projects,
            k8s_namespaces,
        }
    }

    /// Runs `infrahub tasks flush <kind>` in the task worker, falling back to
    /// the embedded cleanup script on workers whose CLI lacks the command.
    pub async fn flush_task_runs(
        &self,
        kind: FlushKind,
        days: Option<u32>,
        batch: Option<u32>,
    ) -> Result<()> {
        let backend = self.backend().await?;
        let days = days.unwrap_or(kind.default_days()).to_string();
        let batch = batch
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .to_string();
        info!(
            "Flushing {} older than {} days (batch size {})",
            kind.subcommand(),
            days,
            batch
        );

        let command = argv(&[
            "infrahub",
            "tasks",
            "flush",
            kind.subcommand(),
            "--days-to-keep",
            days.as_str(),
            "--batch-size",
            batch.as_str(),
        ]);

        match backend
            .exec(service::TASK_WORKER, &command, &ExecOptions::default())
            .await
        {
            Ok(output) => {
                let output = output.trim();
                if !output.is_empty() {
                    info!("{}", output);
                }
            }
            Err(e) if is_missing_command(&e.to_string()) => {
                let script = kind.script();
                info!(
                    "infrahub CLI command not available in {}, falling back to {}",
                    service::TASK_WORKER,
                    script.remote_path
                );
                execute_script(backend, service::TASK_WORKER, script, &[days, batch]).await?;
            }
            Err(e) => return Err(e.during(format!("failed to execute {}", command.join(" ")))),
        }

        info!("{} cleanup completed", kind.subcommand());
        Ok(())
    }
}
