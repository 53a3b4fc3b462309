//! Docker Compose backend.

use super::{sorted_unique, EnvironmentBackend, ExecOptions};
use crate::runner::{argv, CommandRunner};
use crate::utils::{OpsError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const DOCKER: &str = "docker";

pub struct ComposeBackend {
    runner: Arc<dyn CommandRunner>,
    requested: Option<String>,
    project: Option<String>,
}

impl ComposeBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, requested: Option<String>) -> Self {
        Self {
            runner,
            requested: requested.filter(|p| !p.is_empty()),
            project: None,
        }
    }

    fn project(&self) -> Result<&str> {
        self.project
            .as_deref()
            .ok_or_else(|| OpsError::other("docker compose project has not been detected"))
    }

    fn compose_args(&self, args: Vec<String>) -> Result<Vec<String>> {
        let mut full = argv(&["compose", "-p", self.project()?]);
        full.extend(args);
        Ok(full)
    }

    fn exec_args(
        &self,
        service: &str,
        command: &[String],
        opts: &ExecOptions,
    ) -> Result<Vec<String>> {
        let mut args = argv(&["exec", "-T"]);
        if let Some(user) = &opts.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        for (key, value) in &opts.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(service.to_string());
        args.extend(command.iter().cloned());
        self.compose_args(args)
    }
}

/// Lists compose projects on this host whose containers mention Infrahub.
pub async fn list_projects(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let output = runner.run(DOCKER, &argv(&["compose", "ls"])).await?;

    let mut projects = Vec::new();
    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.to_uppercase().starts_with("NAME ") {
            continue;
        }
        let Some(project) = line.split_whitespace().next() else {
            continue;
        };
        match runner
            .run(DOCKER, &argv(&["compose", "-p", project, "ps", "-a"]))
            .await
        {
            Ok(ps) if ps.to_lowercase().contains("infrahub") => projects.push(project.to_string()),
            Ok(_) => debug!(project, "Compose project does not run Infrahub"),
            Err(e) => debug!(project, "Could not inspect compose project: {}", e),
        }
    }

    Ok(sorted_unique(projects))
}

#[async_trait]
impl EnvironmentBackend for ComposeBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn target(&self) -> Option<String> {
        self.project.clone()
    }

    async fn detect(&mut self) -> Result<()> {
        if let Err(e) = self.runner.run_quiet(DOCKER, &argv(&["--version"])).await {
            return Err(match &self.requested {
                Some(project) => OpsError::Detection {
                    backend: self.name().to_string(),
                    message: format!("docker CLI required for project {}: {}", project, e),
                },
                None => OpsError::CliUnavailable {
                    tool: DOCKER.to_string(),
                    reason: e.to_string(),
                },
            });
        }

        let projects = match list_projects(self.runner.as_ref()).await {
            Ok(projects) => projects,
            // An unreachable daemon means this backend cannot be used at all.
            Err(e) if self.requested.is_none() => {
                return Err(OpsError::CliUnavailable {
                    tool: DOCKER.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => Vec::new(),
        };

        if let Some(project) = self.requested.clone() {
            if !projects.contains(&project) {
                self.runner
                    .run(DOCKER, &argv(&["compose", "-p", project.as_str(), "ps"]))
                    .await
                    .map_err(|e| OpsError::Detection {
                        backend: self.name().to_string(),
                        message: format!("docker compose project {} not found: {}", project, e),
                    })?;
            }
            self.project = Some(project);
            return Ok(());
        }

        match projects.len() {
            0 => Err(OpsError::EnvironmentNotFound),
            1 => {
                self.project = projects.into_iter().next();
                Ok(())
            }
            _ => Err(OpsError::AmbiguousTarget {
                kind: "docker compose projects".to_string(),
                candidates: projects.join(", "),
                flag: "--project".to_string(),
            }),
        }
    }

    async fn exec(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        let args = self.exec_args(service, command, opts)?;
        self.runner.run(DOCKER, &args).await
    }

    async fn exec_stream(
        &self,
        service: &str,
        command: &[String],
        opts: &ExecOptions,
    ) -> Result<String> {
        let args = self.exec_args(service, command, opts)?;
        self.runner.run_streaming(DOCKER, &args).await
    }

    async fn copy_to(&self, service: &str, src: &Path, dest: &str) -> Result<()> {
        let args = self.compose_args(vec![
            "cp".to_string(),
            "-a".to_string(),
            src.display().to_string(),
            format!("{}:{}", service, dest),
        ])?;
        self.runner.run_quiet(DOCKER, &args).await
    }

    async fn copy_from(&self, service: &str, src: &str, dest: &Path) -> Result<()> {
        let args = self.compose_args(vec![
            "cp".to_string(),
            format!("{}:{}", service, src),
            dest.display().to_string(),
        ])?;
        self.runner.run_quiet(DOCKER, &args).await
    }

    async fn start(&self, services: &[&str]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let mut args = vec!["start".to_string()];
        args.extend(services.iter().map(|s| s.to_string()));
        let args = self.compose_args(args)?;
        self.runner.run_quiet(DOCKER, &args).await
    }

    async fn stop(&self, services: &[&str]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let mut args = vec!["stop".to_string()];
        args.extend(services.iter().map(|s| s.to_string()));
        let args = self.compose_args(args)?;
        self.runner.run_quiet(DOCKER, &args).await
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        let args = self.compose_args(argv(&["ps", service]))?;
        let output = self.runner.run(DOCKER, &args).await?;
        Ok(output.contains("Up"))
    }
}
