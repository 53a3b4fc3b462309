//! Kubernetes backend.
//!
//! Logical services resolve to pods through label selectors. Start and stop
//! scale the backing workloads, remembering the replica count seen before a
//! stop so the next start restores the same topology.

use super::quote::shell_quote_command;
use super::workloads::{Kubectl, KUBECTL, PRODUCT_SELECTOR};
use super::{sorted_unique, EnvironmentBackend, ExecOptions};
use crate::runner::{argv, CommandRunner};
use crate::utils::format::non_empty_lines;
use crate::utils::{OpsError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const NAMESPACE_JSONPATH: &str = r#"jsonpath={range .items[*]}{.metadata.namespace}{"\n"}{end}"#;

pub struct ClusterBackend {
    runner: Arc<dyn CommandRunner>,
    requested: Option<String>,
    namespace: Option<String>,
    /// Logical service to resolved pod name
    pods: Mutex<HashMap<String, String>>,
    /// `<kind>/<name>` to replica count observed before scaling to zero
    replicas: Mutex<HashMap<String, u32>>,
}

/// Namespaces containing at least one Infrahub pod.
pub async fn list_namespaces(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let args = argv(&["get", "pods", "-A", "-l", PRODUCT_SELECTOR, "-o", NAMESPACE_JSONPATH]);
    match runner.run(KUBECTL, &args).await {
        Ok(output) => Ok(sorted_unique(non_empty_lines(&output))),
        Err(e) => {
            let text = format!("{} {}", e, e.command_output().unwrap_or_default()).to_lowercase();
            if text.contains("forbidden") || text.contains("cannot list") {
                Err(OpsError::Detection {
                    backend: "kubernetes".to_string(),
                    message: format!(
                        "insufficient permissions to list pods across namespaces; \
                         specify --k8s-namespace ({})",
                        e
                    ),
                })
            } else {
                debug!("Namespace discovery failed: {}", e);
                Err(OpsError::EnvironmentNotFound)
            }
        }
    }
}

impl ClusterBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, requested: Option<String>) -> Self {
        Self {
            runner,
            requested: requested.filter(|ns| !ns.is_empty()),
            namespace: None,
            pods: Mutex::new(HashMap::new()),
            replicas: Mutex::new(HashMap::new()),
        }
    }

    fn kubectl(&self) -> Result<Kubectl<'_>> {
        let namespace = self
            .namespace
            .as_deref()
            .ok_or_else(|| OpsError::other("kubernetes namespace has not been detected"))?;
        Ok(Kubectl::new(self.runner.as_ref(), namespace))
    }

    fn namespace(&self) -> Result<&str> {
        self.namespace
            .as_deref()
            .ok_or_else(|| OpsError::other("kubernetes namespace has not been detected"))
    }

    async fn pod_for(&self, service: &str) -> Result<String> {
        if let Some(pod) = self.pods.lock().await.get(service) {
            return Ok(pod.clone());
        }
        let pod = self.kubectl()?.find_pod(service).await?;
        self.pods
            .lock()
            .await
            .insert(service.to_string(), pod.clone());
        Ok(pod)
    }

    async fn exec_args(
        &self,
        service: &str,
        command: &[String],
        opts: &ExecOptions,
    ) -> Result<Vec<String>> {
        let pod = self.pod_for(service).await?;
        let mut args = argv(&["exec", "-n", self.namespace()?, pod.as_str(), "--"]);
        args.extend(prepare_command(command, opts));
        Ok(args)
    }
}

/// Applies environment overrides and the process owner to a remote command.
pub fn prepare_command(command: &[String], opts: &ExecOptions) -> Vec<String> {
    let mut result = Vec::with_capacity(command.len() + opts.env.len() + 1);
    if !opts.env.is_empty() {
        result.push("env".to_string());
        result.extend(opts.env.iter().map(|(k, v)| format!("{}={}", k, v)));
    }
    result.extend(command.iter().cloned());

    match &opts.user {
        Some(user) => argv(&[
            "su",
            "-",
            user.as_str(),
            "-s",
            "/bin/sh",
            "-c",
            shell_quote_command(&result).as_str(),
        ]),
        None => result,
    }
}

#[async_trait]
impl EnvironmentBackend for ClusterBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn target(&self) -> Option<String> {
        self.namespace.clone()
    }

    async fn detect(&mut self) -> Result<()> {
        if let Err(e) = self
            .runner
            .run_quiet(KUBECTL, &argv(&["version", "--client"]))
            .await
        {
            return Err(OpsError::CliUnavailable {
                tool: KUBECTL.to_string(),
                reason: e.to_string(),
            });
        }

        if let Some(namespace) = self.requested.clone() {
            self.runner
                .run(
                    KUBECTL,
                    &argv(&["get", "pods", "-n", namespace.as_str(), "-l", PRODUCT_SELECTOR]),
                )
                .await
                .map_err(|e| OpsError::Detection {
                    backend: self.name().to_string(),
                    message: format!("failed to verify namespace {}: {}", namespace, e),
                })?;
            self.namespace = Some(namespace);
            return Ok(());
        }

        let namespaces = list_namespaces(self.runner.as_ref()).await?;
        match namespaces.len() {
            0 => Err(OpsError::EnvironmentNotFound),
            1 => {
                self.namespace = namespaces.into_iter().next();
                Ok(())
            }
            _ => Err(OpsError::AmbiguousTarget {
                kind: "kubernetes namespaces".to_string(),
                candidates: namespaces.join(", "),
                flag: "--k8s-namespace".to_string(),
            }),
        }
    }

    async fn exec(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        let args = self.exec_args(service, command, opts).await?;
        self.runner.run(KUBECTL, &args).await
    }

    async fn exec_stream(
        &self,
        service: &str,
        command: &[String],
        opts: &ExecOptions,
    ) -> Result<String> {
        let args = self.exec_args(service, command, opts).await?;
        self.runner.run_streaming(KUBECTL, &args).await
    }

    async fn copy_to(&self, service: &str, src: &Path, dest: &str) -> Result<()> {
        let pod = self.pod_for(service).await?;
        let args = vec![
            "cp".to_string(),
            src.display().to_string(),
            format!("{}/{}:{}", self.namespace()?, pod, dest),
        ];
        self.runner.run_quiet(KUBECTL, &args).await
    }

    async fn copy_from(&self, service: &str, src: &str, dest: &Path) -> Result<()> {
        let pod = self.pod_for(service).await?;
        let args = vec![
            "cp".to_string(),
            format!("{}/{}:{}", self.namespace()?, pod, src),
            dest.display().to_string(),
        ];
        self.runner.run_quiet(KUBECTL, &args).await
    }

    async fn start(&self, services: &[&str]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let kubectl = self.kubectl()?;
        for service in services {
            let workload = kubectl
                .find_workload(service)
                .await
                .map_err(|e| e.during(format!("failed to resolve workload for {}", service)))?;
            let replicas = self
                .replicas
                .lock()
                .await
                .get(&workload.key())
                .copied()
                .unwrap_or(1);
            info!(service, workload = %workload, replicas, "Scaling up");
            kubectl.scale(&workload, replicas).await.map_err(|e| {
                e.during(format!(
                    "failed to scale {} ({}) to {} replicas",
                    service, workload, replicas
                ))
            })?;
        }
        self.pods.lock().await.clear();
        Ok(())
    }

    async fn stop(&self, services: &[&str]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let kubectl = self.kubectl()?;
        let mut targets = Vec::with_capacity(services.len());
        for service in services {
            let workload = kubectl
                .find_workload(service)
                .await
                .map_err(|e| e.during(format!("failed to resolve workload for {}", service)))?;
            match kubectl.replica_count(&workload).await {
                Ok(count) if count > 0 => {
                    self.replicas.lock().await.insert(workload.key(), count);
                }
                Ok(_) => {}
                Err(e) => warn!(workload = %workload, "Could not read replica count: {}", e),
            }
            targets.push((*service, workload));
        }

        for (service, workload) in &targets {
            info!(service, workload = %workload, "Scaling down");
            kubectl.scale(workload, 0).await.map_err(|e| {
                e.during(format!("failed to scale {} ({}) to 0 replicas", service, workload))
            })?;
        }
        self.pods.lock().await.clear();
        Ok(())
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        let phases = self.kubectl()?.pod_phases(service).await?;
        Ok(phases.iter().any(|phase| phase == "Running"))
    }
}
