//! Chooses the backend that hosts the Infrahub deployment.

use super::{ClusterBackend, ComposeBackend, EnvironmentBackend};
use crate::runner::CommandRunner;
use crate::utils::{OpsError, Result};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Resolver {
    candidates: Vec<Box<dyn EnvironmentBackend>>,
}

impl Resolver {
    /// Builds the candidate list for the given explicit targets.
    ///
    /// A backend with an explicit target is tried first; otherwise Docker
    /// Compose is tried before Kubernetes.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        project: Option<String>,
        namespace: Option<String>,
    ) -> Self {
        let compose: Box<dyn EnvironmentBackend> =
            Box::new(ComposeBackend::new(runner.clone(), project.clone()));
        let cluster: Box<dyn EnvironmentBackend> =
            Box::new(ClusterBackend::new(runner, namespace.clone()));

        let candidates = if namespace.is_some() && project.is_none() {
            vec![cluster, compose]
        } else {
            vec![compose, cluster]
        };
        Self { candidates }
    }

    pub fn with_backends(candidates: Vec<Box<dyn EnvironmentBackend>>) -> Self {
        Self { candidates }
    }

    /// Detects each candidate in turn. Soft failures move on to the next one;
    /// anything else stops resolution.
    pub async fn resolve(self) -> Result<Box<dyn EnvironmentBackend>> {
        let mut tried = Vec::new();
        for mut backend in self.candidates {
            let name = backend.name();
            match backend.detect().await {
                Ok(()) => {
                    info!(
                        backend = name,
                        target = %backend.target().unwrap_or_default(),
                        "Detected {} environment",
                        name
                    );
                    return Ok(backend);
                }
                Err(e) if e.is_soft_detection() => {
                    debug!(backend = name, "Skipping backend: {}", e);
                    tried.push(name);
                }
                Err(e) => return Err(e.during(format!("{} environment detection failed", name))),
            }
        }

        Err(OpsError::NoEnvironment {
            tried: tried.join(", "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, ScriptedRunner};

    #[tokio::test]
    async fn test_soft_failures_fall_through() {
        let first = FakeBackend::new()
            .named("docker")
            .detect_with(|| Err(OpsError::EnvironmentNotFound));
        let second = FakeBackend::new().named("kubernetes");

        let backend = Resolver::with_backends(vec![Box::new(first), Box::new(second)])
            .resolve()
            .await
            .unwrap();
        assert_eq!(backend.name(), "kubernetes");
    }

    #[tokio::test]
    async fn test_hard_failure_stops_resolution() {
        let first = FakeBackend::new().named("docker").detect_with(|| {
            Err(OpsError::AmbiguousTarget {
                kind: "docker compose projects".into(),
                candidates: "a, b".into(),
                flag: "--project".into(),
            })
        });
        let second = FakeBackend::new().named("kubernetes");

        let err = Resolver::with_backends(vec![Box::new(first), Box::new(second)])
            .resolve()
            .await
            .err()
            .unwrap();
        let text = err.to_string();
        assert!(text.contains("docker environment detection failed"));
        assert!(text.contains("specify --project"));
    }

    #[tokio::test]
    async fn test_all_exhausted() {
        let first = FakeBackend::new().named("docker").detect_with(|| {
            Err(OpsError::CliUnavailable { tool: "docker".into(), reason: "missing".into() })
        });
        let second = FakeBackend::new()
            .named("kubernetes")
            .detect_with(|| Err(OpsError::EnvironmentNotFound));

        let err = Resolver::with_backends(vec![Box::new(first), Box::new(second)])
            .resolve()
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "no Infrahub environment detected (tried docker, kubernetes)");
    }

    #[tokio::test]
    async fn test_explicit_namespace_tries_cluster_first() {
        let runner = Arc::new(ScriptedRunner::new());
        let backend = Resolver::new(runner.clone(), None, Some("infrahub".into()))
            .resolve()
            .await
            .unwrap();

        assert_eq!(backend.name(), "kubernetes");
        assert_eq!(backend.target().as_deref(), Some("infrahub"));
        assert!(!runner.called("docker"));
    }
}
