//! Execution environments.
//!
//! An [`EnvironmentBackend`] maps the logical Infrahub services onto whatever
//! runs them: a Docker Compose project or a Kubernetes namespace. Orchestration
//! code only ever talks to the trait.

pub mod cluster;
pub mod compose;
pub mod quote;
pub mod resolver;
pub mod workloads;

use crate::utils::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

pub use cluster::ClusterBackend;
pub use compose::ComposeBackend;
pub use resolver::Resolver;

/// Logical service names shared by every backend.
pub mod service {
    pub const DATABASE: &str = "database";
    pub const TASK_MANAGER_DB: &str = "task-manager-db";
    pub const INFRAHUB_SERVER: &str = "infrahub-server";
    pub const TASK_WORKER: &str = "task-worker";
    pub const TASK_MANAGER: &str = "task-manager";
    pub const TASK_MANAGER_BACKGROUND: &str = "task-manager-background-svc";
    pub const CACHE: &str = "cache";
    pub const MESSAGE_QUEUE: &str = "message-queue";
}

/// How a remote command should run. The default runs with the backend's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Process owner inside the target
    pub user: Option<String>,

    /// Environment overrides, kept sorted so command lines are stable
    pub env: BTreeMap<String, String>,
}

impl ExecOptions {
    pub fn as_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    /// Short backend identifier (`docker`, `kubernetes`).
    fn name(&self) -> &'static str;

    /// The resolved project or namespace, once detection has succeeded.
    fn target(&self) -> Option<String>;

    /// Verifies the explicit target or discovers exactly one deployment.
    async fn detect(&mut self) -> Result<()>;

    async fn exec(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String>;

    /// Same as [`EnvironmentBackend::exec`], forwarding each output line to the log.
    async fn exec_stream(
        &self,
        service: &str,
        command: &[String],
        opts: &ExecOptions,
    ) -> Result<String>;

    async fn copy_to(&self, service: &str, src: &Path, dest: &str) -> Result<()>;

    async fn copy_from(&self, service: &str, src: &str, dest: &Path) -> Result<()>;

    async fn start(&self, services: &[&str]) -> Result<()>;

    async fn stop(&self, services: &[&str]) -> Result<()>;

    async fn is_running(&self, service: &str) -> Result<bool>;
}

/// Sorted, de-duplicated copy of `items`.
pub(crate) fn sorted_unique(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}
