//! Backup and restore orchestration.
//!
//! [`InfrahubOps`] is the session object behind every CLI command. It
//! resolves the environment backend and the database credentials lazily, once
//! per session, and hands them to the individual engines:
//! - [`backup`] creates archives from a running deployment
//! - [`restore`] validates an archive and loads it back
//! - [`from_files`] packages existing dumps into an archive
//! - [`maintenance`] covers environment reporting and task-manager cleanup

pub mod backup;
pub mod from_files;
pub mod maintenance;
pub mod restore;
pub mod scripts;
pub mod services;
pub mod taskmanager_db;
pub mod tasks;

use crate::config::Config;
use crate::credentials::{CredentialResolver, Credentials};
use crate::env::{service, EnvironmentBackend, ExecOptions, Resolver};
use crate::neo4j::watchdog::WatchdogAssets;
use crate::neo4j::GraphDatabase;
use crate::runner::{argv, CommandRunner, SystemRunner};
use crate::utils::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;

pub use backup::BackupOptions;
pub use from_files::FromFilesOptions;
pub use restore::RestoreOptions;

pub struct InfrahubOps {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    local_env: HashMap<String, String>,
    assets: WatchdogAssets,
    backend: OnceCell<Box<dyn EnvironmentBackend>>,
    credentials: OnceCell<Credentials>,
}

impl InfrahubOps {
    /// Session against the local host, with the embedded watchdog helpers.
    pub fn new(config: Config) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner::new()))
    }

    pub fn with_runner(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            local_env: std::env::vars().collect(),
            assets: WatchdogAssets::embedded(),
            backend: OnceCell::new(),
            credentials: OnceCell::new(),
        }
    }

    /// Session bound to an already detected backend.
    pub fn with_backend(config: Config, backend: Box<dyn EnvironmentBackend>) -> Self {
        let mut ops = Self::new(config);
        ops.backend = OnceCell::new_with(Some(backend));
        ops
    }

    pub fn with_assets(mut self, assets: WatchdogAssets) -> Self {
        self.assets = assets;
        self
    }

    /// Replaces the snapshot of the local environment used for credentials.
    pub fn with_local_env(mut self, local_env: HashMap<String, String>) -> Self {
        self.local_env = local_env;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The detected backend, resolving it on first use.
    pub async fn backend(&self) -> Result<&dyn EnvironmentBackend> {
        let backend = self
            .backend
            .get_or_try_init(|| async {
                Resolver::new(
                    self.runner.clone(),
                    self.config.project.clone(),
                    self.config.k8s_namespace.clone(),
                )
                .resolve()
                .await
            })
            .await?;
        Ok(backend.as_ref())
    }

    pub async fn credentials(&self) -> Result<&Credentials> {
        let backend = self.backend().await?;
        let credentials = self
            .credentials
            .get_or_init(|| async {
                CredentialResolver::new(&self.config.neo4j, &self.config.postgres, &self.local_env)
                    .resolve(backend)
                    .await
            })
            .await;
        Ok(credentials)
    }

    pub async fn graph(&self) -> Result<GraphDatabase<'_>> {
        let backend = self.backend().await?;
        let credentials = self.credentials().await?;
        Ok(GraphDatabase::new(
            backend,
            &credentials.neo4j,
            &self.config.timings,
            &self.assets,
        ))
    }

    /// Version reported by the application server, `unknown` if it cannot be read.
    pub async fn infrahub_version(&self) -> String {
        match self.read_infrahub_version().await {
            Ok(Some(version)) => version,
            Ok(None) => "unknown".to_string(),
            Err(e) => {
                warn!("Could not determine Infrahub version: {}", e);
                "unknown".to_string()
            }
        }
    }

    async fn read_infrahub_version(&self) -> Result<Option<String>> {
        let output = self
            .backend()
            .await?
            .exec(
                service::INFRAHUB_SERVER,
                &argv(&["python", "-c", "import infrahub; print(infrahub.__version__)"]),
                &ExecOptions::default(),
            )
            .await?;
        Ok(output
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }
}
