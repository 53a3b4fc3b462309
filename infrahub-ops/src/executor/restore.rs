use super::services::{restart_dependencies, stop_app_services, wipe_transient_data};
use super::{taskmanager_db, InfrahubOps};
use crate::archive::metadata::BackupMetadata;
use crate::archive::{self, checksums};
use crate::env::service;
use crate::neo4j::resolve_restore_edition;
use crate::utils::{OpsError, Result, StepContext};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub exclude_task_manager: bool,
    /// Convert the restored store to the block format
    pub migrate_format: bool,
    /// Pause before anything else happens
    pub sleep: Option<Duration>,
}

impl InfrahubOps {
    /// Restores `archive` onto the detected deployment.
    ///
    /// Nothing is stopped or overwritten until the metadata has been read,
    /// the edition checked and every checksum verified.
    pub async fn restore_backup(&self, archive: &Path, opts: &RestoreOptions) -> Result<()> {
        if !archive.is_file() {
            return Err(OpsError::other(format!("backup file not found: {}", archive.display())));
        }

        if let Some(pause) = opts.sleep {
            info!("Sleeping for {} before restore", humantime::format_duration(pause));
            tokio::time::sleep(pause).await;
        }

        let backend = self.backend().await?;

        let work = tempfile::Builder::new().prefix("infrahub_restore_").tempdir()?;
        info!("Restoring from backup: {}", archive.display());
        let root = archive::extract(archive, work.path()).step("failed to extract backup")?;

        let metadata = BackupMetadata::read(&root)?;
        info!("Backup metadata:\n{}", metadata.to_json()?);

        let graph = self.graph().await?;
        let runtime = graph.edition_info("restore").await;
        let edition = resolve_restore_edition(metadata.neo4j_edition, runtime.edition)?;

        let restore_task_manager = if !metadata.includes_task_manager() {
            info!("Backup does not include task manager database; skipping restore");
            false
        } else if opts.exclude_task_manager {
            info!("Skipping task manager database restore as requested");
            false
        } else {
            true
        };
        verify_capture(&root, &metadata, restore_task_manager)?;

        wipe_transient_data(backend).await;
        stop_app_services(backend).await?;

        if restore_task_manager {
            let credentials = self.credentials().await?;
            taskmanager_db::restore(backend, &credentials.postgres, &root).await?;
        }

        restart_dependencies(backend).await?;
        graph.restore(&root, edition, opts.migrate_format).await?;

        info!("Starting Infrahub services");
        backend
            .start(&[service::INFRAHUB_SERVER, service::TASK_WORKER])
            .await
            .step("failed to restart infrahub services")?;

        info!("Restore completed");
        Ok(())
    }
}

/// Every file under `database/` must be listed, so metadata without a
/// checksum map only passes for an empty capture.
fn verify_capture(
    root: &Path,
    metadata: &BackupMetadata,
    restore_task_manager: bool,
) -> Result<()> {
    if metadata.checksums.is_empty() {
        warn!("Backup metadata has no checksums");
    }
    checksums::verify(root, &metadata.checksums, restore_task_manager)
}
