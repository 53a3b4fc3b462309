use super::freeze::{FreezeProtocol, RemoteProcessControl};
use super::{GraphDatabase, MetadataMode, WORK_DIR};
use crate::env::{service, ExecOptions};
use crate::runner::argv;
use crate::utils::{Result, StepContext};
use std::path::Path;
use tracing::{info, warn};

impl GraphDatabase<'_> {
    /// Online backup with `neo4j-admin database backup` into `<backup_dir>/database`.
    pub async fn backup_enterprise(&self, backup_dir: &Path, metadata: MetadataMode) -> Result<()> {
        info!("Backing up Neo4j database (enterprise)");
        let result = self.run_enterprise_backup(backup_dir, metadata).await;
        if let Err(e) = self.remove("-rf", &[WORK_DIR]).await {
            warn!("Failed to clean up neo4j scratch directory: {}", e);
        }
        result
    }

    async fn run_enterprise_backup(&self, backup_dir: &Path, metadata: MetadataMode) -> Result<()> {
        self.exec(argv(&["mkdir", "-p", WORK_DIR]), &ExecOptions::default())
            .await
            .step("failed to create neo4j scratch directory")?;

        let include_metadata = format!("--include-metadata={}", metadata.as_str());
        let to_path = format!("--to-path={}", WORK_DIR);
        self.exec_stream(
            argv(&[
                "neo4j-admin",
                "database",
                "backup",
                "--expand-commands",
                include_metadata.as_str(),
                to_path.as_str(),
                self.name(),
            ]),
            &ExecOptions::default(),
        )
        .await
        .step("neo4j backup failed")?;

        self.backend
            .copy_from(service::DATABASE, WORK_DIR, &backup_dir.join("database"))
            .await
            .step("failed to copy neo4j backup")?;
        Ok(())
    }

    /// Offline dump of a frozen community server into `<backup_dir>/database/<db>.dump`.
    pub async fn backup_community(&self, backup_dir: &Path) -> Result<()> {
        info!("Backing up Neo4j database (community)");
        let control = RemoteProcessControl::new(self);
        let result = FreezeProtocol::new(&control, self.timings)
            .run(move || self.dump_frozen(backup_dir))
            .await;
        if let Err(e) = self.remove("-rf", &[WORK_DIR]).await {
            warn!("Failed to clean up neo4j scratch directory: {}", e);
        }
        result
    }

    async fn dump_frozen(&self, backup_dir: &Path) -> Result<()> {
        self.exec(argv(&["mkdir", "-p", WORK_DIR]), &ExecOptions::default())
            .await
            .step("failed to create neo4j scratch directory")?;

        let local_dir = backup_dir.join("database");
        std::fs::create_dir_all(&local_dir)?;

        let to_path = format!("--to-path={}", WORK_DIR);
        self.exec_stream(
            argv(&[
                "neo4j-admin",
                "database",
                "dump",
                "--overwrite-destination=true",
                to_path.as_str(),
                self.name(),
            ]),
            &ExecOptions::default(),
        )
        .await
        .step("neo4j dump failed")?;

        let file_name = format!("{}.dump", self.name());
        let remote = format!("{}/{}", WORK_DIR, file_name);
        self.backend
            .copy_from(service::DATABASE, &remote, &local_dir.join(&file_name))
            .await
            .step("failed to copy neo4j dump")?;
        Ok(())
    }
}
