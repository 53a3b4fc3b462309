use super::services::{restore_after, stop_app_services};
use super::{taskmanager_db, tasks, InfrahubOps};
use crate::archive::metadata::{
    archive_name, backup_id, BackupMetadata, COMPONENT_DATABASE, COMPONENT_TASK_MANAGER_DB,
};
use crate::archive::{self, checksums, BACKUP_ROOT};
use crate::neo4j::{Edition, GraphDatabase, MetadataMode};
use crate::utils::format::format_bytes;
use crate::utils::signal::{abort_window, interrupted};
use crate::utils::{OpsError, Result, StepContext};
use chrono::Local;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Skip waiting for running tasks
    pub force: bool,
    pub metadata: MetadataMode,
    pub exclude_task_manager: bool,
    /// Pause after the archive is written
    pub sleep: Option<Duration>,
}

impl InfrahubOps {
    /// Captures the deployment into a new archive under the backup directory
    /// and returns its path.
    pub async fn create_backup(&self, opts: &BackupOptions) -> Result<PathBuf> {
        let backend = self.backend().await?;
        let graph = self.graph().await?;

        let edition = graph.edition_info("backup").await;
        if edition.is_community() {
            warn!(
                "Neo4j community edition: all Infrahub services will be stopped for the duration of the backup"
            );
            abort_window(self.config.timings.abort_window(), interrupted()).await?;
        }

        let version = self.infrahub_version().await;

        if opts.force {
            info!("Skipping running task check (--force)");
        } else {
            tasks::wait_for_running_tasks(backend, self.config.timings.task_poll()).await?;
        }

        let stopped = if edition.is_community() {
            stop_app_services(backend)
                .await
                .step("failed to stop services for Neo4j community backup")?
        } else {
            Vec::new()
        };

        let outcome = self.capture(&graph, edition.edition, &version, opts).await;
        let archive = restore_after(backend, &stopped, outcome).await?;

        if let Some(pause) = opts.sleep {
            info!("Sleeping for {}", humantime::format_duration(pause));
            tokio::time::sleep(pause).await;
        }
        Ok(archive)
    }

    async fn capture(
        &self,
        graph: &GraphDatabase<'_>,
        edition: Edition,
        version: &str,
        opts: &BackupOptions,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.backup_dir)
            .map_err(OpsError::from)
            .step("failed to create backup directory")?;

        let work = tempfile::Builder::new().prefix("infrahub_backup_").tempdir()?;
        let root = work.path().join(BACKUP_ROOT);
        std::fs::create_dir_all(&root)?;

        match edition {
            Edition::Enterprise => graph.backup_enterprise(&root, opts.metadata).await?,
            Edition::Community => graph.backup_community(&root).await?,
        }

        let mut components = vec![COMPONENT_DATABASE.to_string()];
        let include_task_manager = !opts.exclude_task_manager;
        if include_task_manager {
            let credentials = self.credentials().await?;
            taskmanager_db::backup(graph.backend, &credentials.postgres, &root).await?;
            components.push(COMPONENT_TASK_MANAGER_DB.to_string());
        } else {
            info!("Skipping task manager database backup (--exclude-taskmanager)");
        }

        let name = archive_name(Local::now());
        let mut metadata = BackupMetadata::new(backup_id(&name), version, components);
        metadata.checksums = checksums::compute(&root, include_task_manager)?;
        metadata.neo4j_edition = Some(edition);
        metadata.write(&root)?;

        let path = self.config.backup_dir.join(&name);
        info!("Creating archive {}", path.display());
        archive::create(&root, &path)?;

        let size = std::fs::metadata(&path)?.len();
        info!("Backup created: {} ({})", path.display(), format_bytes(size));
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::metadata::PREFECT_DUMP;
    use crate::executor::test_support::session;
    use crate::testing::{FakeBackend, Fixture};

    fn enterprise() -> FakeBackend {
        FakeBackend::new()
            .on("dbms.components()", "edition\n\"enterprise\"")
            .fixture(
                "copy_from database:/tmp/infrahubops",
                Fixture::Dir(vec![
                    ("neo4j/neostore".into(), b"store".to_vec()),
                    ("neo4j/tx/log.0".into(), b"tx".to_vec()),
                ]),
            )
            .fixture("infrahubops_prefect.dump", Fixture::File(b"PGDMP".to_vec()))
    }

    fn unpack(archive: &std::path::Path) -> (tempfile::TempDir, BackupMetadata) {
        let dir = tempfile::tempdir().unwrap();
        let root = archive::extract(archive, dir.path()).unwrap();
        let metadata = BackupMetadata::read(&root).unwrap();
        (dir, metadata)
    }

    #[tokio::test]
    async fn test_enterprise_backup_keeps_services_running() {
        let out = tempfile::tempdir().unwrap();
        let (ops, backend) = session(enterprise(), out.path());

        let path = ops
            .create_backup(&BackupOptions { force: true, ..Default::default() })
            .await
            .unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("infrahub_backup_") && name.ends_with(".tar.gz"));
        assert!(!backend.called("stop "));
        assert!(!backend.called("infrahubctl"));
        assert!(backend.called("--include-metadata=all"));

        let (_dir, metadata) = unpack(&path);
        assert_eq!(metadata.components, vec!["database", "task-manager-db"]);
        assert_eq!(metadata.neo4j_edition, Some(Edition::Enterprise));
        assert_eq!(metadata.checksums.len(), 3);
        assert!(metadata.checksums.contains_key(PREFECT_DUMP));
        assert_eq!(metadata.backup_id, name.trim_end_matches(".tar.gz"));
    }

    #[tokio::test]
    async fn test_waits_for_tasks_unless_forced() {
        let out = tempfile::tempdir().unwrap();
        let (ops, backend) = session(
            enterprise()
                .once("infrahubctl task list", r#"[{"id": "t1", "title": "import"}]"#)
                .on("infrahubctl task list", "[]"),
            out.path(),
        );

        ops.create_backup(&BackupOptions::default()).await.unwrap();
        let waited = backend.calls().iter().filter(|c| c.contains("infrahubctl")).count();
        assert_eq!(waited, 2);
        let listed = backend.position("infrahubctl").unwrap();
        assert!(listed < backend.position("neo4j-admin").unwrap());
    }

    #[tokio::test]
    async fn test_excluding_task_manager() {
        let out = tempfile::tempdir().unwrap();
        let (ops, backend) = session(enterprise(), out.path());

        let path = ops
            .create_backup(&BackupOptions {
                force: true,
                exclude_task_manager: true,
                metadata: MetadataMode::None,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(!backend.called("pg_dump"));
        assert!(backend.called("--include-metadata=none"));
        let (_dir, metadata) = unpack(&path);
        assert_eq!(metadata.components, vec!["database"]);
        assert!(!metadata.checksums.contains_key(PREFECT_DUMP));
    }

    #[tokio::test]
    async fn test_community_backup_stops_and_restarts_services() {
        let out = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new()
            .on("dbms.components()", "edition\n\"community\"")
            .on("cat /var/lib/neo4j/run/neo4j.pid", "4242")
            .on("uname -m", "x86_64")
            .on("/proc/4242/status", "T (stopped)")
            .fixture(
                "copy_from database:/tmp/infrahubops/neo4j.dump",
                Fixture::File(b"dump".to_vec()),
            )
            .fixture("infrahubops_prefect.dump", Fixture::File(b"PGDMP".to_vec()));
        let (ops, backend) = session(backend, out.path());

        let path = ops
            .create_backup(&BackupOptions { force: true, ..Default::default() })
            .await
            .unwrap();

        let stop = backend.position("stop infrahub-server").unwrap();
        let dump = backend.position("neo4j-admin database dump").unwrap();
        let resume = backend.position("kill -CONT 4242").unwrap();
        let restart = backend.position("start infrahub-server").unwrap();
        assert!(stop < dump && dump < resume && resume < restart);
        assert!(backend.is_up("task-worker"));

        let (_dir, metadata) = unpack(&path);
        assert_eq!(metadata.neo4j_edition, Some(Edition::Community));
        assert!(metadata.checksums.contains_key("database/neo4j.dump"));
    }

    #[tokio::test]
    async fn test_failed_capture_restarts_services_and_leaves_no_archive() {
        let out = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new()
            .on("dbms.components()", "edition\n\"community\"")
            .on("cat /var/lib/neo4j/run/neo4j.pid", "4242")
            .on("uname -m", "x86_64")
            .on("/proc/4242/status", "T (stopped)")
            .fail("neo4j-admin database dump", "disk full");
        let (ops, backend) = session(backend, out.path());

        let err = ops
            .create_backup(&BackupOptions { force: true, ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.command_output(), Some("disk full"));
        assert!(backend.called("kill -CONT 4242"));
        assert!(backend.is_up("infrahub-server"));
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }
}
