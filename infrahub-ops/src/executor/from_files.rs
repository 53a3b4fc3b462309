use super::InfrahubOps;
use crate::archive::checksums::{self, DATABASE_DIR};
use crate::archive::metadata::{
    archive_name, backup_id, BackupMetadata, COMPONENT_DATABASE, COMPONENT_TASK_MANAGER_DB,
    PREFECT_DUMP,
};
use crate::archive::{self, BACKUP_ROOT};
use crate::neo4j::Edition;
use crate::utils::format::format_bytes;
use crate::utils::{OpsError, Result, StepContext};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

/// Inputs for packaging dumps taken outside of this tool.
#[derive(Debug, Clone)]
pub struct FromFilesOptions {
    /// Backup set directory or single dump file
    pub neo4j_path: PathBuf,
    pub postgres_path: Option<PathBuf>,
    pub neo4j_edition: Option<Edition>,
    pub infrahub_version: Option<String>,
}

/// Community for a lone `.dump` file, enterprise otherwise.
fn infer_edition(neo4j_path: &Path) -> Edition {
    let is_dump = neo4j_path.is_file() && neo4j_path.extension().is_some_and(|ext| ext == "dump");
    if is_dump {
        Edition::Community
    } else {
        Edition::Enterprise
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| OpsError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| OpsError::other(e.to_string()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

impl InfrahubOps {
    /// Builds a standard archive from existing dump files without touching
    /// any running deployment.
    pub async fn create_backup_from_files(&self, opts: &FromFilesOptions) -> Result<PathBuf> {
        let neo4j = &opts.neo4j_path;
        if !neo4j.exists() {
            return Err(OpsError::other(format!(
                "neo4j backup path not accessible: {}",
                neo4j.display()
            )));
        }
        if let Some(postgres) = &opts.postgres_path {
            if !postgres.is_file() {
                return Err(OpsError::other(format!(
                    "postgres dump file not accessible: {}",
                    postgres.display()
                )));
            }
        }

        let work = tempfile::Builder::new().prefix("infrahub_backup_").tempdir()?;
        let root = work.path().join(BACKUP_ROOT);
        let database_dir = root.join(DATABASE_DIR);
        fs::create_dir_all(&database_dir)?;
        fs::create_dir_all(&self.config.backup_dir)
            .map_err(OpsError::from)
            .step("failed to create backup directory")?;

        info!("Copying Neo4j backup files");
        if neo4j.is_dir() {
            copy_tree(neo4j, &database_dir).step("failed to copy neo4j backup directory")?;
        } else {
            let file_name = neo4j.file_name().ok_or_else(|| {
                OpsError::other(format!("invalid neo4j path: {}", neo4j.display()))
            })?;
            fs::copy(neo4j, database_dir.join(file_name))
                .map_err(OpsError::from)
                .step("failed to copy neo4j backup file")?;
        }

        let mut components = vec![COMPONENT_DATABASE.to_string()];
        if let Some(postgres) = &opts.postgres_path {
            info!("Copying PostgreSQL dump file");
            fs::copy(postgres, root.join(PREFECT_DUMP))
                .map_err(OpsError::from)
                .step("failed to copy postgres dump")?;
            components.push(COMPONENT_TASK_MANAGER_DB.to_string());
        }

        let edition = match opts.neo4j_edition {
            Some(edition) => edition,
            None => {
                let edition = infer_edition(neo4j);
                info!("Auto-detected Neo4j edition: {}", edition);
                edition
            }
        };

        let name = archive_name(Local::now());
        let version = opts.infrahub_version.as_deref().unwrap_or("unknown");
        let mut metadata = BackupMetadata::new(backup_id(&name), version, components);
        metadata.checksums = checksums::compute(&root, opts.postgres_path.is_some())?;
        metadata.neo4j_edition = Some(edition);
        metadata.write(&root)?;

        let path = self.config.backup_dir.join(&name);
        archive::create(&root, &path)?;
        let size = fs::metadata(&path)?.len();
        info!("Backup created: {} ({})", path.display(), format_bytes(size));
        Ok(path)
    }
}
