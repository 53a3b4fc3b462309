//! `backup_information.json`, the record stored at the root of every archive.

use crate::neo4j::Edition;
use crate::utils::{OpsError, Result};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Schema stamp of the archive layout. Bumped on incompatible changes.
pub const METADATA_VERSION: u64 = 2025111200;
pub const METADATA_FILE: &str = "backup_information.json";

pub const COMPONENT_DATABASE: &str = "database";
pub const COMPONENT_TASK_MANAGER_DB: &str = "task-manager-db";

/// Key of the task manager dump in [`BackupMetadata::checksums`].
pub const PREFECT_DUMP: &str = "prefect.dump";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub metadata_version: u64,
    pub backup_id: String,
    pub created_at: String,
    pub tool_version: String,
    pub infrahub_version: String,
    pub components: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checksums: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neo4j_edition: Option<Edition>,
}

impl BackupMetadata {
    pub fn new(backup_id: &str, infrahub_version: &str, components: Vec<String>) -> Self {
        Self {
            metadata_version: METADATA_VERSION,
            backup_id: backup_id.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            infrahub_version: infrahub_version.to_string(),
            components,
            checksums: BTreeMap::new(),
            neo4j_edition: None,
        }
    }

    pub fn has_component(&self, component: &str) -> bool {
        self.components.iter().any(|c| c == component)
    }

    /// True when the archive carries a task manager dump, either declared as
    /// a component or only present in the checksum map.
    pub fn includes_task_manager(&self) -> bool {
        self.has_component(COMPONENT_TASK_MANAGER_DB) || self.checksums.contains_key(PREFECT_DUMP)
    }

    /// Serializes with 4-space indentation.
    pub fn to_json(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)?;
        String::from_utf8(buf).map_err(|e| OpsError::other(e.to_string()))
    }

    pub fn write(&self, backup_dir: &Path) -> Result<()> {
        std::fs::write(backup_dir.join(METADATA_FILE), self.to_json()?)?;
        Ok(())
    }

    /// Reads the sidecar, rejecting layouts written by a newer tool.
    pub fn read(backup_dir: &Path) -> Result<Self> {
        let path = backup_dir.join(METADATA_FILE);
        if !path.is_file() {
            return Err(OpsError::MissingMetadata);
        }
        let content = std::fs::read_to_string(path)?;
        let metadata: Self = serde_json::from_str(&content)?;
        if metadata.metadata_version > METADATA_VERSION {
            return Err(OpsError::UnsupportedMetadata {
                found: metadata.metadata_version,
                supported: METADATA_VERSION,
            });
        }
        Ok(metadata)
    }
}

/// `infrahub_backup_YYYYMMDD_HHMMSS.tar.gz` in local time.
pub fn archive_name(now: DateTime<Local>) -> String {
    format!("infrahub_backup_{}.tar.gz", now.format("%Y%m%d_%H%M%S"))
}

/// Backup id for an archive file name.
pub fn backup_id(archive_name: &str) -> &str {
    archive_name.strip_suffix(".tar.gz").unwrap_or(archive_name)
}
