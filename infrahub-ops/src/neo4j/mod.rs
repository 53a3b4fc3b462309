//! Neo4j edition handling and database access.
//!
//! Enterprise deployments are captured with the online backup tool. Community
//! deployments have no online backup, so the process is frozen with the
//! watchdog helper (see [`freeze`]) and dumped offline.

pub mod backup;
pub mod freeze;
pub mod restore;
pub mod watchdog;

use crate::config::Timings;
use crate::credentials::DatabaseCredentials;
use crate::env::{service, EnvironmentBackend, ExecOptions};
use crate::runner::argv;
use crate::utils::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};
use watchdog::WatchdogAssets;

pub const PID_FILE: &str = "/var/lib/neo4j/run/neo4j.pid";
/// Scratch directory inside the database container.
pub const WORK_DIR: &str = "/tmp/infrahubops";
pub const WATCHDOG_BINARY: &str = "/tmp/infrahubops/neo4j_watchdog";
pub const WATCHDOG_READY: &str = "/tmp/infrahubops/neo4j_watchdog.ready";
pub const WATCHDOG_LOG: &str = "/tmp/infrahubops/neo4j_watchdog.log";

const RESTORE_METADATA_SCRIPT: &str = "/data/scripts/neo4j/restore_metadata.cypher";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Enterprise,
    Community,
}

impl Edition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edition::Enterprise => "enterprise",
            Edition::Community => "community",
        }
    }
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Edition {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "enterprise" => Ok(Edition::Enterprise),
            "community" => Ok(Edition::Community),
            other => Err(OpsError::Parse {
                what: "neo4j edition".to_string(),
                message: format!("unknown edition {:?}", other),
            }),
        }
    }
}

/// Which security metadata the enterprise backup includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MetadataMode {
    #[default]
    All,
    None,
    Users,
    Roles,
}

impl MetadataMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataMode::All => "all",
            MetadataMode::None => "none",
            MetadataMode::Users => "users",
            MetadataMode::Roles => "roles",
        }
    }
}

/// The runtime edition as far as it could be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditionInfo {
    pub edition: Edition,
    pub detected: bool,
}

impl EditionInfo {
    pub fn is_community(&self) -> bool {
        self.edition == Edition::Community
    }
}

/// Picks the restore strategy for a backup taken from `backup` on a `runtime` server.
///
/// A community dump can always be loaded with the community method; an
/// enterprise backup set cannot be restored on a community server.
pub fn resolve_restore_edition(backup: Option<Edition>, runtime: Edition) -> Result<Edition> {
    match (backup, runtime) {
        (Some(Edition::Community), Edition::Enterprise) => {
            info!("Backup is Community edition; will use community restore method");
            Ok(Edition::Community)
        }
        (Some(Edition::Enterprise), Edition::Community) => Err(OpsError::EditionMismatch {
            backup: "Enterprise".to_string(),
            runtime: "Community".to_string(),
        }),
        _ => Ok(runtime),
    }
}

/// Last non-empty line of `cypher-shell --format plain` output, unquoted and lower-cased.
pub fn extract_edition(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .map(|line| line.trim().trim_matches('"').trim())
        .find(|line| !line.is_empty())
        .map(str::to_lowercase)
}

/// Access to the graph database through the active backend.
pub struct GraphDatabase<'a> {
    pub backend: &'a dyn EnvironmentBackend,
    pub creds: &'a DatabaseCredentials,
    pub timings: &'a Timings,
    pub assets: &'a WatchdogAssets,
}

impl<'a> GraphDatabase<'a> {
    pub fn new(
        backend: &'a dyn EnvironmentBackend,
        creds: &'a DatabaseCredentials,
        timings: &'a Timings,
        assets: &'a WatchdogAssets,
    ) -> Self {
        Self {
            backend,
            creds,
            timings,
            assets,
        }
    }

    pub fn name(&self) -> &str {
        &self.creds.database
    }

    pub async fn exec(&self, command: Vec<String>, opts: &ExecOptions) -> Result<String> {
        self.backend.exec(service::DATABASE, &command, opts).await
    }

    pub async fn exec_stream(&self, command: Vec<String>, opts: &ExecOptions) -> Result<String> {
        self.backend.exec_stream(service::DATABASE, &command, opts).await
    }

    fn cypher_command(&self, query: &str, plain: bool) -> Vec<String> {
        let mut command = vec![
            "cypher-shell".to_string(),
            "-u".to_string(),
            self.creds.username.clone(),
            format!("-p{}", self.creds.password),
            "-d".to_string(),
            "system".to_string(),
        ];
        if plain {
            command.push("--format".to_string());
            command.push("plain".to_string());
        }
        command.push(query.to_string());
        command
    }

    /// Runs a query against the `system` database.
    pub async fn system_query(&self, query: &str) -> Result<String> {
        self.exec(self.cypher_command(query, false), &ExecOptions::default())
            .await
    }

    /// Runs a query against the `system` database with plain output.
    pub async fn system_query_plain(&self, query: &str) -> Result<String> {
        self.exec(self.cypher_command(query, true), &ExecOptions::default())
            .await
    }

    pub async fn detect_edition(&self) -> Result<Edition> {
        let output = self
            .system_query_plain("CALL dbms.components() YIELD edition")
            .await
            .map_err(|e| e.during("failed to query neo4j edition"))?;
        let edition = extract_edition(&output).ok_or_else(|| OpsError::Parse {
            what: "neo4j edition".to_string(),
            message: format!("empty output: {}", output.trim()),
        })?;
        edition.parse()
    }

    /// Detects the edition, assuming community when detection fails.
    pub async fn edition_info(&self, context: &str) -> EditionInfo {
        match self.detect_edition().await {
            Ok(edition) => {
                info!("Detected Neo4j {} edition for {}", edition, context);
                EditionInfo {
                    edition,
                    detected: true,
                }
            }
            Err(e) => {
                warn!(
                    "Could not determine Neo4j edition during {}; \
                     defaulting to community workflow: {}",
                    context, e
                );
                EditionInfo {
                    edition: Edition::Community,
                    detected: false,
                }
            }
        }
    }

    /// Options for the admin tools, which must run as the `neo4j` user.
    pub async fn admin_options(&self) -> ExecOptions {
        match self.exec(argv(&["whoami"]), &ExecOptions::default()).await {
            Ok(user) if user.trim() == "neo4j" => ExecOptions::default(),
            _ => ExecOptions::as_user("neo4j"),
        }
    }

    /// True when more than one server is registered in the cluster.
    pub async fn is_cluster(&self) -> bool {
        let Ok(output) = self
            .system_query_plain("SHOW SERVERS YIELD * RETURN count(*) as serverCount")
            .await
        else {
            return false;
        };
        let lines: Vec<&str> = output.trim().lines().collect();
        if lines.len() < 2 {
            return false;
        }
        lines[lines.len() - 1]
            .trim()
            .parse::<u32>()
            .map(|count| count > 1)
            .unwrap_or(false)
    }

    pub async fn read_pid(&self) -> Result<u32> {
        let output = self
            .exec(argv(&["cat", PID_FILE]), &ExecOptions::default())
            .await
            .map_err(|e| e.during("failed to read neo4j pid file"))?;
        let pid = output.trim();
        if pid.is_empty() {
            return Err(OpsError::other("neo4j pid file is empty"));
        }
        pid.parse().map_err(|_| OpsError::Parse {
            what: "neo4j pid".to_string(),
            message: format!("invalid pid {:?}", pid),
        })
    }

    pub async fn architecture(&self) -> Result<String> {
        let output = self
            .exec(argv(&["uname", "-m"]), &ExecOptions::default())
            .await
            .map_err(|e| e.during("failed to detect neo4j architecture"))?;
        let arch = output.trim();
        if arch.is_empty() {
            return Err(OpsError::other("empty architecture string"));
        }
        Ok(arch.to_string())
    }

    /// Best-effort removal of a remote path.
    pub async fn remove(&self, flags: &str, paths: &[&str]) -> Result<()> {
        let mut command = vec!["rm".to_string(), flags.to_string()];
        command.extend(paths.iter().map(|p| p.to_string()));
        self.exec(command, &ExecOptions::default()).await.map(|_| ())
    }

    fn restore_metadata_command(&self) -> Vec<String> {
        let pipeline = format!(
            "cat {} | cypher-shell -u {} -p{} -d system --param \"database => '{}'\"",
            RESTORE_METADATA_SCRIPT, self.creds.username, self.creds.password, self.creds.database
        );
        argv(&["sh", "-c", pipeline.as_str()])
    }
}
