use super::freeze::{FreezeProtocol, RemoteProcessControl};
use super::{Edition, GraphDatabase, WORK_DIR};
use crate::env::{service, ExecOptions};
use crate::runner::argv;
use crate::utils::{OpsError, Result, StepContext};
use std::path::Path;
use tracing::{info, warn};

/// The server id of the row flagged `requester = true` in
/// `dbms.cluster.statusCheck` plain output.
pub fn seeder_server_id(output: &str) -> Result<String> {
    let ids: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("requester"))
        .filter(|line| line.starts_with("true") || line.starts_with("TRUE"))
        .filter_map(|line| line.split_once(','))
        .map(|(_, id)| id.trim().trim_matches('"').to_string())
        .filter(|id| !id.is_empty())
        .collect();

    match ids.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(OpsError::other(
            "failed to find current server ID (no requester=true found in output)",
        )),
        _ => Err(OpsError::other(format!(
            "ambiguous current server ID (several requester=true rows: {})",
            ids.join(", ")
        ))),
    }
}

impl GraphDatabase<'_> {
    /// Restores `<backup_dir>/database` with the method matching `edition`.
    pub async fn restore(
        &self,
        backup_dir: &Path,
        edition: Edition,
        migrate_format: bool,
    ) -> Result<()> {
        if let Err(e) = self.remove("-rf", &[WORK_DIR]).await {
            warn!("Failed to clear stale neo4j scratch directory: {}", e);
        }
        self.backend
            .copy_to(service::DATABASE, &backup_dir.join("database"), WORK_DIR)
            .await
            .step("failed to copy backup to database container")?;

        let result = self.restore_staged(edition, migrate_format).await;
        if let Err(e) = self.remove("-rf", &[WORK_DIR]).await {
            warn!("Failed to clean up staged neo4j backup: {}", e);
        }
        result
    }

    async fn restore_staged(&self, edition: Edition, migrate_format: bool) -> Result<()> {
        self.exec(
            argv(&["chown", "-R", "neo4j:neo4j", WORK_DIR]),
            &ExecOptions::default(),
        )
        .await
        .step("failed to change backup ownership")?;

        match edition {
            Edition::Community => self.restore_community(migrate_format).await,
            Edition::Enterprise => self.restore_enterprise(migrate_format).await,
        }
    }

    async fn admin(&self, command: &[&str], opts: &ExecOptions, step: &str) -> Result<()> {
        let mut command = argv(command);
        command.push(self.name().to_string());
        self.exec_stream(command, opts).await.step(step).map(|_| ())
    }

    async fn restore_enterprise(&self, migrate_format: bool) -> Result<()> {
        info!("Restoring Neo4j database (enterprise)");
        let opts = self.admin_options().await;

        if self.is_cluster().await {
            return self.restore_cluster(&opts).await;
        }

        self.system_query(&format!("stop database {}", self.name()))
            .await
            .step("failed to stop neo4j database")?;

        self.admin(
            &[
                "neo4j-admin",
                "database",
                "restore",
                "--expand-commands",
                "--overwrite-destination=true",
                "--from-path=/tmp/infrahubops",
            ],
            &opts,
            "failed to restore neo4j",
        )
        .await?;

        if migrate_format {
            self.admin(
                &["neo4j-admin", "database", "migrate", "--expand-commands", "--to-format=block"],
                &opts,
                "failed to migrate neo4j to block format",
            )
            .await?;
        }

        self.exec(self.restore_metadata_command(), &opts)
            .await
            .step("failed to restore neo4j metadata")?;

        self.system_query(&format!("start database {}", self.name()))
            .await
            .step("failed to start neo4j database")?;
        Ok(())
    }

    /// Designated-seeder restore: the local server restores the backup and
    /// the database is recreated cluster-wide from its copy.
    async fn restore_cluster(&self, opts: &ExecOptions) -> Result<()> {
        info!("Using Neo4j cluster restore flow (designated seeder)");
        let name = self.name();

        if let Err(e) = self.system_query(&format!("STOP DATABASE {}", name)).await {
            warn!("Failed to stop database (may not exist): {}", e);
        }
        self.system_query(&format!("DROP DATABASE {} IF EXISTS", name))
            .await
            .step("failed to drop database")?;

        self.admin(
            &[
                "neo4j-admin",
                "database",
                "restore",
                "--expand-commands",
                "--overwrite-destination=true",
                "--from-path=/tmp/infrahubops",
            ],
            opts,
            "failed to restore neo4j",
        )
        .await?;

        let status = self
            .system_query_plain(
                "CALL dbms.cluster.statusCheck([]) YIELD requester, serverId RETURN requester, serverId",
            )
            .await
            .step("failed to get server ID")?;
        let server_id = seeder_server_id(&status)?;
        info!(server_id = %server_id, "Creating database with designated seeder");

        let create = format!(
            "CREATE DATABASE {}\nTOPOLOGY 3 PRIMARIES\nOPTIONS {{\n  existingData: 'use',\n  \
             existingDataSeedInstance: '{}'\n}}",
            name, server_id
        );
        self.system_query(&create)
            .await
            .step("failed to create database with seeder")?;

        self.wait_online().await
    }

    async fn wait_online(&self) -> Result<()> {
        let query = format!(
            "SHOW DATABASE {} YIELD currentStatus RETURN currentStatus",
            self.name()
        );
        let attempts = self.timings.seed_online_attempts;
        let interval = self.timings.seed_online_interval();
        for attempt in 1..=attempts {
            match self.system_query_plain(&query).await {
                Ok(output) if output.to_lowercase().contains("online") => {
                    info!("Database is online");
                    return Ok(());
                }
                Ok(_) | Err(_) => {}
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(OpsError::Timeout {
            what: format!("database {} to come online", self.name()),
            seconds: interval.as_secs() * u64::from(attempts),
        })
    }

    async fn restore_community(&self, migrate_format: bool) -> Result<()> {
        info!("Restoring Neo4j database (community dump)");
        let control = RemoteProcessControl::new(self);
        FreezeProtocol::new(&control, self.timings)
            .run(move || async move {
                let opts = self.admin_options().await;
                self.admin(
                    &[
                        "neo4j-admin",
                        "database",
                        "load",
                        "--overwrite-destination=true",
                        "--from-path=/tmp/infrahubops",
                    ],
                    &opts,
                    "failed to load neo4j dump",
                )
                .await?;

                if migrate_format {
                    self.admin(
                        &["neo4j-admin", "database", "migrate", "--to-format=block"],
                        &opts,
                        "failed to migrate neo4j to block format",
                    )
                    .await?;
                }
                info!("Neo4j dump restored");
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::neo4j::watchdog::WatchdogAssets;
    use crate::testing::{neo4j_credentials, FakeBackend};

    const STATUS_HEADER: &str = "requester, serverId\n";

    #[test]
    fn test_seeder_server_id() {
        let output = format!(
            "{}false, \"aaa\"\ntrue, \"bbb-123\"\nfalse, \"ccc\"\n",
            STATUS_HEADER
        );
        assert_eq!(seeder_server_id(&output).unwrap(), "bbb-123");
        assert_eq!(seeder_server_id("TRUE, plain-id").unwrap(), "plain-id");
    }

    #[test]
    fn test_seeder_server_id_requires_exactly_one() {
        let none = format!("{}false, \"aaa\"", STATUS_HEADER);
        assert!(seeder_server_id(&none).is_err());

        let many = format!("{}true, \"aaa\"\ntrue, \"bbb\"", STATUS_HEADER);
        let err = seeder_server_id(&many).unwrap_err();
        assert!(err.to_string().contains("aaa, bbb"));
    }

    fn database<'a>(
        backend: &'a FakeBackend,
        creds: &'a crate::credentials::DatabaseCredentials,
        timings: &'a Timings,
        assets: &'a WatchdogAssets,
    ) -> GraphDatabase<'a> {
        GraphDatabase::new(backend, creds, timings, assets)
    }

    #[tokio::test]
    async fn test_standalone_enterprise_restore_sequence() {
        let backend = FakeBackend::new()
            .on("database: whoami", "neo4j")
            .on("SHOW SERVERS", "serverCount\n1");
        let (creds, timings, assets) =
            (neo4j_credentials(), Timings::immediate(), WatchdogAssets::empty());
        let db = database(&backend, &creds, &timings, &assets);
        let dir = tempfile::tempdir().unwrap();

        db.restore(dir.path(), Edition::Enterprise, true).await.unwrap();

        let order = [
            "database: rm -rf /tmp/infrahubops",
            "copy_to database:/tmp/infrahubops",
            "database: chown -R neo4j:neo4j /tmp/infrahubops",
            "stop database neo4j",
            "neo4j-admin database restore --expand-commands --overwrite-destination=true --from-path=/tmp/infrahubops neo4j",
            "neo4j-admin database migrate --expand-commands --to-format=block neo4j",
            "restore_metadata.cypher | cypher-shell -u neo4j -padmin -d system --param \"database => 'neo4j'\"",
            "start database neo4j",
        ];
        let positions: Vec<usize> = order.iter().map(|f| backend.position(f).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", backend.calls());
        assert_eq!(backend.calls().last().unwrap(), "database: rm -rf /tmp/infrahubops");
        assert_eq!(backend.count("rm -rf /tmp/infrahubops"), 2);
        assert!(!backend.called("[user=neo4j]"));
    }

    #[tokio::test]
    async fn test_cluster_restore_uses_designated_seeder() {
        let backend = FakeBackend::new()
            .on("database: whoami", "root")
            .on("SHOW SERVERS", "serverCount\n3")
            .on("dbms.cluster.statusCheck", "requester, serverId\nfalse, \"x\"\ntrue, \"seed-1\"")
            .once("YIELD currentStatus", "currentStatus\n\"starting\"")
            .on("YIELD currentStatus", "currentStatus\n\"online\"");
        let (creds, timings, assets) =
            (neo4j_credentials(), Timings::immediate(), WatchdogAssets::empty());
        let db = database(&backend, &creds, &timings, &assets);
        let dir = tempfile::tempdir().unwrap();

        db.restore(dir.path(), Edition::Enterprise, false).await.unwrap();

        assert!(backend.called("DROP DATABASE neo4j IF EXISTS"));
        assert!(backend.called("--from-path=/tmp/infrahubops neo4j [user=neo4j]"));
        assert!(backend.called("existingDataSeedInstance: 'seed-1'"));
        assert!(!backend.called("restore_metadata.cypher"));
    }

    #[tokio::test]
    async fn test_cluster_restore_times_out_when_never_online() {
        let backend = FakeBackend::new()
            .on("SHOW SERVERS", "serverCount\n2")
            .on("dbms.cluster.statusCheck", "requester, serverId\ntrue, \"seed-1\"")
            .on("YIELD currentStatus", "currentStatus\n\"offline\"");
        let (creds, timings, assets) =
            (neo4j_credentials(), Timings::immediate(), WatchdogAssets::empty());
        let db = database(&backend, &creds, &timings, &assets);
        let dir = tempfile::tempdir().unwrap();

        let err = db.restore(dir.path(), Edition::Enterprise, false).await.unwrap_err();
        assert!(matches!(err, OpsError::Timeout { .. }));
        assert!(backend.called("database: rm -rf /tmp/infrahubops"));
    }

    #[tokio::test]
    async fn test_community_restore_loads_while_frozen() {
        let backend = FakeBackend::new()
            .on("database: cat /var/lib/neo4j/run/neo4j.pid", "9")
            .on("database: uname -m", "x86_64")
            .on("/proc/9/status", "T (stopped)")
            .on("database: whoami", "root");
        let (creds, timings) = (neo4j_credentials(), Timings::immediate());
        let assets = WatchdogAssets::new(b"helper".to_vec(), Vec::new());
        let db = database(&backend, &creds, &timings, &assets);
        let dir = tempfile::tempdir().unwrap();

        db.restore(dir.path(), Edition::Community, true).await.unwrap();

        let kill = backend.position("database: kill 9").unwrap();
        let load = backend
            .position(
                "neo4j-admin database load --overwrite-destination=true \
                 --from-path=/tmp/infrahubops neo4j [user=neo4j]",
            )
            .unwrap();
        let migrate = backend
            .position("neo4j-admin database migrate --to-format=block neo4j [user=neo4j]")
            .unwrap();
        let resume = backend.position("database: kill -CONT 9").unwrap();
        assert!(kill < load && load < migrate && migrate < resume);
        assert!(!backend.called("stop database"));
    }
}
