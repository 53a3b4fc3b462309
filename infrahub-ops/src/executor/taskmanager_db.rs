use crate::archive::metadata::PREFECT_DUMP;
use crate::credentials::DatabaseCredentials;
use crate::env::{service, EnvironmentBackend, ExecOptions};
use crate::runner::argv;
use crate::utils::{Result, StepContext};
use std::path::Path;
use tracing::{debug, info, warn};

const WRITE_MARKER: &str = ".infrahubops_write_test";
const DUMP_NAME: &str = "infrahubops_prefect.dump";

/// First of `/tmp` and `/run` that accepts a file inside `target`, falling back to `/tmp`.
pub async fn writable_temp_dir(backend: &dyn EnvironmentBackend, target: &str) -> String {
    for dir in ["/tmp", "/run"] {
        let marker = format!("{}/{}", dir, WRITE_MARKER);
        if backend
            .exec(target, &argv(&["touch", marker.as_str()]), &ExecOptions::default())
            .await
            .is_ok()
        {
            if let Err(e) = backend
                .exec(target, &argv(&["rm", "-f", marker.as_str()]), &ExecOptions::default())
                .await
            {
                debug!("Failed to remove write marker {}: {}", marker, e);
            }
            return dir.to_string();
        }
    }
    warn!("No writable temp directory found in {}; using /tmp", target);
    "/tmp".to_string()
}

async fn remove_dump(backend: &dyn EnvironmentBackend, dump: &str) {
    if let Err(e) = backend
        .exec(service::TASK_MANAGER_DB, &argv(&["rm", dump]), &ExecOptions::default())
        .await
    {
        warn!("Failed to remove temporary postgres dump: {}", e);
    }
}

/// Dumps the task manager database to `<backup_dir>/prefect.dump`.
pub async fn backup(
    backend: &dyn EnvironmentBackend,
    creds: &DatabaseCredentials,
    backup_dir: &Path,
) -> Result<()> {
    info!("Backing up PostgreSQL database");
    let dump = format!(
        "{}/{}",
        writable_temp_dir(backend, service::TASK_MANAGER_DB).await,
        DUMP_NAME
    );

    let command = argv(&[
        "pg_dump",
        "-Fc",
        "-h",
        "localhost",
        "-U",
        creds.username.as_str(),
        "-d",
        creds.database.as_str(),
        "-f",
        dump.as_str(),
    ]);
    let opts = ExecOptions::default().with_env("PGPASSWORD", creds.password.as_str());
    let copied = match backend.exec(service::TASK_MANAGER_DB, &command, &opts).await {
        Ok(_) => backend
            .copy_from(service::TASK_MANAGER_DB, &dump, &backup_dir.join(PREFECT_DUMP))
            .await
            .step("failed to copy postgresql dump"),
        Err(e) => Err(e.during("failed to create postgresql dump")),
    };
    remove_dump(backend, &dump).await;
    copied?;

    info!("PostgreSQL backup completed");
    Ok(())
}

/// Loads `<backup_dir>/prefect.dump` into the task manager database.
pub async fn restore(
    backend: &dyn EnvironmentBackend,
    creds: &DatabaseCredentials,
    backup_dir: &Path,
) -> Result<()> {
    info!("Restoring PostgreSQL database");
    if let Err(e) = backend.start(&[service::TASK_MANAGER_DB]).await {
        match backend.is_running(service::TASK_MANAGER_DB).await {
            Ok(true) => info!(
                "Could not start {} but it is running (may be externally managed): {}",
                service::TASK_MANAGER_DB,
                e
            ),
            _ => return Err(e.during(format!("failed to start {}", service::TASK_MANAGER_DB))),
        }
    }

    let dump = format!(
        "{}/{}",
        writable_temp_dir(backend, service::TASK_MANAGER_DB).await,
        DUMP_NAME
    );
    backend
        .copy_to(service::TASK_MANAGER_DB, &backup_dir.join(PREFECT_DUMP), &dump)
        .await
        .step("failed to copy dump to container")?;

    let result = run_restore(backend, creds, &dump).await;
    remove_dump(backend, &dump).await;
    result
}

async fn run_restore(
    backend: &dyn EnvironmentBackend,
    creds: &DatabaseCredentials,
    dump: &str,
) -> Result<()> {
    let local_socket = match backend
        .exec(service::TASK_MANAGER_DB, &argv(&["whoami"]), &ExecOptions::default())
        .await
    {
        Ok(user) => !user.contains("cannot find name"),
        Err(_) => false,
    };

    let (command, opts) = if local_socket {
        (
            argv(&["pg_restore", "-d", "postgres", "--clean", "--create", dump]),
            ExecOptions::default(),
        )
    } else {
        (
            argv(&[
                "pg_restore",
                "-h",
                "localhost",
                "-d",
                "postgres",
                "-U",
                creds.username.as_str(),
                "--clean",
                "--create",
                dump,
            ]),
            ExecOptions::default().with_env("PGPASSWORD", creds.password.as_str()),
        )
    };

    backend
        .exec(service::TASK_MANAGER_DB, &command, &opts)
        .await
        .step("failed to restore postgresql")?;
    info!("PostgreSQL restore completed");
    Ok(())
}
