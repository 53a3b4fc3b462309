//! Application service lifecycle around backups and restores.

use crate::env::{service, EnvironmentBackend, ExecOptions};
use crate::runner::argv;
use crate::utils::{Result, StepContext};
use tracing::{debug, error, info, warn};

/// Services stopped before a quiesced capture, in stop order.
pub const APP_SERVICES: [&str; 6] = [
    service::INFRAHUB_SERVER,
    service::TASK_WORKER,
    service::TASK_MANAGER,
    service::TASK_MANAGER_BACKGROUND,
    service::CACHE,
    service::MESSAGE_QUEUE,
];

/// Start order; dependencies come first.
const START_ORDER: [&str; 6] = [
    service::CACHE,
    service::MESSAGE_QUEUE,
    service::TASK_MANAGER,
    service::TASK_MANAGER_BACKGROUND,
    service::INFRAHUB_SERVER,
    service::TASK_WORKER,
];

/// Stops every application service that is running and returns the ones it
/// stopped. If a stop fails, the services already stopped are started again
/// before the error is returned.
pub async fn stop_app_services(backend: &dyn EnvironmentBackend) -> Result<Vec<String>> {
    info!("Stopping Infrahub application services");
    let mut stopped: Vec<String> = Vec::new();

    for name in APP_SERVICES {
        match backend.is_running(name).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                debug!(service = name, "Could not determine status: {}", e);
                continue;
            }
        }

        info!("Stopping {}", name);
        if let Err(e) = backend.stop(&[name]).await {
            if !stopped.is_empty() {
                if let Err(restart) = start_app_services(backend, &stopped).await {
                    warn!("Failed to restart services after stop error: {}", restart);
                }
            }
            return Err(e.during(format!("failed to stop {}", name)));
        }
        stopped.push(name.to_string());
    }

    if stopped.is_empty() {
        info!("No application services were running");
    }
    Ok(stopped)
}

/// Orders `services` for start-up: known services by dependency, then the rest.
pub fn start_order(services: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = START_ORDER
        .iter()
        .filter(|name| services.iter().any(|s| s == *name))
        .map(|name| name.to_string())
        .collect();
    for name in services {
        if !ordered.contains(name) {
            ordered.push(name.clone());
        }
    }
    ordered
}

pub async fn start_app_services(
    backend: &dyn EnvironmentBackend,
    services: &[String],
) -> Result<()> {
    if services.is_empty() {
        return Ok(());
    }
    info!("Starting Infrahub application services");
    for name in start_order(services) {
        info!("Starting {}", name);
        backend
            .start(&[name.as_str()])
            .await
            .step(&format!("failed to start {}", name))?;
    }
    Ok(())
}

/// Empties the cache and message queue stores. Failures are only logged.
pub async fn wipe_transient_data(backend: &dyn EnvironmentBackend) {
    info!("Wiping cache and message queue data");
    let targets = [
        (service::MESSAGE_QUEUE, "/var/lib/rabbitmq"),
        (service::CACHE, "/data"),
    ];
    for (name, path) in targets {
        let command = argv(&["find", path, "-mindepth", "1", "-delete"]);
        if let Err(e) = backend.exec(name, &command, &ExecOptions::default()).await {
            warn!(service = name, "Failed to wipe transient data: {}", e);
        }
    }
}

/// Bounces the cache, the message queue and the task manager.
pub async fn restart_dependencies(backend: &dyn EnvironmentBackend) -> Result<()> {
    info!("Restarting cache and message-queue");
    let queue = [service::CACHE, service::MESSAGE_QUEUE];
    if let Err(e) = backend.stop(&queue).await {
        debug!("Failed to stop cache/message-queue: {}", e);
    }
    backend
        .start(&queue)
        .await
        .step("failed to restart cache and message-queue")?;

    info!("Restarting task manager");
    if let Err(e) = backend.stop(&[service::TASK_MANAGER]).await {
        debug!("Failed to stop task-manager: {}", e);
    }
    if let Err(e) = backend.stop(&[service::TASK_MANAGER_BACKGROUND]).await {
        debug!("Failed to stop optional {}: {}", service::TASK_MANAGER_BACKGROUND, e);
    }
    backend
        .start(&[service::TASK_MANAGER])
        .await
        .step("failed to restart task-manager")?;
    if let Err(e) = backend.start(&[service::TASK_MANAGER_BACKGROUND]).await {
        info!("Skipping optional {} restart: {}", service::TASK_MANAGER_BACKGROUND, e);
    }
    Ok(())
}

/// Starts `stopped` again after a capture. A restart failure only becomes the
/// result when the capture itself succeeded.
pub async fn restore_after<T>(
    backend: &dyn EnvironmentBackend,
    stopped: &[String],
    outcome: Result<T>,
) -> Result<T> {
    if stopped.is_empty() {
        return outcome;
    }
    match start_app_services(backend, stopped).await {
        Ok(()) => outcome,
        Err(e) => {
            error!("Failed to restart services after backup: {}", e);
            match outcome {
                Ok(_) => Err(e.during("failed to restart services after backup")),
                Err(capture) => Err(capture),
            }
        }
    }
}
