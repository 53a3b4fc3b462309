//! infrahub-ops - Main entry point
//!
//! Backup and restore for Infrahub deployments.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use infrahub_ops::executor::maintenance::FlushKind;
use infrahub_ops::executor::{BackupOptions, FromFilesOptions, RestoreOptions};
use infrahub_ops::neo4j::{Edition, MetadataMode};
use infrahub_ops::utils::logger::LogFormat;
use infrahub_ops::{utils, Config, InfrahubOps};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "infrahub-ops", author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Docker Compose project name
    #[arg(long, env = "INFRAHUB_PROJECT", global = true)]
    project: Option<String>,

    /// Directory where backups are written
    #[arg(long, env = "BACKUP_DIR", global = true)]
    backup_dir: Option<PathBuf>,

    /// Kubernetes namespace
    #[arg(long, env = "INFRAHUB_K8S_NAMESPACE", global = true)]
    k8s_namespace: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, env = "INFRAHUB_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a backup of the Infrahub deployment
    Create(CreateArgs),

    /// Restore the Infrahub deployment from a backup archive
    Restore(RestoreArgs),

    /// Inspect Infrahub environments
    Environment {
        #[command(subcommand)]
        command: EnvironmentCommands,
    },

    /// Task manager maintenance
    Taskmanager {
        #[command(subcommand)]
        command: TaskmanagerCommands,
    },

    /// Print the tool version
    Version,
}

#[derive(Args, Debug)]
#[command(args_conflicts_with_subcommands = true)]
struct CreateArgs {
    /// Do not wait for running tasks to finish
    #[arg(long)]
    force: bool,

    /// Security metadata included in enterprise backups
    #[arg(long = "neo4jmetadata", value_enum, default_value_t = MetadataMode::All)]
    neo4j_metadata: MetadataMode,

    /// Leave the task manager database out of the backup
    #[arg(long = "exclude-taskmanager")]
    exclude_task_manager: bool,

    /// Wait after the backup is written (e.g. 5m, 1h)
    #[arg(long, value_parser = humantime::parse_duration)]
    sleep: Option<Duration>,

    #[command(subcommand)]
    command: Option<CreateCommands>,
}

#[derive(Subcommand, Debug)]
enum CreateCommands {
    /// Package existing dump files into a backup archive
    #[command(hide = true)]
    FromFiles {
        /// Neo4j backup directory or dump file
        #[arg(long)]
        neo4j_path: PathBuf,

        /// PostgreSQL dump of the task manager database
        #[arg(long)]
        postgres_path: Option<PathBuf>,

        /// Edition the Neo4j files were taken from
        #[arg(long)]
        neo4j_edition: Option<String>,

        /// Infrahub version recorded in the metadata
        #[arg(long)]
        infrahub_version: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Backup archive to restore
    archive: PathBuf,

    /// Do not restore the task manager database
    #[arg(long = "exclude-taskmanager")]
    exclude_task_manager: bool,

    /// Migrate the restored Neo4j store to the block format
    #[arg(long)]
    migrate_format: bool,

    /// Wait before the restore starts (e.g. 5m, 1h)
    #[arg(long, value_parser = humantime::parse_duration)]
    sleep: Option<Duration>,
}

#[derive(Subcommand, Debug)]
enum EnvironmentCommands {
    /// Detect the active deployment and its credentials
    Detect,

    /// List all deployments visible from this host
    List,
}

#[derive(Subcommand, Debug)]
enum TaskmanagerCommands {
    /// Remove old flow runs
    Flush {
        #[command(subcommand)]
        command: FlushCommands,
    },
}

#[derive(Subcommand, Debug)]
enum FlushCommands {
    /// Delete completed, failed and cancelled flow runs (default: older than 30 days)
    FlowRuns {
        days_to_keep: Option<u32>,
        batch_size: Option<u32>,
    },

    /// Mark flow runs stuck in RUNNING as crashed (default: older than 2 days)
    StaleRuns {
        days_to_keep: Option<u32>,
        batch_size: Option<u32>,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(project) = &cli.project {
        config.project = Some(project.clone());
    }
    if let Some(namespace) = &cli.k8s_namespace {
        config.k8s_namespace = Some(namespace.clone());
    }
    if let Some(dir) = &cli.backup_dir {
        config.backup_dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    Ok(config)
}

async fn run(command: Commands, ops: InfrahubOps) -> Result<()> {
    match command {
        Commands::Create(args) => match args.command {
            Some(CreateCommands::FromFiles {
                neo4j_path,
                postgres_path,
                neo4j_edition,
                infrahub_version,
            }) => {
                let neo4j_edition = neo4j_edition.map(|e| e.parse::<Edition>()).transpose()?;
                ops.create_backup_from_files(&FromFilesOptions {
                    neo4j_path,
                    postgres_path,
                    neo4j_edition,
                    infrahub_version,
                })
                .await?;
            }
            None => {
                ops.create_backup(&BackupOptions {
                    force: args.force,
                    metadata: args.neo4j_metadata,
                    exclude_task_manager: args.exclude_task_manager,
                    sleep: args.sleep,
                })
                .await?;
            }
        },
        Commands::Restore(args) => {
            ops.restore_backup(
                &args.archive,
                &RestoreOptions {
                    exclude_task_manager: args.exclude_task_manager,
                    migrate_format: args.migrate_format,
                    sleep: args.sleep,
                },
            )
            .await?;
        }
        Commands::Environment { command } => match command {
            EnvironmentCommands::Detect => {
                let report = ops.detect_environment().await?;
                println!("Backend:           {}", report.backend);
                println!("Target:            {}", report.target);
                println!("Neo4j database:    {}", report.neo4j_database);
                println!("Neo4j user:        {}", report.neo4j_username);
                println!("Postgres database: {}", report.postgres_database);
                println!("Postgres user:     {}", report.postgres_username);
            }
            EnvironmentCommands::List => {
                let listing = ops.list_environments().await;
                println!("Docker Compose projects:");
                for project in &listing.compose_projects {
                    println!("  {}", project);
                }
                println!("Kubernetes namespaces:");
                for namespace in &listing.k8s_namespaces {
                    println!("  {}", namespace);
                }
            }
        },
        Commands::Taskmanager {
            command: TaskmanagerCommands::Flush { command },
        } => match command {
            FlushCommands::FlowRuns {
                days_to_keep,
                batch_size,
            } => {
                ops.flush_task_runs(FlushKind::FlowRuns, days_to_keep, batch_size)
                    .await?
            }
            FlushCommands::StaleRuns {
                days_to_keep,
                batch_size,
            } => {
                ops.flush_task_runs(FlushKind::StaleRuns, days_to_keep, batch_size)
                    .await?
            }
        },
        Commands::Version => println!("infrahub-ops {}", env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Values from .env must be visible before clap reads its env bindings
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = utils::logger::init(&config.log.level, config.log.format) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    tracing::debug!("Starting infrahub-ops v{}", env!("CARGO_PKG_VERSION"));

    let ops = InfrahubOps::new(config);
    match run(cli.command, ops).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
