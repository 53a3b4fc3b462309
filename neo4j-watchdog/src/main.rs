//! neo4j-watchdog
//!
//! Runs inside the Neo4j container. Reads the server PID, watches the PID
//! file and sends SIGSTOP to the server the moment the file is deleted or
//! moved, i.e. when the server starts shutting down. The orchestrator can then
//! dump the store from a process that still holds its locks, and resumes it
//! with SIGCONT afterwards.

use anyhow::{Context, Result};
use clap::Parser;
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// PID file written by the Neo4j server
    #[arg(long, default_value = "/var/lib/neo4j/run/neo4j.pid")]
    pid_file: PathBuf,

    /// Marker created once the watch is armed
    #[arg(long)]
    ready_file: Option<PathBuf>,
}

#[derive(Error, Debug, PartialEq, Eq)]
enum PidError {
    #[error("pid file is empty")]
    Empty,

    #[error("invalid pid {0:?}")]
    Invalid(String),
}

fn parse_pid(content: &str) -> Result<i32, PidError> {
    let pid = content.trim();
    if pid.is_empty() {
        return Err(PidError::Empty);
    }
    match pid.parse::<i32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(PidError::Invalid(pid.to_string())),
    }
}

fn read_pid(path: &Path) -> Result<Pid> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let pid = parse_pid(&content).with_context(|| format!("bad pid file {}", path.display()))?;
    Ok(Pid::from_raw(pid))
}

/// Blocks until `read` reports the watched file deleted or moved. Reads
/// interrupted by a signal are retried.
fn wait_for_removal<F>(mut read: F) -> Result<()>
where
    F: FnMut() -> nix::Result<Vec<AddWatchFlags>>,
{
    let removal = AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_MOVE_SELF;
    loop {
        match read() {
            Ok(masks) if masks.iter().any(|mask| mask.intersects(removal)) => return Ok(()),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("failed to read inotify events"),
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let pid = read_pid(&args.pid_file)?;

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC).context("failed to initialise inotify")?;
    inotify
        .add_watch(
            args.pid_file.as_path(),
            AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_MOVE_SELF,
        )
        .with_context(|| format!("failed to watch {}", args.pid_file.display()))?;
    info!(pid = pid.as_raw(), "Watching {}", args.pid_file.display());

    if let Some(ready) = &args.ready_file {
        std::fs::write(ready, b"ready\n")
            .with_context(|| format!("failed to write ready file {}", ready.display()))?;
    }

    wait_for_removal(|| {
        inotify
            .read_events()
            .map(|events| events.iter().map(|event| event.mask).collect())
    })?;

    kill(pid, Signal::SIGSTOP).with_context(|| format!("failed to stop process {}", pid))?;
    info!(pid = pid.as_raw(), "PID file removed; process stopped");
    Ok(())
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            std::process::ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("1234\n"), Ok(1234));
        assert_eq!(parse_pid("  \n"), Err(PidError::Empty));
        assert_eq!(parse_pid("abc"), Err(PidError::Invalid("abc".into())));
        assert_eq!(parse_pid("0"), Err(PidError::Invalid("0".into())));
    }

    #[test]
    fn test_wait_retries_interrupted_reads() {
        let mut replies = vec![
            Err(Errno::EINTR),
            Ok(vec![AddWatchFlags::IN_ATTRIB]),
            Err(Errno::EINTR),
            Ok(vec![AddWatchFlags::IN_DELETE_SELF]),
        ]
        .into_iter();
        wait_for_removal(|| replies.next().unwrap()).unwrap();
        assert!(replies.next().is_none());

        let mut moved = vec![Ok(vec![AddWatchFlags::IN_MOVE_SELF])].into_iter();
        wait_for_removal(|| moved.next().unwrap()).unwrap();

        let err = wait_for_removal(|| Err(Errno::EBADF)).unwrap_err();
        assert!(err.to_string().contains("failed to read inotify events"));
    }

    #[test]
    fn test_read_pid_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neo4j.pid");
        std::fs::write(&path, "4321").unwrap();
        assert_eq!(read_pid(&path).unwrap(), Pid::from_raw(4321));
        assert!(read_pid(&dir.path().join("missing.pid")).is_err());
    }
}
