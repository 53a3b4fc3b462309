//! Freezing a community Neo4j process for an offline dump.
//!
//! Neo4j deletes its pid file at the very start of a graceful shutdown. A
//! watchdog helper, started next to the database, watches that file and sends
//! SIGSTOP to the process as soon as it disappears. The sequence is:
//!
//! 1. read the pid and arm the watchdog
//! 2. SIGTERM the database and wait for its state to become `T` (stopped)
//! 3. run the capture against the frozen store
//! 4. remove the helper and SIGCONT the process, whatever happened in 3
//!
//! The container's main process never exits, so the orchestrator does not
//! restart the database while it is dumped.

use super::watchdog::materialize;
use super::{GraphDatabase, PID_FILE, WATCHDOG_BINARY, WATCHDOG_LOG, WATCHDOG_READY, WORK_DIR};
use crate::config::Timings;
use crate::env::{service, ExecOptions};
use crate::runner::argv;
use crate::utils::{OpsError, Result, StepContext};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Continue,
}

/// Process primitives the freeze needs from wherever the database runs.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn read_pid(&self) -> Result<u32>;

    /// Arms a watcher that stops the database the moment its pid file is deleted.
    /// Returns once the watcher reports it is ready.
    async fn watch_for_deletion(&self) -> Result<()>;

    async fn send_signal(&self, pid: u32, signal: ProcessSignal) -> Result<()>;

    /// The `State:` field of the process status, e.g. `T (stopped)`.
    async fn process_state(&self, pid: u32) -> Result<String>;

    /// Removes the watcher and its artifacts. Never fails.
    async fn disarm(&self);
}

/// [`ProcessControl`] over shell commands in the database service.
pub struct RemoteProcessControl<'a> {
    db: &'a GraphDatabase<'a>,
}

impl<'a> RemoteProcessControl<'a> {
    pub fn new(db: &'a GraphDatabase<'a>) -> Self {
        Self { db }
    }

    async fn exec(&self, command: Vec<String>) -> Result<String> {
        self.db.exec(command, &ExecOptions::default()).await
    }

    async fn wait_ready(&self) -> Result<()> {
        let timings = self.db.timings;
        let deadline = Instant::now() + timings.watchdog_ready_timeout();
        loop {
            if self.exec(argv(&["test", "-f", WATCHDOG_READY])).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(OpsError::Timeout {
                    what: "neo4j watchdog readiness".to_string(),
                    seconds: timings.watchdog_ready_timeout().as_secs(),
                });
            }
            tokio::time::sleep(timings.watchdog_ready_poll()).await;
        }
    }
}

#[async_trait]
impl ProcessControl for RemoteProcessControl<'_> {
    async fn read_pid(&self) -> Result<u32> {
        self.db.read_pid().await
    }

    async fn watch_for_deletion(&self) -> Result<()> {
        self.exec(argv(&["mkdir", "-p", WORK_DIR]))
            .await
            .step("failed to prepare neo4j work directory")?;

        let arch = self.db.architecture().await?;
        let helper = materialize(self.db.assets.for_arch(&arch)?)?;
        self.db
            .backend
            .copy_to(service::DATABASE, helper.path(), WATCHDOG_BINARY)
            .await
            .step("failed to copy neo4j watchdog")?;
        self.exec(argv(&["chmod", "+x", WATCHDOG_BINARY]))
            .await
            .step("failed to make neo4j watchdog executable")?;

        if let Err(e) = self.db.remove("-f", &[WATCHDOG_READY, WATCHDOG_LOG]).await {
            debug!("Could not clear previous watchdog state: {}", e);
        }

        let launch = format!(
            "nohup {} --pid-file {} --ready-file {} >{} 2>&1 &",
            WATCHDOG_BINARY, PID_FILE, WATCHDOG_READY, WATCHDOG_LOG
        );
        self.exec(argv(&["sh", "-c", launch.as_str()]))
            .await
            .step("failed to start neo4j watchdog")?;

        self.wait_ready().await
    }

    async fn send_signal(&self, pid: u32, signal: ProcessSignal) -> Result<()> {
        let pid = pid.to_string();
        let command = match signal {
            ProcessSignal::Terminate => argv(&["kill", pid.as_str()]),
            ProcessSignal::Continue => argv(&["kill", "-CONT", pid.as_str()]),
        };
        self.exec(command).await.map(|_| ())
    }

    async fn process_state(&self, pid: u32) -> Result<String> {
        let script = format!("sed -n 's/^State:[[:space:]]*//p' /proc/{}/status", pid);
        let output = self.exec(argv(&["sh", "-c", script.as_str()])).await?;
        Ok(output.trim().to_string())
    }

    async fn disarm(&self) {
        if let Err(e) = self
            .db
            .remove("-f", &[WATCHDOG_BINARY, WATCHDOG_READY, WATCHDOG_LOG])
            .await
        {
            warn!("Failed to remove neo4j watchdog artifacts: {}", e);
        }
    }
}

pub struct FreezeProtocol<'a> {
    control: &'a dyn ProcessControl,
    timeout: Duration,
    poll: Duration,
}

impl<'a> FreezeProtocol<'a> {
    pub fn new(control: &'a dyn ProcessControl, timings: &Timings) -> Self {
        Self {
            control,
            timeout: timings.freeze_timeout(),
            poll: timings.freeze_poll(),
        }
    }

    /// Freezes the database, runs `capture` and resumes the process.
    ///
    /// The resume is attempted whenever the process may have been signalled.
    /// If it fails the result is [`OpsError::ResumeFailed`], carrying the
    /// capture error as well when there was one.
    pub async fn run<T, F, Fut>(&self, capture: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pid = self.control.read_pid().await?;
        if let Err(e) = self.control.watch_for_deletion().await {
            self.control.disarm().await;
            return Err(e.during("failed to arm neo4j watchdog"));
        }

        let outcome = match self.stop(pid).await {
            Ok(()) => capture().await,
            Err(e) => Err(e),
        };
        self.release(pid, outcome).await
    }

    async fn stop(&self, pid: u32) -> Result<()> {
        info!(pid, "Stopping neo4j process");
        self.control
            .send_signal(pid, ProcessSignal::Terminate)
            .await
            .step("failed to signal neo4j process")?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.control.process_state(pid).await {
                Ok(state) if state.starts_with('T') => {
                    info!(pid, "Neo4j process frozen");
                    return Ok(());
                }
                Ok(state) => debug!(pid, state = %state, "Waiting for neo4j to stop"),
                Err(e) => debug!(pid, "Could not read process state: {}", e),
            }
            if Instant::now() >= deadline {
                return Err(OpsError::Timeout {
                    what: format!("neo4j process {} to stop", pid),
                    seconds: self.timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    async fn release<T>(&self, pid: u32, outcome: Result<T>) -> Result<T> {
        self.control.disarm().await;
        info!(pid, "Resuming neo4j process");
        if let Err(e) = self.control.send_signal(pid, ProcessSignal::Continue).await {
            return Err(OpsError::ResumeFailed {
                pid,
                message: e.to_string(),
                capture: outcome.err().map(|e| e.to_string()),
            });
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neo4j::watchdog::WatchdogAssets;
    use crate::testing::{neo4j_credentials, FakeBackend};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeControl {
        events: Mutex<Vec<String>>,
        states: Mutex<Vec<&'static str>>,
        fail_arm: bool,
        fail_resume: bool,
    }

    impl FakeControl {
        fn with_states(states: &[&'static str]) -> Self {
            Self {
                states: Mutex::new(states.iter().rev().copied().collect()),
                ..Default::default()
            }
        }

        fn event(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessControl for FakeControl {
        async fn read_pid(&self) -> Result<u32> {
            Ok(42)
        }

        async fn watch_for_deletion(&self) -> Result<()> {
            self.event("arm");
            if self.fail_arm {
                return Err(OpsError::other("helper missing"));
            }
            Ok(())
        }

        async fn send_signal(&self, pid: u32, signal: ProcessSignal) -> Result<()> {
            self.event(format!("{:?} {}", signal, pid));
            if signal == ProcessSignal::Continue && self.fail_resume {
                return Err(OpsError::other("no such process"));
            }
            Ok(())
        }

        async fn process_state(&self, _pid: u32) -> Result<String> {
            let mut states = self.states.lock().unwrap();
            Ok(states.pop().unwrap_or("S (sleeping)").to_string())
        }

        async fn disarm(&self) {
            self.event("disarm");
        }
    }

    #[tokio::test]
    async fn test_capture_runs_while_frozen() {
        let control = FakeControl::with_states(&["S (sleeping)", "T (stopped)"]);
        let timings = Timings::immediate();
        let protocol = FreezeProtocol::new(&control, &timings);

        let value = protocol
            .run(|| async {
                control.event("capture");
                Ok(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(
            control.events(),
            vec!["arm", "Terminate 42", "capture", "disarm", "Continue 42"]
        );
    }

    #[tokio::test]
    async fn test_capture_failure_still_resumes() {
        let control = FakeControl::with_states(&["T (stopped)"]);
        let timings = Timings::immediate();
        let protocol = FreezeProtocol::new(&control, &timings);

        let err = protocol
            .run(|| async { Err::<(), _>(OpsError::other("dump failed")) })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "dump failed");
        assert_eq!(control.events().last().map(String::as_str), Some("Continue 42"));
    }

    #[tokio::test]
    async fn test_resume_failure_reports_both_errors() {
        let control = FakeControl {
            fail_resume: true,
            ..FakeControl::with_states(&["T (stopped)"])
        };
        let timings = Timings::immediate();
        let protocol = FreezeProtocol::new(&control, &timings);

        let err = protocol
            .run(|| async { Err::<(), _>(OpsError::other("dump failed")) })
            .await
            .unwrap_err();

        match &err {
            OpsError::ResumeFailed { pid, capture, .. } => {
                assert_eq!(*pid, 42);
                assert_eq!(capture.as_deref(), Some("dump failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("capture also failed: dump failed"));
    }

    #[tokio::test]
    async fn test_freeze_timeout_resumes_without_capture() {
        let control = FakeControl::with_states(&[]);
        let timings = Timings::immediate();
        let protocol = FreezeProtocol::new(&control, &timings);

        let err = protocol
            .run(|| async {
                control.event("capture");
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OpsError::Timeout { .. }));
        let events = control.events();
        assert!(!events.contains(&"capture".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("Continue 42"));
    }

    #[tokio::test]
    async fn test_arming_failure_never_signals() {
        let control = FakeControl {
            fail_arm: true,
            ..Default::default()
        };
        let timings = Timings::immediate();
        let protocol = FreezeProtocol::new(&control, &timings);

        assert!(protocol.run(|| async { Ok(()) }).await.is_err());
        assert_eq!(control.events(), vec!["arm", "disarm"]);
    }

    #[tokio::test]
    async fn test_remote_control_command_sequence() {
        let backend = FakeBackend::new()
            .on("database: cat /var/lib/neo4j/run/neo4j.pid", "1234\n")
            .on("database: uname -m", "x86_64")
            .on("/proc/1234/status", "T (stopped)");
        let creds = neo4j_credentials();
        let timings = Timings::immediate();
        let assets = WatchdogAssets::new(b"helper".to_vec(), Vec::new());
        let db = GraphDatabase::new(&backend, &creds, &timings, &assets);
        let control = RemoteProcessControl::new(&db);

        FreezeProtocol::new(&control, &timings)
            .run(|| async { Ok(()) })
            .await
            .unwrap();

        let order = [
            "copy_to database:/tmp/infrahubops/neo4j_watchdog",
            "database: chmod +x /tmp/infrahubops/neo4j_watchdog",
            "--ready-file /tmp/infrahubops/neo4j_watchdog.ready",
            "database: test -f /tmp/infrahubops/neo4j_watchdog.ready",
            "database: kill 1234",
            "database: rm -f /tmp/infrahubops/neo4j_watchdog /tmp/infrahubops",
            "database: kill -CONT 1234",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|fragment| {
                backend
                    .position(fragment)
                    .unwrap_or_else(|| panic!("missing {fragment}"))
            })
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", backend.calls());
    }

    #[tokio::test]
    async fn test_remote_control_unsupported_architecture() {
        let backend = FakeBackend::new()
            .on("database: cat /var/lib/neo4j/run/neo4j.pid", "1234")
            .on("database: uname -m", "s390x");
        let creds = neo4j_credentials();
        let timings = Timings::immediate();
        let assets = WatchdogAssets::new(b"helper".to_vec(), b"helper".to_vec());
        let db = GraphDatabase::new(&backend, &creds, &timings, &assets);
        let control = RemoteProcessControl::new(&db);

        let err = FreezeProtocol::new(&control, &timings)
            .run(|| async { Ok(()) })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("unsupported architecture: s390x"));
        assert!(!backend.called("kill"));
    }
}
