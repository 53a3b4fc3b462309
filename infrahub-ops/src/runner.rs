//! Local process execution.
//!
//! Every interaction with Docker or Kubernetes goes through a [`CommandRunner`]
//! so backends can be driven by a scripted runner in tests.

use crate::utils::{OpsError, Result};
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion and returns trimmed stdout followed by stderr.
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;

    /// Runs to completion, discarding output.
    async fn run_quiet(&self, program: &str, args: &[String]) -> Result<()> {
        self.run(program, args).await.map(|_| ())
    }

    /// Like [`CommandRunner::run`] but logs every line as it arrives.
    /// Only stdout is returned to the caller.
    async fn run_streaming(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Builds an owned argument vector from string slices.
pub fn argv<S: AsRef<str>>(parts: &[S]) -> Vec<String> {
    parts.iter().map(|part| part.as_ref().to_string()).collect()
}

pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

const MASK: &str = "****";
const PASSWORD_ASSIGN: &str = "PASSWORD=";

/// The command line as it may appear in logs and errors. Passwords given as
/// cypher-shell `-p<secret>` or as `*PASSWORD=<secret>` are masked, including
/// inside `sh -c` strings.
pub fn redacted_command_line(program: &str, args: &[String]) -> String {
    let mask_flag =
        program == "cypher-shell" || args.iter().any(|arg| arg.contains("cypher-shell"));
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&redact_arg(arg, mask_flag));
    }
    line
}

fn redact_arg(arg: &str, mask_flag: bool) -> String {
    if mask_flag && arg.starts_with("-p") && arg.len() > 2 {
        return format!("-p{}", MASK);
    }
    if let Some(pos) = arg.find(PASSWORD_ASSIGN) {
        if !arg[..pos].contains(' ') {
            return format!("{}{}", &arg[..pos + PASSWORD_ASSIGN.len()], MASK);
        }
    }
    if arg.contains(' ') {
        return arg
            .split(' ')
            .map(|token| redact_token(token, mask_flag))
            .collect::<Vec<_>>()
            .join(" ");
    }
    arg.to_string()
}

/// Masks one whitespace-separated word of a shell string, keeping its quotes.
fn redact_token(token: &str, mask_flag: bool) -> String {
    let body = token.trim_start_matches(['\'', '"']);
    let lead = &token[..token.len() - body.len()];
    let tail = if body.ends_with(['\'', '"']) { &body[body.len() - 1..] } else { "" };

    if let Some(pos) = body.find(PASSWORD_ASSIGN) {
        let keep = &body[..pos + PASSWORD_ASSIGN.len()];
        return format!("{}{}{}{}", lead, keep, MASK, tail);
    }
    if mask_flag && body.starts_with("-p") && body.len() > 2 + tail.len() {
        return format!("{}-p{}{}", lead, MASK, tail);
    }
    token.to_string()
}

fn spawn_error(program: &str, args: &[String], err: std::io::Error) -> OpsError {
    OpsError::Command {
        command: redacted_command_line(program, args),
        status: "failed to start".to_string(),
        output: err.to_string(),
    }
}

fn exit_error(program: &str, args: &[String], status: ExitStatus, output: String) -> OpsError {
    OpsError::Command {
        command: redacted_command_line(program, args),
        status: status.to_string(),
        output,
    }
}

/// Runs commands on the local host with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!(command = %redacted_command_line(program, args), "Running command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(program, args, e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        if !output.status.success() {
            return Err(exit_error(program, args, output.status, combined));
        }
        Ok(combined)
    }

    async fn run_streaming(&self, program: &str, args: &[String]) -> Result<String> {
        debug!(command = %redacted_command_line(program, args), "Running streamed command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(program, args, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OpsError::other("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| OpsError::other("child stderr was not captured"))?;

        // Both pipes are drained concurrently so neither can fill up and block the child.
        let stdout_task = tokio::spawn(drain_lines(stdout, false));
        let stderr_task = tokio::spawn(drain_lines(stderr, true));

        let status = child.wait().await?;
        let stdout_text = stdout_task
            .await
            .map_err(|e| OpsError::other(format!("stdout reader failed: {}", e)))?;
        let stderr_text = stderr_task
            .await
            .map_err(|e| OpsError::other(format!("stderr reader failed: {}", e)))?;

        if !status.success() {
            let mut output = stdout_text;
            output.push_str(&stderr_text);
            return Err(exit_error(program, args, status, output.trim().to_string()));
        }
        Ok(stdout_text)
    }
}

/// Logs and collects every line of `reader` until EOF. Bytes that are not
/// valid UTF-8 are replaced rather than ending the read.
async fn drain_lines<R>(reader: R, is_stderr: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                if is_stderr {
                    info!(target: "remote", stream = "stderr", "{}", line);
                } else {
                    info!(target: "remote", "{}", line);
                }
                collected.push_str(line);
                collected.push('\n');
            }
            Err(e) => {
                warn!("Error reading command output: {}", e);
                break;
            }
        }
    }
    collected
}
