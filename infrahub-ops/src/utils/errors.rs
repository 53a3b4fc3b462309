//! Error types for backup and restore orchestration.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend's command-line tool is not installed or not runnable.
    #[error("{tool} CLI not available: {reason}")]
    CliUnavailable { tool: String, reason: String },

    /// No deployment was found by this backend.
    #[error("environment not found")]
    EnvironmentNotFound,

    #[error("multiple {kind} found: {candidates} (specify {flag})")]
    AmbiguousTarget {
        kind: String,
        candidates: String,
        flag: String,
    },

    #[error("{backend} detection failed: {message}")]
    Detection { backend: String, message: String },

    #[error("no Infrahub environment detected (tried {tried})")]
    NoEnvironment { tried: String },

    #[error("command `{command}` failed ({status}): {output}")]
    Command {
        command: String,
        status: String,
        output: String,
    },

    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<OpsError>,
    },

    #[error("invalid backup file: missing metadata")]
    MissingMetadata,

    #[error("backup metadata version {found} is newer than supported version {supported}")]
    UnsupportedMetadata { found: u64, supported: u64 },

    #[error("missing backup file: {0}")]
    MissingFile(String),

    #[error("unexpected file in backup without checksum: {0}")]
    UnexpectedFile(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("cannot restore {backup} backup on {runtime} edition Neo4j")]
    EditionMismatch { backup: String, runtime: String },

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    /// The frozen database process could not be resumed.
    #[error("failed to resume neo4j process {pid}: {message}{}", capture_suffix(.capture))]
    ResumeFailed {
        pid: u32,
        message: String,
        capture: Option<String>,
    },

    #[error("operation aborted by operator")]
    Aborted,

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("{0}")]
    Other(String),
}

fn capture_suffix(capture: &Option<String>) -> String {
    match capture {
        Some(message) => format!(" (capture also failed: {})", message),
        None => String::new(),
    }
}

impl OpsError {
    /// Soft detection failures let the resolver move on to the next backend.
    pub fn is_soft_detection(&self) -> bool {
        matches!(
            self,
            OpsError::CliUnavailable { .. } | OpsError::EnvironmentNotFound
        )
    }

    /// Wraps the error with the name of the step that failed.
    pub fn during(self, step: impl Into<String>) -> Self {
        OpsError::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Combined command output when this error came from a remote command.
    pub fn command_output(&self) -> Option<&str> {
        match self {
            OpsError::Command { output, .. } => Some(output),
            OpsError::Step { source, .. } => source.command_output(),
            _ => None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        OpsError::Other(message.into())
    }
}

/// Attaches a step name to the error side of a result.
pub trait StepContext<T> {
    fn step(self, step: &str) -> Result<T>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: &str) -> Result<T> {
        self.map_err(|e| e.during(step))
    }
}

pub type Result<T> = std::result::Result<T, OpsError>;
