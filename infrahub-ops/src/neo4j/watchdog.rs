//! Watchdog helper binaries shipped inside this executable.
//!
//! `build.rs` copies the cross-compiled helpers into `OUT_DIR`. A build
//! without them still succeeds, but the community freeze refuses to run.

use crate::utils::{OpsError, Result};
use std::borrow::Cow;
use std::io::Write;
use tempfile::NamedTempFile;

static EMBEDDED_AMD64: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/neo4j_watchdog_linux_amd64"));
static EMBEDDED_ARM64: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/neo4j_watchdog_linux_arm64"));

#[derive(Debug, Clone)]
pub struct WatchdogAssets {
    amd64: Cow<'static, [u8]>,
    arm64: Cow<'static, [u8]>,
}

impl Default for WatchdogAssets {
    fn default() -> Self {
        Self::embedded()
    }
}

impl WatchdogAssets {
    pub fn embedded() -> Self {
        Self {
            amd64: Cow::Borrowed(EMBEDDED_AMD64),
            arm64: Cow::Borrowed(EMBEDDED_ARM64),
        }
    }

    pub fn new(amd64: Vec<u8>, arm64: Vec<u8>) -> Self {
        Self {
            amd64: Cow::Owned(amd64),
            arm64: Cow::Owned(arm64),
        }
    }

    /// No helpers at all.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Helper binary for the architecture reported by `uname -m`.
    pub fn for_arch(&self, arch: &str) -> Result<&[u8]> {
        let (label, bytes) = match arch.trim() {
            "x86_64" | "amd64" => ("amd64", &self.amd64),
            "aarch64" | "arm64" => ("arm64", &self.arm64),
            other => return Err(OpsError::UnsupportedArchitecture(other.to_string())),
        };
        if bytes.is_empty() {
            return Err(OpsError::other(format!(
                "neo4j watchdog helper not embedded for {}",
                label
            )));
        }
        Ok(bytes)
    }
}

/// Writes `bytes` to an executable local temp file.
pub fn materialize(bytes: &[u8]) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("neo4j-watchdog-")
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(file)
}
