//! SHA-256 checksums over the captured files.
//!
//! Keys are paths relative to the backup root, always `/`-separated. The set
//! of keys must match the files on disk exactly.

use super::metadata::PREFECT_DUMP;
use crate::utils::{OpsError, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Directory holding the graph database capture.
pub const DATABASE_DIR: &str = "database";

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Relative keys of every regular file under `<root>/database`.
fn database_files(root: &Path) -> Result<BTreeSet<String>> {
    let dir = root.join(DATABASE_DIR);
    let mut files = BTreeSet::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(&dir).follow_links(false) {
        let entry = entry.map_err(|e| OpsError::Io(e.into()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| OpsError::other(e.to_string()))?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.insert(key);
    }
    Ok(files)
}

/// Checksums for the database capture, plus the task manager dump when
/// `include_prefect` is set and the dump exists.
pub fn compute(root: &Path, include_prefect: bool) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::new();
    for key in database_files(root)? {
        let sum = file_sha256(&root.join(&key))?;
        checksums.insert(key, sum);
    }

    let prefect = root.join(PREFECT_DUMP);
    if include_prefect && prefect.is_file() {
        checksums.insert(PREFECT_DUMP.to_string(), file_sha256(&prefect)?);
    }
    Ok(checksums)
}

/// Checks the extracted capture against `expected`.
///
/// Every listed database file must exist and match, and every file under the
/// database directory must be listed. The task manager dump is only checked
/// when `check_prefect` is set.
pub fn verify(root: &Path, expected: &BTreeMap<String, String>, check_prefect: bool) -> Result<()> {
    for (key, want) in expected {
        if key == PREFECT_DUMP {
            continue;
        }
        verify_file(root, key, want)?;
    }

    if let Some(unlisted) = database_files(root)?
        .into_iter()
        .find(|key| !expected.contains_key(key))
    {
        return Err(OpsError::UnexpectedFile(unlisted));
    }

    if check_prefect {
        match expected.get(PREFECT_DUMP) {
            Some(want) => verify_file(root, PREFECT_DUMP, want)?,
            None if root.join(PREFECT_DUMP).is_file() => {
                return Err(OpsError::UnexpectedFile(PREFECT_DUMP.to_string()))
            }
            None => return Err(OpsError::MissingFile(PREFECT_DUMP.to_string())),
        }
    }
    Ok(())
}

fn verify_file(root: &Path, key: &str, want: &str) -> Result<()> {
    let path = root.join(key);
    if !path.is_file() {
        return Err(OpsError::MissingFile(key.to_string()));
    }
    let actual = file_sha256(&path)?;
    if !actual.eq_ignore_ascii_case(want) {
        return Err(OpsError::ChecksumMismatch {
            path: key.to_string(),
            expected: want.to_string(),
            actual,
        });
    }
    Ok(())
}
