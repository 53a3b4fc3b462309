//! Archive layout and packing.
//!
//! An archive is a gzip-compressed tarball whose single top-level directory
//! `backup/` holds the metadata file, the `database/` capture and, when
//! included, `prefect.dump`.

pub mod checksums;
pub mod metadata;

use crate::utils::{OpsError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::Path;
use tracing::{debug, warn};

/// Name of the top-level directory inside every archive.
pub const BACKUP_ROOT: &str = "backup";

/// Packs `source` as `backup/` into a new gzip tarball at `dest`.
/// A partially written archive is removed on failure.
pub fn create(source: &Path, dest: &Path) -> Result<()> {
    debug!(source = %source.display(), dest = %dest.display(), "Creating archive");
    let result = write_tarball(source, dest);
    if result.is_err() && dest.exists() {
        if let Err(e) = std::fs::remove_file(dest) {
            warn!("Failed to remove partial archive {}: {}", dest.display(), e);
        }
    }
    result
}

fn write_tarball(source: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder
        .append_dir_all(BACKUP_ROOT, source)
        .map_err(|e| OpsError::Archive(format!("failed to add {}: {}", source.display(), e)))?;
    let encoder = builder
        .into_inner()
        .map_err(|e| OpsError::Archive(format!("failed to finish tarball: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| OpsError::Archive(format!("failed to finish compression: {}", e)))?;
    Ok(())
}

/// Unpacks `archive` into `dest`, returning the path of the `backup/` root.
pub fn extract(archive: &Path, dest: &Path) -> Result<std::path::PathBuf> {
    let file = File::open(archive)?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .map_err(|e| OpsError::Archive(format!("failed to extract {}: {}", archive.display(), e)))?;
    Ok(dest.join(BACKUP_ROOT))
}
