//! # Validator Module
//!
//! Controlli pre-flight eseguiti prima di schedulare qualsiasi job:
//! un fallimento qui interrompe l'intero run.

use std::path::{Component, Path};
use sysinfo::Disks;
use tracing::debug;

use crate::codec::TargetFormat;
use crate::error::ConvertError;

/// Reject a missing or unreadable input, or an unknown target format.
pub fn validate_inputs(input: &Path, target_format: &str) -> Result<(), ConvertError> {
    let metadata = std::fs::metadata(input)
        .map_err(|e| ConvertError::from_io(&e, &format!("cannot access {}", input.display())))?;

    let readable = if metadata.is_dir() {
        std::fs::read_dir(input).map(|_| ())
    } else {
        std::fs::File::open(input).map(|_| ())
    };
    readable.map_err(|e| ConvertError::from_io(&e, &format!("cannot read {}", input.display())))?;

    if TargetFormat::parse(target_format).is_none() {
        return Err(ConvertError::UnsupportedFormat(format!(
            "target format {} is not supported",
            target_format
        )));
    }
    Ok(())
}

/// Reject paths that climb out of their base with `..`.
pub fn validate_file_path(path: &Path) -> Result<(), ConvertError> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ConvertError::Validation(format!(
            "path traversal detected in {}",
            path.display()
        )));
    }
    Ok(())
}

/// Whether the disk holding `path` has `required` free bytes.
///
/// The disk is the one with the longest mount point prefixing `path`;
/// when none matches the check passes.
pub fn has_sufficient_space(path: &Path, required: u64) -> bool {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    let disk = disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    match disk {
        Some(disk) => {
            debug!(
                "Disk {} has {} bytes available, {} required",
                disk.mount_point().display(),
                disk.available_space(),
                required
            );
            disk.available_space() >= required
        }
        None => {
            debug!("No disk found for {}, assuming enough space", target.display());
            true
        }
    }
}

/// Upper bound for the output size: the total input size.
pub async fn estimate_required_space(files: &[impl AsRef<Path>]) -> u64 {
    let mut total = 0u64;
    for file in files {
        if let Ok(metadata) = tokio::fs::metadata(file.as_ref()).await {
            total += metadata.len();
        }
    }
    total
}
