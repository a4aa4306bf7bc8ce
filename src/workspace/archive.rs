//! Debug-mode snapshots of stage data.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::error::WorkspaceError;

/// Archive name for a stage: `stage-<n>-<component>.tar.gz`.
pub fn stage_archive_name(priority: usize, component_id: &str) -> String {
    let component: String = component_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') { c } else { '-' })
        .collect();
    format!("stage-{}-{}.tar.gz", priority, component)
}

/// Packs `source` into a gzipped tarball at `destination`.
///
/// Paths inside the archive are relative to `source`. Files are visited in
/// a stable order.
pub fn archive_directory(source: &Path, destination: &Path) -> Result<PathBuf, WorkspaceError> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(destination)?;
    let mut tar = TarBuilder::new(GzEncoder::new(file, Compression::default()));

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| WorkspaceError::ArchiveFailed(e.to_string()))?;
        let path = entry.path();
        let relative = match path.strip_prefix(source) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => continue,
        };
        if entry.file_type().is_dir() {
            tar.append_dir(relative, path)?;
        } else if entry.file_type().is_file() {
            tar.append_path_with_name(path, relative)?;
        }
    }

    tar.into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| WorkspaceError::ArchiveFailed(e.to_string()))?;

    Ok(destination.to_path_buf())
}
