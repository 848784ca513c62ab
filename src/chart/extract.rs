use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Archive;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("extract error: {0}")]
pub struct ExtractError(pub String);

/// Extracts a packaged chart (`.tgz`) located at `archive_path` into
/// `dest_path` and returns the chart root directory.
///
/// Unpacking will not write files outside of `dest_path`; entries with `..`
/// in their path are skipped. Chart tarballs carry a single top-level
/// directory named after the chart; if `chart_name` is not present the first
/// extracted directory is used.
pub fn extract_chart(
    archive_path: &Path,
    dest_path: &Path,
    chart_name: &str,
) -> Result<PathBuf, ExtractError> {
    debug!("Extracting chart archive to '{:?}'", dest_path);

    std::fs::create_dir_all(dest_path)
        .map_err(|e| ExtractError(format!("creating destination directory: {e}")))?;
    let tar_gz = File::open(archive_path)
        .map_err(|e| ExtractError(format!("opening chart archive: {e}")))?;
    let tar = GzDecoder::new(tar_gz);
    Archive::new(tar)
        .unpack(dest_path)
        .map_err(|e| ExtractError(format!("extracting chart archive: {e}")))?;

    let named_root = dest_path.join(chart_name);
    if named_root.is_dir() {
        return Ok(named_root);
    }
    first_directory(dest_path)?
        .ok_or_else(|| ExtractError("archive contains no chart directory".to_string()))
}

fn first_directory(path: &Path) -> Result<Option<PathBuf>, ExtractError> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(path)
        .map_err(|e| ExtractError(format!("listing extracted archive: {e}")))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs.into_iter().next())
}
