use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use zip::read::ZipArchive;

use crate::error::{SyncError, SyncResult};

pub const DEFAULT_METADATA_MARKER: &str = "META-INF";

/// Unpacks zip-compatible bundles, dropping packaging metadata.
#[derive(Clone, Debug)]
pub struct ArchiveExtractor {
    metadata_marker: String,
}

impl Default for ArchiveExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_MARKER)
    }
}

impl ArchiveExtractor {
    pub fn new(metadata_marker: impl Into<String>) -> Self {
        Self {
            metadata_marker: metadata_marker.into(),
        }
    }

    /// Extract `archive_path` into `dest`, then delete the archive.
    /// Returns the number of files written.
    pub fn extract(&self, archive_path: &Path, dest: &Path) -> SyncResult<usize> {
        info!(
            "extract: {} -> {}",
            archive_path.display(),
            dest.display()
        );
        let failure = |message: String| SyncError::ExtractionFailure {
            path: archive_path.to_path_buf(),
            message,
        };

        let file = fs::File::open(archive_path).map_err(|e| failure(format!("open error: {e}")))?;
        let mut archive = ZipArchive::new(file).map_err(|e| failure(format!("zip parse error: {e}")))?;
        fs::create_dir_all(dest).map_err(|e| SyncError::io(dest, e))?;

        let mut written = 0;
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| failure(format!("zip entry error: {e}")))?;
            if entry.name().contains(self.metadata_marker.as_str()) {
                continue;
            }
            let Some(relative) = entry.enclosed_name() else {
                warn!("extract: skipping unsafe entry {}", entry.name());
                continue;
            };
            let out_path = dest.join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&out_path).map_err(|e| SyncError::io(&out_path, e))?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
            }
            let mut out_file =
                fs::File::create(&out_path).map_err(|e| SyncError::io(&out_path, e))?;
            io::copy(&mut entry, &mut out_file)
                .map_err(|e| failure(format!("write error for {}: {e}", out_path.display())))?;
            debug!("extract: wrote {}", out_path.display());
            written += 1;
        }
        drop(archive);

        let leftover: PathBuf = dest.join(&self.metadata_marker);
        if leftover.is_dir() {
            fs::remove_dir_all(&leftover).map_err(|e| SyncError::io(&leftover, e))?;
        }
        fs::remove_file(archive_path).map_err(|e| SyncError::io(archive_path, e))?;
        info!("extract: {written} files from {}", archive_path.display());
        Ok(written)
    }
}
