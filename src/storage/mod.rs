use std::path::PathBuf;

use tokio::fs;

use crate::env::InstanceLayout;
use crate::error::{SyncError, SyncResult};

mod cache;

pub use cache::DownloadCache;

/// Requested version meaning "whatever is installed is fine".
pub const ANY_VERSION: &str = "-1";

/// The raw version tag recorded after a successful update.
#[derive(Clone, Debug)]
pub struct VersionMarker {
    path: PathBuf,
}

impl VersionMarker {
    pub fn new(layout: &InstanceLayout) -> Self {
        Self {
            path: layout.version_file(),
        }
    }

    pub async fn read(&self) -> Option<String> {
        fs::read(&self.path).await.ok().and_then(|bytes| {
            let version = String::from_utf8_lossy(&bytes).trim().to_owned();
            (!version.is_empty()).then_some(version)
        })
    }

    pub async fn write(&self, version: &str) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io(parent, e))?;
        }
        fs::write(&self.path, version.as_bytes())
            .await
            .map_err(|e| SyncError::persist(&self.path, e))
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// An installation can start without the network once a version is recorded.
    pub async fn can_play_offline(&self) -> bool {
        self.read().await.is_some()
    }

    /// Whether a run for `requested` may skip the network entirely.
    pub async fn satisfies(&self, requested: &str) -> bool {
        match self.read().await {
            Some(installed) => requested == ANY_VERSION || installed == requested,
            None => false,
        }
    }
}
