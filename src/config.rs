use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::{SyncError, SyncResult};

const EMBEDDED_CONFIG: &str = include_str!("../sync.json");

/// Where assets come from and how they are checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub main_base_url: String,
    /// The main host publishes MD5 ETags that can be checked against the body.
    #[serde(default = "default_true")]
    pub main_verify_etag: bool,
    pub library_base_url: String,
    #[serde(default)]
    pub library_verify_etag: bool,
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Native bundle file name keyed by platform (`windows`, `linux`, `macos`).
    #[serde(default)]
    pub native_bundles: HashMap<String, String>,
    #[serde(default = "default_head_timeout")]
    pub head_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_metadata_marker")]
    pub metadata_marker: String,
}

fn default_true() -> bool {
    true
}

fn default_head_timeout() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    3
}

fn default_metadata_marker() -> String {
    "META-INF".into()
}

impl SyncConfig {
    /// Load from an explicit path, then the shared app directory, then the
    /// copy embedded in the binary.
    pub fn load(explicit: Option<&Path>) -> SyncResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let shared = env::config_path();
        if shared.exists() {
            match Self::from_file(&shared) {
                Ok(config) => return Ok(config),
                Err(err) => warn!("config: ignoring {} ({err})", shared.display()),
            }
        }
        debug!("config: using embedded defaults");
        Self::embedded()
    }

    pub fn embedded() -> SyncResult<Self> {
        Self::parse(EMBEDDED_CONFIG)
    }

    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> SyncResult<Self> {
        let config: SyncConfig = serde_json::from_str(contents)
            .map_err(|e| SyncError::Config(format!("sync.json parse error: {e}")))?;
        if config.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }
        Ok(config)
    }

    pub fn head_timeout(&self) -> Duration {
        Duration::from_secs(self.head_timeout_secs)
    }
}
