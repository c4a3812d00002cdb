use std::env;
use std::path::{Path, PathBuf};

/// Returns the root directory used by the launcher for shared files.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("mmc-sync")
}

pub fn instances_dir() -> PathBuf {
    default_app_dir().join("instances")
}

pub fn config_path() -> PathBuf {
    default_app_dir().join("sync.json")
}

/// Resolve an instance argument: existing paths are used as-is, bare names
/// are looked up under the shared instances directory.
pub fn resolve_instance(arg: &str) -> PathBuf {
    let path = PathBuf::from(arg);
    if path.is_absolute() || path.exists() {
        path
    } else {
        instances_dir().join(arg)
    }
}

/// On-disk layout of one game installation.
#[derive(Clone, Debug)]
pub struct InstanceLayout {
    root: PathBuf,
}

impl InstanceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The game folder. Older installations used `.minecraft`; it is only
    /// picked when the newer `minecraft` folder does not exist.
    pub fn minecraft_dir(&self) -> PathBuf {
        let legacy = self.root.join(".minecraft");
        let current = self.root.join("minecraft");
        if legacy.is_dir() && !current.is_dir() {
            legacy
        } else {
            current
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.minecraft_dir().join("bin")
    }

    pub fn natives_dir(&self) -> PathBuf {
        self.bin_dir().join("natives")
    }

    pub fn version_file(&self) -> PathBuf {
        self.bin_dir().join("version")
    }

    pub fn cache_file(&self) -> PathBuf {
        self.bin_dir().join("md5s")
    }

    pub fn backup_jar(&self) -> PathBuf {
        self.bin_dir().join("mcbackup.jar")
    }

    pub fn mods_dir(&self) -> PathBuf {
        self.root.join("instMods")
    }

    pub fn mod_list_file(&self) -> PathBuf {
        self.root.join("modlist")
    }
}
