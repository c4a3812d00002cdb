use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::env::InstanceLayout;
use crate::error::{SyncError, SyncResult};

pub mod watch;

pub use watch::{ModRegistryHandle, WatchEvent};

type WriteFn = fn(&Path, &str) -> io::Result<()>;

fn write_list(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModChangeKind {
    Added,
    Removed,
    Renamed,
    Other,
}

/// Raised after every structural change to the load order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModChange {
    pub kind: ModChangeKind,
    pub path: PathBuf,
}

/// Ordered, duplicate-free list of the mod files installed into one instance.
///
/// Entries are kept as absolute paths under the mod directory and persisted
/// one per line, relative to it.
pub struct ModRegistry {
    mods_dir: PathBuf,
    list_file: PathBuf,
    entries: Vec<PathBuf>,
    needs_rebuild: Arc<AtomicBool>,
    subscribers: Vec<mpsc::UnboundedSender<ModChange>>,
    write: WriteFn,
}

impl ModRegistry {
    /// Create the mod directory if needed and reconcile the persisted list
    /// with what is on disk.
    pub fn open(layout: &InstanceLayout) -> SyncResult<Self> {
        Self::open_at(layout.mods_dir(), layout.mod_list_file())
    }

    pub fn open_at(mods_dir: impl AsRef<Path>, list_file: impl Into<PathBuf>) -> SyncResult<Self> {
        let mods_dir = mods_dir.as_ref();
        fs::create_dir_all(mods_dir).map_err(|e| SyncError::io(mods_dir, e))?;
        // Watch events carry canonical paths; entries must compare equal to them.
        let mods_dir = fs::canonicalize(mods_dir).map_err(|e| SyncError::io(mods_dir, e))?;
        let mut registry = Self {
            mods_dir,
            list_file: list_file.into(),
            entries: Vec::new(),
            needs_rebuild: Arc::new(AtomicBool::new(false)),
            subscribers: Vec::new(),
            write: write_list,
        };
        registry.update()?;
        Ok(registry)
    }

    #[cfg(test)]
    fn with_writer(mut self, write: WriteFn) -> Self {
        self.write = write;
        self
    }

    pub fn mods_dir(&self) -> &Path {
        &self.mods_dir
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn index_of(&self, path: impl AsRef<Path>) -> Option<usize> {
        let path = self.resolve(path.as_ref());
        self.entries.iter().position(|entry| *entry == path)
    }

    /// Shared with the owning instance; set whenever the load order changes.
    pub fn rebuild_flag(&self) -> Arc<AtomicBool> {
        self.needs_rebuild.clone()
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::SeqCst)
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ModChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Replace the in-memory list with the persisted one. A missing list
    /// file leaves the registry empty.
    pub fn load(&mut self) -> SyncResult<()> {
        self.entries.clear();
        let text = match fs::read_to_string(&self.list_file) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("mods: no list at {}", self.list_file.display());
                return Ok(());
            }
            Err(err) => return Err(SyncError::io(&self.list_file, err)),
        };
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let path = self.resolve(Path::new(line));
            if !self.entries.contains(&path) {
                self.entries.push(path);
            }
        }
        debug!("mods: loaded {} entries", self.entries.len());
        Ok(())
    }

    /// Persist the list. A list file held open by another process is
    /// logged and left for the next mutation to retry.
    pub fn save(&self) -> SyncResult<()> {
        let mut text = String::new();
        for entry in &self.entries {
            let relative = entry.strip_prefix(&self.mods_dir).unwrap_or(entry);
            text.push_str(&relative.to_string_lossy());
            text.push('\n');
        }
        if let Some(parent) = self.list_file.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }
        match (self.write)(&self.list_file, &text)
            .map_err(|e| SyncError::persist(&self.list_file, e))
        {
            Err(SyncError::PersistenceContention { path }) => {
                warn!("mods: {} is busy, list not saved", path.display());
                Ok(())
            }
            other => other,
        }
    }

    /// Full reconciliation against the mod directory. Running it twice with
    /// no filesystem change in between persists the same list both times.
    pub fn update(&mut self) -> SyncResult<()> {
        self.load()?;

        let mut missing = Vec::new();
        self.entries.retain(|entry| {
            let present = entry.is_file();
            if !present {
                missing.push(entry.clone());
            }
            present
        });

        let root = self.mods_dir.clone();
        let added = self.add_tree(&root, self.entries.len());
        for path in missing {
            info!("mods: {} disappeared", path.display());
            self.notify(ModChangeKind::Removed, path);
        }
        for path in added {
            self.notify(ModChangeKind::Added, path);
        }
        self.save()
    }

    /// Put a single file at `index` (clamped) without rescanning. A file
    /// already in the list is moved instead. A directory contributes the
    /// unlisted files beneath it, starting at `index`.
    pub fn insert_mod(&mut self, path: impl AsRef<Path>, index: usize) -> SyncResult<()> {
        let path = self.resolve(path.as_ref());
        if path.is_dir() {
            let added = self.add_tree(&path, index);
            if added.is_empty() {
                return Ok(());
            }
            for file in added {
                self.notify(ModChangeKind::Added, file);
            }
            return self.save();
        }
        if !path.is_file() {
            return Err(SyncError::io(
                &path,
                io::Error::new(io::ErrorKind::NotFound, "no such mod file"),
            ));
        }
        if let Some(existing) = self.entries.iter().position(|entry| *entry == path) {
            self.entries.remove(existing);
        }
        let index = index.min(self.entries.len());
        self.entries.insert(index, path.clone());
        self.notify(ModChangeKind::Added, path);
        self.save()
    }

    pub fn move_mod(&mut self, path: impl AsRef<Path>, index: usize) -> SyncResult<()> {
        let path = self.resolve(path.as_ref());
        let current = self
            .entries
            .iter()
            .position(|entry| *entry == path)
            .ok_or_else(|| SyncError::NotFound(path.clone()))?;
        let entry = self.entries.remove(current);
        let index = index.min(self.entries.len());
        self.entries.insert(index, entry);
        self.notify(ModChangeKind::Other, path);
        self.save()
    }

    /// Put `order` first, in that order; entries not named keep their
    /// relative order after them. Nothing changes if any path is unknown.
    pub fn reorder<P: AsRef<Path>>(&mut self, order: &[P]) -> SyncResult<()> {
        let mut front: Vec<PathBuf> = Vec::with_capacity(order.len());
        for path in order {
            let path = self.resolve(path.as_ref());
            if !self.entries.contains(&path) {
                return Err(SyncError::NotFound(path));
            }
            if !front.contains(&path) {
                front.push(path);
            }
        }
        let rest = self
            .entries
            .iter()
            .filter(|entry| !front.contains(*entry))
            .cloned();
        let reordered: Vec<PathBuf> = front.iter().cloned().chain(rest).collect();
        self.entries = reordered;
        self.notify(ModChangeKind::Other, self.mods_dir.clone());
        self.save()
    }

    /// Delete the file from disk and drop its entry.
    pub fn delete_mod(&mut self, path: impl AsRef<Path>) -> SyncResult<()> {
        let path = self.resolve(path.as_ref());
        let index = self
            .entries
            .iter()
            .position(|entry| *entry == path)
            .ok_or_else(|| SyncError::NotFound(path.clone()))?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(SyncError::io(&path, err)),
        }
        self.entries.remove(index);
        self.notify(ModChangeKind::Removed, path);
        self.save()
    }

    /// Apply one filesystem change incrementally.
    pub fn apply(&mut self, event: WatchEvent) -> SyncResult<()> {
        match event {
            WatchEvent::Created(path) => {
                let path = self.resolve(&path);
                let added = if path.is_dir() {
                    self.add_tree(&path, self.entries.len())
                } else if path.is_file() && !self.entries.contains(&path) {
                    self.entries.push(path.clone());
                    vec![path]
                } else {
                    Vec::new()
                };
                if added.is_empty() {
                    return Ok(());
                }
                for path in added {
                    self.notify(ModChangeKind::Added, path);
                }
                self.save()
            }
            WatchEvent::Removed(path) => {
                let path = self.resolve(&path);
                let before = self.entries.len();
                self.entries.retain(|entry| !entry.starts_with(&path));
                if self.entries.len() == before {
                    return Ok(());
                }
                self.notify(ModChangeKind::Removed, path);
                self.save()
            }
            WatchEvent::Renamed { from, to } => {
                let from = self.resolve(&from);
                let to = self.resolve(&to);
                if !self.entries.iter().any(|entry| entry.starts_with(&from)) {
                    return self.apply(WatchEvent::Created(to));
                }
                self.rename_entries(&from, &to);
                self.notify(ModChangeKind::Renamed, to);
                self.save()
            }
            WatchEvent::Other => Ok(()),
        }
    }

    /// Rewrite every entry at or beneath `from` in place. A target that was
    /// already listed elsewhere is dropped there.
    fn rename_entries(&mut self, from: &Path, to: &Path) {
        let targets: Vec<(usize, PathBuf)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let rest = entry.strip_prefix(from).ok()?;
                let target = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                Some((index, target))
            })
            .collect();

        let mut rewritten = Vec::with_capacity(self.entries.len());
        for (index, entry) in self.entries.iter().enumerate() {
            match targets.iter().find(|(slot, _)| *slot == index) {
                Some((_, target)) => rewritten.push(target.clone()),
                None if targets.iter().any(|(_, target)| target == entry) => {}
                None => rewritten.push(entry.clone()),
            }
        }
        self.entries = rewritten;
    }

    /// Insert every file under `dir` not already listed, in walk order,
    /// starting at `index`. Directories themselves are never listed.
    fn add_tree(&mut self, dir: &Path, index: usize) -> Vec<PathBuf> {
        let mut index = index.min(self.entries.len());
        let mut added = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("mods: skipping unreadable entry ({err})");
                    continue;
                }
            };
            // Follows symlinks, like the presence check in `update`.
            if !entry.path().is_file() {
                continue;
            }
            let path = entry.into_path();
            if !self.entries.contains(&path) {
                debug!("mods: found {}", path.display());
                self.entries.insert(index, path.clone());
                index += 1;
                added.push(path);
            }
        }
        added
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.mods_dir.join(path)
        }
    }

    fn notify(&mut self, kind: ModChangeKind, path: PathBuf) {
        self.needs_rebuild.store(true, Ordering::SeqCst);
        let change = ModChange { kind, path };
        self.subscribers
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }
}
