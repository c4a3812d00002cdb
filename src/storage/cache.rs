use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use futures_util::future::BoxFuture;
use log::{debug, warn};
use tokio::fs;

use crate::error::{SyncError, SyncResult};

type WriteFn = fn(PathBuf, String) -> BoxFuture<'static, io::Result<()>>;

fn write_file(path: PathBuf, contents: String) -> BoxFuture<'static, io::Result<()>> {
    Box::pin(async move { fs::write(path, contents).await })
}

/// File name to validation tag, persisted as `name=tag` lines.
#[derive(Clone, Debug)]
pub struct DownloadCache {
    path: PathBuf,
    tags: BTreeMap<String, String>,
    write: WriteFn,
}

impl DownloadCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tags: BTreeMap::new(),
            write: write_file,
        }
    }

    #[cfg(test)]
    fn with_writer(mut self, write: WriteFn) -> Self {
        self.write = write;
        self
    }

    /// Read the cache file, replacing in-memory entries. A missing file is an empty cache.
    pub async fn load(&mut self) -> SyncResult<()> {
        self.tags.clear();
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("cache: {} not found, starting empty", self.path.display());
                return Ok(());
            }
            Err(err) => return Err(SyncError::io(&self.path, err)),
        };
        self.tags = parse(&contents);
        debug!("cache: loaded {} entries", self.tags.len());
        Ok(())
    }

    pub async fn save(&self) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io(parent, e))?;
        }
        (self.write)(self.path.clone(), render(&self.tags))
            .await
            .map_err(|e| SyncError::persist(&self.path, e))
    }

    /// Save, tolerating another process holding the file. A stale cache only
    /// costs a redundant download on the next run.
    pub async fn save_best_effort(&self) -> SyncResult<()> {
        match self.save().await {
            Err(SyncError::PersistenceContention { path }) => {
                warn!(
                    "cache: {} is in use by another process; not saved",
                    path.display()
                );
                Ok(())
            }
            other => other,
        }
    }

    pub fn get(&self, file_name: &str) -> Option<&str> {
        self.tags.get(file_name).map(String::as_str)
    }

    pub fn set(&mut self, file_name: impl Into<String>, tag: impl Into<String>) {
        self.tags.insert(file_name.into(), tag.into());
    }

    pub fn remove(&mut self, file_name: &str) -> Option<String> {
        self.tags.remove(file_name)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

fn parse(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

fn render(tags: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (name, tag) in tags {
        out.push_str(name);
        out.push('=');
        out.push_str(tag);
        out.push('\n');
    }
    out
}
