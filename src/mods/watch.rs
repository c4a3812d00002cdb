use std::path::PathBuf;

use log::{debug, info, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{ModChange, ModRegistry};
use crate::error::{SyncError, SyncResult};

const COMMAND_CAPACITY: usize = 256;

/// A filesystem change under the mod directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
    Other,
}

impl WatchEvent {
    pub fn from_notify(event: Event) -> Vec<WatchEvent> {
        match event.kind {
            EventKind::Create(_) => event.paths.into_iter().map(WatchEvent::Created).collect(),
            EventKind::Remove(_) => event.paths.into_iter().map(WatchEvent::Removed).collect(),
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::Both => {
                    let mut paths = event.paths.into_iter();
                    match (paths.next(), paths.next()) {
                        (Some(from), Some(to)) => vec![WatchEvent::Renamed { from, to }],
                        (Some(path), None) => vec![WatchEvent::Created(path)],
                        _ => Vec::new(),
                    }
                }
                RenameMode::To => event.paths.into_iter().map(WatchEvent::Created).collect(),
                // The next reconciliation drops the old entry.
                RenameMode::From => Vec::new(),
                // Backends that cannot pair the two halves (FSEvents) land here.
                // The renamed file loses its position and is appended again.
                _ => event
                    .paths
                    .into_iter()
                    .map(|path| {
                        if path.exists() {
                            WatchEvent::Created(path)
                        } else {
                            WatchEvent::Removed(path)
                        }
                    })
                    .collect(),
            },
            _ => vec![WatchEvent::Other],
        }
    }
}

type Reply<T> = oneshot::Sender<SyncResult<T>>;

enum RegistryCommand {
    Update(Reply<()>),
    Insert {
        path: PathBuf,
        index: usize,
        reply: Reply<()>,
    },
    Move {
        path: PathBuf,
        index: usize,
        reply: Reply<()>,
    },
    Reorder {
        order: Vec<PathBuf>,
        reply: Reply<()>,
    },
    Delete {
        path: PathBuf,
        reply: Reply<()>,
    },
    Entries(oneshot::Sender<Vec<PathBuf>>),
    Subscribe(oneshot::Sender<mpsc::UnboundedReceiver<ModChange>>),
    Watch(WatchEvent),
}

/// Owns a [`ModRegistry`] on a dedicated task. Caller commands and watcher
/// events share one queue, so mutations never interleave.
pub struct ModRegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<ModRegistry>,
}

impl ModRegistryHandle {
    pub fn spawn(registry: ModRegistry) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        Self::start(registry, tx, rx, None)
    }

    /// Like [`spawn`](Self::spawn), plus a recursive watcher on the mod
    /// directory feeding the same queue.
    pub fn spawn_watched(registry: ModRegistry) -> SyncResult<Self> {
        let mods_dir = registry.mods_dir().to_path_buf();
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let events = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in WatchEvent::from_notify(event) {
                    if events.blocking_send(RegistryCommand::Watch(change)).is_err() {
                        break;
                    }
                }
            }
            Err(err) => warn!("mods: watcher error ({err})"),
        })?;
        watcher.watch(&mods_dir, RecursiveMode::Recursive)?;
        info!("mods: watching {}", mods_dir.display());
        Ok(Self::start(registry, tx, rx, Some(watcher)))
    }

    fn start(
        mut registry: ModRegistry,
        commands: mpsc::Sender<RegistryCommand>,
        mut rx: mpsc::Receiver<RegistryCommand>,
        watcher: Option<RecommendedWatcher>,
    ) -> Self {
        let task = tokio::task::spawn_blocking(move || {
            while let Some(command) = rx.blocking_recv() {
                handle(&mut registry, command);
            }
            debug!("mods: registry task stopped");
            registry
        });
        Self {
            commands,
            watcher,
            task,
        }
    }

    pub async fn update(&self) -> SyncResult<()> {
        self.request(RegistryCommand::Update).await
    }

    pub async fn insert_mod(&self, path: impl Into<PathBuf>, index: usize) -> SyncResult<()> {
        let path = path.into();
        self.request(|reply| RegistryCommand::Insert { path, index, reply })
            .await
    }

    pub async fn move_mod(&self, path: impl Into<PathBuf>, index: usize) -> SyncResult<()> {
        let path = path.into();
        self.request(|reply| RegistryCommand::Move { path, index, reply })
            .await
    }

    pub async fn reorder(&self, order: Vec<PathBuf>) -> SyncResult<()> {
        self.request(|reply| RegistryCommand::Reorder { order, reply })
            .await
    }

    pub async fn delete_mod(&self, path: impl Into<PathBuf>) -> SyncResult<()> {
        let path = path.into();
        self.request(|reply| RegistryCommand::Delete { path, reply })
            .await
    }

    pub async fn entries(&self) -> SyncResult<Vec<PathBuf>> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Entries(reply)).await?;
        rx.await.map_err(|_| SyncError::RegistryClosed)
    }

    pub async fn subscribe(&self) -> SyncResult<mpsc::UnboundedReceiver<ModChange>> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Subscribe(reply)).await?;
        rx.await.map_err(|_| SyncError::RegistryClosed)
    }

    /// Stop watching, drain queued commands and hand the registry back.
    pub async fn shutdown(self) -> SyncResult<ModRegistry> {
        let Self {
            commands,
            watcher,
            task,
        } = self;
        drop(watcher);
        drop(commands);
        task.await.map_err(|_| SyncError::RegistryClosed)
    }

    async fn request<F>(&self, build: F) -> SyncResult<()>
    where
        F: FnOnce(Reply<()>) -> RegistryCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| SyncError::RegistryClosed)?
    }

    async fn send(&self, command: RegistryCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::RegistryClosed)
    }
}

fn handle(registry: &mut ModRegistry, command: RegistryCommand) {
    match command {
        RegistryCommand::Update(reply) => {
            let _ = reply.send(registry.update());
        }
        RegistryCommand::Insert { path, index, reply } => {
            let _ = reply.send(registry.insert_mod(path, index));
        }
        RegistryCommand::Move { path, index, reply } => {
            let _ = reply.send(registry.move_mod(path, index));
        }
        RegistryCommand::Reorder { order, reply } => {
            let _ = reply.send(registry.reorder(&order));
        }
        RegistryCommand::Delete { path, reply } => {
            let _ = reply.send(registry.delete_mod(path));
        }
        RegistryCommand::Entries(reply) => {
            let _ = reply.send(registry.entries().to_vec());
        }
        RegistryCommand::Subscribe(reply) => {
            let _ = reply.send(registry.subscribe());
        }
        RegistryCommand::Watch(event) => {
            debug!("mods: {event:?}");
            if let Err(err) = registry.apply(event) {
                warn!("mods: failed to apply change ({err})");
            }
        }
    }
}
