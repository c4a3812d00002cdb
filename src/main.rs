use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

mod archive;
mod config;
mod env;
mod error;
mod manifest;
mod mods;
mod networking;
mod storage;
mod updater;
mod util;

use config::SyncConfig;
use env::InstanceLayout;
use error::{SyncError, SyncResult};
use mods::{ModRegistry, ModRegistryHandle};
use storage::VersionMarker;
use updater::{UpdateEvent, UpdateOrchestrator, UpdateOutcome, UpdatePrompt, UpdateRequest};

#[derive(Parser, Debug)]
#[command(
    name = "mmc-sync",
    author,
    version,
    about = "Keeps game instances up to date and tracks their installed mods"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download, verify and unpack the game files for an instance.
    Update {
        /// Instance directory or name under the shared instances folder.
        instance: String,
        /// Version to install; `-1` accepts whatever is installed.
        #[arg(long, default_value = storage::ANY_VERSION)]
        version: String,
        #[arg(long, default_value = "minecraft.jar")]
        main_asset: String,
        /// Re-download everything, ignoring the version marker and cache.
        #[arg(long)]
        force: bool,
        /// Answer yes to the update confirmation.
        #[arg(long, short)]
        yes: bool,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Inspect or change an instance's mod load order.
    Mods {
        instance: String,
        #[command(subcommand)]
        action: ModAction,
    },
}

#[derive(Subcommand, Debug)]
enum ModAction {
    List,
    /// Reconcile the list with the mod folder.
    Sync,
    /// Add a file at a position; files outside the mod folder are copied in.
    Insert { file: PathBuf, index: usize },
    Move { file: PathBuf, index: usize },
    /// Put the given files first, in this order.
    Reorder {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Delete a mod file and drop it from the list.
    Remove { file: PathBuf },
    /// Follow the mod folder until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Update {
            instance,
            version,
            main_asset,
            force,
            yes,
            config,
        } => {
            let request = UpdateRequest {
                version,
                main_asset,
                force_update: force,
            };
            run_update(&instance, request, yes, config.as_deref()).await
        }
        Command::Mods { instance, action } => run_mods(&instance, action).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Asks on stdin, keeping the progress bar out of the way.
struct StdinPrompt {
    bar: ProgressBar,
}

impl UpdatePrompt for StdinPrompt {
    fn ask_update(&self, message: &str) -> bool {
        self.bar.suspend(|| {
            print!("{message} [y/N] ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line) {
                Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
                Err(err) => {
                    warn!("prompt: could not read answer ({err})");
                    false
                }
            }
        })
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

async fn run_update(
    instance: &str,
    request: UpdateRequest,
    yes: bool,
    config: Option<&Path>,
) -> SyncResult<ExitCode> {
    let config = SyncConfig::load(config)?;
    let layout = InstanceLayout::new(env::resolve_instance(instance));
    info!("update: instance {}", layout.root().display());

    let bar = progress_bar();
    let prompt: Arc<dyn UpdatePrompt> = if yes {
        Arc::new(|_: &str| true)
    } else {
        Arc::new(StdinPrompt { bar: bar.clone() })
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let marker = VersionMarker::new(&layout);
    let mut orchestrator = UpdateOrchestrator::with_http(layout, &config, prompt, tx);

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("update: interrupt received, stopping after the current step");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let run = tokio::spawn(async move {
        let outcome = orchestrator.run(&request).await;
        let tally = orchestrator.tally();
        debug!(
            "update: ended in {:?} at {}% ({} of {} bytes)",
            orchestrator.state(),
            orchestrator.progress(),
            tally.downloaded,
            tally.total
        );
        outcome
    });

    let mut outcome = None;
    while let Some(event) = rx.recv().await {
        match event {
            UpdateEvent::State { status, .. } => bar.set_message(status),
            UpdateEvent::Progress(value) => bar.set_position(u64::from(value)),
            UpdateEvent::Error(message) => bar.suspend(|| eprintln!("{message}")),
            UpdateEvent::Finished(done) => {
                outcome = Some(done);
                break;
            }
        }
    }
    let outcome = match outcome {
        Some(outcome) => outcome,
        None => run
            .await
            .map_err(|e| SyncError::Config(format!("update task failed: {e}")))?,
    };

    Ok(match outcome {
        UpdateOutcome::Completed => {
            bar.finish_with_message("Done");
            ExitCode::SUCCESS
        }
        UpdateOutcome::Cancelled => {
            bar.abandon_with_message("Cancelled");
            ExitCode::SUCCESS
        }
        UpdateOutcome::Failed(_) => {
            bar.abandon_with_message("Failed");
            if marker.can_play_offline().await {
                warn!("update: the previously installed version can still be played offline");
            }
            ExitCode::FAILURE
        }
    })
}

async fn run_mods(instance: &str, action: ModAction) -> SyncResult<ExitCode> {
    let layout = InstanceLayout::new(env::resolve_instance(instance));
    let registry = ModRegistry::open(&layout)?;
    let mods_dir = registry.mods_dir().to_path_buf();
    // Only changes made by this command count.
    registry.rebuild_flag().store(false, Ordering::SeqCst);
    if let ModAction::Watch = action {
        return watch_mods(registry).await;
    }

    let handle = ModRegistryHandle::spawn(registry);
    let touched = match action {
        ModAction::List | ModAction::Watch => None,
        ModAction::Sync => {
            handle.update().await?;
            None
        }
        ModAction::Insert { file, index } => {
            let target = import_mod(&file, &mods_dir)?;
            handle.insert_mod(target.clone(), index).await?;
            Some(target)
        }
        ModAction::Move { file, index } => {
            handle.move_mod(file.clone(), index).await?;
            Some(file)
        }
        ModAction::Reorder { files } => {
            handle.reorder(files).await?;
            None
        }
        ModAction::Remove { file } => {
            handle.delete_mod(file).await?;
            None
        }
    };

    print_mods(&mods_dir, &handle.entries().await?);
    let registry = handle.shutdown().await?;
    if let Some(position) = touched.and_then(|file| registry.index_of(file)) {
        info!("mods: now at position {position}");
    }
    if registry.needs_rebuild() {
        info!("mods: load order of {} entries changed", registry.len());
    }
    Ok(ExitCode::SUCCESS)
}

/// Files outside the mod folder are copied into it first.
fn import_mod(file: &Path, mods_dir: &Path) -> SyncResult<PathBuf> {
    let source = if file.is_relative() && !file.exists() {
        mods_dir.join(file)
    } else {
        file.to_path_buf()
    };
    let source = std::fs::canonicalize(&source).map_err(|e| SyncError::io(&source, e))?;
    if source.starts_with(mods_dir) {
        return Ok(source);
    }
    let name = source
        .file_name()
        .ok_or_else(|| SyncError::NotFound(source.clone()))?;
    let target = mods_dir.join(name);
    std::fs::copy(&source, &target).map_err(|e| SyncError::io(&target, e))?;
    info!("mods: copied {} into {}", source.display(), mods_dir.display());
    Ok(target)
}

async fn watch_mods(registry: ModRegistry) -> SyncResult<ExitCode> {
    let mods_dir = registry.mods_dir().to_path_buf();
    let rebuild = registry.rebuild_flag();
    let handle = ModRegistryHandle::spawn_watched(registry)?;
    let mut changes = handle.subscribe().await?;
    println!("Watching {} (Ctrl+C to stop)", mods_dir.display());

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(change) => println!("{:?} {}", change.kind, change.path.display()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let registry = handle.shutdown().await?;
    if rebuild.load(Ordering::SeqCst) {
        println!("Load order changed while watching:");
    }
    print_mods(registry.mods_dir(), registry.iter());
    Ok(ExitCode::SUCCESS)
}

fn print_mods<'a>(mods_dir: &Path, entries: impl IntoIterator<Item = &'a PathBuf>) {
    let mut shown_any = false;
    for (index, entry) in entries.into_iter().enumerate() {
        let shown = entry.strip_prefix(mods_dir).unwrap_or(entry);
        println!("{index:>3}  {}", shown.display());
        shown_any = true;
    }
    if !shown_any {
        println!("No mods installed.");
    }
}
