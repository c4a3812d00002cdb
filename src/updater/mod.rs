use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::archive::ArchiveExtractor;
use crate::config::SyncConfig;
use crate::env::InstanceLayout;
use crate::error::{SyncError, SyncResult};
use crate::manifest::{AssetManifestResolver, AssetRef, Platform, TrustDomain};
use crate::networking::{AssetTransport, BodyStream, Head, HttpTransport};
use crate::storage::{DownloadCache, VersionMarker};
use crate::util::{format_speed, weighted_progress};

pub mod state;

pub use state::{UpdateEvent, UpdateOutcome, UpdatePrompt, UpdateState};

const ASK_UPDATE_MESSAGE: &str = "Would you like to update Minecraft?";
const CHECKING_CACHE_PROGRESS: u8 = 5;
const CACHE_HIT_PROGRESS: u8 = 90;

/// What the caller wants installed.
#[derive(Clone, Debug)]
pub struct UpdateRequest {
    pub version: String,
    pub main_asset: String,
    pub force_update: bool,
}

enum Flow {
    Completed,
    Cancelled,
}

/// Bytes credited toward the download phase. Skipped files are credited in full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteTally {
    pub initial: u8,
    pub downloaded: u64,
    pub total: u64,
}

impl ByteTally {
    fn percent(&self) -> u8 {
        weighted_progress(self.initial, self.downloaded, self.total)
    }
}

/// Drives one installation from "version requested" to "files on disk".
pub struct UpdateOrchestrator<T: AssetTransport> {
    layout: InstanceLayout,
    resolver: AssetManifestResolver,
    extractor: ArchiveExtractor,
    transport: T,
    platform: Platform,
    prompt: Arc<dyn UpdatePrompt>,
    events: mpsc::UnboundedSender<UpdateEvent>,
    cancel_flag: Arc<AtomicBool>,
    max_attempts: u32,
    state: UpdateState,
    progress: u8,
    tally: ByteTally,
}

impl UpdateOrchestrator<HttpTransport> {
    pub fn with_http(
        layout: InstanceLayout,
        config: &SyncConfig,
        prompt: Arc<dyn UpdatePrompt>,
        events: mpsc::UnboundedSender<UpdateEvent>,
    ) -> Self {
        let transport = HttpTransport::with_head_timeout(config.head_timeout());
        Self::new(layout, config, transport, prompt, events)
    }
}

impl<T: AssetTransport> UpdateOrchestrator<T> {
    pub fn new(
        layout: InstanceLayout,
        config: &SyncConfig,
        transport: T,
        prompt: Arc<dyn UpdatePrompt>,
        events: mpsc::UnboundedSender<UpdateEvent>,
    ) -> Self {
        Self {
            layout,
            resolver: AssetManifestResolver::new(config),
            extractor: ArchiveExtractor::new(config.metadata_marker.clone()),
            transport,
            platform: Platform::current(),
            prompt,
            events,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            max_attempts: config.max_attempts.max(1),
            state: UpdateState::Init,
            progress: 0,
            tally: ByteTally::default(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Raising the flag stops the current or next run at a step boundary.
    /// The flag is cleared when that run ends.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn tally(&self) -> ByteTally {
        self.tally
    }

    pub async fn run(&mut self, request: &UpdateRequest) -> UpdateOutcome {
        self.reset();
        info!(
            "update: starting run for version {} (force={})",
            request.version, request.force_update
        );

        let outcome = match self.execute(request).await {
            Ok(Flow::Completed) => {
                self.transition(UpdateState::Done);
                self.set_progress(100);
                info!("update: done");
                UpdateOutcome::Completed
            }
            Ok(Flow::Cancelled) => {
                self.transition(UpdateState::Cancelled);
                warn!("update: cancelled");
                UpdateOutcome::Cancelled
            }
            Err(SyncError::UnsupportedPlatform(name)) => {
                let message = format!("Your operating system ({name}) is not supported.");
                error!("update: {message}");
                self.emit(UpdateEvent::Error(message));
                self.transition(UpdateState::Cancelled);
                UpdateOutcome::Cancelled
            }
            Err(err) => {
                let message = describe(&err);
                error!("update: {err}");
                self.emit(UpdateEvent::Error(message.clone()));
                self.transition(UpdateState::Failed);
                UpdateOutcome::Failed(message)
            }
        };
        // A cancel applies to one run only.
        self.cancel_flag.store(false, Ordering::SeqCst);
        self.emit(UpdateEvent::Finished(outcome.clone()));
        outcome
    }

    async fn execute(&mut self, request: &UpdateRequest) -> SyncResult<Flow> {
        self.transition(UpdateState::DeterminingPackages);
        let assets = self
            .resolver
            .resolve(&request.main_asset, &request.version, self.platform)?;
        if self.cancel_requested() {
            return Ok(Flow::Cancelled);
        }

        self.transition(UpdateState::CheckingCache);
        self.set_progress(CHECKING_CACHE_PROGRESS);
        let bin_dir = self.layout.bin_dir();
        fs::create_dir_all(&bin_dir)
            .await
            .map_err(|e| SyncError::io(&bin_dir, e))?;

        let marker = VersionMarker::new(&self.layout);
        if !request.force_update && marker.satisfies(&request.version).await {
            info!("update: version {} already installed", request.version);
            self.set_progress(CACHE_HIT_PROGRESS);
            return Ok(Flow::Completed);
        }
        if !request.force_update && marker.exists().await && !self.confirm().await {
            info!("update: declined by user");
            return Ok(Flow::Cancelled);
        }
        if self.cancel_requested() {
            return Ok(Flow::Cancelled);
        }

        let mut cache = DownloadCache::new(self.layout.cache_file());
        cache.load().await?;
        if cache.is_empty() {
            debug!("update: no cached tags, every asset is fetched");
        } else {
            debug!("update: {} cached tags", cache.len());
        }
        if let Flow::Cancelled = self
            .download_all(assets.clone(), &mut cache, request.force_update)
            .await?
        {
            return Ok(Flow::Cancelled);
        }
        if self.cancel_requested() {
            return Ok(Flow::Cancelled);
        }

        self.transition(UpdateState::ExtractingPackages);
        if let Some(native) = assets.last() {
            self.extract_native(native, &mut cache).await?;
        }

        marker.write(&request.version).await?;
        Ok(Flow::Completed)
    }

    async fn download_all(
        &mut self,
        mut assets: Vec<AssetRef>,
        cache: &mut DownloadCache,
        force: bool,
    ) -> SyncResult<Flow> {
        self.transition(UpdateState::Downloading);
        let bin_dir = self.layout.bin_dir();

        let mut skip = Vec::with_capacity(assets.len());
        let mut total = 0u64;
        for asset in &mut assets {
            if self.cancel_requested() {
                return Ok(Flow::Cancelled);
            }
            asset.cached_tag = cache
                .get(&asset.file_name)
                .filter(|tag| !tag.is_empty())
                .map(str::to_owned);
            let on_disk = fs::metadata(bin_dir.join(&asset.file_name)).await.is_ok();
            let precondition = if force || !on_disk {
                None
            } else {
                asset.cached_tag.as_deref()
            };

            debug!("update: probing {}", asset.url);
            let head = self.transport.head(&asset.url, precondition).await?;
            asset.size = head.size();
            total += asset.size.unwrap_or(0);
            skip.push(precondition.is_some() && matches!(head, Head::NotModified { .. }));
        }

        self.tally = ByteTally {
            initial: self.progress,
            downloaded: 0,
            total,
        };
        debug!("update: {total} bytes across {} assets", assets.len());

        for (index, (asset, skip)) in assets.iter().zip(skip).enumerate() {
            if self.cancel_requested() {
                return Ok(Flow::Cancelled);
            }
            if skip {
                info!("update: {} is up to date", asset.file_name);
                self.credit(asset.size.unwrap_or(0));
                continue;
            }
            self.fetch_asset(asset, index == 0, cache).await?;
        }
        Ok(Flow::Completed)
    }

    /// Download one asset, retrying from scratch until it verifies or the
    /// attempt budget is spent. Assets of unknown size are accepted as received.
    async fn fetch_asset(
        &mut self,
        asset: &AssetRef,
        is_main: bool,
        cache: &mut DownloadCache,
    ) -> SyncResult<()> {
        let dest = self.layout.bin_dir().join(&asset.file_name);

        // A stale tag must not survive an interrupted download.
        if cache.remove(&asset.file_name).is_some() {
            cache.save_best_effort().await?;
        }
        if is_main {
            let backup = self.layout.backup_jar();
            if fs::metadata(&backup).await.is_ok() {
                info!("update: removing stale backup {}", backup.display());
                fs::remove_file(&backup)
                    .await
                    .map_err(|e| SyncError::io(&backup, e))?;
            }
        }

        let mut reason = String::new();
        for attempt in 1..=self.max_attempts {
            let started = Instant::now();
            let fetched = self.transport.fetch(&asset.url).await?;
            let (received, digest) = self
                .stream_to_file(fetched.body, &dest, asset.size.is_some())
                .await?;

            let expected = match asset.domain {
                TrustDomain::Verified => fetched.etag.as_deref(),
                TrustDomain::Unverified => None,
            };
            let hash_ok = expected.is_none_or(|tag| tag.eq_ignore_ascii_case(&digest));
            let size_ok = asset.size.is_none_or(|size| size == received);

            // Without an advertised size there is nothing to check against.
            if asset.size.is_none() || (hash_ok && size_ok) {
                let elapsed = started.elapsed().as_secs_f32().max(0.001);
                info!(
                    "update: fetched {} ({received} bytes, {})",
                    asset.file_name,
                    format_speed(received as f32 / elapsed)
                );
                cache.set(asset.file_name.clone(), fetched.etag.unwrap_or_default());
                cache.save_best_effort().await?;
                return Ok(());
            }

            reason = if hash_ok {
                format!(
                    "expected {} bytes, received {received}",
                    asset.size.unwrap_or(0)
                )
            } else {
                format!(
                    "MD5 sums did not match (expected {}, got {digest})",
                    expected.unwrap_or_default()
                )
            };
            warn!(
                "update: {} attempt {attempt}/{} failed: {reason}",
                asset.file_name, self.max_attempts
            );
            if asset.size.is_some() {
                self.tally.downloaded = self.tally.downloaded.saturating_sub(received);
            }
        }

        Err(SyncError::IntegrityMismatch {
            file: asset.file_name.clone(),
            attempts: self.max_attempts,
            reason,
        })
    }

    /// Write the body to `dest`, hashing as it goes. Returns the byte count
    /// and the lowercase hex MD5.
    async fn stream_to_file(
        &mut self,
        mut body: BodyStream,
        dest: &Path,
        counted: bool,
    ) -> SyncResult<(u64, String)> {
        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| SyncError::io(dest, e))?;
        let mut hasher = Md5::new();
        let mut received = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| SyncError::io(dest, e))?;
            hasher.update(&chunk);
            received += chunk.len() as u64;
            if counted {
                self.credit(chunk.len() as u64);
            }
        }
        file.flush().await.map_err(|e| SyncError::io(dest, e))?;

        Ok((received, hex::encode(hasher.finalize())))
    }

    async fn extract_native(
        &mut self,
        native: &AssetRef,
        cache: &mut DownloadCache,
    ) -> SyncResult<()> {
        let archive = self.layout.bin_dir().join(&native.file_name);
        let dest = self.layout.natives_dir();
        let extractor = self.extractor.clone();
        let job_archive = archive.clone();
        tokio::task::spawn_blocking(move || extractor.extract(&job_archive, &dest))
            .await
            .map_err(|e| SyncError::ExtractionFailure {
                path: archive.clone(),
                message: format!("extraction task failed: {e}"),
            })??;

        // The archive is gone, so its tag no longer describes anything on disk.
        if cache.remove(&native.file_name).is_some() {
            cache.save_best_effort().await?;
        }
        Ok(())
    }

    async fn confirm(&self) -> bool {
        let prompt = self.prompt.clone();
        match tokio::task::spawn_blocking(move || prompt.ask_update(ASK_UPDATE_MESSAGE)).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!("update: confirmation prompt failed ({err}); not updating");
                false
            }
        }
    }

    fn credit(&mut self, bytes: u64) {
        self.tally.downloaded += bytes;
        let percent = self.tally.percent();
        self.set_progress(percent);
    }

    fn reset(&mut self) {
        self.state = UpdateState::Init;
        self.progress = 0;
        self.tally = ByteTally::default();
        self.emit(UpdateEvent::State {
            state: UpdateState::Init,
            status: UpdateState::Init.status(),
        });
        self.emit(UpdateEvent::Progress(0));
    }

    fn transition(&mut self, next: UpdateState) {
        if !self.state.can_transition_to(next) {
            warn!("update: ignoring transition {:?} -> {:?}", self.state, next);
            return;
        }
        debug!("update: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.emit(UpdateEvent::State {
            state: next,
            status: next.status(),
        });
    }

    /// Progress never moves backwards within a run.
    fn set_progress(&mut self, value: u8) {
        let value = value.min(100);
        if value > self.progress {
            self.progress = value;
            self.emit(UpdateEvent::Progress(value));
        }
    }

    fn emit(&self, event: UpdateEvent) {
        let _ = self.events.send(event);
    }

    fn cancel_requested(&self) -> bool {
        let value = self.cancel_flag.load(Ordering::SeqCst);
        if value {
            debug!("update: cancel flag observed set");
        }
        value
    }
}

fn describe(err: &SyncError) -> String {
    match err {
        SyncError::NetworkFailure { .. } => format!(
            "An error occurred when downloading packages.\nDetails:\n{err}"
        ),
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests;
