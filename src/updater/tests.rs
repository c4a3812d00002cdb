use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use zip::write::{SimpleFileOptions, ZipWriter};

use super::*;
use crate::networking::Fetched;

const MAIN: &str = "minecraft.jar";
const LIB: &str = "lwjgl.jar";
const NATIVE: &str = "linux_natives.jar";

fn md5_hex(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}

fn native_zip() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer.add_directory("META-INF/", options).unwrap();
    writer.start_file("META-INF/MANIFEST.MF", options).unwrap();
    writer.write_all(b"Manifest-Version: 1.0").unwrap();
    writer.start_file("liblwjgl.so", options).unwrap();
    writer.write_all(b"native code").unwrap();
    writer.finish().unwrap().into_inner()
}

#[derive(Clone)]
struct ScriptedAsset {
    size: Option<u64>,
    etag: Option<String>,
    /// Body served on each attempt; the last one repeats.
    bodies: Vec<Vec<u8>>,
}

impl ScriptedAsset {
    fn good(body: Vec<u8>, etag: Option<String>) -> Self {
        Self {
            size: Some(body.len() as u64),
            etag,
            bodies: vec![body],
        }
    }
}

#[derive(Default)]
struct ScriptedTransport {
    assets: HashMap<String, ScriptedAsset>,
    heads: Mutex<Vec<(String, Option<String>)>>,
    fetches: Mutex<HashMap<String, usize>>,
    total_fetches: AtomicUsize,
}

impl ScriptedTransport {
    fn with(mut self, name: &str, asset: ScriptedAsset) -> Self {
        self.assets.insert(name.to_owned(), asset);
        self
    }

    fn fetch_count(&self, name: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn head_count(&self) -> usize {
        self.heads.lock().unwrap().len()
    }

    fn asset(&self, url: &str) -> SyncResult<(String, ScriptedAsset)> {
        let name = url.rsplit('/').next().unwrap_or_default().to_owned();
        let asset = self
            .assets
            .get(&name)
            .cloned()
            .ok_or_else(|| SyncError::network(url, "404 Not Found"))?;
        Ok((name, asset))
    }
}

#[async_trait]
impl AssetTransport for ScriptedTransport {
    async fn head(&self, url: &str, cached_tag: Option<&str>) -> SyncResult<Head> {
        let (name, asset) = self.asset(url)?;
        self.heads
            .lock()
            .unwrap()
            .push((name, cached_tag.map(str::to_owned)));
        if cached_tag.is_some() && cached_tag == asset.etag.as_deref() {
            return Ok(Head::NotModified { size: asset.size });
        }
        Ok(Head::Available { size: asset.size })
    }

    async fn fetch(&self, url: &str) -> SyncResult<Fetched> {
        let (name, asset) = self.asset(url)?;
        let attempt = {
            let mut fetches = self.fetches.lock().unwrap();
            let count = fetches.entry(name).or_insert(0);
            *count += 1;
            *count
        };
        self.total_fetches.fetch_add(1, Ordering::SeqCst);
        let body = asset.bodies[(attempt - 1).min(asset.bodies.len() - 1)].clone();
        let mid = body.len() / 2;
        let chunks = vec![
            Ok(Bytes::copy_from_slice(&body[..mid])),
            Ok(Bytes::copy_from_slice(&body[mid..])),
        ];
        Ok(Fetched {
            etag: asset.etag.clone(),
            body: stream::iter(chunks).boxed(),
        })
    }
}

fn config() -> SyncConfig {
    SyncConfig::parse(
        r#"{
            "main_base_url": "http://main.test/dl/",
            "main_verify_etag": true,
            "library_base_url": "http://libs.test/",
            "library_verify_etag": false,
            "libraries": ["lwjgl.jar"],
            "native_bundles": {"linux": "linux_natives.jar", "windows": "windows_natives.jar"}
        }"#,
    )
    .unwrap()
}

fn healthy_transport() -> ScriptedTransport {
    let main = b"main game archive".to_vec();
    let main_tag = md5_hex(&main);
    ScriptedTransport::default()
        .with(MAIN, ScriptedAsset::good(main, Some(main_tag)))
        .with(LIB, ScriptedAsset::good(b"library".to_vec(), Some("dropbox-rev-7".into())))
        .with(NATIVE, ScriptedAsset::good(native_zip(), None))
}

fn request(version: &str) -> UpdateRequest {
    UpdateRequest {
        version: version.into(),
        main_asset: MAIN.into(),
        force_update: false,
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    layout: InstanceLayout,
    orchestrator: UpdateOrchestrator<ScriptedTransport>,
    events: mpsc::UnboundedReceiver<UpdateEvent>,
}

impl Harness {
    fn new(transport: ScriptedTransport, prompt: Arc<dyn UpdatePrompt>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::new(tmp.path());
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator =
            UpdateOrchestrator::new(layout.clone(), &config(), transport, prompt, tx)
                .with_platform(Platform::Linux);
        Self {
            _tmp: tmp,
            layout,
            orchestrator,
            events: rx,
        }
    }

    fn drain(&mut self) -> Vec<UpdateEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn transport(&self) -> &ScriptedTransport {
        &self.orchestrator.transport
    }
}

fn always(answer: bool) -> Arc<dyn UpdatePrompt> {
    Arc::new(move |_: &str| answer)
}

fn progress_values(events: &[UpdateEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            UpdateEvent::Progress(value) => Some(*value),
            _ => None,
        })
        .collect()
}

fn errors(events: &[UpdateEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            UpdateEvent::Error(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn fresh_install_downloads_verifies_and_extracts() {
    let mut h = Harness::new(healthy_transport(), always(true));

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert_eq!(outcome, UpdateOutcome::Completed);
    assert_eq!(h.orchestrator.state(), UpdateState::Done);
    assert_eq!(h.orchestrator.progress(), 100);
    for name in [MAIN, LIB, NATIVE] {
        assert_eq!(h.transport().fetch_count(name), 1, "{name}");
    }

    let bin = h.layout.bin_dir();
    assert_eq!(
        std::fs::read(bin.join(MAIN)).unwrap(),
        b"main game archive"
    );
    assert!(h.layout.natives_dir().join("liblwjgl.so").is_file());
    assert!(!h.layout.natives_dir().join("META-INF").exists());
    assert!(!bin.join(NATIVE).exists());

    let mut cache = DownloadCache::new(h.layout.cache_file());
    cache.load().await.unwrap();
    assert_eq!(
        cache.get(MAIN),
        Some(md5_hex(b"main game archive").as_str())
    );
    assert_eq!(cache.get(LIB), Some("dropbox-rev-7"));
    assert_eq!(cache.get(NATIVE), None);

    let marker = VersionMarker::new(&h.layout);
    assert_eq!(marker.read().await.as_deref(), Some("1.2.5"));

    let tally = h.orchestrator.tally();
    assert_eq!(tally.downloaded, tally.total);
    assert!(tally.total > 0);

    let events = h.drain();
    let progress = progress_values(&events);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100));
    assert!(errors(&events).is_empty());
    assert_eq!(
        events.last(),
        Some(&UpdateEvent::Finished(UpdateOutcome::Completed))
    );
}

#[tokio::test]
async fn unchanged_version_skips_the_network() {
    let mut h = Harness::new(healthy_transport(), always(true));
    VersionMarker::new(&h.layout).write("1.2.5").await.unwrap();

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert_eq!(outcome, UpdateOutcome::Completed);
    assert_eq!(h.transport().head_count(), 0);
    assert_eq!(h.transport().total_fetches.load(Ordering::SeqCst), 0);
    let progress = progress_values(&h.drain());
    assert!(progress.contains(&90), "{progress:?}");
    assert!(h.orchestrator.progress() >= 90);
}

#[tokio::test]
async fn any_version_sentinel_accepts_installed_copy() {
    let mut h = Harness::new(healthy_transport(), always(true));
    VersionMarker::new(&h.layout).write("1.0").await.unwrap();

    let outcome = h.orchestrator.run(&request("-1")).await;

    assert_eq!(outcome, UpdateOutcome::Completed);
    assert_eq!(h.transport().head_count(), 0);
}

#[tokio::test]
async fn hash_mismatch_fails_after_three_attempts() {
    let transport = healthy_transport().with(
        MAIN,
        ScriptedAsset {
            size: Some(9),
            etag: Some(md5_hex(b"the truth")),
            bodies: vec![b"corrupted".to_vec()],
        },
    );
    let mut h = Harness::new(transport, always(true));

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert!(matches!(outcome, UpdateOutcome::Failed(ref msg) if msg.contains(MAIN)));
    assert_eq!(h.orchestrator.state(), UpdateState::Failed);
    assert_eq!(h.transport().fetch_count(MAIN), 3);
    assert_eq!(h.transport().fetch_count(LIB), 0);
    assert_eq!(VersionMarker::new(&h.layout).read().await, None);

    let mut cache = DownloadCache::new(h.layout.cache_file());
    cache.load().await.unwrap();
    assert_eq!(cache.get(MAIN), None);

    let events = h.drain();
    assert_eq!(errors(&events).len(), 1);
    let progress = progress_values(&events);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
}

#[tokio::test]
async fn second_attempt_match_lets_the_run_continue() {
    let good = b"the truth".to_vec();
    let transport = healthy_transport().with(
        MAIN,
        ScriptedAsset {
            size: Some(9),
            etag: Some(md5_hex(&good)),
            bodies: vec![b"corrupted".to_vec(), good],
        },
    );
    let mut h = Harness::new(transport, always(true));

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert_eq!(outcome, UpdateOutcome::Completed);
    assert_eq!(h.transport().fetch_count(MAIN), 2);
    assert_eq!(h.transport().fetch_count(NATIVE), 1);
    let tally = h.orchestrator.tally();
    assert_eq!(tally.downloaded, tally.total);
}

#[tokio::test]
async fn short_body_on_unverified_host_is_retried_then_fatal() {
    let transport = healthy_transport().with(
        LIB,
        ScriptedAsset {
            size: Some(100),
            etag: None,
            bodies: vec![b"truncated".to_vec()],
        },
    );
    let mut h = Harness::new(transport, always(true));

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert!(matches!(outcome, UpdateOutcome::Failed(_)));
    assert_eq!(h.transport().fetch_count(LIB), 3);
    // Files fetched before the failure stay on disk.
    assert!(h.layout.bin_dir().join(MAIN).is_file());
}

#[tokio::test]
async fn unverified_host_tags_are_not_checked_against_the_body() {
    let transport = healthy_transport().with(
        LIB,
        ScriptedAsset::good(b"library".to_vec(), Some("not-an-md5".into())),
    );
    let mut h = Harness::new(transport, always(true));

    assert_eq!(
        h.orchestrator.run(&request("1.2.5")).await,
        UpdateOutcome::Completed
    );
    assert_eq!(h.transport().fetch_count(LIB), 1);
}

#[tokio::test]
async fn cached_files_are_skipped_and_credited() {
    let mut h = Harness::new(healthy_transport(), always(true));
    let bin = h.layout.bin_dir();
    std::fs::create_dir_all(&bin).unwrap();
    std::fs::write(bin.join(LIB), b"library").unwrap();
    let mut cache = DownloadCache::new(h.layout.cache_file());
    cache.set(LIB, "dropbox-rev-7");
    cache.save().await.unwrap();

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert_eq!(outcome, UpdateOutcome::Completed);
    assert_eq!(h.transport().fetch_count(LIB), 0);
    assert_eq!(h.transport().fetch_count(MAIN), 1);
    let tally = h.orchestrator.tally();
    assert_eq!(tally.downloaded, tally.total);

    let heads = h.transport().heads.lock().unwrap().clone();
    assert!(heads.contains(&(LIB.to_owned(), Some("dropbox-rev-7".to_owned()))));
    assert!(heads.contains(&(MAIN.to_owned(), None)));
}

#[tokio::test]
async fn cached_tag_without_file_is_not_sent() {
    let mut h = Harness::new(healthy_transport(), always(true));
    let mut cache = DownloadCache::new(h.layout.cache_file());
    cache.set(LIB, "dropbox-rev-7");
    cache.save().await.unwrap();

    h.orchestrator.run(&request("1.2.5")).await;

    assert_eq!(h.transport().fetch_count(LIB), 1);
    let heads = h.transport().heads.lock().unwrap().clone();
    assert!(heads.contains(&(LIB.to_owned(), None)));
}

#[tokio::test]
async fn force_update_ignores_marker_and_cache() {
    let mut h = Harness::new(healthy_transport(), always(false));
    VersionMarker::new(&h.layout).write("1.2.5").await.unwrap();
    let bin = h.layout.bin_dir();
    std::fs::write(bin.join(LIB), b"library").unwrap();
    let mut cache = DownloadCache::new(h.layout.cache_file());
    cache.set(LIB, "dropbox-rev-7");
    cache.save().await.unwrap();

    let mut req = request("1.2.5");
    req.force_update = true;
    let outcome = h.orchestrator.run(&req).await;

    // The declining prompt is never consulted when forcing.
    assert_eq!(outcome, UpdateOutcome::Completed);
    assert_eq!(h.transport().fetch_count(LIB), 1);
    let heads = h.transport().heads.lock().unwrap().clone();
    assert!(heads.iter().all(|(_, tag)| tag.is_none()));
}

#[tokio::test]
async fn declining_the_update_cancels_cleanly() {
    let mut h = Harness::new(healthy_transport(), always(false));
    VersionMarker::new(&h.layout).write("1.0").await.unwrap();

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert_eq!(outcome, UpdateOutcome::Cancelled);
    assert_eq!(h.orchestrator.state(), UpdateState::Cancelled);
    assert_eq!(h.transport().head_count(), 0);
    assert!(errors(&h.drain()).is_empty());
    assert_eq!(
        VersionMarker::new(&h.layout).read().await.as_deref(),
        Some("1.0")
    );
}

#[tokio::test]
async fn cancel_flag_stops_the_run_between_steps() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let tmp = tempfile::tempdir().unwrap();
    let layout = InstanceLayout::new(tmp.path());
    VersionMarker::new(&layout).write("1.0").await.unwrap();

    let flag = Arc::new(AtomicBool::new(false));
    let prompt_flag = flag.clone();
    let prompt: Arc<dyn UpdatePrompt> = Arc::new(move |_: &str| {
        prompt_flag.store(true, Ordering::SeqCst);
        true
    });
    let mut orchestrator =
        UpdateOrchestrator::new(layout, &config(), healthy_transport(), prompt, tx)
            .with_platform(Platform::Linux);
    orchestrator.cancel_flag = flag;

    let outcome = orchestrator.run(&request("1.2.5")).await;

    assert_eq!(outcome, UpdateOutcome::Cancelled);
    assert_eq!(orchestrator.transport.head_count(), 0);
}

#[tokio::test]
async fn unsupported_platform_reports_and_cancels() {
    let mut h = Harness::new(healthy_transport(), always(true));
    h.orchestrator.platform = Platform::Other("haiku");

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert_eq!(outcome, UpdateOutcome::Cancelled);
    assert_eq!(h.orchestrator.state(), UpdateState::Cancelled);
    let errors = errors(&h.drain());
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("not supported"));
    assert_eq!(h.transport().head_count(), 0);
}

#[tokio::test]
async fn head_failure_is_fatal_with_details() {
    let mut transport = healthy_transport();
    transport.assets.remove(LIB);
    let mut h = Harness::new(transport, always(true));

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    match outcome {
        UpdateOutcome::Failed(message) => {
            assert!(message.starts_with("An error occurred when downloading packages."));
            assert!(message.contains("lwjgl.jar"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.transport().total_fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refetching_main_asset_drops_stale_backup() {
    let mut h = Harness::new(healthy_transport(), always(true));
    let backup = h.layout.backup_jar();
    std::fs::create_dir_all(backup.parent().unwrap()).unwrap();
    std::fs::write(&backup, b"pristine").unwrap();

    h.orchestrator.run(&request("1.2.5")).await;

    assert!(!backup.exists());
}

#[tokio::test]
async fn unknown_size_is_accepted_without_hash_gate() {
    let transport = healthy_transport().with(
        MAIN,
        ScriptedAsset {
            size: None,
            etag: Some(md5_hex(b"the truth")),
            bodies: vec![b"something else".to_vec()],
        },
    );
    let mut h = Harness::new(transport, always(true));

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert_eq!(outcome, UpdateOutcome::Completed);
    assert_eq!(h.transport().fetch_count(MAIN), 1);
    let mut cache = DownloadCache::new(h.layout.cache_file());
    cache.load().await.unwrap();
    assert_eq!(cache.get(MAIN), Some(md5_hex(b"the truth").as_str()));
    let tally = h.orchestrator.tally();
    assert_eq!(tally.downloaded, tally.total);
}

#[tokio::test]
async fn cancel_raised_before_run_is_honored_once() {
    let mut h = Harness::new(healthy_transport(), always(true));
    h.orchestrator.cancel_handle().store(true, Ordering::SeqCst);

    let outcome = h.orchestrator.run(&request("1.2.5")).await;

    assert_eq!(outcome, UpdateOutcome::Cancelled);
    assert_eq!(h.transport().head_count(), 0);
    assert!(!h.orchestrator.cancel_handle().load(Ordering::SeqCst));

    let outcome = h.orchestrator.run(&request("1.2.5")).await;
    assert_eq!(outcome, UpdateOutcome::Completed);
}
