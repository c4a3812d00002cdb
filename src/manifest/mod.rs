use std::collections::HashSet;
use std::fmt;

use log::debug;
use reqwest::Url;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Operating system the native bundle is picked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
    Other(&'static str),
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other(std::env::consts::OS)
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Other(name) => name,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Whether the host's ETag can be checked against the body hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustDomain {
    Verified,
    Unverified,
}

impl TrustDomain {
    fn from_flag(verify: bool) -> Self {
        if verify {
            TrustDomain::Verified
        } else {
            TrustDomain::Unverified
        }
    }
}

/// One remote file to keep in sync. Identified by `file_name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetRef {
    pub url: String,
    pub file_name: String,
    /// Size reported by the HEAD request; `None` until requested or when the host omits it.
    pub size: Option<u64>,
    pub cached_tag: Option<String>,
    pub domain: TrustDomain,
}

impl AssetRef {
    fn new(url: Url, domain: TrustDomain) -> SyncResult<Self> {
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| SyncError::InvalidUrl {
                url: url.to_string(),
                message: "URL has no file name".into(),
            })?;
        Ok(Self {
            url: url.to_string(),
            file_name,
            size: None,
            cached_tag: None,
            domain,
        })
    }
}

/// Builds the ordered asset list: main archive, libraries, native bundle last.
#[derive(Clone, Debug)]
pub struct AssetManifestResolver {
    main_base: String,
    main_domain: TrustDomain,
    library_base: String,
    library_domain: TrustDomain,
    libraries: Vec<String>,
    native_bundles: Vec<(String, String)>,
}

impl AssetManifestResolver {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            main_base: config.main_base_url.clone(),
            main_domain: TrustDomain::from_flag(config.main_verify_etag),
            library_base: config.library_base_url.clone(),
            library_domain: TrustDomain::from_flag(config.library_verify_etag),
            libraries: config.libraries.clone(),
            native_bundles: config
                .native_bundles
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn native_bundle(&self, platform: Platform) -> SyncResult<&str> {
        if let Platform::Other(name) = platform {
            return Err(SyncError::UnsupportedPlatform(name.to_owned()));
        }
        self.native_bundles
            .iter()
            .find(|(key, _)| key == platform.key())
            .map(|(_, bundle)| bundle.as_str())
            .ok_or_else(|| SyncError::UnsupportedPlatform(platform.key().to_owned()))
    }

    /// `main_asset` may be a name relative to the main host, an absolute URL,
    /// and may contain a `{version}` placeholder.
    pub fn resolve(
        &self,
        main_asset: &str,
        version: &str,
        platform: Platform,
    ) -> SyncResult<Vec<AssetRef>> {
        let native = self.native_bundle(platform)?;
        let main_base = parse_base(&self.main_base)?;
        let library_base = parse_base(&self.library_base)?;

        let main_name = main_asset.replace("{version}", version);
        let mut assets = vec![AssetRef::new(
            join(&main_base, &main_name)?,
            self.main_domain,
        )?];
        for library in &self.libraries {
            assets.push(AssetRef::new(
                join(&library_base, library)?,
                self.library_domain,
            )?);
        }
        assets.push(AssetRef::new(
            join(&library_base, native)?,
            self.library_domain,
        )?);

        let mut seen = HashSet::new();
        for asset in &assets {
            if !seen.insert(asset.file_name.as_str()) {
                return Err(SyncError::InvalidManifest(format!(
                    "{} is listed more than once",
                    asset.file_name
                )));
            }
        }
        debug!(
            "manifest: resolved {} assets for {platform}: {:?}",
            assets.len(),
            assets.iter().map(|a| &a.file_name).collect::<Vec<_>>()
        );
        Ok(assets)
    }
}

fn parse_base(base: &str) -> SyncResult<Url> {
    Url::parse(base).map_err(|e| SyncError::InvalidUrl {
        url: base.to_owned(),
        message: e.to_string(),
    })
}

fn join(base: &Url, name: &str) -> SyncResult<Url> {
    base.join(name).map_err(|e| SyncError::InvalidUrl {
        url: format!("{base}{name}"),
        message: e.to_string(),
    })
}
