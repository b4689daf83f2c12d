//! Background self-update
//!
//! On every tick the scheduler starts at most one check: fetch the
//! manifest, compare versions, download and gunzip the newer build, verify
//! its SHA-256 and stage it. The running executable is never touched;
//! installing the staged build is left to whatever restarts the bridge.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use semver::Version;
use serde::Deserialize;
use serialbridge_core::api::UpdateInfo;
use serialbridge_core::BridgeError;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors from the update source or the staging step
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("invalid version '{version}': {source}")]
    Version {
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Manifest published next to every build
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdateManifest {
    #[serde(rename = "Version")]
    pub version: String,
    /// Hex SHA-256 of the uncompressed binary
    #[serde(rename = "Sha256")]
    pub sha256: String,
}

/// Where update manifests and builds come from
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn manifest(&self) -> Result<UpdateManifest, UpdateError>;

    /// Gzipped build for `version`
    async fn download(&self, version: &str) -> Result<Bytes, UpdateError>;
}

/// Platform tag used in update URLs, e.g. `linux-x86_64`
pub fn platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Update source over HTTP
///
/// Manifest: `{url}/{app}/{platform}.json`; build:
/// `{url}/{app}/{version}/{platform}.gz`.
pub struct HttpUpdateSource {
    client: reqwest::Client,
    base_url: String,
    app_name: String,
    platform: String,
}

impl HttpUpdateSource {
    pub fn new(base_url: &str, app_name: &str) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("serialbridged/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_name: app_name.to_string(),
            platform: platform(),
        })
    }

    pub fn manifest_url(&self) -> String {
        format!("{}/{}/{}.json", self.base_url, self.app_name, self.platform)
    }

    pub fn archive_url(&self, version: &str) -> String {
        format!(
            "{}/{}/{}/{}.gz",
            self.base_url, self.app_name, version, self.platform
        )
    }

    async fn get(&self, url: String) -> Result<reqwest::Response, UpdateError> {
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn manifest(&self) -> Result<UpdateManifest, UpdateError> {
        Ok(self.get(self.manifest_url()).await?.json().await?)
    }

    async fn download(&self, version: &str) -> Result<Bytes, UpdateError> {
        Ok(self.get(self.archive_url(version)).await?.bytes().await?)
    }
}

/// Shared record of update activity
#[derive(Debug)]
pub struct UpdateState {
    current: Version,
    in_progress: AtomicBool,
    /// Unix seconds of the last completed manifest fetch; 0 when never
    last_check: AtomicU64,
    staged: RwLock<Option<Version>>,
}

impl UpdateState {
    pub fn new(current: Version) -> Self {
        Self {
            current,
            in_progress: AtomicBool::new(false),
            last_check: AtomicU64::new(0),
            staged: RwLock::new(None),
        }
    }

    pub fn current(&self) -> &Version {
        &self.current
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn staged(&self) -> Option<Version> {
        self.staged.read().ok().and_then(|staged| staged.clone())
    }

    pub fn info(&self, enabled: bool) -> UpdateInfo {
        let last_check = self.last_check.load(Ordering::Relaxed);
        UpdateInfo {
            enabled,
            in_progress: self.in_progress(),
            last_check: (last_check > 0).then_some(last_check),
            staged_version: self.staged().map(|v| v.to_string()),
        }
    }

    fn mark_checked(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.last_check.store(now, Ordering::Relaxed);
    }
}

/// Clears the in-progress flag when an attempt ends, however it ends
struct InProgress(Arc<UpdateState>);

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Periodic check-and-stage driver
pub struct Updater {
    source: Arc<dyn UpdateSource>,
    state: Arc<UpdateState>,
    staging_dir: PathBuf,
    binary_name: String,
}

impl Updater {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        state: Arc<UpdateState>,
        staging_dir: PathBuf,
        binary_name: &str,
    ) -> Self {
        Self {
            source,
            state,
            staging_dir,
            binary_name: binary_name.to_string(),
        }
    }

    pub fn state(&self) -> &Arc<UpdateState> {
        &self.state
    }

    /// Start an attempt in the background unless one is already running
    pub fn try_start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .state
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Update attempt still in progress, skipping this tick");
            return None;
        }

        let guard = InProgress(Arc::clone(&self.state));
        let updater = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _guard = guard;
            match updater.check_and_stage().await {
                Ok(Some(version)) => info!(
                    "Update {} staged in {}; restart to apply",
                    version,
                    updater.staging_dir.display()
                ),
                Ok(None) => debug!("No update available"),
                Err(e) => warn!("{}", e),
            }
        }))
    }

    /// One full attempt. Returns the staged version, if any.
    pub async fn check_and_stage(&self) -> Result<Option<Version>, BridgeError> {
        let manifest = self
            .source
            .manifest()
            .await
            .map_err(|e| BridgeError::UpdateCheckFailed(e.to_string()))?;
        self.state.mark_checked();

        let latest = Version::parse(manifest.version.trim_start_matches('v')).map_err(|source| {
            BridgeError::UpdateCheckFailed(
                UpdateError::Version {
                    version: manifest.version.clone(),
                    source,
                }
                .to_string(),
            )
        })?;

        if latest <= self.state.current || self.state.staged().as_ref() == Some(&latest) {
            return Ok(None);
        }
        info!("Update available: {} -> {}", self.state.current, latest);

        self.stage(&manifest, &latest)
            .await
            .map_err(|e| BridgeError::UpdateApplyFailed(e.to_string()))?;

        if let Ok(mut staged) = self.state.staged.write() {
            *staged = Some(latest.clone());
        }
        Ok(Some(latest))
    }

    async fn stage(&self, manifest: &UpdateManifest, version: &Version) -> Result<(), UpdateError> {
        let archive = self.source.download(&manifest.version).await?;
        let expected = manifest.sha256.trim().to_lowercase();

        let binary = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, UpdateError> {
            let binary = gunzip(&archive)?;
            let actual = sha256_hex(&binary);
            if actual != expected {
                return Err(UpdateError::Checksum { expected, actual });
            }
            Ok(binary)
        })
        .await
        .map_err(|e| UpdateError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let target = self.staged_path(version);
        let partial = self
            .staging_dir
            .join(format!(".{}-{}.partial", self.binary_name, version));
        tokio::fs::write(&partial, &binary).await?;
        make_executable(&partial).await?;
        tokio::fs::rename(&partial, &target).await?;
        debug!("Staged {} bytes at {}", binary.len(), target.display());
        Ok(())
    }

    /// Path a given version is staged at
    pub fn staged_path(&self, version: &Version) -> PathBuf {
        self.staging_dir.join(format!("{}-{}", self.binary_name, version))
    }

    /// Start an attempt every `interval` until `shutdown` flips
    pub async fn run_scheduler(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Update checks every {}s", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.try_start();
                }
            }
        }
        debug!("Update scheduler stopped");
    }
}

fn gunzip(archive: &[u8]) -> Result<Vec<u8>, UpdateError> {
    let mut decoder = GzDecoder::new(archive);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
