//! Peer-to-peer self update.
//!
//! A node asks a peer for its version and, if the peer is newer, pulls the
//! peer's distributable package. Packages claiming the main developer must
//! carry a valid Ed25519 signature; a bad one is refused outright. Any other
//! developer needs explicit confirmation. Installation keeps a rollback point
//! and restores it if the trial run or the swap fails.

use std::cmp::Ordering;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use lanshare_shared::constants::{APP_VERSION, MAIN_DEVELOPER_ID};
use lanshare_shared::identity::verify_signature;
use lanshare_shared::protocol::{FrameKind, Preamble, UpdateOffer, VersionInfo};
use lanshare_shared::retry::RetryPolicy;
use lanshare_shared::types::compare_versions;
use lanshare_store::Journal;

use crate::bandwidth::BandwidthGovernor;
use crate::devices::DeviceManager;
use crate::error::{NetError, TrustError};
use crate::notify::{Notification, Notifier};
use crate::transfer::copy_chunked;
use crate::transport::Dialer;

const TRIAL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateState {
    Idle,
    Checking,
    PackageReceived,
    Verified,
    Unverified,
    AwaitingConfirmation,
    Installing,
    Installed,
    RolledBack,
    Refused,
    UpToDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    /// Main developer, signature verified.
    Trusted,
    /// Someone else; needs confirmation.
    ThirdParty,
    /// Claims the main developer but the signature does not verify.
    Tampered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePackage {
    pub version: String,
    pub developer_id: String,
    pub patch_notes: String,
    pub signature: String,
    pub payload_size: u64,
    pub path: PathBuf,
}

/// Sidecar file for packages installed by hand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateManifest {
    pub version: String,
    pub developer_id: String,
    #[serde(default)]
    pub patch_notes: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Installed { version: String },
}

/// Asks the user whether a third-party package may be installed.
pub trait UpdateConfirmer: Send + Sync {
    fn confirm<'a>(&'a self, package: &'a UpdatePackage) -> BoxFuture<'a, bool>;
}

/// Confirmer for unattended nodes: third-party packages are never installed.
pub struct DeclineThirdParty;

impl UpdateConfirmer for DeclineThirdParty {
    fn confirm<'a>(&'a self, package: &'a UpdatePackage) -> BoxFuture<'a, bool> {
        info!(
            version = %package.version,
            developer = %package.developer_id,
            "Third-party update declined (no one to confirm)"
        );
        Box::pin(async { false })
    }
}

/// Replaces the running program.
pub trait Installer: Send + Sync {
    /// Keep a copy of the current program as the rollback point.
    fn backup(&self) -> BoxFuture<'_, io::Result<()>>;
    /// Run the candidate in isolation and fail if it misbehaves.
    fn trial<'a>(&'a self, package: &'a Path) -> BoxFuture<'a, io::Result<()>>;
    fn install_and_restart<'a>(&'a self, package: &'a Path) -> BoxFuture<'a, io::Result<()>>;
    /// Put the rollback point back.
    fn restore(&self) -> BoxFuture<'_, io::Result<()>>;
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

async fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Installer that swaps an executable file on disk.
pub struct ExecutableInstaller {
    executable: PathBuf,
    rollback: PathBuf,
    trial_timeout: Duration,
    relaunch: bool,
}

impl ExecutableInstaller {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        Self {
            rollback: with_suffix(&executable, ".rollback"),
            executable,
            trial_timeout: TRIAL_TIMEOUT,
            relaunch: true,
        }
    }

    pub fn for_current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_relaunch(mut self, relaunch: bool) -> Self {
        self.relaunch = relaunch;
        self
    }

    pub fn with_trial_timeout(mut self, timeout: Duration) -> Self {
        self.trial_timeout = timeout;
        self
    }

    async fn run_trial(&self, package: &Path) -> io::Result<()> {
        let sandbox = std::env::temp_dir().join(format!("lanshare-trial-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&sandbox).await?;
        let result = self.run_trial_in(&sandbox, package).await;
        let _ = tokio::fs::remove_dir_all(&sandbox).await;
        result
    }

    async fn run_trial_in(&self, sandbox: &Path, package: &Path) -> io::Result<()> {
        let candidate = sandbox.join("candidate");
        tokio::fs::copy(package, &candidate).await?;
        make_executable(&candidate).await?;

        let run = tokio::process::Command::new(&candidate)
            .arg("--version")
            .current_dir(sandbox)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.trial_timeout, run)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "trial run timed out"))??;

        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("trial run exited with {}", output.status),
            ));
        }
        debug!(
            output = %String::from_utf8_lossy(&output.stdout).trim(),
            "Trial run passed"
        );
        Ok(())
    }
}

impl Installer for ExecutableInstaller {
    fn backup(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            tokio::fs::copy(&self.executable, &self.rollback).await?;
            Ok(())
        })
    }

    fn trial<'a>(&'a self, package: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(self.run_trial(package))
    }

    fn install_and_restart<'a>(&'a self, package: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let staged = with_suffix(&self.executable, ".new");
            tokio::fs::copy(package, &staged).await?;
            make_executable(&staged).await?;
            tokio::fs::rename(&staged, &self.executable).await?;
            info!(exe = %self.executable.display(), "Executable replaced");
            if self.relaunch {
                tokio::process::Command::new(&self.executable).spawn()?;
            }
            Ok(())
        })
    }

    fn restore(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            tokio::fs::copy(&self.rollback, &self.executable).await?;
            make_executable(&self.executable).await
        })
    }
}

/// Package this node hands to peers that ask for an update.
#[derive(Debug, Clone)]
pub struct PackageSource {
    pub path: PathBuf,
    pub patch_notes: String,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub current_version: String,
    pub developer_id: String,
    pub main_developer_id: String,
    /// Ed25519 public key of the main developer. Without it no package can
    /// be trusted.
    pub main_developer_key: Option<[u8; 32]>,
    pub package: Option<PackageSource>,
    pub staging_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl UpdateConfig {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            current_version: APP_VERSION.to_string(),
            developer_id: MAIN_DEVELOPER_ID.to_string(),
            main_developer_id: MAIN_DEVELOPER_ID.to_string(),
            main_developer_key: None,
            package: None,
            staging_dir: staging_dir.into(),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct UpdateCoordinator {
    local_id: String,
    devices: Arc<DeviceManager>,
    dialer: Arc<dyn Dialer>,
    journal: Journal,
    notifier: Notifier,
    governor: Arc<BandwidthGovernor>,
    installer: Arc<dyn Installer>,
    confirmer: Arc<dyn UpdateConfirmer>,
    state: RwLock<UpdateState>,
    downloaded: AtomicU64,
    download_total: AtomicU64,
    config: UpdateConfig,
}

impl UpdateCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        devices: Arc<DeviceManager>,
        dialer: Arc<dyn Dialer>,
        journal: Journal,
        notifier: Notifier,
        governor: Arc<BandwidthGovernor>,
        installer: Arc<dyn Installer>,
        confirmer: Arc<dyn UpdateConfirmer>,
        config: UpdateConfig,
    ) -> Self {
        Self {
            local_id: devices.local_id().to_string(),
            devices,
            dialer,
            journal,
            notifier,
            governor,
            installer,
            confirmer,
            state: RwLock::new(UpdateState::Idle),
            downloaded: AtomicU64::new(0),
            download_total: AtomicU64::new(0),
            config,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state.read().map(|s| *s).unwrap_or(UpdateState::Idle)
    }

    fn set_state(&self, state: UpdateState) {
        if let Ok(mut current) = self.state.write() {
            debug!(from = ?*current, to = ?state, "Update state");
            *current = state;
        }
    }

    /// Fraction of the current package download, 0.0 when idle.
    pub fn download_progress(&self) -> f64 {
        let total = self.download_total.load(AtomicOrdering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.downloaded.load(AtomicOrdering::Relaxed) as f64 / total as f64
    }

    fn log_activity(&self, action: &str, version: &str, developer: &str, success: bool) {
        if let Err(e) = self.journal.with(|db| {
            db.insert_update_activity(&self.local_id, action, version, developer, success)
        }) {
            warn!(action, error = %e, "Failed to log update activity");
        }
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    /// Compare versions with `peer` and install its package if it is newer.
    pub async fn check_for_update(&self, peer: &str) -> Result<UpdateOutcome, NetError> {
        self.set_state(UpdateState::Checking);
        let result = self.check_and_fetch(peer).await;
        if result.is_err() && self.state() == UpdateState::Checking {
            self.set_state(UpdateState::Idle);
        }
        result
    }

    async fn check_and_fetch(&self, peer: &str) -> Result<UpdateOutcome, NetError> {
        let remote = self
            .config
            .retry
            .run("version_query", |_| self.query_version(peer))
            .await
            .map_err(|e| {
                self.log_activity("Check", &self.config.current_version, peer, false);
                e
            })?;
        self.log_activity("Check", &remote.version, &remote.developer_id, true);

        if compare_versions(&remote.version, &self.config.current_version)? != Ordering::Greater {
            info!(peer = %peer, remote = %remote.version, "Already up to date");
            self.set_state(UpdateState::UpToDate);
            self.notifier.emit(Notification::UpToDate);
            return Ok(UpdateOutcome::UpToDate);
        }

        info!(peer = %peer, version = %remote.version, developer = %remote.developer_id, "Update available");
        self.notifier.emit(Notification::UpdateAvailable {
            version: remote.version.clone(),
            developer: remote.developer_id.clone(),
        });

        let package = self
            .config
            .retry
            .run("update_download", |_| self.download(peer, &remote))
            .await?;
        self.set_state(UpdateState::PackageReceived);
        self.apply_update(package).await
    }

    async fn query_version(&self, peer: &str) -> Result<VersionInfo, NetError> {
        let addr = self.devices.resolve(peer)?;
        let mut stream = self.dialer.dial(addr).await?;
        Preamble::write_to(&mut stream, &self.local_id, FrameKind::Version).await?;
        VersionInfo {
            version: self.config.current_version.clone(),
            developer_id: self.config.developer_id.clone(),
        }
        .write_to(&mut stream)
        .await?;
        stream.flush().await?;
        let remote = VersionInfo::read_from(&mut stream).await?;
        stream.finish().await?;
        Ok(remote)
    }

    async fn download(&self, peer: &str, remote: &VersionInfo) -> Result<UpdatePackage, NetError> {
        let addr = self.devices.resolve(peer)?;
        let mut stream = self.dialer.dial(addr).await?;
        Preamble::write_to(&mut stream, &self.local_id, FrameKind::Update).await?;
        stream.flush().await?;

        let offer = UpdateOffer::read_from(&mut stream).await?;
        if offer.payload_size == 0 {
            return Err(NetError::Rejected(format!("{peer} has no update package")));
        }

        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        let path = self
            .config
            .staging_dir
            .join(format!("update_{}.bin", remote.version));
        let mut file = tokio::fs::File::create(&path).await?;
        let mut throttle = self.governor.throttle();
        self.downloaded.store(0, AtomicOrdering::Relaxed);
        self.download_total
            .store(offer.payload_size, AtomicOrdering::Relaxed);
        copy_chunked(
            &mut stream,
            &mut file,
            offer.payload_size,
            &mut throttle,
            None,
            |done| self.downloaded.store(done, AtomicOrdering::Relaxed),
        )
        .await?;
        file.sync_all().await?;
        stream.finish().await?;

        debug!(path = %path.display(), size = offer.payload_size, "Update package downloaded");
        Ok(UpdatePackage {
            version: remote.version.clone(),
            developer_id: remote.developer_id.clone(),
            patch_notes: offer.patch_notes,
            signature: offer.signature,
            payload_size: offer.payload_size,
            path,
        })
    }

    /// Install a package delivered by hand, described by a JSON manifest.
    pub async fn install_from_file(
        &self,
        package: &Path,
        manifest: &Path,
    ) -> Result<UpdateOutcome, NetError> {
        let raw = tokio::fs::read_to_string(manifest).await?;
        let manifest: UpdateManifest =
            serde_json::from_str(&raw).map_err(|e| NetError::Manifest(e.to_string()))?;
        let payload_size = tokio::fs::metadata(package).await?.len();
        self.set_state(UpdateState::PackageReceived);
        self.apply_update(UpdatePackage {
            version: manifest.version,
            developer_id: manifest.developer_id,
            patch_notes: manifest.patch_notes,
            signature: manifest.signature,
            payload_size,
            path: package.to_path_buf(),
        })
        .await
    }

    // ------------------------------------------------------------------
    // Trust gate and install
    // ------------------------------------------------------------------

    pub async fn assess_trust(&self, package: &UpdatePackage) -> TrustVerdict {
        if package.developer_id != self.config.main_developer_id {
            return TrustVerdict::ThirdParty;
        }
        match &self.config.main_developer_key {
            Some(key) if verify_signature(&package.path, &package.signature, key).await => {
                TrustVerdict::Trusted
            }
            _ => TrustVerdict::Tampered,
        }
    }

    /// Run the trust gate, then install.
    pub async fn apply_update(&self, package: UpdatePackage) -> Result<UpdateOutcome, NetError> {
        let version = package.version.clone();
        let developer = package.developer_id.clone();

        match self.assess_trust(&package).await {
            TrustVerdict::Trusted => {
                self.set_state(UpdateState::Verified);
                self.log_activity("Verify", &version, &developer, true);
            }
            TrustVerdict::Tampered => {
                self.set_state(UpdateState::Refused);
                self.log_activity("Verify", &version, &developer, false);
                warn!(version = %version, developer = %developer, "Tampered update refused");
                self.notifier.emit(Notification::UpdateRefused {
                    version: version.clone(),
                    reason: "signature does not match the main developer".into(),
                });
                return Err(TrustError::Tampered { version, developer }.into());
            }
            TrustVerdict::ThirdParty => {
                self.set_state(UpdateState::Unverified);
                self.set_state(UpdateState::AwaitingConfirmation);
                if !self.confirmer.confirm(&package).await {
                    self.set_state(UpdateState::Refused);
                    self.log_activity("Confirm", &version, &developer, false);
                    self.notifier.emit(Notification::UpdateRefused {
                        version: version.clone(),
                        reason: format!("third-party package from {developer} not confirmed"),
                    });
                    return Err(TrustError::NotConfirmed { version, developer }.into());
                }
                self.log_activity("Confirm", &version, &developer, true);
            }
        }

        self.install(&package).await
    }

    /// Back up, trial, swap. Any failure after the backup restores it.
    pub async fn install(&self, package: &UpdatePackage) -> Result<UpdateOutcome, NetError> {
        let version = &package.version;
        let developer = &package.developer_id;
        self.set_state(UpdateState::Installing);

        if let Err(e) = self.installer.backup().await {
            // Nothing has been touched yet, so there is nothing to roll back.
            self.set_state(UpdateState::Refused);
            self.log_activity("Backup", version, developer, false);
            error!(error = %e, "Cannot create rollback point, update aborted");
            self.notifier.emit(Notification::UpdateRefused {
                version: version.clone(),
                reason: format!("cannot create rollback point: {e}"),
            });
            return Err(NetError::Install(e.to_string()));
        }

        let attempt = async {
            self.installer.trial(&package.path).await?;
            self.installer.install_and_restart(&package.path).await
        };
        if let Err(e) = attempt.await {
            error!(version = %version, error = %e, "Update install failed");
            self.log_activity("Apply", version, developer, false);
            self.rollback(version, developer).await;
            return Err(NetError::Install(e.to_string()));
        }

        self.set_state(UpdateState::Installed);
        self.log_activity("Apply", version, developer, true);
        info!(version = %version, "Update installed");
        self.notifier.emit(Notification::UpdateInstalled {
            version: version.clone(),
        });
        Ok(UpdateOutcome::Installed {
            version: version.clone(),
        })
    }

    /// Restore the rollback point.
    pub async fn rollback(&self, version: &str, developer: &str) {
        match self.installer.restore().await {
            Ok(()) => {
                self.set_state(UpdateState::RolledBack);
                self.log_activity("Rollback", version, developer, true);
                self.notifier.emit(Notification::UpdateRolledBack {
                    version: version.to_string(),
                });
            }
            Err(e) => {
                self.set_state(UpdateState::RolledBack);
                self.log_activity("Rollback", version, developer, false);
                error!(error = %e, "Rollback failed, executable may be damaged");
            }
        }
    }

    // ------------------------------------------------------------------
    // Serving side
    // ------------------------------------------------------------------

    /// Inbound VERSION: read the asker's version, answer with ours.
    pub async fn handle_version_query<S>(&self, sender_id: &str, stream: &mut S) -> Result<(), NetError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let asker = VersionInfo::read_from(stream).await?;
        debug!(sender = %sender_id, version = %asker.version, "Version query");
        VersionInfo {
            version: self.config.current_version.clone(),
            developer_id: self.config.developer_id.clone(),
        }
        .write_to(stream)
        .await?;
        stream.flush().await?;
        Ok(())
    }

    /// Inbound UPDATE: stream our package, or an empty offer if we have none.
    pub async fn serve_package<S>(&self, stream: &mut S) -> Result<(), NetError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(source) = &self.config.package else {
            UpdateOffer {
                patch_notes: String::new(),
                signature: String::new(),
                payload_size: 0,
            }
            .write_to(stream)
            .await?;
            stream.flush().await?;
            return Ok(());
        };

        let mut file = tokio::fs::File::open(&source.path).await?;
        let size = file.metadata().await?.len();
        UpdateOffer {
            patch_notes: source.patch_notes.clone(),
            signature: source.signature.clone(),
            payload_size: size,
        }
        .write_to(stream)
        .await?;
        let mut throttle = self.governor.throttle();
        copy_chunked(&mut file, stream, size, &mut throttle, None, |_| {}).await?;
        info!(size, "Update package served");
        Ok(())
    }
}
