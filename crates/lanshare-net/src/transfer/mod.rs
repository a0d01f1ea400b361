//! File transfer engine.
//!
//! Outbound jobs run on a bounded worker pool, retry whole sends on
//! transport failure and can be cancelled at any point. Inbound files are
//! offered to a [`ReceiveConfirmer`] unless auto-accept is on, hashed while
//! written to a per-job `.part` file and only replace the destination once
//! the hash matches.

mod archive;
mod receive;
mod send;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use lanshare_shared::constants::{CHUNK_SIZE, TRANSFER_WORKERS};
use lanshare_shared::crypto::Sha256Stream;
use lanshare_shared::protocol::FileHeader;
use lanshare_shared::retry::RetryPolicy;
use lanshare_shared::types::Direction;
use lanshare_store::{FileVersionRecord, Journal};

use crate::bandwidth::{BandwidthGovernor, Throttle};
use crate::devices::DeviceManager;
use crate::error::NetError;
use crate::notify::{Notification, Notifier};
use crate::pool::WorkerPool;
use crate::transport::Dialer;

pub use archive::zip_directory;
pub use receive::ReceivedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(pub Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    InProgress,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    pub id: JobId,
    pub file_name: String,
    pub total_size: u64,
    pub content_hash: String,
    pub tags: String,
    pub metadata: String,
    pub direction: Direction,
    /// Peer name for sends, sender id for receives.
    pub peer: String,
    /// 0.0 to 1.0, never decreasing.
    pub progress: f64,
    pub state: JobState,
}

/// Outcome of a completed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub job_id: JobId,
    pub file_name: String,
    pub size: u64,
    pub hash: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Where received files land.
    pub save_dir: PathBuf,
    /// Where directory archives are built before sending.
    pub staging_dir: PathBuf,
    pub retry: RetryPolicy,
    pub workers: usize,
    /// Store inbound files without asking the confirmer.
    pub auto_accept: bool,
}

impl TransferConfig {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
            staging_dir: std::env::temp_dir().join("lanshare-staging"),
            retry: RetryPolicy::default(),
            workers: TRANSFER_WORKERS,
            auto_accept: true,
        }
    }
}

/// Asks the user whether an inbound file may be stored.
pub trait ReceiveConfirmer: Send + Sync {
    /// `from` is the sender's peer name when known, else its id.
    fn confirm<'a>(&'a self, from: &'a str, offer: &'a FileHeader) -> BoxFuture<'a, bool>;
}

/// Confirmer for unattended nodes with auto-accept off.
pub struct DeclineFiles;

impl ReceiveConfirmer for DeclineFiles {
    fn confirm<'a>(&'a self, from: &'a str, offer: &'a FileHeader) -> BoxFuture<'a, bool> {
        info!(from = %from, file = %offer.file_name, "Inbound file declined (no one to confirm)");
        Box::pin(async { false })
    }
}

/// A file ready to go out: either the user's file or a staged archive.
#[derive(Debug, Clone)]
struct Outgoing {
    path: PathBuf,
    file_name: String,
    size: u64,
    staged: bool,
}

pub struct TransferEngine {
    local_id: String,
    devices: Arc<DeviceManager>,
    dialer: Arc<dyn Dialer>,
    journal: Journal,
    notifier: Notifier,
    governor: Arc<BandwidthGovernor>,
    pool: WorkerPool,
    jobs: DashMap<JobId, TransferJob>,
    tasks: DashMap<JobId, AbortHandle>,
    /// One lock per destination name, held while versioning and renaming.
    finalize_locks: DashMap<String, Arc<Mutex<()>>>,
    confirmer: Arc<dyn ReceiveConfirmer>,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(
        devices: Arc<DeviceManager>,
        dialer: Arc<dyn Dialer>,
        journal: Journal,
        notifier: Notifier,
        governor: Arc<BandwidthGovernor>,
        confirmer: Arc<dyn ReceiveConfirmer>,
        config: TransferConfig,
    ) -> Self {
        Self {
            local_id: devices.local_id().to_string(),
            devices,
            dialer,
            journal,
            notifier,
            governor,
            pool: WorkerPool::new(config.workers),
            jobs: DashMap::new(),
            tasks: DashMap::new(),
            finalize_locks: DashMap::new(),
            confirmer,
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn governor(&self) -> &Arc<BandwidthGovernor> {
        &self.governor
    }

    /// Queue files and directories for `peer`, smallest first. Returns the
    /// job ids in execution order.
    pub async fn submit(
        self: &Arc<Self>,
        peer: &str,
        paths: &[PathBuf],
        tags: &str,
    ) -> Result<Vec<JobId>, NetError> {
        self.devices.resolve(peer)?;

        let mut outgoing = Vec::with_capacity(paths.len());
        for path in paths {
            match self.prepare(path).await {
                Ok(file) => outgoing.push(file),
                Err(e) => {
                    for file in outgoing.iter().filter(|f| f.staged) {
                        let _ = tokio::fs::remove_file(&file.path).await;
                    }
                    return Err(e);
                }
            }
        }
        outgoing.sort_by_key(|o| o.size);

        let mut ids = Vec::with_capacity(outgoing.len());
        for file in outgoing {
            let (id, job) = self.schedule(peer, file, tags);
            self.pool.spawn(job);
            ids.push(id);
        }
        info!(peer = %peer, count = ids.len(), "Transfers queued");
        Ok(ids)
    }

    /// Send one file or directory and wait for the receiver's verdict.
    pub async fn send_file(
        self: &Arc<Self>,
        peer: &str,
        path: &Path,
        tags: &str,
    ) -> Result<TransferReport, NetError> {
        self.devices.resolve(peer)?;
        let file = self.prepare(path).await?;
        let (_, job) = self.schedule(peer, file, tags);
        self.pool.run(job).await
    }

    /// Register a pending job and build its abortable future.
    fn schedule(
        self: &Arc<Self>,
        peer: &str,
        file: Outgoing,
        tags: &str,
    ) -> (
        JobId,
        impl std::future::Future<Output = Result<TransferReport, NetError>> + Send + 'static,
    ) {
        let id = JobId::new();
        self.jobs.insert(
            id,
            TransferJob {
                id,
                file_name: file.file_name.clone(),
                total_size: file.size,
                content_hash: String::new(),
                tags: tags.to_string(),
                metadata: String::new(),
                direction: Direction::Sent,
                peer: peer.to_string(),
                progress: 0.0,
                state: JobState::Pending,
            },
        );

        let (handle, registration) = AbortHandle::new_pair();
        self.tasks.insert(id, handle);

        // Owned by the future, so it also fires if the job is aborted
        // before it first runs.
        let guard = JobGuard {
            engine: self.clone(),
            id,
            staged: file.staged.then(|| file.path.clone()),
        };
        let engine = self.clone();
        let peer = peer.to_string();
        let tags = tags.to_string();
        let job = async move {
            let result = engine.run_send(id, &peer, &file, &tags).await;
            if let Err(e) = &result {
                engine.set_state(id, JobState::Failed);
                engine.report_failure(&file.file_name, e);
            }
            drop(guard);
            result
        };
        let job = async move {
            Abortable::new(job, registration)
                .await
                .unwrap_or(Err(NetError::Cancelled))
        };
        (id, job)
    }

    fn report_failure(&self, file: &str, e: &NetError) {
        warn!(file = %file, error = %e, "Transfer failed");
        let notification = match e {
            NetError::Integrity { .. } => Notification::IntegrityFailed {
                file: file.to_string(),
            },
            _ => Notification::TransferFailed {
                file: file.to_string(),
                reason: e.to_string(),
            },
        };
        self.notifier.emit(notification);
    }

    /// Zip directories into the staging area; plain files pass through.
    async fn prepare(&self, path: &Path) -> Result<Outgoing, NetError> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_dir() {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
            return Ok(Outgoing {
                path: path.to_path_buf(),
                file_name,
                size: meta.len(),
                staged: false,
            });
        }

        let root = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "directory has no name"))?;
        let file_name = format!("{root}.zip");
        let staging = self.config.staging_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&staging).await?;
        let archive = staging.join(&file_name);

        let (dir, out) = (path.to_path_buf(), archive.clone());
        tokio::task::spawn_blocking(move || zip_directory(&dir, &out))
            .await
            .map_err(io::Error::other)??;

        let size = tokio::fs::metadata(&archive).await?.len();
        info!(dir = %path.display(), archive = %file_name, size, "Directory archived");
        Ok(Outgoing {
            path: archive,
            file_name,
            size,
            staged: true,
        })
    }

    /// Abort a queued or running job. Returns false for unknown ids.
    pub fn cancel(&self, id: JobId) -> bool {
        let Some((_, handle)) = self.tasks.remove(&id) else {
            return false;
        };
        handle.abort();
        if let Some((_, job)) = self.jobs.remove(&id) {
            info!(job = %id, file = %job.file_name, "Transfer cancelled");
            self.notifier.emit(Notification::TransferCancelled {
                file: job.file_name,
            });
        }
        true
    }

    /// Snapshot of active jobs.
    pub fn jobs(&self) -> Vec<TransferJob> {
        self.jobs.iter().map(|j| j.value().clone()).collect()
    }

    pub fn job(&self, id: JobId) -> Option<TransferJob> {
        self.jobs.get(&id).map(|j| j.value().clone())
    }

    /// File name to progress for every active job.
    pub fn progress(&self) -> Vec<(String, f64)> {
        self.jobs
            .iter()
            .map(|j| (j.file_name.clone(), j.progress))
            .collect()
    }

    pub fn versions(&self) -> Result<Vec<FileVersionRecord>, NetError> {
        Ok(self.journal.with(|db| db.list_file_versions())?)
    }

    fn update_job(&self, id: JobId, f: impl FnOnce(&mut TransferJob)) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            f(&mut job);
        }
    }

    fn set_state(&self, id: JobId, state: JobState) {
        self.update_job(id, |job| job.state = state);
    }

    fn set_progress(&self, id: JobId, done: u64, total: u64) {
        let fraction = if total == 0 {
            1.0
        } else {
            done as f64 / total as f64
        };
        self.update_job(id, |job| job.progress = job.progress.max(fraction.min(1.0)));
    }

    /// Write to the journal; failures are logged and never abort a transfer.
    fn journal_write<T>(&self, what: &str, f: impl FnOnce(&lanshare_store::Database) -> lanshare_store::Result<T>) {
        if let Err(e) = self.journal.with(f) {
            warn!(record = what, error = %e, "Failed to write journal record");
        }
    }
}

/// Clears a job and its staged archive however the job ends.
struct JobGuard {
    engine: Arc<TransferEngine>,
    id: JobId,
    staged: Option<PathBuf>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.engine.jobs.remove(&self.id);
        self.engine.tasks.remove(&self.id);
        if let Some(path) = self.staged.take() {
            let _ = std::fs::remove_file(&path);
            if let Some(dir) = path.parent() {
                let _ = std::fs::remove_dir(dir);
            }
        }
    }
}

/// Copy exactly `total` bytes in chunks, pacing with `throttle` and
/// reporting cumulative progress after each chunk.
pub async fn copy_chunked<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    throttle: &mut Throttle,
    mut digest: Option<&mut Sha256Stream>,
    mut on_progress: F,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done = 0u64;
    while done < total {
        let want = (total - done).min(CHUNK_SIZE as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {done} of {total} bytes"),
            ));
        }
        writer.write_all(&buf[..n]).await?;
        if let Some(d) = digest.as_deref_mut() {
            d.update(&buf[..n]);
        }
        done += n as u64;
        throttle.consume(n).await;
        on_progress(done);
    }
    writer.flush().await
}
