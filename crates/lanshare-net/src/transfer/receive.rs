use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lanshare_shared::crypto::{hash_file, Sha256Stream};
use lanshare_shared::error::ValidationError;
use lanshare_shared::protocol::{FileHeader, ACK_INTEGRITY, ACK_OK, ACK_REJECTED};
use lanshare_shared::types::Direction;

use super::{JobId, JobState, TransferEngine, TransferJob};
use crate::error::NetError;
use crate::notify::Notification;

/// A received file that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub hash: String,
    /// Label of the copy taken of the previous content, if any.
    pub previous_version: Option<String>,
}

/// Plain file names only.
fn validate_file_name(name: &str) -> Result<(), ValidationError> {
    let bad = name.is_empty()
        || name == "."
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0');
    if bad {
        return Err(ValidationError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

/// Deletes the partial file unless disarmed.
struct PartGuard {
    path: PathBuf,
    armed: bool,
}

impl PartGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Removes an inbound job from the active map.
struct InboundJob<'a> {
    engine: &'a TransferEngine,
    id: JobId,
}

impl Drop for InboundJob<'_> {
    fn drop(&mut self) {
        self.engine.jobs.remove(&self.id);
    }
}

/// Drain the declared payload so the sender reaches the verdict instead of
/// a reset, then answer with `ACK_REJECTED`.
async fn refuse<S>(stream: &mut S, total_size: u64) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::io::copy(&mut (&mut *stream).take(total_size), &mut tokio::io::sink()).await?;
    stream.write_u8(ACK_REJECTED).await?;
    stream.flush().await
}

impl TransferEngine {
    /// Read one FILE frame body from `stream` (preamble already consumed),
    /// store it, and answer with a verdict byte.
    pub async fn receive<S>(&self, sender_id: &str, stream: &mut S) -> Result<ReceivedFile, NetError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let header = FileHeader::read_from(stream).await?;

        if let Err(e) = validate_file_name(&header.file_name) {
            warn!(sender = %sender_id, file = %header.file_name, "Rejected unsafe file name");
            refuse(stream, header.total_size).await?;
            return Err(e.into());
        }

        let from = self
            .devices
            .name_for_id(sender_id)
            .unwrap_or_else(|| sender_id.to_string());
        if !self.config.auto_accept && !self.confirmer.confirm(&from, &header).await {
            info!(file = %header.file_name, from = %from, "Inbound file declined");
            refuse(stream, header.total_size).await?;
            self.notifier.emit(Notification::TransferDeclined {
                file: header.file_name.clone(),
                from,
            });
            return Err(NetError::Declined(header.file_name));
        }

        let id = JobId::new();
        self.jobs.insert(
            id,
            TransferJob {
                id,
                file_name: header.file_name.clone(),
                total_size: header.total_size,
                content_hash: header.hash.clone(),
                tags: header.tags.clone(),
                metadata: header.metadata.clone(),
                direction: Direction::Received,
                peer: sender_id.to_string(),
                progress: 0.0,
                state: JobState::InProgress,
            },
        );
        let _job = InboundJob { engine: self, id };

        match self.store_incoming(id, &header, stream).await {
            Ok(received) => {
                self.set_state(id, JobState::Completed);
                self.journal_write("transfer", |db| {
                    db.insert_transfer(
                        &header.file_name,
                        Direction::Received,
                        header.total_size,
                        &header.metadata,
                    )
                });
                if !header.tags.is_empty() {
                    self.journal_write("tag", |db| db.insert_tag(&header.file_name, &header.tags));
                }
                let saved_to = received.path.to_string_lossy().into_owned();
                self.journal_write("download", |db| {
                    db.insert_download(&header.file_name, &saved_to, header.total_size)
                });

                stream.write_u8(ACK_OK).await?;
                stream.flush().await?;

                info!(file = %header.file_name, from = %from, size = header.total_size, "File received");
                self.notifier.emit(Notification::TransferReceived {
                    file: header.file_name.clone(),
                    from,
                });
                Ok(received)
            }
            Err(e @ NetError::Integrity { .. }) => {
                self.set_state(id, JobState::Failed);
                warn!(file = %header.file_name, sender = %sender_id, error = %e, "Integrity check failed");
                self.notifier.emit(Notification::IntegrityFailed {
                    file: header.file_name.clone(),
                });
                stream.write_u8(ACK_INTEGRITY).await?;
                stream.flush().await?;
                Err(e)
            }
            Err(e) => {
                self.set_state(id, JobState::Failed);
                // The stream may already be gone; the verdict is best effort.
                let _ = stream.write_u8(ACK_REJECTED).await;
                let _ = stream.flush().await;
                Err(e)
            }
        }
    }

    async fn store_incoming<R>(
        &self,
        id: JobId,
        header: &FileHeader,
        reader: &mut R,
    ) -> Result<ReceivedFile, NetError>
    where
        R: AsyncRead + Unpin,
    {
        let save_dir = &self.config.save_dir;
        tokio::fs::create_dir_all(save_dir).await?;
        let dest = save_dir.join(&header.file_name);
        let part_path = save_dir.join(format!("{}.{id}.part", header.file_name));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await?;
        let mut part = PartGuard {
            path: part_path.clone(),
            armed: true,
        };
        let mut digest = Sha256Stream::new();
        let mut throttle = self.governor.throttle();
        let total = header.total_size;
        super::copy_chunked(reader, &mut file, total, &mut throttle, Some(&mut digest), |done| {
            self.set_progress(id, done, total)
        })
        .await?;
        file.sync_all().await?;
        drop(file);

        self.set_state(id, JobState::Verifying);
        let actual = digest.finalize_hex();
        if !actual.eq_ignore_ascii_case(&header.hash) {
            // part guard removes the partial file
            return Err(NetError::Integrity {
                file: header.file_name.clone(),
                expected: header.hash.clone(),
                actual,
            });
        }

        let lock = self.finalize_lock(&header.file_name);
        let finalized = async {
            let _held = lock.lock().await;
            let previous_version = if tokio::fs::try_exists(&dest).await? {
                Some(self.keep_previous_version(&header.file_name, &dest).await?)
            } else {
                None
            };
            tokio::fs::rename(&part_path, &dest).await?;
            Ok::<_, io::Error>(previous_version)
        }
        .await;
        drop(lock);
        self.release_finalize_lock(&header.file_name);
        let previous_version = finalized?;
        part.disarm();

        Ok(ReceivedFile {
            file_name: header.file_name.clone(),
            path: dest,
            size: total,
            hash: actual,
            previous_version,
        })
    }

    fn finalize_lock(&self, file_name: &str) -> Arc<Mutex<()>> {
        self.finalize_locks
            .entry(file_name.to_string())
            .or_default()
            .clone()
    }

    /// Forget the lock once no other receive of the same name holds it.
    fn release_finalize_lock(&self, file_name: &str) {
        self.finalize_locks
            .remove_if(file_name, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Copy the current content aside as `<name>.v<epoch millis>` and record it.
    async fn keep_previous_version(&self, file_name: &str, dest: &Path) -> io::Result<String> {
        let mut millis = chrono::Utc::now().timestamp_millis();
        let mut label = format!("{file_name}.v{millis}");
        while tokio::fs::try_exists(self.config.save_dir.join(&label)).await? {
            millis += 1;
            label = format!("{file_name}.v{millis}");
        }

        let old_hash = hash_file(dest).await?;
        let size = tokio::fs::copy(dest, self.config.save_dir.join(&label)).await?;
        self.journal_write("file version", |db| {
            db.insert_file_version(file_name, &label, size, &old_hash)
        });
        debug!(file = %file_name, version = %label, "Previous content kept");
        Ok(label)
    }

    /// Copy a kept version back over its original file.
    pub async fn restore_version(&self, version_label: &str) -> Result<PathBuf, NetError> {
        let record = self
            .journal
            .with(|db| db.find_file_version(version_label))?
            .ok_or_else(|| ValidationError::InvalidVersion(version_label.to_string()))?;
        validate_file_name(&record.file_name)?;
        validate_file_name(&record.version_label)?;

        let source = self.config.save_dir.join(&record.version_label);
        let target = self.config.save_dir.join(&record.file_name);
        tokio::fs::copy(&source, &target).await?;

        let action = format!(
            "Restored file version: {} to {}",
            record.version_label, record.file_name
        );
        self.journal_write("activity", |db| db.insert_activity(&self.local_id, &action));
        info!(file = %record.file_name, version = %record.version_label, "File version restored");
        self.notifier.emit(Notification::VersionRestored {
            file: record.file_name,
        });
        Ok(target)
    }
}
