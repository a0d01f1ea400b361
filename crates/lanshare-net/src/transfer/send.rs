use std::net::SocketAddr;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use lanshare_shared::crypto::hash_file;
use lanshare_shared::protocol::{FileHeader, FrameKind, Preamble, ACK_INTEGRITY, ACK_OK};
use lanshare_shared::types::Direction;

use super::{JobId, JobState, Outgoing, TransferEngine, TransferReport};
use crate::error::NetError;
use crate::notify::Notification;

/// `Size: N bytes, Modified: <rfc3339>`
pub(super) async fn describe(path: &Path, size: u64) -> String {
    let modified = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    format!(
        "Size: {size} bytes, Modified: {}",
        modified.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

impl TransferEngine {
    pub(super) async fn run_send(
        &self,
        id: JobId,
        peer: &str,
        file: &Outgoing,
        tags: &str,
    ) -> Result<TransferReport, NetError> {
        // Hashed once; every attempt sends the same header.
        let hash = hash_file(&file.path).await?;
        let metadata = describe(&file.path, file.size).await;
        let header = FileHeader {
            file_name: file.file_name.clone(),
            total_size: file.size,
            metadata: metadata.clone(),
            hash: hash.clone(),
            tags: tags.to_string(),
        };
        self.update_job(id, |job| {
            job.content_hash = hash.clone();
            job.metadata = metadata.clone();
        });

        let mut attempts = 0;
        self.config
            .retry
            .run("send_file", |attempt| {
                attempts = attempt;
                let header = &header;
                async move {
                    let addr = self.devices.resolve(peer)?;
                    self.send_once(id, addr, &file.path, header).await
                }
            })
            .await?;

        self.set_state(id, JobState::Completed);
        self.journal_write("transfer", |db| {
            db.insert_transfer(&file.file_name, Direction::Sent, file.size, &metadata)
        });
        if !tags.is_empty() {
            self.journal_write("tag", |db| db.insert_tag(&file.file_name, tags));
        }

        info!(file = %file.file_name, peer = %peer, size = file.size, attempts, "File sent");
        self.notifier.emit(Notification::TransferCompleted {
            file: file.file_name.clone(),
            peer: peer.to_string(),
        });

        Ok(TransferReport {
            job_id: id,
            file_name: file.file_name.clone(),
            size: file.size,
            hash,
            attempts,
        })
    }

    /// One complete attempt: connect, header, payload, verdict.
    async fn send_once(
        &self,
        id: JobId,
        addr: SocketAddr,
        path: &Path,
        header: &FileHeader,
    ) -> Result<(), NetError> {
        self.set_state(id, JobState::InProgress);
        let mut stream = self.dialer.dial(addr).await?;
        Preamble::write_to(&mut stream, &self.local_id, FrameKind::File).await?;
        header.write_to(&mut stream).await?;

        let mut source = tokio::fs::File::open(path).await?;
        let mut throttle = self.governor.throttle();
        let total = header.total_size;
        super::copy_chunked(&mut source, &mut stream, total, &mut throttle, None, |done| {
            self.set_progress(id, done, total)
        })
        .await?;

        self.set_state(id, JobState::Verifying);
        debug!(file = %header.file_name, "Payload sent, waiting for verdict");
        let verdict = stream.read_u8().await?;
        stream.finish().await?;

        match verdict {
            ACK_OK => Ok(()),
            ACK_INTEGRITY => Err(NetError::Integrity {
                file: header.file_name.clone(),
                expected: header.hash.clone(),
                actual: "mismatch reported by receiver".into(),
            }),
            other => Err(NetError::Rejected(format!(
                "{} refused (verdict {other})",
                header.file_name
            ))),
        }
    }
}
