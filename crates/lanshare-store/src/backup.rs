use std::path::Path;

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::database::{format_ts, Database};
use crate::error::Result;
use crate::models::{
    ActivityRecord, ChatRecord, DownloadRecord, FileVersionRecord, TagRecord, TransferRecord,
};

/// Full journal snapshot, written as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPayload {
    /// RFC 3339 timestamp of when the backup was created
    pub created_at: String,
    /// App version that produced the backup
    pub version: String,
    pub transfers: Vec<TransferRecord>,
    pub tags: Vec<TagRecord>,
    pub chats: Vec<ChatRecord>,
    pub downloads: Vec<DownloadRecord>,
    pub activities: Vec<ActivityRecord>,
    pub file_versions: Vec<FileVersionRecord>,
}

// Log tables trimmed by retention; versions and policies are kept.
const PURGEABLE_TABLES: [&str; 5] = ["transfers", "tags", "chats", "downloads", "activities"];

impl Database {
    pub fn export_backup(&self) -> Result<BackupPayload> {
        Ok(BackupPayload {
            created_at: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            transfers: self.list_transfers()?,
            tags: self.list_tags()?,
            chats: self.list_chats()?,
            downloads: self.list_downloads()?,
            activities: self.list_activities()?,
            file_versions: self.list_file_versions()?,
        })
    }

    /// Write the backup as pretty JSON to `path`.
    pub fn export_backup_to(&self, path: &Path) -> Result<()> {
        let payload = self.export_backup()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&payload)?)?;
        Ok(())
    }

    /// Delete log rows older than `days`. Returns the number of rows removed.
    pub fn purge_logs_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = format_ts(&(Utc::now() - chrono::Duration::days(i64::from(days))));
        let mut removed = 0;
        for table in PURGEABLE_TABLES {
            removed += self.conn().execute(
                &format!("DELETE FROM {table} WHERE timestamp < ?1"),
                params![cutoff],
            )?;
        }
        Ok(removed)
    }
}
