//! Row types returned by the journal queries.
//!
//! Every struct derives `Serialize` so it can be exported in backups or
//! handed to a UI layer as-is.

use chrono::{DateTime, Utc};
use lanshare_shared::types::{Direction, TrustGrade};
use serde::{Deserialize, Serialize};

/// One completed file transfer, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub id: i64,
    pub file_name: String,
    pub direction: Direction,
    pub size: u64,
    /// `Size: N bytes, Modified: <time>`
    pub metadata: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagRecord {
    pub id: i64,
    pub file_name: String,
    pub tags: String,
    pub timestamp: DateTime<Utc>,
}

/// A received file saved to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRecord {
    pub id: i64,
    pub file_name: String,
    pub path: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// A chat message as it was sent or received. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: i64,
    pub peer_id: String,
    pub message: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityRecord {
    pub id: i64,
    pub node_id: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

/// Prior content of a received file, kept before it was overwritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileVersionRecord {
    pub id: i64,
    pub file_name: String,
    pub version_label: String,
    pub size: u64,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockPolicyRecord {
    pub peer_id: String,
    pub block_files: bool,
    pub block_messages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactRecord {
    pub peer_id: String,
    pub trust_grade: TrustGrade,
}

/// Row counts per direction, for a stats dashboard.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectionCounts {
    pub sent: u64,
    pub received: u64,
}
