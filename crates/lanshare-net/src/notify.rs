//! User-facing notifications.
//!
//! Success and failure travel over the same channel and differ only in their
//! text. Any number of observers (a UI, the multicast relay, tests) can
//! subscribe.

use std::fmt;

use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    PeerOnline { peer: String },
    PeerUnreachable { peer: String },
    PeerRemoved { peer: String },
    TransferCompleted { file: String, peer: String },
    TransferReceived { file: String, from: String },
    TransferFailed { file: String, reason: String },
    TransferCancelled { file: String },
    TransferDeclined { file: String, from: String },
    IntegrityFailed { file: String },
    ChatSent { text: String },
    ChatReceived { from: String, text: String },
    GroupMessage { from: String, text: String },
    UpdateAvailable { version: String, developer: String },
    UpToDate,
    UpdateInstalled { version: String },
    UpdateRefused { version: String, reason: String },
    UpdateRolledBack { version: String },
    VersionRestored { file: String },
    BackupCompleted { path: String },
    BackupFailed { reason: String },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::PeerOnline { peer } => write!(f, "Device online: {peer}"),
            Notification::PeerUnreachable { peer } => write!(f, "Could not reconnect to {peer}"),
            Notification::PeerRemoved { peer } => write!(f, "Device removed: {peer}"),
            Notification::TransferCompleted { file, peer } => {
                write!(f, "File sent: {file} to {peer}")
            }
            Notification::TransferReceived { file, from } => {
                write!(f, "File received: {file} from {from}")
            }
            Notification::TransferFailed { file, reason } => {
                write!(f, "Transfer failed: {file} ({reason})")
            }
            Notification::TransferCancelled { file } => write!(f, "Transfer cancelled: {file}"),
            Notification::TransferDeclined { file, from } => {
                write!(f, "File declined: {file} from {from}")
            }
            Notification::IntegrityFailed { file } => {
                write!(f, "File integrity check failed: {file}")
            }
            Notification::ChatSent { text } => write!(f, "Sent: {text}"),
            Notification::ChatReceived { from, text } => write!(f, "{from}: {text}"),
            Notification::GroupMessage { from, text } => write!(f, "Group: {from}: {text}"),
            Notification::UpdateAvailable { version, developer } => {
                write!(f, "Update available: {version} from {developer}")
            }
            Notification::UpToDate => write!(f, "Already up to date"),
            Notification::UpdateInstalled { version } => write!(f, "Update installed: {version}"),
            Notification::UpdateRefused { version, reason } => {
                write!(f, "Update {version} refused: {reason}")
            }
            Notification::UpdateRolledBack { version } => {
                write!(f, "Update {version} failed, previous version restored")
            }
            Notification::VersionRestored { file } => write!(f, "File version restored: {file}"),
            Notification::BackupCompleted { path } => write!(f, "Auto-backup completed: {path}"),
            Notification::BackupFailed { reason } => write!(f, "Backup error: {reason}"),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        debug!(notification = %notification, "notify");
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
