use std::io;
use std::net::SocketAddr;

use lanshare_shared::error::{CryptoError, KeystoreError, NoiseError, ValidationError};
use lanshare_shared::retry::Retryable;
use lanshare_store::StoreError;
use thiserror::Error;

/// Connect, handshake and socket failures. Always worth another attempt.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Keystore unavailable: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("Cannot bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("Connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    #[error("Connect to {0} timed out")]
    Timeout(SocketAddr),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] NoiseError),

    #[error("Peer static key is not trusted")]
    UntrustedPeer,

    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
}

/// Update packages that must not be installed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    #[error("Package {version} claims developer {developer} but its signature does not verify")]
    Tampered { version: String, developer: String },

    #[error("Third-party package {version} from {developer} was not confirmed")]
    NotConfirmed { version: String, developer: String },
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Integrity check failed for {file}: expected {expected}, got {actual}")]
    Integrity {
        file: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Journal error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Rejected by peer: {0}")]
    Rejected(String),

    #[error("Declined: {0}")]
    Declined(String),

    #[error("Install failed: {0}")]
    Install(String),

    #[error("Invalid update manifest: {0}")]
    Manifest(String),
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        NetError::Transport(TransportError::Io(e))
    }
}

impl Retryable for NetError {
    fn is_retryable(&self) -> bool {
        matches!(self, NetError::Transport(_))
    }
}
