use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid encoding: {0}")]
    Encoding(String),
}

/// Malformed input rejected before it reaches any data structure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid peer id: {0:?}")]
    InvalidNodeId(String),

    #[error("Invalid IPv4 address: {0:?}")]
    InvalidAddress(String),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    #[error("Unknown frame tag: {0:?}")]
    UnknownTag(String),
}

#[derive(Error, Debug)]
pub enum NoiseError {
    #[error("Noise handshake error: {0}")]
    Handshake(String),

    #[error("Noise transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Keystore IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keystore format error: {0}")]
    Format(String),
}
