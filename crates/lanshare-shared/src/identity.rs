use std::path::Path;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::digest_file;
use crate::error::KeystoreError;

/// Ed25519 key used to sign distributable packages.
#[derive(Clone)]
pub struct DeveloperKey {
    signing_key: SigningKey,
}

impl DeveloperKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign the SHA-256 digest of `file`; returns the signature as base64.
    pub async fn sign_file(&self, file: &Path) -> std::io::Result<String> {
        let digest = digest_file(file).await?;
        let signature = self.signing_key.sign(&digest);
        Ok(B64.encode(signature.to_bytes()))
    }
}

/// Verify a base64 Ed25519 signature over the SHA-256 digest of `file`.
///
/// Any failure (unreadable file, bad base64, malformed key, wrong
/// signature) yields `false`.
pub async fn verify_signature(file: &Path, signature_b64: &str, public_key: &[u8; 32]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = B64.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    let Ok(digest) = digest_file(file).await else {
        return false;
    };
    verifying_key.verify(&digest, &signature).is_ok()
}

pub fn parse_public_key_hex(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s.trim()).ok()?;
    bytes.try_into().ok()
}

/// Transport credentials shared by the nodes of one network.
///
/// On disk the keystore is JSON with every key hex-encoded.
#[derive(Clone)]
pub struct Keystore {
    pub static_secret: [u8; 32],
    pub network_psk: [u8; 32],
    pub trusted_peers: Vec<[u8; 32]>,
}

#[derive(Serialize, Deserialize)]
struct KeystoreFile {
    static_secret: String,
    network_psk: String,
    #[serde(default)]
    trusted_peers: Vec<String>,
}

impl Keystore {
    /// Fresh static key and network secret.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let mut psk = [0u8; 32];
        OsRng.fill_bytes(&mut psk);
        Self {
            static_secret: secret.to_bytes(),
            network_psk: psk,
            trusted_peers: Vec::new(),
        }
    }

    /// A new static key joining the network of `self`.
    pub fn join(&self) -> Self {
        let mut fresh = Self::generate();
        fresh.network_psk = self.network_psk;
        fresh.trusted_peers = self.trusted_peers.clone();
        fresh
    }

    pub fn static_public(&self) -> [u8; 32] {
        PublicKey::from(&StaticSecret::from(self.static_secret)).to_bytes()
    }

    /// Whether a handshake peer presenting `remote_static` is acceptable.
    /// An empty pin list accepts every holder of the network secret.
    pub fn is_trusted(&self, remote_static: &[u8]) -> bool {
        self.trusted_peers.is_empty()
            || self
                .trusted_peers
                .iter()
                .any(|k| k.as_slice() == remote_static)
    }

    pub fn load(path: &Path) -> Result<Self, KeystoreError> {
        let raw = std::fs::read_to_string(path)?;
        let file: KeystoreFile =
            serde_json::from_str(&raw).map_err(|e| KeystoreError::Format(e.to_string()))?;

        let decode = |field: &str, value: &str| -> Result<[u8; 32], KeystoreError> {
            parse_public_key_hex(value)
                .ok_or_else(|| KeystoreError::Format(format!("{field} must be 32 hex bytes")))
        };

        Ok(Self {
            static_secret: decode("static_secret", &file.static_secret)?,
            network_psk: decode("network_psk", &file.network_psk)?,
            trusted_peers: file
                .trusted_peers
                .iter()
                .map(|p| decode("trusted_peers", p))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), KeystoreError> {
        let file = KeystoreFile {
            static_secret: hex::encode(self.static_secret),
            network_psk: hex::encode(self.network_psk),
            trusted_peers: self.trusted_peers.iter().map(hex::encode).collect(),
        };
        let json =
            serde_json::to_string_pretty(&file).map_err(|e| KeystoreError::Format(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load the keystore at `path`, creating and saving one if absent.
    pub fn load_or_create(path: &Path) -> Result<Self, KeystoreError> {
        if path.exists() {
            return Self::load(path);
        }
        let keystore = Self::generate();
        keystore.save(path)?;
        Ok(keystore)
    }
}
