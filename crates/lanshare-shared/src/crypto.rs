use std::path::Path;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::constants::{CHUNK_SIZE, KDF_CONTEXT_MESSAGE_KEY, NONCE_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// BLAKE3 KDF with domain separation
pub fn derive_key(secret: &[u8], context: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(secret);
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

/// Text cipher for chat bodies and multicast datagrams.
///
/// Output is base64 of `nonce || ciphertext`. Peers sharing the same
/// network secret derive the same key; without one the key only lives as
/// long as the process.
#[derive(Clone)]
pub struct MessageCipher {
    key: SymmetricKey,
}

impl MessageCipher {
    pub fn from_network_secret(secret: &[u8]) -> Self {
        Self {
            key: derive_key(secret, KDF_CONTEXT_MESSAGE_KEY),
        }
    }

    pub fn ephemeral() -> Self {
        Self {
            key: generate_symmetric_key(),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let sealed = encrypt(&self.key, plaintext.as_bytes())?;
        Ok(B64.encode(sealed))
    }

    pub fn decrypt_strict(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let sealed = B64
            .decode(ciphertext.trim())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let plain = decrypt(&self.key, &sealed)?;
        String::from_utf8(plain).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// Best-effort decrypt that never fails.
    ///
    /// Falls back to the base64-decoded bytes, then to the raw input, so a
    /// single malformed packet cannot take down a listener.
    pub fn decrypt(&self, ciphertext: &str) -> String {
        if let Ok(plain) = self.decrypt_strict(ciphertext) {
            return plain;
        }
        match B64.decode(ciphertext.trim()) {
            Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
            Err(_) => ciphertext.to_string(),
        }
    }
}

/// SHA-256 of a byte slice, lowercase hex.
pub fn hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Incremental SHA-256, fed chunk by chunk during transfers.
#[derive(Default, Clone)]
pub struct Sha256Stream {
    inner: Sha256,
}

impl Sha256Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finalize_bytes(self) -> [u8; 32] {
        self.inner.finalize().into()
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize_bytes())
    }
}

/// Raw SHA-256 digest of a file, read in transfer-sized chunks.
pub async fn digest_file(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256Stream::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_bytes())
}

pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    Ok(hex::encode(digest_file(path).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"Lunch at noon?";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();

        let encrypted = encrypt(&key1, b"Secret message").unwrap();
        assert!(decrypt(&key2, &encrypted).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_symmetric_key();
        let mut encrypted = encrypt(&key, b"Important data").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_empty_data_fails() {
        let key = generate_symmetric_key();
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_shared_secret_gives_shared_key() {
        let a = MessageCipher::from_network_secret(b"office-lan");
        let b = MessageCipher::from_network_secret(b"office-lan");

        let sealed = a.encrypt("hello team").unwrap();
        assert_eq!(b.decrypt_strict(&sealed).unwrap(), "hello team");
    }

    #[test]
    fn test_lenient_decrypt_falls_back() {
        let cipher = MessageCipher::ephemeral();

        // base64 of "plain words" that is not a valid sealed box
        assert_eq!(cipher.decrypt("cGxhaW4gd29yZHM="), "plain words");
        // not base64 at all
        assert_eq!(cipher.decrypt("%%% not base64"), "%%% not base64");
        assert!(cipher.decrypt_strict("%%% not base64").is_err());
    }

    #[test]
    fn test_hash_known_vector() {
        assert_eq!(
            hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_hash_file_matches_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), hash(&data));
    }
}
