//! At-rest secret encryption
//!
//! Secrets are sealed with XChaCha20-Poly1305 under a single store-wide key.
//! The stored form is `nonce (24 bytes) || ciphertext || tag (16 bytes)`.

use crate::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Nonce length prefixed to every sealed secret
pub const NONCE_SIZE: usize = 24;

/// Store key length
pub const KEY_SIZE: usize = 32;

/// Symmetric key protecting secrets at rest
#[derive(Clone, PartialEq, Eq)]
pub struct StoreKey([u8; KEY_SIZE]);

impl StoreKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a key file's contents: either 32 raw bytes or 64 hex characters.
    pub fn from_file_contents(data: &[u8]) -> Result<Self> {
        if data.len() == KEY_SIZE {
            let mut bytes = [0u8; KEY_SIZE];
            bytes.copy_from_slice(data);
            return Ok(Self(bytes));
        }
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Crypto("invalid store key encoding".to_string()))?;
        let decoded = hex::decode(text.trim())
            .map_err(|e| Error::Crypto(format!("invalid store key hex: {}", e)))?;
        let bytes: [u8; KEY_SIZE] = decoded.try_into().map_err(|v: Vec<u8>| {
            Error::Crypto(format!("invalid store key length {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Load the key at `path`, creating a new random key there if the file
    /// does not exist.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let data = std::fs::read(path)?;
            let key = Self::from_file_contents(&data)?;
            info!("Loaded store key {}", key.fingerprint());
            return Ok(key);
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(hex::encode(key.0).as_bytes())?;
        file.sync_all()?;
        info!("Generated new store key {}", key.fingerprint());
        Ok(key)
    }

    /// Short SHA-256 fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.0))
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt_secret(plaintext: &[u8], key: &StoreKey) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| Error::Crypto(format!("failed to read random bytes: {}", e)))?;

    let sealed = key
        .cipher()
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("encrypt failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a blob produced by [`encrypt_secret`].
pub fn decrypt_secret(blob: &[u8], key: &StoreKey) -> Result<Vec<u8>> {
    if blob.len() < NONCE_SIZE {
        return Err(Error::Crypto("invalid secret value".to_string()));
    }
    let (nonce, sealed) = blob.split_at(NONCE_SIZE);
    key.cipher()
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| Error::Crypto("decrypt failed".to_string()))
}
