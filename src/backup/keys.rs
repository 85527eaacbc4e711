//! Backup key material.
//!
//! Every project gets a random 256-bit data key. The data key is wrapped
//! with a root key and stored in the key bucket; content is encrypted with
//! the data key before it is written to a backup bucket.

use crate::error::{Result, StoreError};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A key-encryption key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    id: String,
    key: [u8; 32],
}

impl RootKey {
    pub fn new(key: [u8; 32]) -> Self {
        let digest = Sha256::digest(key);
        Self {
            id: hex::encode(&digest[..8]),
            key,
        }
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s).map_err(|e| StoreError::Config(format!("root key is not hex: {e}")))?,
        );
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Config(format!("root key must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::new(key))
    }

    /// Fingerprint stored next to wrapped keys.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// The root keys in rotation. New data keys are wrapped with a key picked
/// from the project folder; any of them can unwrap a data key it wrapped
/// earlier.
#[derive(Clone)]
pub struct KeyRing {
    keys: Vec<RootKey>,
}

#[derive(Serialize, Deserialize)]
struct WrappedKey {
    key_id: String,
    /// Hex of `[nonce][ciphertext + tag]`.
    data: String,
}

impl KeyRing {
    pub fn new(keys: Vec<RootKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(StoreError::Config("backup key ring has no root keys".into()));
        }
        Ok(Self { keys })
    }

    pub fn from_hex(keys: &[String]) -> Result<Self> {
        Self::new(keys.iter().map(|k| RootKey::from_hex(k)).collect::<Result<_>>()?)
    }

    /// The root key that wraps new data keys for `folder`. Stable for a
    /// given folder and ring.
    pub fn root_for(&self, folder: &str) -> &RootKey {
        let digest = Sha256::digest(folder.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let index = u64::from_be_bytes(head) % self.keys.len() as u64;
        &self.keys[index as usize]
    }

    /// Wrap `data_key` for the project stored under `folder`. The folder is
    /// bound as associated data, so a wrapped key only unwraps for its own
    /// project.
    pub fn wrap(&self, data_key: &DataKey, folder: &str) -> Result<Vec<u8>> {
        let root = self.root_for(folder);
        let sealed = seal(&root.key, &data_key.key, folder.as_bytes())?;
        let wrapped = WrappedKey {
            key_id: root.id.clone(),
            data: hex::encode(sealed),
        };
        Ok(serde_json::to_vec(&wrapped)?)
    }

    pub fn unwrap(&self, wrapped: &[u8], folder: &str) -> Result<DataKey> {
        let wrapped: WrappedKey = serde_json::from_slice(wrapped)?;
        let root = self
            .keys
            .iter()
            .find(|k| k.id == wrapped.key_id)
            .ok_or_else(|| StoreError::Crypto(format!("unknown root key {}", wrapped.key_id)))?;
        let sealed = hex::decode(&wrapped.data)
            .map_err(|e| StoreError::Crypto(format!("wrapped key is not hex: {e}")))?;
        let plain = Zeroizing::new(open(&root.key, &sealed, folder.as_bytes())?);
        let key: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Crypto("wrapped key has the wrong length".into()))?;
        Ok(DataKey { key })
    }
}

/// Per-project data encryption key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: [u8; 32],
}

impl DataKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Returns `[nonce][ciphertext + tag]`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        seal(&self.key, plaintext, aad)
    }

    pub fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        open(&self.key, data, aad)
    }
}

fn cipher(key: &[u8; 32]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| StoreError::Crypto(format!("cipher init: {e}")))
}

fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher(key)?
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload { msg: plaintext, aad },
        )
        .map_err(|e| StoreError::Crypto(format!("encrypt: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(StoreError::Crypto("ciphertext too short".into()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    cipher(key)?
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| StoreError::Crypto("decryption failed".into()))
}
