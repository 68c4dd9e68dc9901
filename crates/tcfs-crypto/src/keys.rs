//! Key material: per-file keys, versioned share keys, and file key wrapping
//!
//! ```text
//! Share Key (256-bit, versioned, supplied by share-key management)
//!   └── File Key (per-file, 256-bit random)
//!         stored in the file header as AES-256(share_key, file_key),
//!         one deterministic block pass per 16-byte half, no IV
//! ```

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::RngCore;
use tcfs_core::{TcfsError, TcfsResult};
use zeroize::Zeroize;

use crate::{BLOCK_SIZE, KEY_SIZE};

/// A per-file 256-bit encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A 256-bit share key protecting the file keys of every file in a share.
///
/// Also keys the header HMAC and the root authentication tag. Zeroized on drop.
#[derive(Clone)]
pub struct ShareKey {
    bytes: [u8; KEY_SIZE],
}

impl ShareKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build a share key from an arbitrary slice, rejecting wrong lengths.
    pub fn from_slice(bytes: &[u8]) -> TcfsResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            TcfsError::Encryption(format!(
                "invalid share key length: {} bytes (expected {KEY_SIZE})",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ShareKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ShareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit file encryption key.
pub fn generate_file_key() -> FileKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    FileKey::from_bytes(bytes)
}

/// Generate a random 256-bit share key.
pub fn generate_share_key() -> ShareKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    ShareKey::from_bytes(bytes)
}

/// Wrap (encrypt) a file key under the share key.
///
/// Key and block sizes line up (two AES blocks), so each half goes through
/// a single AES-256 block encryption; the output is deterministic.
pub fn wrap_file_key(share: &ShareKey, file_key: &FileKey) -> [u8; KEY_SIZE] {
    let cipher = Aes256::new(GenericArray::from_slice(share.as_bytes()));
    let mut out = *file_key.as_bytes();
    for block in out.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    out
}

/// Unwrap (decrypt) a file key produced by [`wrap_file_key`].
pub fn unwrap_file_key(share: &ShareKey, wrapped: &[u8]) -> TcfsResult<FileKey> {
    if wrapped.len() != KEY_SIZE {
        return Err(TcfsError::Encryption(format!(
            "wrapped file key has wrong size: {} bytes (expected {KEY_SIZE})",
            wrapped.len()
        )));
    }
    let cipher = Aes256::new(GenericArray::from_slice(share.as_bytes()));
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(wrapped);
    for block in bytes.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(FileKey::from_bytes(bytes))
}
