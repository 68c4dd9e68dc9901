//! AES-256-GCM chunk codecs: 16-byte IV, 96-bit tag

use aes::{Aes256, Aes256Enc};
use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Payload};
use aes_gcm::AesGcm;
use rand::RngCore;
use tcfs_core::{CodecKind, TcfsError, TcfsResult};

use super::{chunk_aad, ChunkCodec, EncryptedChunk};
use crate::keys::FileKey;
use crate::{BLOCK_SIZE, GCM_TAG_SIZE, IV_SIZE};

/// GCM over the full AES cipher. `aes` selects AES-NI/ARMv8 at runtime
/// when the CPU has them; both key schedules are expanded.
type FullAesGcm = AesGcm<Aes256, U16, U12>;

/// GCM over the encrypt-only AES core. GCM never runs the inverse cipher,
/// so the decryption key schedule is skipped. Block encryption takes the
/// same runtime-selected code path as [`FullAesGcm`].
type AcceleratedGcm = AesGcm<Aes256Enc, U16, U12>;

/// Authenticated chunk codec (preferred).
#[derive(Debug, Clone, Copy, Default)]
pub struct GcmCodec;

/// Authenticated chunk codec over the encrypt-only AES core.
///
/// Produces the same bytes on disk as [`GcmCodec`]; only key setup is cheaper.
#[derive(Debug, Clone, Copy, Default)]
pub struct HwGcmCodec;

impl ChunkCodec for GcmCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Gcm
    }

    fn block_length(&self) -> usize {
        BLOCK_SIZE
    }

    fn tag_length(&self) -> usize {
        GCM_TAG_SIZE
    }

    fn encrypt_chunk(
        &self,
        key: &FileKey,
        plaintext: &[u8],
        index: u64,
        is_last: bool,
    ) -> TcfsResult<EncryptedChunk> {
        seal::<FullAesGcm>(key, plaintext, index, is_last)
    }

    fn decrypt_chunk(
        &self,
        key: &FileKey,
        chunk: &EncryptedChunk,
        index: u64,
        is_last: bool,
    ) -> TcfsResult<Vec<u8>> {
        open::<FullAesGcm>(key, chunk, index, is_last)
    }
}

impl ChunkCodec for HwGcmCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::GcmHw
    }

    fn block_length(&self) -> usize {
        BLOCK_SIZE
    }

    fn tag_length(&self) -> usize {
        GCM_TAG_SIZE
    }

    fn encrypt_chunk(
        &self,
        key: &FileKey,
        plaintext: &[u8],
        index: u64,
        is_last: bool,
    ) -> TcfsResult<EncryptedChunk> {
        seal::<AcceleratedGcm>(key, plaintext, index, is_last)
    }

    fn decrypt_chunk(
        &self,
        key: &FileKey,
        chunk: &EncryptedChunk,
        index: u64,
        is_last: bool,
    ) -> TcfsResult<Vec<u8>> {
        open::<AcceleratedGcm>(key, chunk, index, is_last)
    }
}

fn seal<A>(key: &FileKey, plaintext: &[u8], index: u64, is_last: bool) -> TcfsResult<EncryptedChunk>
where
    A: KeyInit + Aead + AeadCore<NonceSize = U16>,
{
    let cipher = A::new_from_slice(key.as_bytes())
        .map_err(|e| TcfsError::Encryption(format!("GCM key setup failed: {e}")))?;

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let aad = chunk_aad(index, is_last);

    let mut sealed = cipher
        .encrypt(
            GenericArray::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| TcfsError::Encryption(format!("chunk {index} encryption failed: {e}")))?;

    // aes-gcm appends the tag to the ciphertext
    let tag = sealed.split_off(sealed.len() - GCM_TAG_SIZE);
    Ok(EncryptedChunk {
        iv,
        ciphertext: sealed,
        tag,
    })
}

fn open<A>(key: &FileKey, chunk: &EncryptedChunk, index: u64, is_last: bool) -> TcfsResult<Vec<u8>>
where
    A: KeyInit + Aead + AeadCore<NonceSize = U16>,
{
    if chunk.tag.len() != GCM_TAG_SIZE {
        return Err(TcfsError::Encryption(format!(
            "chunk {index} has a {}-byte tag (expected {GCM_TAG_SIZE})",
            chunk.tag.len()
        )));
    }
    let cipher = A::new_from_slice(key.as_bytes())
        .map_err(|e| TcfsError::Encryption(format!("GCM key setup failed: {e}")))?;

    let mut sealed = Vec::with_capacity(chunk.ciphertext.len() + GCM_TAG_SIZE);
    sealed.extend_from_slice(&chunk.ciphertext);
    sealed.extend_from_slice(&chunk.tag);
    let aad = chunk_aad(index, is_last);

    cipher
        .decrypt(
            GenericArray::from_slice(&chunk.iv),
            Payload {
                msg: &sealed,
                aad: &aad,
            },
        )
        .map_err(|_| TcfsError::Integrity(format!("chunk {index} failed authentication")))
}
