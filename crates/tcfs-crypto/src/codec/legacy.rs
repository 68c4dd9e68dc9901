//! Legacy chunk codec: AES-256-CBC for full chunks, AES-256-CFB8 for the tail
//!
//! There is no authentication tag and no root tag. Flipped ciphertext bytes
//! decrypt to wrong plaintext without any error. Only use this codec to stay
//! compatible with shares that were written without integrity protection.

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{AsyncStreamCipher, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use tcfs_core::{CodecKind, TcfsError, TcfsResult};

use super::{ChunkCodec, EncryptedChunk};
use crate::keys::FileKey;
use crate::{BLOCK_SIZE, IV_SIZE};

type CbcEnc = cbc::Encryptor<Aes256>;
type CbcDec = cbc::Decryptor<Aes256>;
type Cfb8Enc = cfb8::Encryptor<Aes256>;
type Cfb8Dec = cfb8::Decryptor<Aes256>;

/// Non-authenticated chunk codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyCodec;

impl ChunkCodec for LegacyCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Legacy
    }

    fn block_length(&self) -> usize {
        BLOCK_SIZE
    }

    fn tag_length(&self) -> usize {
        0
    }

    fn encrypt_chunk(
        &self,
        key: &FileKey,
        plaintext: &[u8],
        index: u64,
        is_last: bool,
    ) -> TcfsResult<EncryptedChunk> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = if is_last {
            let mut buf = plaintext.to_vec();
            Cfb8Enc::new_from_slices(key.as_bytes(), &iv)
                .map_err(|e| TcfsError::Encryption(format!("CFB8 key setup failed: {e}")))?
                .encrypt(&mut buf);
            buf
        } else {
            check_block_aligned(plaintext.len(), index)?;
            CbcEnc::new_from_slices(key.as_bytes(), &iv)
                .map_err(|e| TcfsError::Encryption(format!("CBC key setup failed: {e}")))?
                .encrypt_padded_vec_mut::<NoPadding>(plaintext)
        };

        Ok(EncryptedChunk {
            iv,
            ciphertext,
            tag: Vec::new(),
        })
    }

    fn decrypt_chunk(
        &self,
        key: &FileKey,
        chunk: &EncryptedChunk,
        index: u64,
        is_last: bool,
    ) -> TcfsResult<Vec<u8>> {
        if !chunk.tag.is_empty() {
            return Err(TcfsError::Encryption(format!(
                "chunk {index} carries a tag but the legacy codec has none"
            )));
        }

        if is_last {
            let mut buf = chunk.ciphertext.clone();
            Cfb8Dec::new_from_slices(key.as_bytes(), &chunk.iv)
                .map_err(|e| TcfsError::Encryption(format!("CFB8 key setup failed: {e}")))?
                .decrypt(&mut buf);
            return Ok(buf);
        }

        check_block_aligned(chunk.ciphertext.len(), index)?;
        CbcDec::new_from_slices(key.as_bytes(), &chunk.iv)
            .map_err(|e| TcfsError::Encryption(format!("CBC key setup failed: {e}")))?
            .decrypt_padded_vec_mut::<NoPadding>(&chunk.ciphertext)
            .map_err(|e| TcfsError::Encryption(format!("chunk {index} decryption failed: {e}")))
    }
}

fn check_block_aligned(len: usize, index: u64) -> TcfsResult<()> {
    if len % BLOCK_SIZE != 0 {
        return Err(TcfsError::Encryption(format!(
            "full chunk {index} is {len} bytes, not a multiple of the {BLOCK_SIZE}-byte block"
        )));
    }
    Ok(())
}
