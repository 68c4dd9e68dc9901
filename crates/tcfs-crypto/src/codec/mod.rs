//! Per-chunk cipher strategies
//!
//! Every chunk is encrypted independently under the file key with a fresh
//! random IV. On disk a chunk is laid out as:
//! ```text
//! [16 bytes: IV][N bytes: ciphertext][T bytes: tag]
//! N = chunk_multiple * 16 for full chunks, remainder for the last chunk
//! T = 12 for the GCM codecs, 0 for the legacy codec
//! ```
//!
//! The GCM codecs authenticate `chunk_index (8 bytes, big-endian) || is_last
//! (1 byte)` as associated data, so moving, dropping or re-flagging a chunk
//! breaks its tag even though chunks are sealed one at a time.

mod gcm;
mod legacy;

pub use gcm::{GcmCodec, HwGcmCodec};
pub use legacy::LegacyCodec;

use tcfs_core::{CodecKind, TcfsError, TcfsResult};

use crate::keys::FileKey;
use crate::IV_SIZE;

/// One encrypted chunk, split into its on-disk parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
    /// Empty for codecs without authentication.
    pub tag: Vec<u8>,
}

impl EncryptedChunk {
    /// Split raw `IV || ciphertext || tag` bytes as read from storage.
    pub fn parse(raw: &[u8], tag_length: usize) -> TcfsResult<Self> {
        if raw.len() < IV_SIZE + tag_length {
            return Err(TcfsError::Encryption(format!(
                "encrypted chunk too short: {} bytes (minimum {})",
                raw.len(),
                IV_SIZE + tag_length
            )));
        }
        let (iv, rest) = raw.split_at(IV_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - tag_length);
        let mut iv_bytes = [0u8; IV_SIZE];
        iv_bytes.copy_from_slice(iv);
        Ok(Self {
            iv: iv_bytes,
            ciphertext: ciphertext.to_vec(),
            tag: tag.to_vec(),
        })
    }

    /// Serialize as `IV || ciphertext || tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_SIZE + self.ciphertext.len() + self.tag.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }
}

/// A chunk cipher strategy.
///
/// Implementations are stateless: cipher contexts are built per call from the
/// file key, so a codec can be shared freely between files and threads.
pub trait ChunkCodec: Send + Sync + std::fmt::Debug {
    /// The concrete strategy (never [`CodecKind::Auto`]).
    fn kind(&self) -> CodecKind;

    /// Cipher block length in bytes; also the IV size.
    fn block_length(&self) -> usize;

    /// Per-chunk tag length in bytes (0 without authentication).
    fn tag_length(&self) -> usize;

    fn implements_authentication(&self) -> bool {
        self.tag_length() > 0
    }

    fn encrypt_chunk(
        &self,
        key: &FileKey,
        plaintext: &[u8],
        index: u64,
        is_last: bool,
    ) -> TcfsResult<EncryptedChunk>;

    /// Fails with `Integrity` when authentication fails and with
    /// `Encryption` for every other cryptographic error.
    fn decrypt_chunk(
        &self,
        key: &FileKey,
        chunk: &EncryptedChunk,
        index: u64,
        is_last: bool,
    ) -> TcfsResult<Vec<u8>>;

    fn geometry(&self, chunk_multiple: usize) -> ChunkGeometry {
        ChunkGeometry::new(self.block_length(), chunk_multiple, self.tag_length())
    }
}

/// Sizes of one chunk in plaintext and on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    pub block_length: usize,
    pub chunk_multiple: usize,
    pub tag_length: usize,
    /// IV bytes preceding every chunk (= block length)
    pub iv_size: usize,
    /// Plaintext bytes in a full chunk
    pub data_size: usize,
    /// Ciphertext plus tag bytes of a full chunk
    pub enc_data_size: usize,
    /// Total on-disk bytes of a full chunk
    pub enc_size: usize,
}

impl ChunkGeometry {
    pub const fn new(block_length: usize, chunk_multiple: usize, tag_length: usize) -> Self {
        let data_size = chunk_multiple * block_length;
        let enc_data_size = data_size + tag_length;
        Self {
            block_length,
            chunk_multiple,
            tag_length,
            iv_size: block_length,
            data_size,
            enc_data_size,
            enc_size: enc_data_size + block_length,
        }
    }

    /// Bytes a chunk adds on disk on top of its plaintext.
    pub const fn overhead(&self) -> usize {
        self.iv_size + self.tag_length
    }
}

/// Associated data binding a chunk to its position and finality.
pub fn chunk_aad(index: u64, is_last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = u8::from(is_last);
    aad
}

/// Whether the CPU exposes AES instructions usable by the block cipher.
pub fn hardware_aes_available() -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        std::arch::is_x86_feature_detected!("aes") && std::arch::is_x86_feature_detected!("pclmulqdq")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("aes")
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

/// Resolve [`CodecKind::Auto`] to a concrete strategy for this machine.
pub fn resolve_codec_kind(kind: CodecKind) -> CodecKind {
    match kind {
        CodecKind::Auto if hardware_aes_available() => CodecKind::GcmHw,
        CodecKind::Auto => CodecKind::Gcm,
        other => other,
    }
}

/// Build the codec for `kind`.
pub fn select_codec(kind: CodecKind) -> Box<dyn ChunkCodec> {
    let resolved = resolve_codec_kind(kind);
    tracing::debug!(requested = %kind, selected = %resolved, "chunk codec selected");
    match resolved {
        CodecKind::Legacy => Box::new(LegacyCodec),
        CodecKind::GcmHw => Box::new(HwGcmCodec),
        CodecKind::Gcm | CodecKind::Auto => Box::new(GcmCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_file_key;
    use crate::{BLOCK_SIZE, GCM_TAG_SIZE};
    use proptest::prelude::*;

    #[test]
    fn test_geometry_gcm() {
        let g = ChunkGeometry::new(BLOCK_SIZE, 4096, GCM_TAG_SIZE);
        assert_eq!(g.iv_size, 16);
        assert_eq!(g.data_size, 65536);
        assert_eq!(g.enc_data_size, 65548);
        assert_eq!(g.enc_size, 65564);
        assert_eq!(g.overhead(), 28);
    }

    #[test]
    fn test_geometry_legacy() {
        let g = LegacyCodec.geometry(4);
        assert_eq!(g.data_size, 64);
        assert_eq!(g.enc_data_size, 64, "no tag bytes without authentication");
        assert_eq!(g.enc_size, 80);
    }

    #[test]
    fn test_aad_layout() {
        let aad = chunk_aad(0x0102_0304_0506_0708, true);
        assert_eq!(aad, [1, 2, 3, 4, 5, 6, 7, 8, 1]);
        assert_eq!(chunk_aad(5, false)[8], 0);
    }

    #[test]
    fn test_select_codec_kinds() {
        assert_eq!(select_codec(CodecKind::Legacy).kind(), CodecKind::Legacy);
        assert_eq!(select_codec(CodecKind::Gcm).kind(), CodecKind::Gcm);
        assert_eq!(select_codec(CodecKind::GcmHw).kind(), CodecKind::GcmHw);

        let auto = select_codec(CodecKind::Auto);
        assert_ne!(auto.kind(), CodecKind::Auto, "auto must resolve to a concrete codec");
        assert!(auto.implements_authentication(), "auto never picks the legacy codec");
    }

    #[test]
    fn test_parse_to_bytes_layout() {
        let chunk = EncryptedChunk {
            iv: [9u8; IV_SIZE],
            ciphertext: vec![1, 2, 3],
            tag: vec![0xEE; GCM_TAG_SIZE],
        };
        let raw = chunk.to_bytes();
        assert_eq!(raw.len(), IV_SIZE + 3 + GCM_TAG_SIZE);
        assert_eq!(&raw[..IV_SIZE], &[9u8; IV_SIZE]);
        assert_eq!(EncryptedChunk::parse(&raw, GCM_TAG_SIZE).unwrap(), chunk);

        let short = EncryptedChunk::parse(&raw[..20], GCM_TAG_SIZE);
        assert!(matches!(short, Err(TcfsError::Encryption(_))));
    }

    proptest! {
        #[test]
        fn last_chunk_roundtrip_any_length(
            data in proptest::collection::vec(any::<u8>(), 0..=300),
            index in any::<u64>(),
            legacy in any::<bool>(),
        ) {
            let kind = if legacy { CodecKind::Legacy } else { CodecKind::Gcm };
            let codec = select_codec(kind);
            let key = generate_file_key();
            let chunk = codec.encrypt_chunk(&key, &data, index, true).unwrap();
            prop_assert_eq!(chunk.ciphertext.len(), data.len());
            let raw = chunk.to_bytes();
            let parsed = EncryptedChunk::parse(&raw, codec.tag_length()).unwrap();
            let out = codec.decrypt_chunk(&key, &parsed, index, true).unwrap();
            prop_assert_eq!(out, data, "round-trip must be identical");
        }
    }
}
