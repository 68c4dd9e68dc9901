//! tcfs-crypto: key material and chunk ciphers for encrypted random-access files
//!
//! Key hierarchy:
//! ```text
//! Share Key (256-bit, versioned, supplied by share-key management)
//!   ├── Header HMAC-SHA256 and root authentication tag
//!   └── File Key (per-file, 256-bit random, AES-256 wrapped by the share key)
//!       └── Chunk cipher (key=file_key, IV=random 128-bit):
//!           ├── AES-256-GCM, 96-bit tag, AAD=chunk_idx||is_last   (gcm, gcm-hw)
//!           └── AES-256-CBC full chunks, AES-256-CFB8 tail        (legacy)
//! ```

pub mod codec;
pub mod keys;

pub use codec::{
    chunk_aad, resolve_codec_kind, select_codec, ChunkCodec, ChunkGeometry, EncryptedChunk,
    GcmCodec, HwGcmCodec, LegacyCodec,
};
pub use keys::{
    generate_file_key, generate_share_key, unwrap_file_key, wrap_file_key, FileKey, ShareKey,
};

/// Size of file and share keys in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Per-chunk IV size (one cipher block)
pub const IV_SIZE: usize = BLOCK_SIZE;

/// Size of a GCM chunk tag (96-bit)
pub const GCM_TAG_SIZE: usize = 12;
