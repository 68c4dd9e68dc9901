//! tcfs-encfile: transparent random-access encryption for files in a share
//!
//! On-disk layout of an encrypted file:
//! ```text
//! [header: magic | version | share key version | wrapped file key | root tag | HMAC]
//! [chunk 0: IV | ciphertext | tag]
//! [chunk 1: IV | ciphertext | tag]
//! ...
//! [last chunk: IV | ciphertext (partial) | tag]
//! ```
//!
//! Callers obtain an [`EncryptedFile`] from a [`FileRegistry`], supply the
//! share key, and then read and write plaintext at arbitrary offsets.

pub mod auth_tag;
pub mod cache;
pub mod file;
pub mod header;
pub mod layout;
pub mod registry;
pub mod stream;

pub use auth_tag::AuthTagVerifier;
pub use cache::ChunkCache;
pub use file::{EncryptedFile, FileState, IoStats};
pub use header::{header_size, FileHeader};
pub use layout::{ChunkSpan, FileLayout};
pub use registry::{normalize_path, EncFileOptions, FileRegistry};
pub use stream::{EncFileReader, EncFileWriter};

use tcfs_core::CodecKind;
use tcfs_crypto::select_codec;

/// Plaintext size of a ciphertext file of `real_len` bytes written with
/// `kind` and `chunk_multiple`, without opening it.
pub fn real_to_virtual_size(kind: CodecKind, chunk_multiple: usize, real_len: u64) -> u64 {
    let codec = select_codec(kind);
    FileLayout::new(
        codec.geometry(chunk_multiple),
        header_size(codec.implements_authentication()),
    )
    .real_to_virtual_size(real_len)
}
