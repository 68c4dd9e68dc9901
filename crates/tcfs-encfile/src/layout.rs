//! Translation between virtual (plaintext) and real (on-disk) offsets
//!
//! ```text
//! real:  [header][IV|data 0|tag][IV|data 1|tag] ... [IV|data n (partial)|tag]
//! virt:          [   data 0   ][   data 1   ] ... [ data n ]
//! ```
//!
//! Every chunk but the last holds exactly `data_size` plaintext bytes. The
//! last chunk holds 1..=data_size bytes, or nothing in an empty file.

use tcfs_core::{TcfsError, TcfsResult};
use tcfs_crypto::ChunkGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLayout {
    geometry: ChunkGeometry,
    header_size: u64,
}

/// The part of one chunk touched by a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u64,
    /// Offset of the range start inside the chunk's plaintext
    pub offset: usize,
    pub len: usize,
}

impl ChunkSpan {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

impl FileLayout {
    pub fn new(geometry: ChunkGeometry, header_size: usize) -> Self {
        Self {
            geometry,
            header_size: header_size as u64,
        }
    }

    pub fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn data_size(&self) -> u64 {
        self.geometry.data_size as u64
    }

    pub fn enc_size(&self) -> u64 {
        self.geometry.enc_size as u64
    }

    pub fn iv_size(&self) -> u64 {
        self.geometry.iv_size as u64
    }

    pub fn tag_size(&self) -> u64 {
        self.geometry.tag_length as u64
    }

    /// Real offset where the IV of chunk `index` begins.
    pub fn chunk_offset(&self, index: u64) -> u64 {
        self.header_size + index * self.enc_size()
    }

    /// Number of chunks stored in a backing file of `real_len` bytes.
    pub fn chunk_count(&self, real_len: u64) -> u64 {
        if real_len <= self.header_size {
            return 0;
        }
        (real_len - self.header_size).div_ceil(self.enc_size())
    }

    /// Index of the last chunk. An empty file's last chunk is 0; a file
    /// ending exactly on a chunk boundary has its last chunk before it.
    pub fn last_chunk_index(&self, real_len: u64) -> u64 {
        let len = real_len.saturating_sub(self.header_size);
        if len == 0 {
            0
        } else if len % self.enc_size() == 0 {
            len / self.enc_size() - 1
        } else {
            len / self.enc_size()
        }
    }

    /// Index of the last chunk of a plaintext of `virtual_len` bytes.
    pub fn last_chunk_index_for(&self, virtual_len: u64) -> u64 {
        virtual_len.saturating_sub(1) / self.data_size()
    }

    /// Plaintext length represented by `real_len` bytes of backing storage.
    pub fn virtual_len(&self, real_len: u64) -> u64 {
        if real_len <= self.header_size {
            return 0;
        }
        let body = real_len - self.header_size;
        let full = body / self.enc_size();
        let tail = body % self.enc_size();
        full * self.data_size() + tail.saturating_sub(self.iv_size() + self.tag_size())
    }

    /// Backing storage length needed for `virtual_len` bytes of plaintext.
    pub fn real_len_for(&self, virtual_len: u64) -> u64 {
        let full = virtual_len / self.data_size();
        let tail = virtual_len % self.data_size();
        let tail_real = if tail > 0 {
            self.iv_size() + tail + self.tag_size()
        } else {
            0
        };
        self.header_size + full * self.enc_size() + tail_real
    }

    /// Real offset of virtual byte `virtual_pos`.
    pub fn real_position(&self, virtual_pos: u64) -> TcfsResult<u64> {
        let index = virtual_pos / self.data_size();
        let offset = virtual_pos % self.data_size();
        index
            .checked_mul(self.enc_size())
            .and_then(|p| p.checked_add(self.header_size + self.iv_size() + offset))
            .ok_or_else(|| {
                TcfsError::Encryption(format!("position {virtual_pos} is out of range"))
            })
    }

    /// Virtual offset of real byte `real_pos`.
    ///
    /// Positions inside the header, an IV or a tag have no plaintext
    /// counterpart and are rejected.
    pub fn virtual_position(&self, real_pos: u64) -> TcfsResult<u64> {
        let body = real_pos.checked_sub(self.header_size).ok_or_else(|| {
            TcfsError::Encryption(format!("real position {real_pos} lies inside the header"))
        })?;
        let index = body / self.enc_size();
        let in_chunk = body % self.enc_size();
        if in_chunk < self.iv_size() || in_chunk >= self.iv_size() + self.data_size() {
            return Err(TcfsError::Encryption(format!(
                "real position {real_pos} lies inside a chunk IV or tag"
            )));
        }
        Ok(index * self.data_size() + (in_chunk - self.iv_size()))
    }

    /// Split `len` bytes starting at `pos` into per-chunk spans: a leading
    /// partial chunk, full chunks, then a trailing partial chunk.
    pub fn chunk_spans(&self, pos: u64, len: usize) -> ChunkSpans {
        ChunkSpans {
            pos,
            remaining: len,
            data_size: self.data_size(),
        }
    }

    /// Same as [`virtual_len`](Self::virtual_len); named for callers that
    /// only know a ciphertext file size.
    pub fn real_to_virtual_size(&self, real_len: u64) -> u64 {
        self.virtual_len(real_len)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkSpans {
    pos: u64,
    remaining: usize,
    data_size: u64,
}

impl Iterator for ChunkSpans {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.pos / self.data_size;
        let offset = (self.pos % self.data_size) as usize;
        let len = self.remaining.min(self.data_size as usize - offset);
        self.pos += len as u64;
        self.remaining -= len;
        Some(ChunkSpan { index, offset, len })
    }
}
