//! Single-slot write-back chunk cache
//!
//! Holds at most one plaintext chunk. Small writes to the same chunk are
//! merged here and reach storage only when another chunk is touched or the
//! file is flushed.

#[derive(Debug)]
struct CachedChunk {
    index: u64,
    data: Vec<u8>,
    dirty: bool,
    is_last: bool,
}

#[derive(Debug, Default)]
pub struct ChunkCache {
    slot: Option<CachedChunk>,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the cached plaintext if the slot holds chunk `index`.
    pub fn get(&self, index: u64) -> Option<Vec<u8>> {
        self.slot
            .as_ref()
            .filter(|c| c.index == index)
            .map(|c| c.data.clone())
    }

    /// Replace the slot unconditionally. The cache takes ownership of `data`.
    pub fn set(&mut self, index: u64, data: Vec<u8>, dirty: bool, is_last: bool) {
        self.slot = Some(CachedChunk {
            index,
            data,
            dirty,
            is_last,
        });
    }

    pub fn index(&self) -> Option<u64> {
        self.slot.as_ref().map(|c| c.index)
    }

    pub fn is_dirty(&self) -> bool {
        self.slot.as_ref().is_some_and(|c| c.dirty)
    }

    /// The pending chunk as `(index, plaintext, is_last)`, if any.
    pub fn dirty_chunk(&self) -> Option<(u64, &[u8], bool)> {
        self.slot
            .as_ref()
            .filter(|c| c.dirty)
            .map(|c| (c.index, c.data.as_slice(), c.is_last))
    }

    pub fn mark_clean(&mut self) {
        if let Some(c) = self.slot.as_mut() {
            c.dirty = false;
        }
    }

    /// Drop the slot, discarding any pending data.
    pub fn invalidate(&mut self) {
        self.slot = None;
    }
}
