//! Encrypted random-access file
//!
//! Callers see a plain byte-addressable file. Every operation is mapped onto
//! whole chunks: reads decrypt a chunk (or hit the single-slot cache) and
//! copy the requested slice, writes merge into the cached chunk and reach
//! storage when another chunk is touched or the file is flushed.
//!
//! Lifecycle:
//! ```text
//! Unopened ──open()──▶ Opened ──init_with_share_key()──▶ Initialized ──close()──▶ Closed
//!     └────────────────────────create()───────────────────────▶┘
//! ```
//!
//! The last chunk is sealed differently from full chunks (is_last AAD flag
//! for GCM, CFB8 instead of CBC for the legacy codec). Growing a file past
//! its last chunk therefore re-encrypts the old last chunk as a full,
//! zero-padded chunk before anything is written after it.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tcfs_core::{CodecKind, TcfsError, TcfsResult};
use tcfs_crypto::{generate_file_key, ChunkCodec, EncryptedChunk, FileKey, ShareKey};
use tracing::{debug, info, trace, warn};

use crate::auth_tag::AuthTagVerifier;
use crate::cache::ChunkCache;
use crate::header::{header_size, FileHeader};
use crate::layout::{ChunkSpan, FileLayout};
use crate::registry::{self, Entries};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Unopened,
    /// Header format checked, share key not supplied yet
    Opened,
    /// Header verified and file key recovered; reads and writes allowed
    Initialized,
    Closed,
}

/// Storage operations performed by one file instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub chunks_read: u64,
    pub chunks_written: u64,
    pub header_writes: u64,
}

pub struct EncryptedFile {
    writable: bool,
    kind: CodecKind,
    layout: FileLayout,
    closed: AtomicBool,
    inner: Mutex<Inner>,
    entries: Weak<Entries>,
}

struct Inner {
    path: PathBuf,
    writable: bool,
    codec: Arc<dyn ChunkCodec>,
    layout: FileLayout,
    state: FileState,
    storage: Option<File>,
    header: FileHeader,
    share_key: Option<ShareKey>,
    cache: ChunkCache,
    verifier: Option<AuthTagVerifier>,
    /// Backing length including a pending cached chunk
    real_len: u64,
    /// Virtual file pointer
    pos: u64,
    stats: IoStats,
}

impl EncryptedFile {
    pub(crate) fn new(
        path: PathBuf,
        writable: bool,
        codec: Arc<dyn ChunkCodec>,
        chunk_multiple: usize,
        entries: Weak<Entries>,
    ) -> Self {
        let authenticated = codec.implements_authentication();
        let layout = FileLayout::new(codec.geometry(chunk_multiple), header_size(authenticated));
        Self {
            writable,
            kind: codec.kind(),
            layout,
            closed: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                path,
                writable,
                codec,
                layout,
                state: FileState::Unopened,
                storage: None,
                header: FileHeader::new(authenticated),
                share_key: None,
                cache: ChunkCache::new(),
                verifier: None,
                real_len: 0,
                pos: 0,
                stats: IoStats::default(),
            }),
            entries,
        }
    }

    fn inner(&self) -> TcfsResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| TcfsError::State("file lock poisoned by a panicked thread".into()))
    }

    pub(crate) fn open_existing(&self) -> TcfsResult<()> {
        self.inner()?.open()
    }

    pub(crate) fn create_new(&self, share_key_version: u32, share_key: &ShareKey) -> TcfsResult<()> {
        self.inner()?.create(share_key_version, share_key)
    }

    /// False once `close` has started; the registry never hands out such an
    /// instance again.
    pub(crate) fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn codec_kind(&self) -> CodecKind {
        self.kind
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Current backing path (follows `rename_to`).
    pub fn path(&self) -> PathBuf {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .path
            .clone()
    }

    pub fn state(&self) -> TcfsResult<FileState> {
        Ok(self.inner()?.state)
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            Ok(FileState::Opened) | Ok(FileState::Initialized)
        )
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state(), Ok(FileState::Initialized))
    }

    /// Share key version recorded in the header; known right after open.
    pub fn share_key_version(&self) -> TcfsResult<Option<u32>> {
        Ok(self.inner()?.header.share_key_version())
    }

    pub fn io_stats(&self) -> TcfsResult<IoStats> {
        Ok(self.inner()?.stats)
    }

    /// Verify the header and chunk tag tree with the share key and unlock
    /// reads and writes. A no-op on an already initialized file.
    pub fn init_with_share_key(&self, share_key: &ShareKey) -> TcfsResult<()> {
        self.inner()?.init_with_share_key(share_key)
    }

    /// Read up to `buf.len()` bytes at the file pointer. Returns `Ok(0)` at
    /// or past end of file; a short count means the file ended mid-range.
    pub fn read(&self, buf: &mut [u8]) -> TcfsResult<usize> {
        self.inner()?.read(buf)
    }

    /// Write all of `buf` at the file pointer, growing the file as needed.
    pub fn write(&self, buf: &[u8]) -> TcfsResult<usize> {
        self.inner()?.write(buf)
    }

    /// Seek and read under one lock acquisition.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> TcfsResult<usize> {
        let mut inner = self.inner()?;
        inner.seek(pos)?;
        inner.read(buf)
    }

    /// Seek and write under one lock acquisition.
    pub fn write_at(&self, pos: u64, buf: &[u8]) -> TcfsResult<usize> {
        let mut inner = self.inner()?;
        inner.seek(pos)?;
        inner.write(buf)
    }

    /// Move the file pointer. Seeking past the end is allowed; a later write
    /// there zero-fills the gap.
    pub fn seek(&self, pos: u64) -> TcfsResult<()> {
        self.inner()?.seek(pos)
    }

    pub fn file_pointer(&self) -> TcfsResult<u64> {
        let inner = self.inner()?;
        inner.require_initialized()?;
        Ok(inner.pos)
    }

    /// Plaintext length, including data still held in the cache.
    pub fn length(&self) -> TcfsResult<u64> {
        let inner = self.inner()?;
        inner.require_initialized()?;
        Ok(inner.virtual_len())
    }

    /// Truncate or extend the file. Extension zero-fills.
    pub fn set_length(&self, len: u64) -> TcfsResult<()> {
        self.inner()?.set_length(len)
    }

    /// Persist the cached chunk and, if chunk tags changed, the root tag.
    pub fn flush(&self) -> TcfsResult<()> {
        self.inner()?.flush()
    }

    /// Rebuild the tag tree from storage and verify it against the header.
    ///
    /// Returns `Ok(true)` when the file verifies, `Ok(false)` for the legacy
    /// codec, which has nothing to verify, and an `Integrity` error when the
    /// stored tags or header do not match.
    pub fn check_authentication_tag(&self) -> TcfsResult<bool> {
        self.inner()?.check_authentication_tag()
    }

    /// Advisory whole-file lock on the backing storage: exclusive for
    /// writable handles, shared for read-only ones. Returns false when
    /// `blocking` is false and the lock is held elsewhere.
    pub fn lock(&self, blocking: bool) -> TcfsResult<bool> {
        self.inner()?.lock_storage(blocking)
    }

    pub fn unlock(&self) -> TcfsResult<()> {
        let inner = self.inner()?;
        inner.storage()?.unlock()?;
        Ok(())
    }

    /// Flush, release all key material and buffers, and drop the registry
    /// entry. Closing twice is harmless.
    pub fn close(&self) -> TcfsResult<()> {
        let (result, path) = {
            let mut inner = self.inner()?;
            self.closed.store(true, Ordering::Release);
            (inner.close(), inner.path.clone())
        };
        if let Some(entries) = self.entries.upgrade() {
            registry::remove_entry(&entries, &path, self.writable, self);
        }
        result
    }

    /// Rename the backing file and move the registry entry along.
    ///
    /// The other access mode's instance at the old path and any instances
    /// registered at the new path are closed and discarded.
    pub fn rename_to(&self, new_path: impl AsRef<Path>) -> TcfsResult<()> {
        let new_path = registry::normalize_path(new_path.as_ref())?;
        let old_path = {
            let mut inner = self.inner()?;
            inner.storage()?;
            std::fs::rename(&inner.path, &new_path)?;
            std::mem::replace(&mut inner.path, new_path.clone())
        };
        info!(
            from = %old_path.display(),
            to = %new_path.display(),
            writable = self.writable,
            "renamed encrypted file"
        );

        let Some(entries) = self.entries.upgrade() else {
            return Ok(());
        };
        for stale in registry::migrate(&entries, self, &old_path, &new_path)? {
            if let Err(e) = stale.close() {
                warn!(path = %stale.path().display(), error = %e, "closing displaced instance failed");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EncryptedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFile")
            .field("path", &self.path())
            .field("writable", &self.writable)
            .field("codec", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Inner {
    fn storage(&self) -> TcfsResult<&File> {
        self.storage
            .as_ref()
            .ok_or_else(|| not_ready(&self.path, self.state))
    }

    fn require_initialized(&self) -> TcfsResult<()> {
        match self.state {
            FileState::Initialized => Ok(()),
            state => Err(not_ready(&self.path, state)),
        }
    }

    fn require_writable(&self) -> TcfsResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(TcfsError::Encryption(format!(
                "{} was opened read-only",
                self.path.display()
            )))
        }
    }

    fn virtual_len(&self) -> u64 {
        self.layout.virtual_len(self.real_len)
    }

    fn open(&mut self) -> TcfsResult<()> {
        if self.state != FileState::Unopened {
            return Err(TcfsError::State(format!(
                "{} cannot be opened from state {:?}",
                self.path.display(),
                self.state
            )));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(self.writable)
            .open(&self.path)?;
        let real_len = file.metadata()?.len();
        if real_len < self.layout.header_size() {
            return Err(TcfsError::Encryption(format!(
                "{} is not an encrypted file: {real_len} bytes is shorter than the header",
                self.path.display()
            )));
        }
        self.header.read_dont_verify(&mut file)?;

        self.storage = Some(file);
        self.real_len = real_len;
        self.pos = 0;
        self.state = FileState::Opened;
        debug!(
            path = %self.path.display(),
            writable = self.writable,
            share_key_version = ?self.header.share_key_version(),
            "opened encrypted file"
        );
        Ok(())
    }

    fn create(&mut self, share_key_version: u32, share_key: &ShareKey) -> TcfsResult<()> {
        if self.state != FileState::Unopened {
            return Err(TcfsError::State(format!(
                "{} cannot be created from state {:?}",
                self.path.display(),
                self.state
            )));
        }
        self.require_writable()?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        if file.metadata()?.len() > 0 {
            return Err(TcfsError::Encryption(format!(
                "{}: a non-empty file already exists",
                self.path.display()
            )));
        }

        let mut header = FileHeader::new(self.codec.implements_authentication());
        header.set_share_key_version(share_key_version);
        header.set_file_key(generate_file_key());
        header.write(&mut file, share_key)?;
        self.stats.header_writes += 1;

        self.verifier = self
            .codec
            .implements_authentication()
            .then(|| AuthTagVerifier::new(share_key, self.codec.tag_length()));
        self.header = header;
        self.storage = Some(file);
        self.share_key = Some(share_key.clone());
        self.real_len = self.layout.header_size();
        self.pos = 0;
        self.state = FileState::Initialized;
        debug!(
            path = %self.path.display(),
            share_key_version,
            codec = %self.codec.kind(),
            "created encrypted file"
        );
        Ok(())
    }

    fn init_with_share_key(&mut self, share_key: &ShareKey) -> TcfsResult<()> {
        match self.state {
            FileState::Opened => {}
            FileState::Initialized => {
                debug!(path = %self.path.display(), "file already initialized");
                return Ok(());
            }
            state => return Err(not_ready(&self.path, state)),
        }
        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| not_ready(&self.path, self.state))?;

        let authenticated = self.codec.implements_authentication();
        let mut header = FileHeader::new(authenticated);
        header.read_and_verify(storage, share_key)?;

        let verifier = if authenticated {
            let real_len = storage.metadata()?.len();
            let verifier = load_verifier(storage, &self.layout, real_len, share_key)?;
            if !verifier.verify_root_tag(header.auth_tag())? {
                return Err(TcfsError::Integrity(format!(
                    "{}: file authentication tag does not match the chunk tags",
                    self.path.display()
                )));
            }
            Some(verifier)
        } else {
            None
        };

        debug!(
            path = %self.path.display(),
            chunks = self.layout.chunk_count(self.real_len),
            "verified encrypted file"
        );
        self.header = header;
        self.verifier = verifier;
        self.share_key = Some(share_key.clone());
        self.state = FileState::Initialized;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> TcfsResult<usize> {
        self.require_initialized()?;
        let len = self.virtual_len();
        if buf.is_empty() || self.pos >= len {
            return Ok(0);
        }
        let wanted = (len - self.pos).min(buf.len() as u64) as usize;
        let last = self.layout.last_chunk_index(self.real_len);

        let mut done = 0;
        for span in self.layout.chunk_spans(self.pos, wanted) {
            let chunk = self.fetch_chunk(span.index, span.index == last)?;
            let end = chunk.len().min(span.end());
            if end <= span.offset {
                break;
            }
            let n = end - span.offset;
            buf[done..done + n].copy_from_slice(&chunk[span.offset..end]);
            done += n;
            self.pos += n as u64;
            if n < span.len {
                break;
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> TcfsResult<usize> {
        self.require_initialized()?;
        self.require_writable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self
            .pos
            .checked_add(buf.len() as u64)
            .ok_or_else(|| TcfsError::Encryption("write past the maximum file size".into()))?;
        self.layout.real_position(end)?;

        let mut done = 0;
        for span in self.layout.chunk_spans(self.pos, buf.len()) {
            self.write_span(span, &buf[done..done + span.len])?;
            done += span.len;
            self.pos += span.len as u64;
        }
        Ok(done)
    }

    fn write_span(&mut self, span: ChunkSpan, data: &[u8]) -> TcfsResult<()> {
        let last = self.layout.last_chunk_index(self.real_len);
        let full = self.layout.data_size() as usize;

        if span.index < last {
            // inside an existing full chunk
            let chunk = if span.offset == 0 && span.len == full {
                data.to_vec()
            } else {
                let mut chunk = self.fetch_chunk(span.index, false)?;
                chunk[span.offset..span.end()].copy_from_slice(data);
                chunk
            };
            self.store_chunk(span.index, chunk, false)
        } else if span.index == last {
            // inside or extending the last chunk
            let mut chunk = self.fetch_chunk(last, true)?;
            if chunk.len() < span.end() {
                chunk.resize(span.end(), 0);
            }
            chunk[span.offset..span.end()].copy_from_slice(data);
            self.store_chunk(last, chunk, true)
        } else {
            // beyond the last chunk
            self.extend_chunks(span.index)?;
            let mut chunk = vec![0u8; span.end()];
            chunk[span.offset..].copy_from_slice(data);
            self.store_chunk(span.index, chunk, true)
        }
    }

    /// Turn the current last chunk into a full chunk and zero-fill every
    /// chunk before `target`, which becomes the caller's new last chunk.
    fn extend_chunks(&mut self, target: u64) -> TcfsResult<()> {
        let last = self.layout.last_chunk_index(self.real_len);
        let full = self.layout.data_size() as usize;

        let mut tail = self.fetch_chunk(last, true)?;
        tail.resize(full, 0);
        self.store_chunk(last, tail, false)?;
        for index in last + 1..target {
            self.store_chunk(index, vec![0u8; full], false)?;
        }
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> TcfsResult<()> {
        self.require_initialized()?;
        let real = self.layout.real_position(pos)?;
        self.pos = self.layout.virtual_position(real)?;
        Ok(())
    }

    fn set_length(&mut self, new_len: u64) -> TcfsResult<()> {
        self.require_initialized()?;
        self.require_writable()?;
        self.layout.real_position(new_len)?;

        let old_len = self.virtual_len();
        if new_len == old_len {
            return Ok(());
        }
        let old_last = self.layout.last_chunk_index(self.real_len);
        let new_last = self.layout.last_chunk_index_for(new_len);
        let tail_len = (new_len - new_last * self.layout.data_size()) as usize;

        if new_len > old_len {
            if new_last == old_last {
                let mut chunk = self.fetch_chunk(old_last, true)?;
                chunk.resize(tail_len, 0);
                self.store_chunk(new_last, chunk, true)?;
            } else {
                self.extend_chunks(new_last)?;
                self.store_chunk(new_last, vec![0u8; tail_len], true)?;
            }
            return self.flush();
        }

        self.flush_cache()?;
        let first_dropped = if new_len == 0 { 0 } else { new_last + 1 };
        if let Some(verifier) = self.verifier.as_mut() {
            for index in (first_dropped..=old_last).rev() {
                verifier.remove_tag(index)?;
            }
        }
        if new_len > 0 {
            let mut chunk = self.fetch_chunk(new_last, new_last == old_last)?;
            chunk.truncate(tail_len);
            self.store_chunk(new_last, chunk, true)?;
            self.flush_cache()?;
        }
        self.cache.invalidate();
        self.persist_root_tag(true)?;

        let real_len = self.layout.real_len_for(new_len);
        self.storage()?.set_len(real_len)?;
        self.real_len = real_len;
        self.pos = self.pos.min(new_len);
        debug!(
            path = %self.path.display(),
            from = old_len,
            to = new_len,
            "truncated encrypted file"
        );
        Ok(())
    }

    fn flush(&mut self) -> TcfsResult<()> {
        match self.state {
            FileState::Initialized => {}
            FileState::Opened => return Ok(()),
            state => return Err(not_ready(&self.path, state)),
        }
        if !self.writable {
            return Ok(());
        }
        self.flush_cache()?;
        self.persist_root_tag(false)
    }

    fn close(&mut self) -> TcfsResult<()> {
        let flushed = match self.state {
            FileState::Unopened | FileState::Closed => {
                debug!(path = %self.path.display(), state = ?self.state, "close on a file that is not open");
                return Ok(());
            }
            FileState::Initialized if self.writable => {
                if self.cache.is_dirty() {
                    warn!(
                        path = %self.path.display(),
                        chunk = ?self.cache.index(),
                        "closing with an unflushed chunk, flushing first"
                    );
                }
                self.flush()
            }
            FileState::Initialized | FileState::Opened => Ok(()),
        };

        debug!(
            path = %self.path.display(),
            chunks_read = self.stats.chunks_read,
            chunks_written = self.stats.chunks_written,
            header_writes = self.stats.header_writes,
            "closed encrypted file"
        );
        self.cache.invalidate();
        self.verifier = None;
        self.share_key = None;
        self.storage = None;
        self.header = FileHeader::new(self.header.is_authenticated());
        self.state = FileState::Closed;
        flushed
    }

    fn check_authentication_tag(&mut self) -> TcfsResult<bool> {
        self.require_initialized()?;
        if self.verifier.is_none() {
            debug!(path = %self.path.display(), "legacy codec: no authentication tags to check");
            return Ok(false);
        }
        self.flush()?;

        let share_key = self
            .share_key
            .clone()
            .ok_or_else(|| not_ready(&self.path, self.state))?;
        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| not_ready(&self.path, self.state))?;

        let mut on_disk = FileHeader::new(true);
        on_disk.read_and_verify(storage, &share_key)?;
        let real_len = storage.metadata()?.len();
        let fresh = load_verifier(storage, &self.layout, real_len, &share_key)?;

        if fresh.verify_root_tag(on_disk.auth_tag())? {
            Ok(true)
        } else {
            Err(TcfsError::Integrity(format!(
                "{}: file authentication tag does not match the stored chunk tags",
                self.path.display()
            )))
        }
    }

    fn lock_storage(&self, blocking: bool) -> TcfsResult<bool> {
        let storage = self.storage()?;
        if blocking {
            if self.writable {
                storage.lock()?;
            } else {
                storage.lock_shared()?;
            }
            return Ok(true);
        }
        let attempt = if self.writable {
            storage.try_lock()
        } else {
            storage.try_lock_shared()
        };
        match attempt {
            Ok(()) => Ok(true),
            Err(TryLockError::WouldBlock) => Ok(false),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }

    // ── chunk I/O ────────────────────────────────────────────────────────

    /// Plaintext of chunk `index`, from the cache or decrypted from storage.
    fn fetch_chunk(&mut self, index: u64, is_last: bool) -> TcfsResult<Vec<u8>> {
        if let Some(data) = self.cache.get(index) {
            return Ok(data);
        }
        self.flush_cache()?;
        let data = self.read_chunk(index, is_last)?;
        self.cache.set(index, data.clone(), false, is_last);
        Ok(data)
    }

    /// Put a modified chunk into the cache, writing out a different pending
    /// chunk first.
    fn store_chunk(&mut self, index: u64, data: Vec<u8>, is_last: bool) -> TcfsResult<()> {
        if self.cache.index() != Some(index) {
            self.flush_cache()?;
        }
        let end = self.layout.chunk_offset(index)
            + self.layout.iv_size()
            + data.len() as u64
            + self.layout.tag_size();
        self.real_len = self.real_len.max(end);
        self.cache.set(index, data, true, is_last);
        Ok(())
    }

    fn read_chunk(&mut self, index: u64, is_last: bool) -> TcfsResult<Vec<u8>> {
        let offset = self.layout.chunk_offset(index);
        let size = if is_last {
            let remaining = self.real_len.saturating_sub(offset);
            if remaining > self.layout.enc_size() {
                return Err(TcfsError::Encryption(format!(
                    "last chunk {index} spans {remaining} bytes, more than a full chunk"
                )));
            }
            if remaining <= self.layout.iv_size() {
                return Ok(Vec::new());
            }
            remaining
        } else {
            self.layout.enc_size()
        };

        let mut raw = vec![0u8; size as usize];
        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| not_ready(&self.path, self.state))?;
        storage.seek(SeekFrom::Start(offset))?;
        storage.read_exact(&mut raw)?;
        self.stats.chunks_read += 1;

        let chunk = EncryptedChunk::parse(&raw, self.layout.tag_size() as usize)?;
        if let Some(verifier) = &self.verifier {
            if verifier.tag(index) != Some(chunk.tag.as_slice()) {
                return Err(TcfsError::Integrity(format!(
                    "chunk {index} tag does not match the verified tag list"
                )));
            }
        }
        let plaintext = self
            .codec
            .decrypt_chunk(file_key(&self.header)?, &chunk, index, is_last)?;
        if !is_last && plaintext.len() as u64 != self.layout.data_size() {
            return Err(TcfsError::Encryption(format!(
                "full chunk {index} decrypted to {} bytes",
                plaintext.len()
            )));
        }
        trace!(chunk = index, is_last, len = plaintext.len(), "chunk read");
        Ok(plaintext)
    }

    /// Encrypt and write the pending chunk, then record its tag.
    fn flush_cache(&mut self) -> TcfsResult<()> {
        let Some((index, data, is_last)) = self.cache.dirty_chunk() else {
            return Ok(());
        };
        // Resizes evict emptied chunks and writes never dirty zero bytes.
        debug_assert!(!data.is_empty(), "dirty chunk {index} is empty");
        let chunk = self
            .codec
            .encrypt_chunk(file_key(&self.header)?, data, index, is_last)?;
        let len = data.len();

        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| not_ready(&self.path, self.state))?;
        storage.seek(SeekFrom::Start(self.layout.chunk_offset(index)))?;
        storage.write_all(&chunk.to_bytes())?;
        self.stats.chunks_written += 1;

        // the tag is recorded only once the chunk is in storage
        if let Some(verifier) = self.verifier.as_mut() {
            verifier.update_tag(index, &chunk.tag)?;
        }
        self.cache.mark_clean();
        trace!(chunk = index, is_last, len, "chunk written");
        Ok(())
    }

    /// Rebuild the root tag and rewrite the header, if tags changed or
    /// `force` is set. No-op without authentication.
    fn persist_root_tag(&mut self, force: bool) -> TcfsResult<()> {
        let Some(verifier) = self.verifier.as_mut() else {
            return Ok(());
        };
        if !force && !verifier.needs_update() {
            return Ok(());
        }
        let root = if verifier.is_empty() {
            None
        } else {
            Some(verifier.build_root_tag()?)
        };
        self.header.set_auth_tag(root);

        let share_key = self
            .share_key
            .as_ref()
            .ok_or_else(|| not_ready(&self.path, self.state))?;
        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| not_ready(&self.path, self.state))?;
        self.header.write(storage, share_key)?;
        self.stats.header_writes += 1;
        verifier.mark_persisted();
        Ok(())
    }
}

/// Read the trailing tag of every stored chunk, without decrypting.
fn load_verifier(
    storage: &mut File,
    layout: &FileLayout,
    real_len: u64,
    share_key: &ShareKey,
) -> TcfsResult<AuthTagVerifier> {
    let tag_len = layout.tag_size();
    let mut verifier = AuthTagVerifier::new(share_key, tag_len as usize);
    let mut tag = vec![0u8; tag_len as usize];

    for index in 0..layout.chunk_count(real_len) {
        let start = layout.chunk_offset(index);
        let end = (start + layout.enc_size()).min(real_len);
        if end - start < layout.iv_size() + tag_len {
            return Err(TcfsError::Integrity(format!(
                "chunk {index} is truncated to {} bytes",
                end - start
            )));
        }
        storage.seek(SeekFrom::Start(end - tag_len))?;
        storage.read_exact(&mut tag)?;
        verifier.insert_tag(index, &tag)?;
    }
    Ok(verifier)
}

fn file_key(header: &FileHeader) -> TcfsResult<&FileKey> {
    header
        .file_key()
        .ok_or_else(|| TcfsError::State("file key not available".into()))
}

fn not_ready(path: &Path, state: FileState) -> TcfsError {
    TcfsError::State(format!(
        "{}: operation not allowed in state {state:?}",
        path.display()
    ))
}
