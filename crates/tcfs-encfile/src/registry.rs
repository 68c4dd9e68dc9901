//! Table of live encrypted files keyed by (normalized path, writable)
//!
//! At most one instance exists per key, so every caller opening the same
//! file in the same mode shares one cache and one tag tree. Entries are
//! removed explicitly by `close` and moved by `rename_to`; nothing is
//! reclaimed implicitly.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use tcfs_core::config::{CryptoConfig, DEFAULT_CHUNK_MULTIPLE, MAX_CHUNK_MULTIPLE};
use tcfs_core::{CodecKind, TcfsError, TcfsResult};
use tcfs_crypto::{select_codec, ChunkCodec, ShareKey};
use tracing::debug;

use crate::file::EncryptedFile;
use crate::header::header_size;
use crate::layout::FileLayout;

pub(crate) type Entries = Mutex<HashMap<RegistryKey, Arc<EncryptedFile>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub path: PathBuf,
    pub writable: bool,
}

impl RegistryKey {
    fn new(path: &Path, writable: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            writable,
        }
    }
}

/// Codec and chunk size shared by every file of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncFileOptions {
    pub codec: CodecKind,
    /// Plaintext chunk size in cipher blocks
    pub chunk_multiple: usize,
}

impl Default for EncFileOptions {
    fn default() -> Self {
        Self {
            codec: CodecKind::Auto,
            chunk_multiple: DEFAULT_CHUNK_MULTIPLE,
        }
    }
}

impl From<&CryptoConfig> for EncFileOptions {
    fn from(config: &CryptoConfig) -> Self {
        Self {
            codec: config.codec,
            chunk_multiple: config.chunk_multiple,
        }
    }
}

#[derive(Debug)]
pub struct FileRegistry {
    options: EncFileOptions,
    codec: Arc<dyn ChunkCodec>,
    entries: Arc<Entries>,
}

static GLOBAL: LazyLock<FileRegistry> =
    LazyLock::new(|| FileRegistry::build(EncFileOptions::default()));

impl FileRegistry {
    pub fn new(options: EncFileOptions) -> TcfsResult<Self> {
        if options.chunk_multiple == 0 || options.chunk_multiple > MAX_CHUNK_MULTIPLE {
            return Err(TcfsError::Config(format!(
                "chunk multiple must be between 1 and {MAX_CHUNK_MULTIPLE}, got {}",
                options.chunk_multiple
            )));
        }
        Ok(Self::build(options))
    }

    fn build(options: EncFileOptions) -> Self {
        Self {
            options,
            codec: Arc::from(select_codec(options.codec)),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The process-wide registry with default options.
    pub fn global() -> &'static FileRegistry {
        &GLOBAL
    }

    pub fn options(&self) -> EncFileOptions {
        self.options
    }

    /// The concrete codec used for new and opened files.
    pub fn codec_kind(&self) -> CodecKind {
        self.codec.kind()
    }

    pub fn layout(&self) -> FileLayout {
        FileLayout::new(
            self.codec.geometry(self.options.chunk_multiple),
            header_size(self.codec.implements_authentication()),
        )
    }

    /// Plaintext size of a ciphertext file of `real_len` bytes, without
    /// opening it.
    pub fn real_to_virtual_size(&self, real_len: u64) -> u64 {
        self.layout().real_to_virtual_size(real_len)
    }

    /// Create a new encrypted file and register it as writable.
    ///
    /// Fails if a non-empty file already exists at `path`.
    pub fn create(
        &self,
        path: impl AsRef<Path>,
        share_key_version: u32,
        share_key: &ShareKey,
    ) -> TcfsResult<Arc<EncryptedFile>> {
        let key = RegistryKey::new(&normalize_path(path.as_ref())?, true);
        let mut entries = lock_entries(&self.entries)?;
        if entries.get(&key).is_some_and(|f| f.is_live()) {
            return Err(TcfsError::Encryption(format!(
                "{} is already open",
                key.path.display()
            )));
        }
        let file = Arc::new(self.new_file(&key));
        file.create_new(share_key_version, share_key)?;
        entries.insert(key, Arc::clone(&file));
        Ok(file)
    }

    /// Open an existing encrypted file, or return the live instance already
    /// registered for `(path, writable)`.
    pub fn open(&self, path: impl AsRef<Path>, writable: bool) -> TcfsResult<Arc<EncryptedFile>> {
        let key = RegistryKey::new(&normalize_path(path.as_ref())?, writable);
        let mut entries = lock_entries(&self.entries)?;
        if let Some(existing) = entries.get(&key).filter(|f| f.is_live()) {
            debug!(path = %key.path.display(), writable, "reusing open encrypted file");
            return Ok(Arc::clone(existing));
        }
        let file = Arc::new(self.new_file(&key));
        file.open_existing()?;
        entries.insert(key, Arc::clone(&file));
        Ok(file)
    }

    pub fn get(&self, path: impl AsRef<Path>, writable: bool) -> TcfsResult<Option<Arc<EncryptedFile>>> {
        let key = RegistryKey::new(&normalize_path(path.as_ref())?, writable);
        Ok(lock_entries(&self.entries)?.get(&key).cloned())
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered file. All files are attempted; the first
    /// error is returned.
    pub fn close_all(&self) -> TcfsResult<()> {
        let files: Vec<_> = lock_entries(&self.entries)?.values().cloned().collect();
        let mut first_err = None;
        for file in files {
            if let Err(e) = file.close() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn new_file(&self, key: &RegistryKey) -> EncryptedFile {
        EncryptedFile::new(
            key.path.clone(),
            key.writable,
            Arc::clone(&self.codec),
            self.options.chunk_multiple,
            Arc::downgrade(&self.entries),
        )
    }
}

fn lock_entries(entries: &Entries) -> TcfsResult<MutexGuard<'_, HashMap<RegistryKey, Arc<EncryptedFile>>>> {
    entries
        .lock()
        .map_err(|_| TcfsError::State("file registry lock poisoned".into()))
}

/// Drop the entry for `(path, writable)` if it still refers to `file`.
pub(crate) fn remove_entry(entries: &Entries, path: &Path, writable: bool, file: &EncryptedFile) {
    let mut map = entries.lock().unwrap_or_else(PoisonError::into_inner);
    let key = RegistryKey::new(path, writable);
    if map.get(&key).is_some_and(|f| std::ptr::eq(Arc::as_ptr(f), file)) {
        map.remove(&key);
    }
}

/// Move `file`'s entry from `old` to `new` and return the instances that
/// were displaced: anything registered at `new`, and the other access mode
/// at `old`. The caller closes them outside the registry lock.
pub(crate) fn migrate(
    entries: &Entries,
    file: &EncryptedFile,
    old: &Path,
    new: &Path,
) -> TcfsResult<Vec<Arc<EncryptedFile>>> {
    let writable = file.is_writable();
    let mut map = lock_entries(entries)?;
    let mut displaced = Vec::new();

    for mode in [true, false] {
        if let Some(stale) = map.remove(&RegistryKey::new(new, mode)) {
            displaced.push(stale);
        }
    }
    if let Some(other) = map.remove(&RegistryKey::new(old, !writable)) {
        displaced.push(other);
    }
    if let Some(own) = map.remove(&RegistryKey::new(old, writable)) {
        if std::ptr::eq(Arc::as_ptr(&own), file) {
            map.insert(RegistryKey::new(new, writable), own);
        } else {
            displaced.push(own);
        }
    }
    displaced.retain(|f| !std::ptr::eq(Arc::as_ptr(f), file));
    Ok(displaced)
}

/// Absolute path with `.` and `..` resolved lexically. Symlinks are not
/// followed, so the file does not need to exist yet.
pub fn normalize_path(path: &Path) -> TcfsResult<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        let base = std::env::current_dir().unwrap();
        assert_eq!(normalize_path(Path::new("a/./b/../c")).unwrap(), base.join("a/c"));
        assert_eq!(
            normalize_path(Path::new("/tmp/x/../y/./z")).unwrap(),
            PathBuf::from("/tmp/y/z")
        );
    }

    #[test]
    fn test_rejects_bad_chunk_multiple() {
        let result = FileRegistry::new(EncFileOptions {
            codec: CodecKind::Gcm,
            chunk_multiple: 0,
        });
        assert!(matches!(result, Err(TcfsError::Config(_))));
    }

    #[test]
    fn test_options_from_config() {
        let config = CryptoConfig {
            codec: CodecKind::Legacy,
            chunk_multiple: 8,
            share_key_file: None,
        };
        let options = EncFileOptions::from(&config);
        assert_eq!(options.codec, CodecKind::Legacy);
        assert_eq!(options.chunk_multiple, 8);
    }

    #[test]
    fn test_layout_per_codec() {
        let gcm = FileRegistry::new(EncFileOptions { codec: CodecKind::Gcm, chunk_multiple: 4 }).unwrap();
        assert_eq!(gcm.layout().header_size(), 110);
        assert_eq!(gcm.layout().enc_size(), 92);

        let legacy =
            FileRegistry::new(EncFileOptions { codec: CodecKind::Legacy, chunk_multiple: 4 }).unwrap();
        assert_eq!(legacy.layout().header_size(), 78);
        assert_eq!(legacy.layout().enc_size(), 80);
    }

    #[test]
    fn test_global_registry_defaults() {
        let global = FileRegistry::global();
        assert_eq!(global.options(), EncFileOptions::default());
        assert!(std::ptr::eq(global, FileRegistry::global()));
    }
}
