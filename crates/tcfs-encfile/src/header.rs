//! Fixed-layout, HMAC-authenticated file header
//!
//! ```text
//! [6 bytes: magic "TCFSRA"][4 bytes: version "1.00"]
//! [4 bytes: share key version, big-endian]
//! [32 bytes: file key, AES-256 encrypted under the share key]
//! [32 bytes: root authentication tag, all zero = none]   (authenticated codecs only)
//! [32 bytes: HMAC-SHA256(share_key, all preceding bytes)]
//! ```

use std::io::{Read, Seek, SeekFrom, Write};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tcfs_core::{TcfsError, TcfsResult};
use tcfs_crypto::{unwrap_file_key, wrap_file_key, FileKey, ShareKey, KEY_SIZE};

type HmacSha256 = Hmac<Sha256>;

pub const MAGIC: [u8; 6] = *b"TCFSRA";
pub const FORMAT_VERSION: [u8; 4] = *b"1.00";

/// Size of the root authentication tag stored in the header
pub const ROOT_TAG_SIZE: usize = 32;

/// Size of the trailing header HMAC
pub const HMAC_SIZE: usize = 32;

const SHARE_KEY_VERSION_SIZE: usize = 4;
const FIXED_FIELDS_SIZE: usize = MAGIC.len() + FORMAT_VERSION.len() + SHARE_KEY_VERSION_SIZE;

/// Header size in bytes for a codec family.
pub const fn header_size(authenticated: bool) -> usize {
    let tag = if authenticated { ROOT_TAG_SIZE } else { 0 };
    FIXED_FIELDS_SIZE + KEY_SIZE + tag + HMAC_SIZE
}

/// In-memory view of the file header.
///
/// The file key is held in plaintext here and only ever written encrypted.
#[derive(Debug, Clone)]
pub struct FileHeader {
    authenticated: bool,
    share_key_version: Option<u32>,
    file_key: Option<FileKey>,
    auth_tag: Option<[u8; ROOT_TAG_SIZE]>,
}

impl FileHeader {
    pub fn new(authenticated: bool) -> Self {
        Self {
            authenticated,
            share_key_version: None,
            file_key: None,
            auth_tag: None,
        }
    }

    pub fn size(&self) -> usize {
        header_size(self.authenticated)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn share_key_version(&self) -> Option<u32> {
        self.share_key_version
    }

    pub fn set_share_key_version(&mut self, version: u32) {
        self.share_key_version = Some(version);
    }

    pub fn file_key(&self) -> Option<&FileKey> {
        self.file_key.as_ref()
    }

    pub fn set_file_key(&mut self, key: FileKey) {
        self.file_key = Some(key);
    }

    /// Root authentication tag, `None` until the first chunk is written.
    pub fn auth_tag(&self) -> Option<&[u8; ROOT_TAG_SIZE]> {
        self.auth_tag.as_ref()
    }

    pub fn set_auth_tag(&mut self, tag: Option<[u8; ROOT_TAG_SIZE]>) {
        self.auth_tag = tag;
    }

    /// Serialize, authenticate and write the header at offset 0.
    ///
    /// The storage position is restored afterwards.
    pub fn write<S: Write + Seek>(&self, storage: &mut S, share_key: &ShareKey) -> TcfsResult<()> {
        let version = self.share_key_version.ok_or_else(|| {
            TcfsError::Encryption("share key version not set for header".into())
        })?;
        let file_key = self
            .file_key
            .as_ref()
            .ok_or_else(|| TcfsError::Encryption("file key not set for header".into()))?;

        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION);
        buf.extend_from_slice(&version.to_be_bytes());
        buf.extend_from_slice(&wrap_file_key(share_key, file_key));
        if self.authenticated {
            buf.extend_from_slice(&self.auth_tag.unwrap_or([0u8; ROOT_TAG_SIZE]));
        }
        let mut mac = new_mac(share_key)?;
        mac.update(&buf);
        buf.extend_from_slice(&mac.finalize().into_bytes());

        let pos = storage.stream_position()?;
        storage.seek(SeekFrom::Start(0))?;
        storage.write_all(&buf)?;
        storage.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Read magic, version and share key version without the share key.
    pub fn read_dont_verify<S: Read + Seek>(&mut self, storage: &mut S) -> TcfsResult<()> {
        let buf = self.read_raw(storage)?;
        check_format(&buf)?;
        self.share_key_version = Some(read_share_key_version(&buf));
        Ok(())
    }

    /// Read the full header, verify its HMAC, and recover the file key and
    /// root authentication tag.
    pub fn read_and_verify<S: Read + Seek>(
        &mut self,
        storage: &mut S,
        share_key: &ShareKey,
    ) -> TcfsResult<()> {
        let buf = self.read_raw(storage)?;
        check_format(&buf)?;

        let (fields, stored_mac) = buf.split_at(buf.len() - HMAC_SIZE);
        let mut mac = new_mac(share_key)?;
        mac.update(fields);
        mac.verify_slice(stored_mac)
            .map_err(|_| TcfsError::Integrity("header HMAC mismatch".into()))?;

        let key_start = FIXED_FIELDS_SIZE;
        let key_end = key_start + KEY_SIZE;
        let file_key = unwrap_file_key(share_key, &fields[key_start..key_end])?;

        self.auth_tag = if self.authenticated {
            let mut tag = [0u8; ROOT_TAG_SIZE];
            tag.copy_from_slice(&fields[key_end..key_end + ROOT_TAG_SIZE]);
            (tag != [0u8; ROOT_TAG_SIZE]).then_some(tag)
        } else {
            None
        };
        self.share_key_version = Some(read_share_key_version(&buf));
        self.file_key = Some(file_key);
        Ok(())
    }

    fn read_raw<S: Read + Seek>(&self, storage: &mut S) -> TcfsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.size()];
        let pos = storage.stream_position()?;
        storage.seek(SeekFrom::Start(0))?;
        let read = storage.read_exact(&mut buf);
        storage.seek(SeekFrom::Start(pos))?;
        match read {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TcfsError::Encryption(
                format!("file is shorter than the {}-byte header", self.size()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

fn new_mac(share_key: &ShareKey) -> TcfsResult<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(share_key.as_bytes())
        .map_err(|e| TcfsError::Encryption(format!("HMAC key setup failed: {e}")))
}

fn check_format(buf: &[u8]) -> TcfsResult<()> {
    if buf[..MAGIC.len()] != MAGIC {
        return Err(TcfsError::Encryption("invalid file header magic".into()));
    }
    if buf[MAGIC.len()..MAGIC.len() + FORMAT_VERSION.len()] != FORMAT_VERSION {
        return Err(TcfsError::Encryption("unsupported file header version".into()));
    }
    Ok(())
}

fn read_share_key_version(buf: &[u8]) -> u32 {
    let start = MAGIC.len() + FORMAT_VERSION.len();
    let mut bytes = [0u8; SHARE_KEY_VERSION_SIZE];
    bytes.copy_from_slice(&buf[start..start + SHARE_KEY_VERSION_SIZE]);
    u32::from_be_bytes(bytes)
}
