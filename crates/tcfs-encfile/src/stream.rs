//! `std::io` adapters over an encrypted file
//!
//! Each adapter keeps its own position and uses positional reads/writes,
//! so several adapters can share one file instance.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::file::EncryptedFile;

/// Sequential plaintext reader, starting at offset 0.
#[derive(Debug)]
pub struct EncFileReader {
    file: Arc<EncryptedFile>,
    pos: u64,
}

impl EncFileReader {
    pub fn new(file: Arc<EncryptedFile>) -> Self {
        Self { file, pos: 0 }
    }

    pub fn into_inner(self) -> Arc<EncryptedFile> {
        self.file
    }
}

impl Read for EncFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for EncFileReader {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        self.pos = resolve(self.pos, self.file.length()?, from)?;
        Ok(self.pos)
    }
}

/// Sequential plaintext writer, starting at offset 0.
///
/// Data reaches storage on `flush`, on a chunk change, or when the file is
/// closed.
#[derive(Debug)]
pub struct EncFileWriter {
    file: Arc<EncryptedFile>,
    pos: u64,
}

impl EncFileWriter {
    pub fn new(file: Arc<EncryptedFile>) -> Self {
        Self { file, pos: 0 }
    }

    pub fn into_inner(self) -> Arc<EncryptedFile> {
        self.file
    }
}

impl Write for EncFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.file.flush()?)
    }
}

impl Seek for EncFileWriter {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        self.pos = resolve(self.pos, self.file.length()?, from)?;
        Ok(self.pos)
    }
}

fn resolve(current: u64, len: u64, from: SeekFrom) -> io::Result<u64> {
    let target = match from {
        SeekFrom::Start(pos) => Some(pos),
        SeekFrom::End(delta) => len.checked_add_signed(delta),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
    };
    target.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        )
    })
}
