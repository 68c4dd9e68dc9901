//! Integration tests for plaintext round trips through encrypted files.
//!
//! All tests use 64-byte chunks (chunk multiple 4) so that multi-chunk
//! layouts stay small, and run against both GCM codecs and the legacy codec.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use proptest::prelude::*;
use tcfs_core::CodecKind;
use tcfs_crypto::ShareKey;
use tcfs_encfile::{EncFileOptions, EncFileReader, EncFileWriter, FileRegistry};
use tempfile::TempDir;

const CODECS: [CodecKind; 3] = [CodecKind::Gcm, CodecKind::GcmHw, CodecKind::Legacy];

fn registry(codec: CodecKind) -> FileRegistry {
    FileRegistry::new(EncFileOptions {
        codec,
        chunk_multiple: 4,
    })
    .expect("registry")
}

fn share_key() -> ShareKey {
    ShareKey::from_bytes([0x5a; 32])
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn create_with(registry: &FileRegistry, path: &Path, data: &[u8]) {
    let file = registry.create(path, 1, &share_key()).expect("create");
    assert_eq!(file.write(data).expect("write"), data.len());
    file.close().expect("close");
}

fn read_back(registry: &FileRegistry, path: &Path) -> Vec<u8> {
    let file = registry.open(path, false).expect("open");
    file.init_with_share_key(&share_key()).expect("init");
    let mut out = vec![0u8; file.length().expect("length") as usize];
    assert_eq!(file.read(&mut out).expect("read"), out.len());
    file.close().expect("close");
    out
}

#[test]
fn roundtrip_aligned_and_unaligned_lengths() {
    for codec in CODECS {
        let registry = registry(codec);
        let tmp = TempDir::new().unwrap();
        for len in [0usize, 1, 15, 16, 63, 64, 65, 128, 200, 1000] {
            let path = tmp.path().join(format!("{len}.enc"));
            let data = pattern(len);
            create_with(&registry, &path, &data);

            assert_eq!(read_back(&registry, &path), data, "{codec} len {len}");

            let real = std::fs::metadata(&path).unwrap().len();
            assert_eq!(
                real,
                registry.layout().real_len_for(len as u64),
                "{codec} backing size for {len}"
            );
            assert_eq!(registry.real_to_virtual_size(real), len as u64);
            assert_eq!(
                tcfs_encfile::real_to_virtual_size(codec, 4, real),
                len as u64
            );
        }
    }
}

#[test]
fn gcm_backing_size_matches_layout() {
    let registry = registry(CodecKind::Gcm);
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("a.enc");
    create_with(&registry, &path, &pattern(200));

    // header 110, two full chunks of 92, tail chunk 16 + 8 + 12
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 110 + 2 * 92 + 36);
}

#[test]
fn overwrite_inside_and_across_chunks() {
    for codec in CODECS {
        let registry = registry(codec);
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("rw.enc");
        let mut model = pattern(200);
        create_with(&registry, &path, &model);

        let file = registry.open(&path, true).expect("open");
        file.init_with_share_key(&share_key()).expect("init");
        file.write_at(50, &[0xaa; 30]).expect("write across boundary");
        file.write_at(130, &[0xbb; 5]).expect("write inside chunk");
        file.write_at(190, &[0xcc; 20]).expect("write past end");
        model[50..80].fill(0xaa);
        model[130..135].fill(0xbb);
        model.resize(210, 0);
        model[190..210].fill(0xcc);
        assert_eq!(file.length().unwrap(), 210);
        file.close().expect("close");

        assert_eq!(read_back(&registry, &path), model, "{codec}");
    }
}

#[test]
fn write_after_gap_zero_fills() {
    for codec in CODECS {
        let registry = registry(codec);
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gap.enc");
        let file = registry.create(&path, 1, &share_key()).expect("create");
        file.write(b"head").unwrap();
        file.seek(300).unwrap();
        file.write(b"tail").unwrap();
        assert_eq!(file.length().unwrap(), 304);
        assert_eq!(file.file_pointer().unwrap(), 304);
        file.close().expect("close");

        let data = read_back(&registry, &path);
        assert_eq!(&data[..4], b"head");
        assert!(data[4..300].iter().all(|&b| b == 0), "{codec} gap is zeroed");
        assert_eq!(&data[300..], b"tail");
    }
}

#[test]
fn read_at_end_of_file_returns_zero() {
    let registry = registry(CodecKind::Gcm);
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("eof.enc");
    create_with(&registry, &path, &pattern(100));

    let file = registry.open(&path, false).expect("open");
    file.init_with_share_key(&share_key()).expect("init");
    let mut buf = [0u8; 16];
    assert_eq!(file.read_at(100, &mut buf).unwrap(), 0);
    assert_eq!(file.read_at(500, &mut buf).unwrap(), 0);
    assert_eq!(file.read_at(90, &mut buf).unwrap(), 10, "short read at the tail");
    assert_eq!(&buf[..10], &pattern(100)[90..]);
}

#[test]
fn extend_aligned_file_by_one_byte() {
    for codec in CODECS {
        let registry = registry(codec);
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grow.enc");
        let data = pattern(64);
        create_with(&registry, &path, &data);

        let file = registry.open(&path, true).expect("open");
        file.init_with_share_key(&share_key()).expect("init");
        file.set_length(65).expect("extend");
        assert_eq!(file.length().unwrap(), 65);
        assert_eq!(
            file.check_authentication_tag().unwrap(),
            codec.is_authenticated()
        );
        file.close().expect("close");

        let mut expected = data;
        expected.push(0);
        assert_eq!(read_back(&registry, &path), expected, "{codec}");
    }
}

#[test]
fn extend_to_aligned_length() {
    let registry = registry(CodecKind::Gcm);
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("grow.enc");
    create_with(&registry, &path, &pattern(10));

    let file = registry.open(&path, true).expect("open");
    file.init_with_share_key(&share_key()).expect("init");
    file.set_length(128).expect("extend");
    assert!(file.check_authentication_tag().unwrap());
    file.close().expect("close");

    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        registry.layout().real_len_for(128)
    );
    let data = read_back(&registry, &path);
    assert_eq!(&data[..10], &pattern(10)[..]);
    assert!(data[10..].iter().all(|&b| b == 0));
}

#[test]
fn truncate_to_earlier_chunk() {
    for codec in CODECS {
        let registry = registry(codec);
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trunc.enc");
        let data = pattern(200);
        create_with(&registry, &path, &data);

        let file = registry.open(&path, true).expect("open");
        file.init_with_share_key(&share_key()).expect("init");
        file.seek(180).unwrap();
        file.set_length(70).expect("truncate");
        assert_eq!(file.length().unwrap(), 70);
        assert_eq!(file.file_pointer().unwrap(), 70, "pointer clamped");
        assert_eq!(
            file.check_authentication_tag().unwrap(),
            codec.is_authenticated()
        );
        file.close().expect("close");

        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            registry.layout().real_len_for(70)
        );
        assert_eq!(read_back(&registry, &path), &data[..70], "{codec}");
    }
}

#[test]
fn truncate_within_last_chunk_and_to_zero() {
    let registry = registry(CodecKind::Gcm);
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("trunc.enc");
    let data = pattern(150);
    create_with(&registry, &path, &data);

    let file = registry.open(&path, true).expect("open");
    file.init_with_share_key(&share_key()).expect("init");
    file.set_length(140).expect("truncate tail");
    assert!(file.check_authentication_tag().unwrap());
    file.set_length(0).expect("truncate all");
    assert!(file.check_authentication_tag().unwrap());
    assert_eq!(file.length().unwrap(), 0);
    file.close().expect("close");

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 110);
    assert!(read_back(&registry, &path).is_empty());
}

#[test]
fn flush_is_idempotent() {
    let registry = registry(CodecKind::Gcm);
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("flush.enc");
    let file = registry.create(&path, 1, &share_key()).expect("create");
    file.write(&pattern(100)).unwrap();
    file.flush().expect("first flush");
    let after_first = file.io_stats().unwrap();
    let len = std::fs::metadata(&path).unwrap().len();

    file.flush().expect("second flush");
    assert_eq!(file.io_stats().unwrap(), after_first, "no storage writes");
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
    assert!(file.check_authentication_tag().unwrap());
}

#[test]
fn small_writes_coalesce_in_cache() {
    let registry = registry(CodecKind::Gcm);
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("small.enc");
    let file = registry.create(&path, 1, &share_key()).expect("create");
    for byte in pattern(64) {
        file.write(&[byte]).unwrap();
    }
    assert_eq!(file.io_stats().unwrap().chunks_written, 0);
    file.flush().unwrap();

    let stats = file.io_stats().unwrap();
    assert_eq!(stats.chunks_written, 1);
    assert_eq!(stats.header_writes, 2, "create plus one root tag update");
    file.close().unwrap();
    assert_eq!(read_back(&registry, &path), pattern(64));
}

#[test]
fn stream_adapters_copy_through() {
    let registry = registry(CodecKind::Gcm);
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("stream.enc");
    let data = pattern(777);

    let file = registry.create(&path, 1, &share_key()).expect("create");
    let mut writer = EncFileWriter::new(file);
    std::io::copy(&mut data.as_slice(), &mut writer).expect("copy in");
    writer.flush().unwrap();
    writer.into_inner().close().unwrap();

    let file = registry.open(&path, false).expect("open");
    file.init_with_share_key(&share_key()).expect("init");
    let mut reader = EncFileReader::new(file);
    let mut out = Vec::new();
    reader.read_to_end(&mut out).expect("read all");
    assert_eq!(out, data);

    assert_eq!(reader.seek(SeekFrom::End(-7)).unwrap(), 770);
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, &data[770..]);
}

#[derive(Debug, Clone)]
struct WriteOp {
    pos: u64,
    data: Vec<u8>,
}

fn write_op() -> impl Strategy<Value = WriteOp> {
    (0u64..400, prop::collection::vec(any::<u8>(), 1..100))
        .prop_map(|(pos, data)| WriteOp { pos, data })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_writes_match_model(
        ops in prop::collection::vec(write_op(), 1..12),
        truncate in prop::option::of(0u64..500),
        codec in prop::sample::select(CODECS.to_vec()),
    ) {
        let registry = registry(codec);
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model.enc");
        let mut model: Vec<u8> = Vec::new();

        let file = registry.create(&path, 1, &share_key()).unwrap();
        for op in &ops {
            file.write_at(op.pos, &op.data).unwrap();
            let end = op.pos as usize + op.data.len();
            if model.len() < end {
                model.resize(end, 0);
            }
            model[op.pos as usize..end].copy_from_slice(&op.data);
        }
        if let Some(len) = truncate {
            file.set_length(len).unwrap();
            model.resize(len as usize, 0);
        }
        prop_assert_eq!(file.length().unwrap(), model.len() as u64);
        file.close().unwrap();

        prop_assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            registry.layout().real_len_for(model.len() as u64)
        );
        prop_assert_eq!(read_back(&registry, &path), model);
    }
}
