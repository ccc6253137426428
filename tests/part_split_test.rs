//! Part splitting, forward compatibility and block alignment.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use barque::archive::restore::{restore_part, RestoreOptions};
use barque::archive::{
    format_part_name, ArchiveOptions, ArchiveReader, ArchiveWriter, Entry, EntryKind,
    EntryMetadata,
};
use barque::chunk;
use barque::compress::{CompressAlgorithm, CompressConfig};
use barque::crypto::CryptAlgorithm;
use barque::password::Password;
use barque::runtime::CoreRuntime;
use barque::storage::{SessionCallbacks, StorageOptions, StorageSession, StorageSpecifier};
use rand::RngCore;

fn open_session<'r>(runtime: &'r CoreRuntime, uri: &str) -> StorageSession<'r> {
    StorageSession::open(
        runtime,
        StorageSpecifier::parse(uri).unwrap(),
        StorageOptions::default(),
        SessionCallbacks::default(),
    )
    .unwrap()
}

fn file_entry(name: &str, size: u64) -> Entry {
    Entry {
        name: name.as_bytes().to_vec(),
        metadata: EntryMetadata {
            user_id: 0,
            group_id: 0,
            permission: 0o644,
            time_last_access: 1,
            time_modified: 2,
            time_last_changed: 3,
        },
        kind: EntryKind::File { size },
    }
}

fn write_archive(
    archive: &Path,
    options: ArchiveOptions,
    password: Option<&Password>,
    files: &[(&str, &[u8])],
) {
    let runtime = CoreRuntime::default();
    let mut session = open_session(&runtime, archive.to_str().unwrap());
    let mut writer = ArchiveWriter::create(&mut session, options, password).unwrap();
    for (name, content) in files {
        let mut data = writer
            .new_data_entry(file_entry(name, content.len() as u64))
            .unwrap();
        data.write(content).unwrap();
        data.finish().unwrap();
    }
    writer.close().unwrap();
}

fn restore_all_parts(archive: &Path, destination: &Path, password: Option<&Password>) {
    let base = archive.to_str().unwrap();
    let mut part_number = 1;
    loop {
        let name = format_part_name(base, part_number, 1);
        if !Path::new(&name).exists() {
            break;
        }
        let handle = fs::File::open(&name).unwrap();
        let mut reader = ArchiveReader::open(handle, password).unwrap();
        restore_part(&mut reader, destination, RestoreOptions { overwrite: true }).unwrap();
        part_number += 1;
    }
    assert!(part_number > 1, "no parts found");
}

/// A five-octet file with a three-octet part limit lands in two files;
/// each replays independently and the pair reconstructs the content.
#[test]
fn tiny_part_size_splits_into_two_files() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");
    let options = ArchiveOptions { part_size: 3, ..Default::default() };
    write_archive(&archive, options, None, &[("hello.txt", b"hello")]);

    let second = dir.path().join("a.bar.2");
    assert!(archive.exists());
    assert!(second.exists());
    assert!(!dir.path().join("a.bar.3").exists());

    // Part two is a standalone archive carrying the continuation.
    let handle = fs::File::open(&second).unwrap();
    let mut reader = ArchiveReader::open(handle, None).unwrap();
    let info = reader.read_entry().unwrap().unwrap();
    assert_eq!(info.entry.name, b"hello.txt");
    assert_eq!(info.part_offset, 3);
    assert_eq!(info.part_size, 2);
    let mut tail = Vec::new();
    reader.copy_entry_data(&mut tail).unwrap();
    assert_eq!(tail, b"lo");

    let restored = tempfile::tempdir().unwrap();
    restore_all_parts(&archive, restored.path(), None);
    assert_eq!(fs::read(restored.path().join("hello.txt")).unwrap(), b"hello");
}

/// Splitting at any part size yields the same restored tree as not
/// splitting at all.
#[test]
fn part_splitting_is_transparent() {
    let mut big = vec![0u8; 300_000];
    rand::thread_rng().fill_bytes(&mut big);
    let files: Vec<(&str, &[u8])> = vec![
        ("big.bin", big.as_slice()),
        ("small.txt", b"just a few bytes"),
        ("empty", b""),
    ];

    for crypt in [CryptAlgorithm::None, CryptAlgorithm::Aes256] {
        let password = Password::from_bytes(b"pw");
        let uses_password = crypt != CryptAlgorithm::None;
        let password = uses_password.then_some(&password);

        let whole_dir = tempfile::tempdir().unwrap();
        let whole = whole_dir.path().join("whole.bar");
        write_archive(
            &whole,
            ArchiveOptions {
                crypt,
                compress: CompressConfig {
                    algorithm: CompressAlgorithm::Zstd,
                    min_file_size: 32,
                },
                part_size: 0,
            },
            password,
            &files,
        );

        let split_dir = tempfile::tempdir().unwrap();
        let split = split_dir.path().join("split.bar");
        write_archive(
            &split,
            ArchiveOptions {
                crypt,
                compress: CompressConfig {
                    algorithm: CompressAlgorithm::Zstd,
                    min_file_size: 32,
                },
                part_size: 64 * 1024,
            },
            password,
            &files,
        );
        assert!(split_dir.path().join("split.bar.2").exists());

        let restored_whole = tempfile::tempdir().unwrap();
        restore_all_parts(&whole, restored_whole.path(), password);
        let restored_split = tempfile::tempdir().unwrap();
        restore_all_parts(&split, restored_split.path(), password);

        for (name, content) in &files {
            let a = fs::read(restored_whole.path().join(name)).unwrap();
            let b = fs::read(restored_split.path().join(name)).unwrap();
            assert_eq!(a, *content);
            assert_eq!(a, b);
        }
    }
}

/// `#`-runs in the base name number every part.
#[test]
fn hash_run_part_naming() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("backup-###.bar");
    let options = ArchiveOptions { part_size: 4096, ..Default::default() };
    let content = vec![7u8; 10_000];
    write_archive(&archive, options, None, &[("f", &content)]);

    assert!(dir.path().join("backup-001.bar").exists());
    assert!(dir.path().join("backup-002.bar").exists());
    assert!(dir.path().join("backup-003.bar").exists());
}

/// An unknown chunk type between two known entries is skipped intact.
#[test]
fn unknown_chunks_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");
    write_archive(
        &archive,
        ArchiveOptions::default(),
        None,
        &[("first", b"one"), ("second", b"twotwo")],
    );

    let bytes = fs::read(&archive).unwrap();

    // Find the end of the first entry container and splice an unknown
    // chunk there.
    let mut reader = chunk::ChunkReader::new(Cursor::new(bytes.clone()), 1);
    let magic = reader.next_chunk().unwrap().unwrap();
    reader.skip(&magic).unwrap();
    let first_container = reader.next_chunk().unwrap().unwrap();
    let insert_at = first_container.payload_end() as usize;

    let mut unknown = Vec::new();
    unknown.extend_from_slice(b"XYZ9");
    unknown.extend_from_slice(&7u64.to_be_bytes());
    unknown.extend_from_slice(b"mystery");

    let mut patched = bytes[..insert_at].to_vec();
    patched.extend_from_slice(&unknown);
    patched.extend_from_slice(&bytes[insert_at..]);

    let mut reader = ArchiveReader::open(Cursor::new(patched), None).unwrap();
    let first = reader.read_entry().unwrap().unwrap();
    assert_eq!(first.entry.name, b"first");
    let mut content = Vec::new();
    reader.copy_entry_data(&mut content).unwrap();
    assert_eq!(content, b"one");
    let second = reader.read_entry().unwrap().unwrap();
    assert_eq!(second.entry.name, b"second");
    let mut content = Vec::new();
    reader.copy_entry_data(&mut content).unwrap();
    assert_eq!(content, b"twotwo");
    assert!(reader.read_entry().unwrap().is_none());
}

/// With a cipher configured, every chunk header in the produced archive
/// starts on a cipher-block boundary.
#[test]
fn encrypted_chunk_headers_are_block_aligned() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");
    let password = Password::from_bytes(b"pw");
    let options = ArchiveOptions {
        crypt: CryptAlgorithm::Aes256,
        compress: CompressConfig { algorithm: CompressAlgorithm::Zstd, min_file_size: 32 },
        part_size: 0,
    };
    let content = vec![3u8; 100_000];
    write_archive(
        &archive,
        options,
        Some(&password),
        &[("a", &content), ("b", b"tiny"), ("c", b"")],
    );

    let bytes = fs::read(&archive).unwrap();
    let mut reader = chunk::ChunkReader::new(Cursor::new(bytes), 16);
    let mut seen = 0u32;
    loop {
        let Some(header) = reader.next_chunk().unwrap() else { break };
        assert_eq!(
            header.offset % 16,
            0,
            "chunk {:?} at offset {}",
            std::str::from_utf8(&header.id).unwrap_or("?"),
            header.offset
        );
        seen += 1;
        // Descend into containers (children follow the header), skip
        // leaf payloads.
        if !chunk::is_container(&header.id) {
            reader.skip(&header).unwrap();
        }
    }
    // BAR0 + 3 entries with 2-3 chunks each + END0.
    assert!(seen >= 10, "walked only {seen} chunk headers");
}

/// Truncating an archive mid-chunk surfaces `CorruptArchive` with an
/// offset.
#[test]
fn truncated_archive_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");
    write_archive(&archive, ArchiveOptions::default(), None, &[("f", b"0123456789")]);

    let bytes = fs::read(&archive).unwrap();
    let truncated = &bytes[..bytes.len() - 15];

    let mut reader = ArchiveReader::open(Cursor::new(truncated.to_vec()), None).unwrap();
    let result = (|| -> barque::Result<()> {
        while let Some(_info) = reader.read_entry()? {
            reader.copy_entry_data(&mut std::io::sink())?;
        }
        Ok(())
    })();
    assert!(matches!(result, Err(barque::Error::CorruptArchive { .. })));
}
