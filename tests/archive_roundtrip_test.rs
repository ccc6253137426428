//! End-to-end round trips through the filesystem backend.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use barque::archive::restore::{restore_part, RestoreOptions};
use barque::archive::{
    ArchiveOptions, ArchiveReader, ArchiveWriter, Entry, EntryKind, EntryMetadata,
};
use barque::chunk;
use barque::compress::{CompressAlgorithm, CompressConfig};
use barque::crypto::CryptAlgorithm;
use barque::password::Password;
use barque::runtime::CoreRuntime;
use barque::storage::{
    SessionCallbacks, StorageOptions, StorageSession, StorageSpecifier,
};
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

fn metadata(permission: u32) -> EntryMetadata {
    EntryMetadata {
        user_id: 1000,
        group_id: 1000,
        permission,
        time_last_access: 1_700_000_000,
        time_modified: 1_700_000_100,
        time_last_changed: 1_700_000_200,
    }
}

fn file_entry(name: &str, size: u64) -> Entry {
    Entry {
        name: name.as_bytes().to_vec(),
        metadata: metadata(0o644),
        kind: EntryKind::File { size },
    }
}

fn write_single_file_archive(
    archive: &Path,
    options: ArchiveOptions,
    password: Option<&Password>,
    name: &str,
    content: &[u8],
) {
    let runtime = CoreRuntime::default();
    let mut session = open_session(&runtime, archive.to_str().unwrap());
    let mut writer = ArchiveWriter::create(&mut session, options, password).unwrap();
    let mut data = writer
        .new_data_entry(file_entry(name, content.len() as u64))
        .unwrap();
    data.write(content).unwrap();
    data.finish().unwrap();
    writer.close().unwrap();
}

/// A five-octet file with no cipher and no compression lands on disk as
/// a magic chunk, one entry container and a data chunk carrying the
/// octets verbatim.
#[test]
fn plain_archive_layout() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");
    write_single_file_archive(
        &archive,
        ArchiveOptions::default(),
        None,
        "hello.txt",
        b"hello",
    );

    let bytes = fs::read(&archive).unwrap();
    let mut reader = chunk::ChunkReader::new(Cursor::new(bytes.clone()), 1);

    let magic = reader.next_chunk().unwrap().unwrap();
    assert_eq!(magic.id, chunk::CHUNK_ID_ARCHIVE);
    reader.skip(&magic).unwrap();

    let container = reader.next_chunk().unwrap().unwrap();
    assert_eq!(container.id, chunk::CHUNK_ID_FILE);

    let entry = reader.next_chunk().unwrap().unwrap();
    assert_eq!(entry.id, chunk::CHUNK_ID_FILE_ENTRY);
    let entry_payload = reader.read_payload(entry.length).unwrap();
    // Prologue (compress id, crypt id, IV), check word, size field,
    // metadata, name.
    assert_eq!(&entry_payload[24..32], &5u64.to_be_bytes());
    assert!(entry_payload.ends_with(b"hello.txt"));

    let data = reader.next_chunk().unwrap().unwrap();
    assert_eq!(data.id, chunk::CHUNK_ID_FILE_DATA);
    let data_payload = reader.read_payload(data.length).unwrap();
    assert_eq!(&data_payload[36..], b"hello");

    let end = reader.next_chunk().unwrap().unwrap();
    assert_eq!(end.id, chunk::CHUNK_ID_END);
    assert!(reader.next_chunk().unwrap().is_none());
}

fn roundtrip_content(crypt: CryptAlgorithm, compress: CompressAlgorithm) {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");
    let password = Password::from_bytes(b"test passphrase");
    let uses_password = crypt != CryptAlgorithm::None;

    let mut content = vec![0u8; 300_000];
    rand::thread_rng().fill_bytes(&mut content[..150_000]);
    // The second half compresses well.
    for (i, b) in content[150_000..].iter_mut().enumerate() {
        *b = (i % 17) as u8;
    }

    let options = ArchiveOptions {
        crypt,
        compress: CompressConfig { algorithm: compress, min_file_size: 32 },
        part_size: 0,
    };
    write_single_file_archive(
        &archive,
        options,
        uses_password.then_some(&password),
        "payload.bin",
        &content,
    );

    let handle = fs::File::open(&archive).unwrap();
    let mut reader =
        ArchiveReader::open(handle, uses_password.then_some(&password)).unwrap();
    let info = reader.read_entry().unwrap().unwrap();
    assert_eq!(info.entry.name, b"payload.bin");
    assert_eq!(info.entry.kind, EntryKind::File { size: content.len() as u64 });
    assert_eq!(info.part_offset, 0);
    assert_eq!(info.part_size, content.len() as u64);

    let mut restored = Vec::new();
    reader.copy_entry_data(&mut restored).unwrap();
    assert_eq!(restored, content);
    assert!(reader.read_entry().unwrap().is_none());
}

#[test]
fn roundtrip_every_cipher_and_compressor() {
    for crypt in [
        CryptAlgorithm::None,
        CryptAlgorithm::Aes128,
        CryptAlgorithm::Aes192,
        CryptAlgorithm::Aes256,
    ] {
        for compress in
            [CompressAlgorithm::None, CompressAlgorithm::Zstd, CompressAlgorithm::Xz]
        {
            roundtrip_content(crypt, compress);
        }
    }
}

#[test]
fn wrong_password_reads_as_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");
    let password = Password::from_bytes(b"right");
    let options = ArchiveOptions {
        crypt: CryptAlgorithm::Aes256,
        compress: CompressConfig::default(),
        part_size: 0,
    };
    write_single_file_archive(&archive, options, Some(&password), "f", b"data!");

    let wrong = Password::from_bytes(b"wrong");
    let handle = fs::File::open(&archive).unwrap();
    let mut reader = ArchiveReader::open(handle, Some(&wrong)).unwrap();
    assert!(matches!(
        reader.read_entry(),
        Err(barque::Error::CorruptArchive { .. })
    ));
}

#[test]
fn empty_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");
    write_single_file_archive(&archive, ArchiveOptions::default(), None, "empty", b"");

    let handle = fs::File::open(&archive).unwrap();
    let mut reader = ArchiveReader::open(handle, None).unwrap();
    let info = reader.read_entry().unwrap().unwrap();
    assert_eq!(info.part_size, 0);
    let mut restored = Vec::new();
    reader.copy_entry_data(&mut restored).unwrap();
    assert!(restored.is_empty());
}

/// Directory, link and special entries carry their metadata; a restore
/// recreates the symlink with the same target.
#[cfg(unix)]
#[test]
fn tree_with_symlink_restores() {
    use std::os::unix::fs::PermissionsExt;

    let runtime = CoreRuntime::default();
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");

    {
        let mut session = open_session(&runtime, archive.to_str().unwrap());
        let mut writer =
            ArchiveWriter::create(&mut session, ArchiveOptions::default(), None).unwrap();
        writer
            .add_entry(&Entry {
                name: b"sub".to_vec(),
                metadata: metadata(0o755),
                kind: EntryKind::Directory,
            })
            .unwrap();
        let mut data = writer.new_data_entry(file_entry("sub/target", 4)).unwrap();
        data.write(b"data").unwrap();
        data.finish().unwrap();
        writer
            .add_entry(&Entry {
                name: b"sub/link".to_vec(),
                metadata: metadata(0o777),
                kind: EntryKind::Link { destination: b"target".to_vec() },
            })
            .unwrap();
        writer.close().unwrap();
    }

    let restore_dir = tempfile::tempdir().unwrap();
    let handle = fs::File::open(&archive).unwrap();
    let mut reader = ArchiveReader::open(handle, None).unwrap();
    let stats =
        restore_part(&mut reader, restore_dir.path(), RestoreOptions::default()).unwrap();
    assert_eq!(stats.entries, 3);

    let link = restore_dir.path().join("sub/link");
    let target = fs::read_link(&link).unwrap();
    assert_eq!(target.to_str().unwrap(), "target");
    assert_eq!(fs::read(restore_dir.path().join("sub/target")).unwrap(), b"data");

    let file_meta = fs::metadata(restore_dir.path().join("sub/target")).unwrap();
    assert_eq!(file_meta.permissions().mode() & 0o777, 0o644);
    use std::os::unix::fs::MetadataExt;
    assert_eq!(file_meta.mtime(), 1_700_000_100);

    let dir_meta = fs::metadata(restore_dir.path().join("sub")).unwrap();
    assert_eq!(dir_meta.permissions().mode() & 0o777, 0o755);
}

#[cfg(unix)]
#[test]
fn fifo_roundtrip() {
    use barque::archive::SpecialKind;
    use std::os::unix::fs::FileTypeExt;

    let runtime = CoreRuntime::default();
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");

    {
        let mut session = open_session(&runtime, archive.to_str().unwrap());
        let mut writer =
            ArchiveWriter::create(&mut session, ArchiveOptions::default(), None).unwrap();
        writer
            .add_entry(&Entry {
                name: b"pipe".to_vec(),
                metadata: metadata(0o600),
                kind: EntryKind::Special { kind: SpecialKind::Fifo, major: 0, minor: 0 },
            })
            .unwrap();
        writer.close().unwrap();
    }

    let restore_dir = tempfile::tempdir().unwrap();
    let handle = fs::File::open(&archive).unwrap();
    let mut reader = ArchiveReader::open(handle, None).unwrap();
    restore_part(&mut reader, restore_dir.path(), RestoreOptions::default()).unwrap();

    let meta = fs::metadata(restore_dir.path().join("pipe")).unwrap();
    assert!(meta.file_type().is_fifo());
}

/// Appending a second archive to the same file reads back as one
/// stream.
#[test]
fn concatenated_archives_read_in_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("a.bar");
    write_single_file_archive(&archive, ArchiveOptions::default(), None, "one", b"1111");

    let second = dir.path().join("b.bar");
    write_single_file_archive(&second, ArchiveOptions::default(), None, "two", b"22");

    let mut combined = fs::read(&archive).unwrap();
    combined.extend(fs::read(&second).unwrap());

    let mut reader = ArchiveReader::open(Cursor::new(combined), None).unwrap();
    let first = reader.read_entry().unwrap().unwrap();
    assert_eq!(first.entry.name, b"one");
    let second = reader.read_entry().unwrap().unwrap();
    assert_eq!(second.entry.name, b"two");
    assert!(reader.read_entry().unwrap().is_none());
}
