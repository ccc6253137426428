//! Hermetic optical and block-device backend tests: the "device" is a
//! regular file, the builtin ISO9660 writer builds images, the builtin
//! write copies them onto the device file, and verify reads them back
//! through the in-process ISO reader.

use std::fs;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use barque::archive::restore::{restore_part, RestoreOptions};
use barque::archive::{
    ArchiveOptions, ArchiveReader, ArchiveWriter, Entry, EntryKind, EntryMetadata,
};
use barque::iso9660::IsoReader;
use barque::password::Password;
use barque::runtime::{CoreRuntime, VolumeRequestResult};
use barque::storage::{
    CommandTemplates, SessionCallbacks, StorageOptions, StorageSession, StorageSpecifier,
};

fn file_entry(name: &str, size: u64) -> Entry {
    Entry {
        name: name.as_bytes().to_vec(),
        metadata: EntryMetadata {
            user_id: 0,
            group_id: 0,
            permission: 0o600,
            time_last_access: 10,
            time_modified: 20,
            time_last_changed: 30,
        },
        kind: EntryKind::File { size },
    }
}

struct Recorded {
    volume_done: Vec<f64>,
    volume_requests: Vec<u32>,
}

fn recording_callbacks(record: Arc<Mutex<Recorded>>) -> SessionCallbacks {
    let for_progress = Arc::clone(&record);
    let for_requests = Arc::clone(&record);
    SessionCallbacks {
        progress: Some(Box::new(move |_bytes, _volume, done, _code, _text| {
            for_progress.lock().unwrap().volume_done.push(done);
            true
        })),
        volume_request: Some(Box::new(move |number, _message| {
            for_requests.lock().unwrap().volume_requests.push(number);
            VolumeRequestResult::Ok
        })),
        ..Default::default()
    }
}

/// Two volumes get burned, the step model counts 9 steps with ECC and
/// blank enabled, progress is monotonic per volume and hits 100, and
/// the staging area is cleaned up.
#[test]
fn multi_volume_write_with_ecc_and_blank() {
    let runtime = CoreRuntime::default();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("drive.img");
    let staging_root = dir.path().join("staging");
    fs::create_dir(&staging_root).unwrap();

    let record = Arc::new(Mutex::new(Recorded {
        volume_done: Vec::new(),
        volume_requests: Vec::new(),
    }));

    let uri = format!("cd://{}:backup.bar", device.display());
    let options = StorageOptions {
        volume_size: 64 * 1024,
        error_correction_codes: true,
        blank: true,
        staging_directory: Some(staging_root.clone()),
        ..Default::default()
    };
    let mut session = StorageSession::open(
        &runtime,
        StorageSpecifier::parse(&uri).unwrap(),
        options,
        recording_callbacks(Arc::clone(&record)),
    )
    .unwrap();

    let archive_options = ArchiveOptions { part_size: 24 * 1024, ..Default::default() };
    let mut writer = ArchiveWriter::create(&mut session, archive_options, None).unwrap();
    let content = vec![0x5Au8; 80 * 1024];
    let mut data = writer
        .new_data_entry(file_entry("payload.bin", content.len() as u64))
        .unwrap();
    data.write(&content).unwrap();
    data.finish().unwrap();
    writer.close().unwrap();
    drop(session);

    // The second medium was requested through the callback.
    let recorded = record.lock().unwrap();
    assert!(recorded.volume_requests.contains(&2), "requests: {:?}", recorded.volume_requests);

    // Progress within a volume never decreases and peaks at exactly 100
    // before the next volume resets it.
    let mut peaked = 0usize;
    let mut previous = 0.0f64;
    for &done in &recorded.volume_done {
        if done < previous {
            assert_eq!(previous, 100.0, "reset before the volume finished");
            peaked += 1;
        }
        previous = done;
    }
    assert_eq!(previous, 100.0);
    assert!(peaked >= 1, "expected at least one volume rollover");

    // The last burned volume is a readable ISO image holding the final
    // part, and the staging directory is gone.
    let mut iso = IsoReader::open(fs::File::open(&device).unwrap()).unwrap();
    let entries = iso.list_root().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "backup.bar.4");
    assert_eq!(fs::read_dir(&staging_root).unwrap().count(), 0);
}

/// The burned volume holds replayable archive parts: read them back out
/// of the ISO and restore.
#[test]
fn burned_volume_parts_are_replayable() {
    let runtime = CoreRuntime::default();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("drive.img");

    let uri = format!("cd://{}:backup.bar", device.display());
    let options = StorageOptions {
        // Everything fits on one volume; burn happens on close.
        volume_size: 0,
        ..Default::default()
    };
    let mut session = StorageSession::open(
        &runtime,
        StorageSpecifier::parse(&uri).unwrap(),
        options,
        SessionCallbacks::default(),
    )
    .unwrap();

    let mut writer =
        ArchiveWriter::create(&mut session, ArchiveOptions::default(), None).unwrap();
    let mut data = writer.new_data_entry(file_entry("hello.txt", 5)).unwrap();
    data.write(b"hello").unwrap();
    data.finish().unwrap();
    writer.close().unwrap();

    // Read the part back through the optical read path (ISO9660).
    let handle = session.open_part("backup.bar").unwrap();
    let mut reader = ArchiveReader::open(handle, None).unwrap();
    let restored = tempfile::tempdir().unwrap();
    restore_part(&mut reader, restored.path(), RestoreOptions::default()).unwrap();
    assert_eq!(fs::read(restored.path().join("hello.txt")).unwrap(), b"hello");
}

/// Mutating a staged file between image creation and verify fails the
/// verify step and names the file.
#[test]
fn verify_detects_staged_corruption() {
    let runtime = CoreRuntime::default();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("drive.img");

    let uri = format!("cd://{}:backup.bar", device.display());
    let options = StorageOptions {
        always_create_image: true,
        templates: CommandTemplates {
            // Runs after the image is built, before write/verify.
            image_post: "sh -c 'for f in %directory/*; do printf X >> \"$f\"; done'"
                .to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let callbacks = SessionCallbacks {
        // Refuse replacement media so the retry loop gives up.
        volume_request: Some(Box::new(|_, _| VolumeRequestResult::Fail)),
        ..Default::default()
    };
    let mut session = StorageSession::open(
        &runtime,
        StorageSpecifier::parse(&uri).unwrap(),
        options,
        callbacks,
    )
    .unwrap();

    let mut writer =
        ArchiveWriter::create(&mut session, ArchiveOptions::default(), None).unwrap();
    let mut data = writer.new_data_entry(file_entry("f.bin", 4096)).unwrap();
    data.write(&vec![7u8; 4096]).unwrap();
    data.finish().unwrap();

    match writer.close() {
        Err(barque::Error::VerifyFailed { path, .. }) => {
            assert!(path.to_string_lossy().ends_with("backup.bar"));
        }
        other => panic!("expected VerifyFailed, got {:?}", other.err()),
    }
}

/// Device backend: image command concatenates staged parts, the builtin
/// write copies the image to the device node, and the result is a
/// readable archive stream.
#[test]
fn device_backend_writes_image_to_node() {
    let runtime = CoreRuntime::default();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("disk.img");

    let uri = format!("device://{}:backup.bar", device.display());
    let options = StorageOptions {
        templates: CommandTemplates {
            image: "sh -c 'cat %directory/* > %image'".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut session = StorageSession::open(
        &runtime,
        StorageSpecifier::parse(&uri).unwrap(),
        options,
        SessionCallbacks::default(),
    )
    .unwrap();

    let archive_options = ArchiveOptions { part_size: 2048, ..Default::default() };
    let mut writer = ArchiveWriter::create(&mut session, archive_options, None).unwrap();
    let content: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    let mut data = writer
        .new_data_entry(file_entry("blob.bin", content.len() as u64))
        .unwrap();
    data.write(&content).unwrap();
    data.finish().unwrap();
    writer.close().unwrap();
    drop(session);

    // The device image is the concatenation of the archive parts: one
    // readable stream of entries.
    let image = fs::read(&device).unwrap();
    let mut reader = ArchiveReader::open(Cursor::new(image), None).unwrap();
    let mut restored = vec![0u8; 0];
    let mut pieces: Vec<(u64, Vec<u8>)> = Vec::new();
    while let Some(info) = reader.read_entry().unwrap() {
        assert_eq!(info.entry.name, b"blob.bin");
        let mut piece = Vec::new();
        reader.copy_entry_data(&mut piece).unwrap();
        pieces.push((info.part_offset, piece));
    }
    pieces.sort_by_key(|(offset, _)| *offset);
    for (_, piece) in pieces {
        restored.extend(piece);
    }
    assert_eq!(restored, content);
}

/// Encrypted archives survive the optical pipeline too.
#[test]
fn encrypted_volume_roundtrip() {
    let runtime = CoreRuntime::default();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("drive.img");
    let password = Password::from_bytes(b"optical secret");

    let uri = format!("cd://{}:backup.bar", device.display());
    let mut session = StorageSession::open(
        &runtime,
        StorageSpecifier::parse(&uri).unwrap(),
        StorageOptions::default(),
        SessionCallbacks::default(),
    )
    .unwrap();

    let archive_options = ArchiveOptions {
        crypt: barque::crypto::CryptAlgorithm::Aes256,
        ..Default::default()
    };
    let mut writer =
        ArchiveWriter::create(&mut session, archive_options, Some(&password)).unwrap();
    let mut data = writer.new_data_entry(file_entry("secret.txt", 11)).unwrap();
    data.write(b"very secret").unwrap();
    data.finish().unwrap();
    writer.close().unwrap();

    let handle = session.open_part("backup.bar").unwrap();
    let mut reader = ArchiveReader::open(handle, Some(&password)).unwrap();
    let info = reader.read_entry().unwrap().unwrap();
    assert_eq!(info.entry.name, b"secret.txt");
    let mut content = Vec::new();
    reader.copy_entry_data(&mut content).unwrap();
    assert_eq!(content, b"very secret");
}
