//! End-to-end runs of the `barque` binary.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn barque() -> Command {
    Command::cargo_bin("barque").unwrap()
}

fn build_tree(root: &Path) {
    fs::create_dir_all(root.join("docs")).unwrap();
    fs::write(root.join("docs/readme.txt"), b"read me please").unwrap();
    fs::write(root.join("data.bin"), vec![0xABu8; 20_000]).unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("docs/readme.txt", root.join("shortcut")).unwrap();
}

#[test]
fn create_list_extract_roundtrip() {
    let source = tempfile::tempdir().unwrap();
    build_tree(source.path());
    let work = tempfile::tempdir().unwrap();
    let archive = work.path().join("backup.bar");

    barque()
        .arg("create")
        .arg(&archive)
        .arg(source.path())
        .args(["--compress", "zstd"])
        .assert()
        .success();

    barque()
        .arg("list")
        .arg(&archive)
        .assert()
        .success()
        .stdout(predicate::str::contains("docs/readme.txt"))
        .stdout(predicate::str::contains("data.bin"));

    let restored = tempfile::tempdir().unwrap();
    barque()
        .arg("extract")
        .arg(&archive)
        .args(["--destination"])
        .arg(restored.path())
        .assert()
        .success();

    assert_eq!(
        fs::read(restored.path().join("docs/readme.txt")).unwrap(),
        b"read me please"
    );
    assert_eq!(
        fs::read(restored.path().join("data.bin")).unwrap(),
        vec![0xABu8; 20_000]
    );
    #[cfg(unix)]
    {
        let target = fs::read_link(restored.path().join("shortcut")).unwrap();
        assert_eq!(target, Path::new("docs/readme.txt"));
    }
}

#[test]
fn encrypted_create_and_test() {
    let source = tempfile::tempdir().unwrap();
    build_tree(source.path());
    let work = tempfile::tempdir().unwrap();
    let archive = work.path().join("secret.bar");

    barque()
        .arg("create")
        .arg(&archive)
        .arg(source.path())
        .args(["--crypt", "aes256", "--password", "hunter2"])
        .assert()
        .success();

    barque()
        .arg("test")
        .arg(&archive)
        .args(["--password", "hunter2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("entries ok"));

    // A wrong password reads as corruption, not as silent garbage.
    barque()
        .arg("test")
        .arg(&archive)
        .args(["--password", "wrong"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("corrupt archive"));
}

#[test]
fn part_split_roundtrip_via_cli() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("big.bin"), vec![0x42u8; 50_000]).unwrap();
    let work = tempfile::tempdir().unwrap();
    let archive = work.path().join("split.bar");

    barque()
        .arg("create")
        .arg(&archive)
        .arg(source.path())
        .args(["--part-size", "16384", "--compress", "none"])
        .assert()
        .success();

    assert!(work.path().join("split.bar.2").exists());
    assert!(work.path().join("split.bar.3").exists());

    let restored = tempfile::tempdir().unwrap();
    barque()
        .arg("extract")
        .arg(&archive)
        .args(["--destination"])
        .arg(restored.path())
        .assert()
        .success();
    assert_eq!(
        fs::read(restored.path().join("big.bin")).unwrap(),
        vec![0x42u8; 50_000]
    );
}

#[test]
fn refuses_existing_archive_without_overwrite() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("f"), b"x").unwrap();
    let work = tempfile::tempdir().unwrap();
    let archive = work.path().join("exists.bar");
    fs::write(&archive, b"already here").unwrap();

    barque()
        .arg("create")
        .arg(&archive)
        .arg(source.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}
