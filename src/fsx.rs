// Filesystem shim used throughout barque.
//
// Thin wrappers around `std::fs` plus the POSIX-only pieces the archive
// format records: ownership, permission bits, the three timestamps, and
// special-file creation. On non-Unix platforms the POSIX helpers
// degrade to no-ops, mirroring how the metadata fields read as zero.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::archive::{Entry, EntryKind, EntryMetadata, SpecialKind};
use crate::error::{Error, Result};

/// Return POSIX mode bits if available (Unix), otherwise 0.
#[inline]
pub fn unix_mode(meta: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        0
    }
}

#[cfg(unix)]
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
#[inline]
pub fn set_unix_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Archive entry names use `/` regardless of host separator.
pub fn entry_name(relative: &Path) -> Vec<u8> {
    let mut name = Vec::new();
    for component in relative.components() {
        if !name.is_empty() {
            name.push(b'/');
        }
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            name.extend_from_slice(component.as_os_str().as_bytes());
        }
        #[cfg(not(unix))]
        {
            name.extend_from_slice(component.as_os_str().to_string_lossy().as_bytes());
        }
    }
    name
}

/// Inverse of [`entry_name`]: a relative host path.
pub fn name_to_path(name: &[u8]) -> PathBuf {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        PathBuf::from(std::ffi::OsStr::from_bytes(name))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(name).to_string())
    }
}

/// Stat `path` (without following symlinks) into an archive [`Entry`]
/// named `relative`.
pub fn entry_from_path(path: &Path, relative: &Path) -> Result<Entry> {
    let meta = fs::symlink_metadata(path).map_err(|e| Error::io(e, path))?;
    let metadata = metadata_of(&meta);
    let file_type = meta.file_type();

    let kind = if file_type.is_symlink() {
        let destination = fs::read_link(path).map_err(|e| Error::io(e, path))?;
        EntryKind::Link { destination: entry_name(&destination) }
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File { size: meta.len() }
    } else {
        special_kind_of(&meta, path)?
    };

    Ok(Entry { name: entry_name(relative), metadata, kind })
}

#[cfg(unix)]
fn metadata_of(meta: &fs::Metadata) -> EntryMetadata {
    use std::os::unix::fs::MetadataExt;
    EntryMetadata {
        user_id: meta.uid(),
        group_id: meta.gid(),
        permission: meta.mode() & 0o7777,
        time_last_access: meta.atime().max(0) as u64,
        time_modified: meta.mtime().max(0) as u64,
        time_last_changed: meta.ctime().max(0) as u64,
    }
}

#[cfg(not(unix))]
fn metadata_of(meta: &fs::Metadata) -> EntryMetadata {
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    EntryMetadata {
        user_id: 0,
        group_id: 0,
        permission: 0,
        time_last_access: modified,
        time_modified: modified,
        time_last_changed: modified,
    }
}

#[cfg(unix)]
fn special_kind_of(meta: &fs::Metadata, _path: &Path) -> Result<EntryKind> {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::fs::MetadataExt;
    let file_type = meta.file_type();
    let rdev = meta.rdev();
    let (major, minor) = (libc::major(rdev as _) as u32, libc::minor(rdev as _) as u32);
    let kind = if file_type.is_char_device() {
        SpecialKind::CharDevice
    } else if file_type.is_block_device() {
        SpecialKind::BlockDevice
    } else if file_type.is_fifo() {
        SpecialKind::Fifo
    } else {
        SpecialKind::Socket
    };
    Ok(EntryKind::Special { kind, major, minor })
}

#[cfg(not(unix))]
fn special_kind_of(_meta: &fs::Metadata, path: &Path) -> Result<EntryKind> {
    Err(Error::io(
        io::Error::other("special files are not supported on this platform"),
        path,
    ))
}

/// Create a special file node.
#[cfg(unix)]
pub fn make_special(
    path: &Path,
    kind: SpecialKind,
    major: u32,
    minor: u32,
    mode: u32,
) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::io(io::Error::other("path contains NUL"), path))?;
    let type_bits = match kind {
        SpecialKind::CharDevice => libc::S_IFCHR,
        SpecialKind::BlockDevice => libc::S_IFBLK,
        SpecialKind::Fifo => libc::S_IFIFO,
        SpecialKind::Socket => libc::S_IFSOCK,
    } as u32;
    let node_mode = (type_bits | (mode & 0o7777)) as libc::mode_t;
    // SAFETY: c_path is a valid NUL-terminated string.
    let rc = unsafe {
        libc::mknod(c_path.as_ptr(), node_mode, libc::makedev(major as _, minor as _))
    };
    if rc != 0 {
        return Err(Error::io(io::Error::last_os_error(), path));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn make_special(
    path: &Path,
    _kind: SpecialKind,
    _major: u32,
    _minor: u32,
    _mode: u32,
) -> Result<()> {
    Err(Error::io(
        io::Error::other("special files are not supported on this platform"),
        path,
    ))
}

/// Apply owner, permission bits and timestamps to a restored entry.
/// Ownership failures are ignored for unprivileged restores; permission
/// and timestamp failures are not.
pub fn apply_metadata(path: &Path, metadata: &EntryMetadata, is_symlink: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::io(io::Error::other("path contains NUL"), path))?;

        // SAFETY: c_path is valid; lchown never follows the link.
        unsafe {
            let _ = libc::lchown(c_path.as_ptr(), metadata.user_id, metadata.group_id);
        }

        if !is_symlink {
            set_unix_permissions(path, metadata.permission)
                .map_err(|e| Error::io(e, path))?;
        }

        let times = [
            libc::timespec {
                tv_sec: metadata.time_last_access as libc::time_t,
                tv_nsec: 0,
            },
            libc::timespec {
                tv_sec: metadata.time_modified as libc::time_t,
                tv_nsec: 0,
            },
        ];
        // SAFETY: c_path and times are valid for the call.
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(Error::io(io::Error::last_os_error(), path));
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (metadata, is_symlink);
    }
    Ok(())
}

/// Size of a regular file or a block device node.
pub fn device_or_file_size(path: &Path) -> Result<u64> {
    use std::io::Seek;
    let meta = fs::metadata(path).map_err(|e| Error::io(e, path))?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut file = fs::File::open(path).map_err(|e| Error::io(e, path))?;
    let size = file
        .seek(io::SeekFrom::End(0))
        .map_err(|e| Error::io(e, path))?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_name_normalizes_separators() {
        let name = entry_name(Path::new("a/b/c.txt"));
        assert_eq!(name, b"a/b/c.txt");
        assert_eq!(name_to_path(&name), PathBuf::from("a/b/c.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn stat_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, b"abc").unwrap();
        let entry = entry_from_path(&path, Path::new("f.txt")).unwrap();
        assert!(matches!(entry.kind, EntryKind::File { size: 3 }));
        assert!(entry.metadata.time_modified > 0);
    }

    #[cfg(unix)]
    #[test]
    fn stat_symlink_keeps_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("target", &link).unwrap();
        let entry = entry_from_path(&link, Path::new("link")).unwrap();
        match entry.kind {
            EntryKind::Link { destination } => assert_eq!(destination, b"target"),
            other => panic!("expected link, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn restore_metadata_applies_mode_and_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        let metadata = EntryMetadata {
            user_id: unsafe { libc::getuid() },
            group_id: unsafe { libc::getgid() },
            permission: 0o640,
            time_last_access: 1_000_000,
            time_modified: 2_000_000,
            time_last_changed: 0,
        };
        apply_metadata(&path, &metadata, false).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(unix_mode(&meta) & 0o7777, 0o640);
        use std::os::unix::fs::MetadataExt;
        assert_eq!(meta.mtime(), 2_000_000);
    }
}
