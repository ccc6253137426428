//! Restore archive entries to a directory tree.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::archive::reader::ArchiveReader;
use crate::archive::{EntryKind, EntryMetadata};
use crate::error::{Error, Result};
use crate::fsx;

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    pub overwrite: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreStats {
    pub entries: u64,
    pub bytes: u64,
}

/// An entry name is only restored strictly below the destination.
fn safe_destination(destination: &Path, name: &[u8]) -> Option<PathBuf> {
    let relative = fsx::name_to_path(name);
    if relative.is_absolute() {
        return None;
    }
    for component in relative.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(destination.join(relative))
}

/// Restore every entry of one archive part into `destination`.
/// Continuation entries seek to their part offset, so restoring all
/// parts in order rebuilds split files.
pub fn restore_part<R: Read + Seek>(
    reader: &mut ArchiveReader<R>,
    destination: &Path,
    options: RestoreOptions,
) -> Result<RestoreStats> {
    let mut stats = RestoreStats::default();
    // Directory metadata is applied last: restoring children would
    // clobber the timestamps otherwise.
    let mut directory_metadata: Vec<(PathBuf, EntryMetadata)> = Vec::new();

    while let Some(info) = reader.read_entry()? {
        let Some(target) = safe_destination(destination, &info.entry.name) else {
            warn!(name = %info.entry.name_lossy(), "skipping unsafe entry name");
            continue;
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent))?;
        }

        match &info.entry.kind {
            EntryKind::File { .. } | EntryKind::Image { .. } => {
                if !options.overwrite && info.part_offset == 0 && target.exists() {
                    return Err(Error::FileExists(target));
                }
                let mut file = fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&target)
                    .map_err(|e| Error::io(e, &target))?;
                file.seek(SeekFrom::Start(info.part_offset))
                    .map_err(|e| Error::io(e, &target))?;
                let copied = reader.copy_entry_data(&mut file)?;
                file.flush().map_err(|e| Error::io(e, &target))?;
                drop(file);
                stats.bytes += copied;
                fsx::apply_metadata(&target, &info.entry.metadata, false)?;
            }
            EntryKind::Directory => {
                fs::create_dir_all(&target).map_err(|e| Error::io(e, &target))?;
                directory_metadata.push((target, info.entry.metadata));
            }
            EntryKind::Link { destination: link_target } => {
                if target.symlink_metadata().is_ok() {
                    if !options.overwrite {
                        return Err(Error::FileExists(target));
                    }
                    fs::remove_file(&target).map_err(|e| Error::io(e, &target))?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(fsx::name_to_path(link_target), &target)
                    .map_err(|e| Error::io(e, &target))?;
                #[cfg(not(unix))]
                {
                    let _ = link_target;
                    warn!(name = %info.entry.name_lossy(), "symlinks not supported here");
                    continue;
                }
                fsx::apply_metadata(&target, &info.entry.metadata, true)?;
            }
            EntryKind::Special { kind, major, minor } => {
                if target.symlink_metadata().is_ok() {
                    if !options.overwrite {
                        return Err(Error::FileExists(target));
                    }
                    fs::remove_file(&target).map_err(|e| Error::io(e, &target))?;
                }
                fsx::make_special(&target, *kind, *major, *minor, info.entry.metadata.permission)?;
                fsx::apply_metadata(&target, &info.entry.metadata, false)?;
            }
        }
        stats.entries += 1;
    }

    // Deepest directories first, so parent timestamps survive.
    directory_metadata.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));
    for (path, metadata) in directory_metadata {
        fsx::apply_metadata(&path, &metadata, false)?;
    }

    Ok(stats)
}
