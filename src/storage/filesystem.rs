//! Local filesystem backend. Parts are created directly at their final
//! location; `store` only has to flush.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fsx;
use crate::storage::{
    CreateMode, PartFile, ReadHandle, RemoteFileInfo, SessionCtx, StorageBackend, StorageKind,
};

pub struct FileStorage;

impl FileStorage {
    pub fn new() -> Self {
        FileStorage
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        FileStorage::new()
    }
}

/// Resolve the create-mode policy against an existing file.
fn resolve_create_path(path: &Path, mode: CreateMode) -> Result<(PathBuf, bool)> {
    if !path.exists() {
        return Ok((path.to_path_buf(), false));
    }
    match mode {
        CreateMode::Stop => Err(Error::FileExists(path.to_path_buf())),
        CreateMode::Overwrite => Ok((path.to_path_buf(), false)),
        CreateMode::Append => Ok((path.to_path_buf(), true)),
        CreateMode::RenameOnConflict => {
            for n in 1..10_000u32 {
                let candidate = PathBuf::from(format!("{}-{}", path.display(), n));
                if !candidate.exists() {
                    return Ok((candidate, false));
                }
            }
            Err(Error::FileExists(path.to_path_buf()))
        }
    }
}

struct LocalReadHandle {
    file: fs::File,
    size: u64,
}

impl Read for LocalReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for LocalReadHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ReadHandle for LocalReadHandle {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

impl StorageBackend for FileStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Filesystem
    }

    fn create(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<PartFile> {
        let requested = Path::new(archive_name);
        if let Some(parent) = requested.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent))?;
            }
        }
        let (path, append) = resolve_create_path(requested, ctx.options.create_mode)?;
        // O_APPEND would defeat the chunk writer's length back-patching,
        // so append mode seeks to the end of a plain read/write handle.
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(!append)
            .open(&path)
            .map_err(|e| Error::io(e, &path))?;
        if append {
            file.seek(SeekFrom::End(0)).map_err(|e| Error::io(e, &path))?;
        }
        Ok(PartFile {
            file,
            remote_name: path.to_string_lossy().into_owned(),
            local_path: path,
            temporary: false,
        })
    }

    fn store(&mut self, _ctx: &SessionCtx<'_>, part: PartFile) -> Result<()> {
        part.file.sync_all().map_err(|e| Error::io(e, &part.local_path))
    }

    fn open(&mut self, _ctx: &SessionCtx<'_>, archive_name: &str) -> Result<Box<dyn ReadHandle>> {
        let path = Path::new(archive_name);
        let file = fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            _ => Error::io(e, path),
        })?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();
        Ok(Box::new(LocalReadHandle { file, size }))
    }

    fn exists(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        Ok(Path::new(name).exists())
    }

    fn is_file(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        Ok(Path::new(name).is_file())
    }

    fn is_directory(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        Ok(Path::new(name).is_dir())
    }

    fn is_readable(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        Ok(fs::File::open(name).is_ok())
    }

    fn is_writable(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        let path = Path::new(name);
        if path.is_dir() {
            return Ok(!fs::metadata(path)
                .map(|m| m.permissions().readonly())
                .unwrap_or(true));
        }
        Ok(fs::OpenOptions::new().append(true).open(path).is_ok())
    }

    fn size(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<u64> {
        let path = Path::new(name);
        fs::metadata(path).map(|m| m.len()).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            _ => Error::io(e, path),
        })
    }

    fn delete(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<()> {
        let path = Path::new(name);
        let meta = fs::symlink_metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            _ => Error::io(e, path),
        })?;
        if meta.is_dir() {
            fs::remove_dir(path).map_err(|e| Error::io(e, path))
        } else {
            fs::remove_file(path).map_err(|e| Error::io(e, path))
        }
    }

    fn rename(&mut self, _ctx: &SessionCtx<'_>, from: &str, to: &str) -> Result<()> {
        fs::rename(from, to).map_err(|e| Error::io(e, from))
    }

    fn make_directory(&mut self, _ctx: &SessionCtx<'_>, path: &str) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| Error::io(e, path))
    }

    fn get_file_info(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<RemoteFileInfo> {
        let path = Path::new(name);
        let meta = fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            _ => Error::io(e, path),
        })?;
        Ok(file_info_from_metadata(name, &meta))
    }

    fn read_directory(&mut self, _ctx: &SessionCtx<'_>, path: &str) -> Result<Vec<RemoteFileInfo>> {
        let directory = if path.is_empty() { Path::new(".") } else { Path::new(path) };
        if !directory.is_dir() {
            return Err(Error::NotADirectory(directory.to_path_buf()));
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(directory).map_err(|e| Error::io(e, directory))? {
            let entry = entry.map_err(|e| Error::io(e, directory))?;
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(file_info_from_metadata(&name, &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn file_info_from_metadata(name: &str, meta: &fs::Metadata) -> RemoteFileInfo {
    #[cfg(unix)]
    let (uid, gid, mtime) = {
        use std::os::unix::fs::MetadataExt;
        (meta.uid(), meta.gid(), meta.mtime().max(0) as u64)
    };
    #[cfg(not(unix))]
    let (uid, gid, mtime) = (0, 0, 0);
    RemoteFileInfo {
        name: name.to_string(),
        is_directory: meta.is_dir(),
        size: meta.len(),
        time_modified: mtime,
        user_id: uid,
        group_id: gid,
        permission: fsx::unix_mode(meta) & 0o7777,
    }
}
