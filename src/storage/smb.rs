//! SMB backend over libsmbclient (the `pavao` binding).
//!
//! Compiled only with the `smb` cargo feature; without it the
//! dispatcher reports `NotSupported` for `smb://` specifiers.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{Instant, UNIX_EPOCH};

use pavao::{SmbClient, SmbCredentials, SmbDirentType, SmbMode, SmbOpenOptions, SmbOptions};
use tracing::debug;

use crate::error::{Error, NetworkErrorKind, Result};
use crate::storage::net::resolve_login;
use crate::storage::{
    CreateMode, PartFile, ReadHandle, RemoteFileInfo, SessionCtx, StorageBackend, StorageKind,
    TRANSFER_BUFFER_SIZE,
};

pub struct SmbStorage {
    client: Option<SmbClient>,
}

fn smb_error(kind: NetworkErrorKind, error: pavao::SmbError) -> Error {
    Error::network(kind, error.to_string())
}

impl SmbStorage {
    pub fn new() -> Self {
        SmbStorage { client: None }
    }

    fn connect(&mut self, ctx: &SessionCtx<'_>) -> Result<&SmbClient> {
        if self.client.is_none() {
            let server = format!("smb://{}:{}", ctx.specifier.host, ctx.specifier.port);
            let share = format!("/{}", ctx.specifier.share);
            let mut connected = None;
            resolve_login(ctx, StorageKind::Smb, |user, password| {
                let client = password.with_plain(|bytes| {
                    SmbClient::new(
                        SmbCredentials::default()
                            .server(server.clone())
                            .share(share.clone())
                            .username(user)
                            .password(String::from_utf8_lossy(bytes)),
                        SmbOptions::default().one_share_per_server(true),
                    )
                })
                .map_err(|e| smb_error(NetworkErrorKind::Connect, e))?;
                client
                    .list_dir("/")
                    .map_err(|e| smb_error(NetworkErrorKind::Auth, e))?;
                connected = Some(client);
                Ok(())
            })?;
            self.client = connected;
        }
        Ok(self.client.as_ref().expect("client connected"))
    }
}

impl Default for SmbStorage {
    fn default() -> Self {
        SmbStorage::new()
    }
}

fn remote_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

impl StorageBackend for SmbStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Smb
    }

    fn create(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<PartFile> {
        let mut remote_name = archive_name.to_string();
        match ctx.options.create_mode {
            CreateMode::Stop => {
                if self.exists(ctx, archive_name)? {
                    return Err(Error::FileExists(archive_name.into()));
                }
            }
            CreateMode::Overwrite | CreateMode::Append => {}
            CreateMode::RenameOnConflict => {
                let mut n = 0u32;
                while self.exists(ctx, &remote_name)? {
                    n += 1;
                    remote_name = format!("{}-{}", archive_name, n);
                }
            }
        }

        let (file, path) = tempfile::Builder::new()
            .prefix("barque-part-")
            .tempfile_in(ctx.runtime.tmp_directory())
            .map_err(|e| Error::io(e, ctx.runtime.tmp_directory()))?
            .keep()
            .map_err(|e| Error::io(e.error, ctx.runtime.tmp_directory()))?;
        Ok(PartFile { file, local_path: path, remote_name, temporary: true })
    }

    fn store(&mut self, ctx: &SessionCtx<'_>, part: PartFile) -> Result<()> {
        let temporary = part.temporary;
        let local_path = part.local_path;
        let _cleanup = scopeguard::guard(local_path.clone(), move |path| {
            if temporary {
                let _ = fs::remove_file(path);
            }
        });

        let mut source = part.file;
        source
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io(e, &local_path))?;
        let size = source
            .metadata()
            .map_err(|e| Error::io(e, &local_path))?
            .len();

        let client = self.connect(ctx)?;
        let mut remote = client
            .open_with(
                remote_path(&part.remote_name),
                SmbOpenOptions::default().create(true).write(true),
            )
            .map_err(|e| smb_error(NetworkErrorKind::Send, e))?;

        let mut buffer = vec![0u8; TRANSFER_BUFFER_SIZE];
        loop {
            if ctx.is_aborted() {
                return Err(Error::Aborted);
            }
            let n = source.read(&mut buffer).map_err(|e| Error::io(e, &local_path))?;
            if n == 0 {
                break;
            }
            let burst = Instant::now();
            remote
                .write_all(&buffer[..n])
                .map_err(|e| Error::network(NetworkErrorKind::Send, e.to_string()))?;
            let elapsed = burst.elapsed().as_micros() as u64;
            ctx.limit_bandwidth(n as u64, elapsed.max(1))?;
        }
        debug!(name = %part.remote_name, bytes = size, "smb upload done");
        Ok(())
    }

    fn open(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<Box<dyn ReadHandle>> {
        // libsmbclient file handles borrow their client, so the read
        // path fetches the archive into a local spool file and serves
        // reads (and seeks) from there.
        let size = self.size(ctx, archive_name)?;
        let client = self.connect(ctx)?;
        let mut remote = client
            .open_with(remote_path(archive_name), SmbOpenOptions::default().read(true))
            .map_err(|e| smb_error(NetworkErrorKind::Receive, e))?;

        let mut spool = tempfile::tempfile_in(ctx.runtime.tmp_directory())
            .map_err(|e| Error::io(e, ctx.runtime.tmp_directory()))?;
        let mut buffer = vec![0u8; TRANSFER_BUFFER_SIZE];
        loop {
            if ctx.is_aborted() {
                return Err(Error::Aborted);
            }
            let burst = Instant::now();
            let n = remote
                .read(&mut buffer)
                .map_err(|e| Error::network(NetworkErrorKind::Receive, e.to_string()))?;
            if n == 0 {
                break;
            }
            spool
                .write_all(&buffer[..n])
                .map_err(Error::from)?;
            let elapsed = burst.elapsed().as_micros() as u64;
            ctx.limit_bandwidth(n as u64, elapsed.max(1))?;
        }
        spool.seek(SeekFrom::Start(0)).map_err(Error::from)?;
        Ok(Box::new(SmbSpoolHandle { file: spool, size }))
    }

    fn exists(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        let client = self.connect(ctx)?;
        Ok(client.stat(remote_path(name)).is_ok())
    }

    fn size(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<u64> {
        let client = self.connect(ctx)?;
        let stat = client
            .stat(remote_path(name))
            .map_err(|_| Error::FileNotFound(name.into()))?;
        Ok(stat.size)
    }

    fn delete(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<()> {
        let client = self.connect(ctx)?;
        client
            .unlink(remote_path(name))
            .map_err(|e| smb_error(NetworkErrorKind::Send, e))
    }

    fn rename(&mut self, ctx: &SessionCtx<'_>, from: &str, to: &str) -> Result<()> {
        let client = self.connect(ctx)?;
        client
            .rename(remote_path(from), remote_path(to))
            .map_err(|e| smb_error(NetworkErrorKind::Send, e))
    }

    fn make_directory(&mut self, ctx: &SessionCtx<'_>, path: &str) -> Result<()> {
        let client = self.connect(ctx)?;
        client
            .mkdir(remote_path(path), SmbMode::from(0o755))
            .map_err(|e| smb_error(NetworkErrorKind::Send, e))
    }

    fn read_directory(&mut self, ctx: &SessionCtx<'_>, path: &str) -> Result<Vec<RemoteFileInfo>> {
        let client = self.connect(ctx)?;
        let entries = client
            .list_dir(remote_path(path))
            .map_err(|e| smb_error(NetworkErrorKind::Receive, e))?;
        let mut infos = Vec::new();
        for entry in entries {
            let name = entry.name().to_string();
            if name == "." || name == ".." {
                continue;
            }
            let is_directory = matches!(entry.get_type(), SmbDirentType::Dir);
            let stat = client
                .stat(format!("{}/{}", remote_path(path).trim_end_matches('/'), name))
                .ok();
            infos.push(RemoteFileInfo {
                name,
                is_directory,
                size: stat.as_ref().map(|s| s.size).unwrap_or(0),
                time_modified: stat
                    .as_ref()
                    .and_then(|s| s.modified.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                user_id: stat.as_ref().map(|s| s.uid).unwrap_or(0),
                group_id: stat.as_ref().map(|s| s.gid).unwrap_or(0),
                permission: 0,
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}

/// Reads served from the local spool file.
struct SmbSpoolHandle {
    file: fs::File,
    size: u64,
}

impl Read for SmbSpoolHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for SmbSpoolHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ReadHandle for SmbSpoolHandle {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}
