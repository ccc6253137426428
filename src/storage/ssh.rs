//! SCP and SFTP backends over libssh2.
//!
//! Both modes share one authenticated session; management operations
//! (listing, stat, delete, rename, mkdir) always go through the SFTP
//! subsystem. SCP transfers have no native seek, so the read handle
//! restarts the channel at the requested offset.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ssh2::Session;
use tracing::debug;

use crate::error::{Error, NetworkErrorKind, Result};
use crate::storage::net::{resolve_login, CONNECT_TIMEOUT_SECS};
use crate::storage::{
    CreateMode, PartFile, ReadHandle, RemoteFileInfo, SessionCtx, StorageBackend, StorageKind,
    TRANSFER_BUFFER_SIZE,
};

const SSH_PROTOCOL_TIMEOUT_MS: u32 = 30_000;
const READ_TIMEOUT_SECS: u64 = 60;
const WRITE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshMode {
    Scp,
    Sftp,
}

pub struct SshStorage {
    mode: SshMode,
    session: Option<Session>,
}

fn ssh_error(kind: NetworkErrorKind, error: ssh2::Error) -> Error {
    Error::network(kind, error.message().to_string())
}

impl SshStorage {
    pub fn new(mode: SshMode) -> Self {
        SshStorage { mode, session: None }
    }

    fn kind_tag(&self) -> StorageKind {
        match self.mode {
            SshMode::Scp => StorageKind::Scp,
            SshMode::Sftp => StorageKind::Sftp,
        }
    }

    /// Connect, handshake and authenticate (cached per session).
    fn session(&mut self, ctx: &SessionCtx<'_>) -> Result<Session> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }

        let host = ctx.specifier.host.clone();
        let address = (host.as_str(), ctx.specifier.port)
            .to_socket_addrs()
            .map_err(|_| Error::HostNotFound(host.clone()))?
            .next()
            .ok_or_else(|| Error::HostNotFound(host.clone()))?;
        let stream =
            TcpStream::connect_timeout(&address, Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .map_err(|e| Error::network(NetworkErrorKind::Connect, e.to_string()))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)))
            .map_err(|e| Error::network(NetworkErrorKind::Connect, e.to_string()))?;
        stream
            .set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)))
            .map_err(|e| Error::network(NetworkErrorKind::Connect, e.to_string()))?;

        let mut session =
            Session::new().map_err(|e| ssh_error(NetworkErrorKind::Connect, e))?;
        session.set_tcp_stream(stream);
        session.set_timeout(SSH_PROTOCOL_TIMEOUT_MS);
        session
            .handshake()
            .map_err(|e| ssh_error(NetworkErrorKind::Connect, e))?;

        resolve_login(ctx, self.kind_tag(), |user, password| {
            // An empty password asks the agent; otherwise password auth.
            let auth = if password.is_empty() {
                session.userauth_agent(user)
            } else {
                password.with_plain(|bytes| {
                    session.userauth_password(user, &String::from_utf8_lossy(bytes))
                })
            };
            auth.map_err(|e| ssh_error(NetworkErrorKind::Auth, e))?;
            if session.authenticated() {
                Ok(())
            } else {
                Err(Error::network(NetworkErrorKind::Auth, "authentication failed"))
            }
        })?;

        debug!(host = %host, "ssh session established");
        self.session = Some(session.clone());
        Ok(session)
    }

    fn sftp(&mut self, ctx: &SessionCtx<'_>) -> Result<ssh2::Sftp> {
        self.session(ctx)?
            .sftp()
            .map_err(|e| ssh_error(NetworkErrorKind::Connect, e))
    }

    /// Create missing remote parent directories of `path`.
    fn ensure_remote_directories(&mut self, ctx: &SessionCtx<'_>, path: &str) -> Result<()> {
        let Some((parents, _)) = path.rsplit_once('/') else {
            return Ok(());
        };
        let sftp = self.sftp(ctx)?;
        let mut current = String::new();
        for component in parents.split('/') {
            if component.is_empty() {
                continue;
            }
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(component);
            let remote = Path::new(&current);
            if sftp.stat(remote).is_err() {
                sftp.mkdir(remote, 0o755)
                    .map_err(|e| ssh_error(NetworkErrorKind::Send, e))?;
            }
        }
        Ok(())
    }
}

fn stat_to_info(name: &str, stat: &ssh2::FileStat) -> RemoteFileInfo {
    RemoteFileInfo {
        name: name.to_string(),
        is_directory: stat.is_dir(),
        size: stat.size.unwrap_or(0),
        time_modified: stat.mtime.unwrap_or(0),
        user_id: stat.uid.unwrap_or(0),
        group_id: stat.gid.unwrap_or(0),
        permission: stat.perm.unwrap_or(0) & 0o7777,
    }
}

impl StorageBackend for SshStorage {
    fn kind(&self) -> StorageKind {
        self.kind_tag()
    }

    fn create(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<PartFile> {
        let mut remote_name = archive_name.to_string();
        match ctx.options.create_mode {
            CreateMode::Stop => {
                if self.exists(ctx, archive_name)? {
                    return Err(Error::FileExists(archive_name.into()));
                }
            }
            // SCP/SFTP uploads replace the remote file; append is not
            // expressible over scp.
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

        self.ensure_remote_directories(ctx, &part.remote_name)?;

        let mut buffer = vec![0u8; TRANSFER_BUFFER_SIZE];
        match self.mode {
            SshMode::Scp => {
                let session = self.session(ctx)?;
                let mut channel = session
                    .scp_send(Path::new(&part.remote_name), 0o644, size, None)
                    .map_err(|e| ssh_error(NetworkErrorKind::Send, e))?;
                copy_with_limit(ctx, &mut source, &mut channel, &mut buffer, &local_path)?;
                channel.send_eof().map_err(|e| ssh_error(NetworkErrorKind::Send, e))?;
                channel.wait_eof().map_err(|e| ssh_error(NetworkErrorKind::Send, e))?;
                channel.close().map_err(|e| ssh_error(NetworkErrorKind::Send, e))?;
                channel.wait_close().map_err(|e| ssh_error(NetworkErrorKind::Send, e))?;
            }
            SshMode::Sftp => {
                let sftp = self.sftp(ctx)?;
                let mut remote = sftp
                    .create(Path::new(&part.remote_name))
                    .map_err(|e| ssh_error(NetworkErrorKind::Send, e))?;
                copy_with_limit(ctx, &mut source, &mut remote, &mut buffer, &local_path)?;
            }
        }
        debug!(name = %part.remote_name, bytes = size, "ssh upload done");
        Ok(())
    }

    fn open(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<Box<dyn ReadHandle>> {
        match self.mode {
            SshMode::Scp => {
                let session = self.session(ctx)?;
                let (channel, stat) = session
                    .scp_recv(Path::new(archive_name))
                    .map_err(|_| Error::FileNotFound(archive_name.into()))?;
                Ok(Box::new(ScpReadHandle {
                    session,
                    path: PathBuf::from(archive_name),
                    channel: Some(channel),
                    channel_position: 0,
                    position: 0,
                    size: stat.size(),
                }))
            }
            SshMode::Sftp => {
                let sftp = self.sftp(ctx)?;
                let path = Path::new(archive_name);
                let stat = sftp
                    .stat(path)
                    .map_err(|_| Error::FileNotFound(archive_name.into()))?;
                let file = sftp
                    .open(path)
                    .map_err(|e| ssh_error(NetworkErrorKind::Receive, e))?;
                Ok(Box::new(SftpReadHandle { file, size: stat.size.unwrap_or(0) }))
            }
        }
    }

    fn exists(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        let sftp = self.sftp(ctx)?;
        Ok(sftp.stat(Path::new(name)).is_ok())
    }

    fn is_file(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        let sftp = self.sftp(ctx)?;
        Ok(sftp.stat(Path::new(name)).map(|s| s.is_file()).unwrap_or(false))
    }

    fn is_directory(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        let sftp = self.sftp(ctx)?;
        Ok(sftp.stat(Path::new(name)).map(|s| s.is_dir()).unwrap_or(false))
    }

    fn size(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<u64> {
        let sftp = self.sftp(ctx)?;
        let stat = sftp
            .stat(Path::new(name))
            .map_err(|_| Error::FileNotFound(name.into()))?;
        Ok(stat.size.unwrap_or(0))
    }

    fn delete(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<()> {
        let sftp = self.sftp(ctx)?;
        let path = Path::new(name);
        let stat = sftp.stat(path).map_err(|_| Error::FileNotFound(name.into()))?;
        if stat.is_dir() {
            sftp.rmdir(path).map_err(|e| ssh_error(NetworkErrorKind::Send, e))
        } else {
            sftp.unlink(path).map_err(|e| ssh_error(NetworkErrorKind::Send, e))
        }
    }

    fn rename(&mut self, ctx: &SessionCtx<'_>, from: &str, to: &str) -> Result<()> {
        let sftp = self.sftp(ctx)?;
        sftp.rename(Path::new(from), Path::new(to), None)
            .map_err(|e| ssh_error(NetworkErrorKind::Send, e))
    }

    fn make_directory(&mut self, ctx: &SessionCtx<'_>, path: &str) -> Result<()> {
        self.ensure_remote_directories(ctx, &format!("{}/.", path.trim_end_matches('/')))
    }

    fn get_file_info(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<RemoteFileInfo> {
        let sftp = self.sftp(ctx)?;
        let stat = sftp
            .stat(Path::new(name))
            .map_err(|_| Error::FileNotFound(name.into()))?;
        let base = name.rsplit('/').next().unwrap_or(name);
        Ok(stat_to_info(base, &stat))
    }

    fn read_directory(&mut self, ctx: &SessionCtx<'_>, path: &str) -> Result<Vec<RemoteFileInfo>> {
        let sftp = self.sftp(ctx)?;
        let directory = if path.is_empty() { Path::new(".") } else { Path::new(path) };
        let entries = sftp
            .readdir(directory)
            .map_err(|e| ssh_error(NetworkErrorKind::Receive, e))?;
        let mut infos = Vec::with_capacity(entries.len());
        for (entry_path, stat) in entries {
            let name = entry_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            infos.push(stat_to_info(&name, &stat));
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}

/// Copy with per-burst bandwidth accounting and abort checks.
fn copy_with_limit(
    ctx: &SessionCtx<'_>,
    source: &mut fs::File,
    sink: &mut dyn Write,
    buffer: &mut [u8],
    local_path: &Path,
) -> Result<()> {
    loop {
        if ctx.is_aborted() {
            return Err(Error::Aborted);
        }
        let n = source.read(buffer).map_err(|e| Error::io(e, local_path))?;
        if n == 0 {
            return Ok(());
        }
        let burst = Instant::now();
        sink.write_all(&buffer[..n])
            .map_err(|e| Error::network(NetworkErrorKind::Send, e.to_string()))?;
        let elapsed = burst.elapsed().as_micros() as u64;
        ctx.limit_bandwidth(n as u64, elapsed.max(1))?;
    }
}

/// SCP has no seek; going backwards reopens the channel and discards
/// bytes up to the requested offset.
struct ScpReadHandle {
    session: Session,
    path: PathBuf,
    channel: Option<ssh2::Channel>,
    channel_position: u64,
    position: u64,
    size: u64,
}

impl ScpReadHandle {
    fn reopen(&mut self) -> std::io::Result<()> {
        let (channel, _stat) = self
            .session
            .scp_recv(&self.path)
            .map_err(|e| std::io::Error::other(e.message().to_string()))?;
        self.channel = Some(channel);
        self.channel_position = 0;
        Ok(())
    }
}

impl Read for ScpReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.size {
            return Ok(0);
        }
        if self.channel.is_none() || self.position < self.channel_position {
            self.reopen()?;
        }
        // Discard up to the logical position.
        let mut skip_buffer = [0u8; 8192];
        while self.channel_position < self.position {
            let want =
                ((self.position - self.channel_position) as usize).min(skip_buffer.len());
            let n = self
                .channel
                .as_mut()
                .expect("channel open")
                .read(&mut skip_buffer[..want])?;
            if n == 0 {
                return Ok(0);
            }
            self.channel_position += n as u64;
        }
        let remaining = (self.size - self.position) as usize;
        let want = remaining.min(buf.len());
        let n = self.channel.as_mut().expect("channel open").read(&mut buf[..want])?;
        self.position += n as u64;
        self.channel_position += n as u64;
        Ok(n)
    }
}

impl Seek for ScpReadHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => self.size as i64 + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl ReadHandle for ScpReadHandle {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

struct SftpReadHandle {
    file: ssh2::File,
    size: u64,
}

impl Read for SftpReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for SftpReadHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ReadHandle for SftpReadHandle {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}
