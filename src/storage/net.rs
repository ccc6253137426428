//! Helpers shared by the network backends: credential resolution and
//! curl error mapping.

use std::io::{Read, Seek, SeekFrom};

use curl::easy::Easy;

use crate::error::{Error, NetworkErrorKind, Result};
use crate::password::Password;
use crate::runtime::MAX_PASSWORD_REQUESTS;
use crate::storage::{ReadHandle, SessionCtx, StorageKind, TRANSFER_BUFFER_SIZE};

/// Connection timeout for all network backends.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

fn default_user(kind: StorageKind) -> String {
    match kind {
        StorageKind::Ftp => "anonymous".to_string(),
        _ => std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
    }
}

/// Resolve login information in the canonical order: specifier override,
/// per-host configuration, cached default, interactive prompt (bounded
/// by `MAX_PASSWORD_REQUESTS`). A successful prompt updates the cached
/// default.
pub(crate) fn resolve_login(
    ctx: &SessionCtx<'_>,
    kind: StorageKind,
    mut check: impl FnMut(&str, &Password) -> Result<()>,
) -> Result<(String, Password)> {
    let host = ctx.specifier.host.clone();
    let preset_user = if ctx.specifier.user.is_empty() {
        None
    } else {
        Some(ctx.specifier.user.clone())
    };

    let mut last_error = None;

    // Per-job override from the URI itself.
    if preset_user.is_some() || ctx.specifier.secret.is_some() {
        let user = preset_user.clone().unwrap_or_else(|| default_user(kind));
        let password = ctx.specifier.secret.clone().unwrap_or_default();
        match check(&user, &password) {
            Ok(()) => return Ok((user, password)),
            Err(error) => last_error = Some(error),
        }
    }

    // Per-host configuration.
    if let Some((user, password)) = ctx.runtime.config().credentials(kind, &host) {
        match check(&user, &password) {
            Ok(()) => return Ok((user, password)),
            Err(error) => last_error = Some(error),
        }
    }

    // Cached default from a previous successful login.
    if let Some((user, password)) = ctx.runtime.default_credentials(kind, &host) {
        match check(&user, &password) {
            Ok(()) => return Ok((user, password)),
            Err(error) => last_error = Some(error),
        }
    }

    // Interactive prompt, a bounded number of times.
    if let Some(prompt) = ctx.callbacks.password_prompt.as_ref() {
        let user = preset_user.unwrap_or_else(|| default_user(kind));
        for _ in 0..MAX_PASSWORD_REQUESTS {
            let label = format!("{} password for {}@{}", kind.scheme(), user, host);
            let Some(password) = prompt(&label) else { break };
            match check(&user, &password) {
                Ok(()) => {
                    ctx.runtime.remember_credentials(kind, &host, &user, &password);
                    return Ok((user, password));
                }
                Err(error) => last_error = Some(error),
            }
        }
    }

    // No credentials configured at all: try the defaults once.
    if last_error.is_none() {
        let user = default_user(kind);
        let password = Password::new();
        match check(&user, &password) {
            Ok(()) => return Ok((user, password)),
            Err(error) => last_error = Some(error),
        }
    }

    Err(match (kind, last_error) {
        (StorageKind::Ftp, _) => Error::FtpAuth,
        (_, Some(error)) => error,
        (_, None) => Error::network(NetworkErrorKind::Auth, "no credentials"),
    })
}

/// Map a curl failure onto the error taxonomy.
pub(crate) fn map_curl_error(error: curl::Error, host: &str, sending: bool) -> Error {
    if error.is_couldnt_resolve_host() {
        return Error::HostNotFound(host.to_string());
    }
    if error.is_couldnt_connect() {
        return Error::network(NetworkErrorKind::Connect, error.description().to_string());
    }
    if error.is_operation_timedout() {
        return Error::network(NetworkErrorKind::Timeout, error.description().to_string());
    }
    if error.is_login_denied() {
        return Error::network(NetworkErrorKind::Auth, "login denied");
    }
    if error.is_aborted_by_callback() {
        return Error::Aborted;
    }
    let kind = if sending { NetworkErrorKind::Send } else { NetworkErrorKind::Receive };
    Error::network(kind, error.description().to_string())
}

/// Set a libcurl boolean option not exposed by the `curl` crate's safe
/// wrapper, via the raw handle it still hands out through `Easy::raw`.
pub(crate) fn setopt_bool(
    easy: &Easy,
    opt: curl_sys::CURLoption,
    value: bool,
) -> std::result::Result<(), curl::Error> {
    let rc = unsafe { curl_sys::curl_easy_setopt(easy.raw(), opt, value as libc::c_long) };
    if rc == curl_sys::CURLE_OK {
        Ok(())
    } else {
        Err(curl::Error::new(rc))
    }
}

/// Apply the session-wide curl defaults.
pub(crate) fn configure_easy(
    easy: &mut Easy,
    user: &str,
    password: &Password,
    host: &str,
) -> Result<()> {
    easy.connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .map_err(|e| map_curl_error(e, host, true))?;
    easy.username(user).map_err(|e| map_curl_error(e, host, true))?;
    password
        .with_plain(|bytes| easy.password(&String::from_utf8_lossy(bytes)))
        .map_err(|e| map_curl_error(e, host, true))?;
    easy.progress(true).map_err(|e| map_curl_error(e, host, true))?;
    Ok(())
}

/// Read handle with a 64 KiB read-ahead buffer; each refill is one
/// ranged retrieval starting at the current offset.
pub(crate) struct CurlReadHandle {
    pub(crate) url: String,
    pub(crate) user: String,
    pub(crate) password: Password,
    pub(crate) size: u64,
    pub(crate) position: u64,
    pub(crate) buffer: Vec<u8>,
    pub(crate) buffer_start: u64,
    pub(crate) abort: Option<std::sync::Arc<crate::runtime::AbortFn>>,
}

impl CurlReadHandle {
    fn refill(&mut self) -> std::io::Result<()> {
        let from = self.position;
        let to = (from + TRANSFER_BUFFER_SIZE as u64 - 1).min(self.size.saturating_sub(1));
        let mut easy = Easy::new();
        let io_err = |e: curl::Error| std::io::Error::other(e.description().to_string());
        easy.connect_timeout(std::time::Duration::from_secs(
            crate::storage::net::CONNECT_TIMEOUT_SECS,
        ))
        .map_err(io_err)?;
        easy.url(&self.url).map_err(io_err)?;
        easy.username(&self.user).map_err(io_err)?;
        self.password
            .with_plain(|bytes| easy.password(&String::from_utf8_lossy(bytes)))
            .map_err(io_err)?;
        easy.range(&format!("{}-{}", from, to)).map_err(io_err)?;
        if self.abort.is_some() {
            easy.progress(true).map_err(io_err)?;
        }
        let mut body = Vec::with_capacity(TRANSFER_BUFFER_SIZE);
        {
            let abort = self.abort.as_ref();
            let mut transfer = easy.transfer();
            transfer
                .write_function(|data| {
                    body.extend_from_slice(data);
                    Ok(data.len())
                })
                .map_err(io_err)?;
            if let Some(abort) = abort {
                transfer.progress_function(move |_, _, _, _| !abort()).map_err(io_err)?;
            }
            transfer.perform().map_err(io_err)?;
        }
        self.buffer = body;
        self.buffer_start = from;
        Ok(())
    }
}

impl Read for CurlReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.size {
            return Ok(0);
        }
        let in_buffer = self.position >= self.buffer_start
            && self.position < self.buffer_start + self.buffer.len() as u64;
        if !in_buffer {
            self.refill()?;
            if self.buffer.is_empty() {
                return Ok(0);
            }
        }
        let offset = (self.position - self.buffer_start) as usize;
        let available = self.buffer.len() - offset;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for CurlReadHandle {
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

impl ReadHandle for CurlReadHandle {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}
