//! WebDAV / WebDAVs backend over libcurl.
//!
//! Uploads are `PUT` requests (missing collections are created with
//! `MKCOL` first); reads are ranged `GET`s through the shared curl
//! read-ahead handle; listings are shallow `PROPFIND`s parsed leniently
//! with regular expressions.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::time::Instant;

use curl::easy::{Easy, List};
use regex::Regex;
use tracing::debug;

use crate::error::{Error, NetworkErrorKind, Result};
use crate::password::Password;
use crate::storage::net::{configure_easy, map_curl_error, resolve_login, CurlReadHandle};
use crate::storage::{
    CreateMode, PartFile, ReadHandle, RemoteFileInfo, SessionCtx, StorageBackend, StorageKind,
};

pub struct WebDavStorage {
    login: Option<(String, Password)>,
}

impl WebDavStorage {
    pub fn new() -> Self {
        WebDavStorage { login: None }
    }

    fn scheme(ctx: &SessionCtx<'_>) -> &'static str {
        if ctx.specifier.kind == StorageKind::WebDavs {
            "https"
        } else {
            "http"
        }
    }

    fn url(ctx: &SessionCtx<'_>, path: &str) -> String {
        format!(
            "{}://{}:{}/{}",
            WebDavStorage::scheme(ctx),
            ctx.specifier.host,
            ctx.specifier.port,
            path
        )
    }

    fn login(&mut self, ctx: &SessionCtx<'_>) -> Result<(String, Password)> {
        if let Some(login) = &self.login {
            return Ok((login.0.clone(), login.1.clone()));
        }
        let host = ctx.specifier.host.clone();
        let url = WebDavStorage::url(ctx, "");
        let login = resolve_login(ctx, ctx.specifier.kind, |user, password| {
            let mut easy = Easy::new();
            configure_easy(&mut easy, user, password, &host)?;
            easy.url(&url).map_err(|e| map_curl_error(e, &host, false))?;
            easy.nobody(true).map_err(|e| map_curl_error(e, &host, false))?;
            easy.perform().map_err(|e| map_curl_error(e, &host, false))?;
            let code = easy
                .response_code()
                .map_err(|e| map_curl_error(e, &host, false))?;
            if code == 401 || code == 403 {
                return Err(Error::network(NetworkErrorKind::Auth, format!("HTTP {code}")));
            }
            Ok(())
        })?;
        self.login = Some((login.0.clone(), login.1.clone()));
        Ok(login)
    }

    /// One HTTP request with an optional custom method, headers and
    /// response body capture. Returns (status, body).
    fn request(
        &mut self,
        ctx: &SessionCtx<'_>,
        method: Option<&str>,
        path: &str,
        headers: &[String],
        head_only: bool,
    ) -> Result<(u32, Vec<u8>)> {
        let (user, password) = self.login(ctx)?;
        let host = ctx.specifier.host.clone();
        let mut easy = Easy::new();
        configure_easy(&mut easy, &user, &password, &host)?;
        easy.url(&WebDavStorage::url(ctx, path))
            .map_err(|e| map_curl_error(e, &host, false))?;
        if let Some(method) = method {
            easy.custom_request(method)
                .map_err(|e| map_curl_error(e, &host, false))?;
        }
        if head_only {
            easy.nobody(true).map_err(|e| map_curl_error(e, &host, false))?;
        }
        if !headers.is_empty() {
            let mut list = List::new();
            for header in headers {
                list.append(header).map_err(|e| map_curl_error(e, &host, false))?;
            }
            easy.http_headers(list).map_err(|e| map_curl_error(e, &host, false))?;
        }

        let mut body = Vec::new();
        {
            let mut transfer = easy.transfer();
            transfer
                .write_function(|data| {
                    body.extend_from_slice(data);
                    Ok(data.len())
                })
                .map_err(|e| map_curl_error(e, &host, false))?;
            transfer
                .progress_function(|_, _, _, _| !ctx.is_aborted())
                .map_err(|e| map_curl_error(e, &host, false))?;
            transfer.perform().map_err(|e| map_curl_error(e, &host, false))?;
        }
        let code = easy
            .response_code()
            .map_err(|e| map_curl_error(e, &host, false))?;
        Ok((code, body))
    }

    /// Create every missing collection on the way to `path`.
    fn ensure_collections(&mut self, ctx: &SessionCtx<'_>, path: &str) -> Result<()> {
        let Some((parents, _)) = path.rsplit_once('/') else {
            return Ok(());
        };
        let mut current = String::new();
        for component in parents.split('/') {
            if component.is_empty() {
                continue;
            }
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(component);
            // 405 means the collection already exists; anything else
            // surfaces on the PUT anyway.
            let _ = self.request(ctx, Some("MKCOL"), &current, &[], true);
        }
        Ok(())
    }
}

impl Default for WebDavStorage {
    fn default() -> Self {
        WebDavStorage::new()
    }
}

impl StorageBackend for WebDavStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::WebDav
    }

    fn create(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<PartFile> {
        let mut remote_name = archive_name.to_string();
        match ctx.options.create_mode {
            CreateMode::Stop => {
                if self.exists(ctx, archive_name)? {
                    return Err(Error::FileExists(archive_name.into()));
                }
            }
            // PUT replaces; append is not expressible over WebDAV.
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

        self.ensure_collections(ctx, &part.remote_name)?;

        let (user, password) = self.login(ctx)?;
        let host = ctx.specifier.host.clone();
        let mut source = part.file;
        source
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io(e, &local_path))?;
        let size = source
            .metadata()
            .map_err(|e| Error::io(e, &local_path))?
            .len();

        let mut easy = Easy::new();
        configure_easy(&mut easy, &user, &password, &host)?;
        easy.url(&WebDavStorage::url(ctx, &part.remote_name))
            .map_err(|e| map_curl_error(e, &host, true))?;
        easy.upload(true).map_err(|e| map_curl_error(e, &host, true))?;
        easy.in_filesize(size).map_err(|e| map_curl_error(e, &host, true))?;

        {
            let mut last_burst = Instant::now();
            let mut transfer = easy.transfer();
            transfer
                .read_function(|into| {
                    let n = source.read(into).map_err(|_| curl::easy::ReadError::Abort)?;
                    let elapsed = last_burst.elapsed().as_micros() as u64;
                    last_burst = Instant::now();
                    if ctx.limit_bandwidth(n as u64, elapsed.max(1)).is_err() {
                        return Err(curl::easy::ReadError::Abort);
                    }
                    Ok(n)
                })
                .map_err(|e| map_curl_error(e, &host, true))?;
            transfer
                .progress_function(|_, _, _, _| !ctx.is_aborted())
                .map_err(|e| map_curl_error(e, &host, true))?;
            transfer.perform().map_err(|e| map_curl_error(e, &host, true))?;
        }
        let code = easy
            .response_code()
            .map_err(|e| map_curl_error(e, &host, true))?;
        if code >= 400 {
            return Err(Error::network(NetworkErrorKind::Send, format!("HTTP {code}")));
        }
        debug!(name = %part.remote_name, bytes = size, "webdav upload done");
        Ok(())
    }

    fn open(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<Box<dyn ReadHandle>> {
        let size = self.size(ctx, archive_name)?;
        let (user, password) = self.login(ctx)?;
        Ok(Box::new(CurlReadHandle {
            url: WebDavStorage::url(ctx, archive_name),
            user,
            password,
            size,
            position: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            abort: ctx.callbacks.abort.clone(),
        }))
    }

    fn exists(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        let (code, _) = self.request(ctx, None, name, &[], true)?;
        Ok((200..300).contains(&code))
    }

    fn is_file(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        Ok(self.exists(ctx, name)? && !self.is_directory(ctx, name)?)
    }

    fn is_directory(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        let (code, body) =
            self.request(ctx, Some("PROPFIND"), name, &[String::from("Depth: 0")], false)?;
        if !(200..300).contains(&code) {
            return Ok(false);
        }
        let text = String::from_utf8_lossy(&body);
        Ok(Regex::new(r"(?i)<[a-z0-9]*:?collection")
            .expect("valid pattern")
            .is_match(&text))
    }

    fn size(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<u64> {
        let (user, password) = self.login(ctx)?;
        let host = ctx.specifier.host.clone();
        let mut easy = Easy::new();
        configure_easy(&mut easy, &user, &password, &host)?;
        easy.url(&WebDavStorage::url(ctx, name))
            .map_err(|e| map_curl_error(e, &host, false))?;
        easy.nobody(true).map_err(|e| map_curl_error(e, &host, false))?;
        easy.perform().map_err(|e| map_curl_error(e, &host, false))?;
        let code = easy
            .response_code()
            .map_err(|e| map_curl_error(e, &host, false))?;
        if code == 404 {
            return Err(Error::FileNotFound(name.into()));
        }
        if !(200..300).contains(&code) {
            return Err(Error::network(NetworkErrorKind::Receive, format!("HTTP {code}")));
        }
        let length = easy
            .content_length_download()
            .map_err(|e| map_curl_error(e, &host, false))?;
        Ok(length.max(0.0) as u64)
    }

    fn delete(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<()> {
        let (code, _) = self.request(ctx, Some("DELETE"), name, &[], false)?;
        match code {
            200..=299 => Ok(()),
            404 => Err(Error::FileNotFound(name.into())),
            _ => Err(Error::network(NetworkErrorKind::Send, format!("HTTP {code}"))),
        }
    }

    fn rename(&mut self, ctx: &SessionCtx<'_>, from: &str, to: &str) -> Result<()> {
        let destination = format!("Destination: {}", WebDavStorage::url(ctx, to));
        let (code, _) = self.request(ctx, Some("MOVE"), from, &[destination], false)?;
        if (200..300).contains(&code) {
            Ok(())
        } else {
            Err(Error::network(NetworkErrorKind::Send, format!("HTTP {code}")))
        }
    }

    fn make_directory(&mut self, ctx: &SessionCtx<'_>, path: &str) -> Result<()> {
        self.ensure_collections(ctx, &format!("{}/.", path.trim_end_matches('/')))
    }

    fn get_file_info(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<RemoteFileInfo> {
        let size = self.size(ctx, name)?;
        let base = name.rsplit('/').next().unwrap_or(name);
        Ok(RemoteFileInfo {
            name: base.to_string(),
            is_directory: false,
            size,
            time_modified: 0,
            user_id: 0,
            group_id: 0,
            permission: 0,
        })
    }

    fn read_directory(&mut self, ctx: &SessionCtx<'_>, path: &str) -> Result<Vec<RemoteFileInfo>> {
        let request_path = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let (code, body) = self.request(
            ctx,
            Some("PROPFIND"),
            &request_path,
            &[String::from("Depth: 1")],
            false,
        )?;
        if code == 404 {
            return Err(Error::NotADirectory(path.into()));
        }
        if !(200..300).contains(&code) {
            return Err(Error::network(NetworkErrorKind::Receive, format!("HTTP {code}")));
        }
        let text = String::from_utf8_lossy(&body);
        Ok(parse_propfind(&text, &request_path))
    }
}

/// Lenient multistatus parsing: one `<response>` block per entry with
/// its `href`, optional `getcontentlength` and `collection` marker.
fn parse_propfind(text: &str, request_path: &str) -> Vec<RemoteFileInfo> {
    let response_split =
        Regex::new(r"(?i)</[a-z0-9]*:?response>").expect("valid pattern");
    let href_pattern =
        Regex::new(r"(?is)<[a-z0-9]*:?href[^>]*>([^<]+)</[a-z0-9]*:?href>").expect("valid pattern");
    let length_pattern =
        Regex::new(r"(?is)<[a-z0-9]*:?getcontentlength[^>]*>(\d+)<").expect("valid pattern");
    let collection_pattern =
        Regex::new(r"(?i)<[a-z0-9]*:?collection").expect("valid pattern");

    let mut entries = Vec::new();
    for block in response_split.split(text) {
        let Some(href) = href_pattern.captures(block).map(|c| c[1].trim().to_string()) else {
            continue;
        };
        let trimmed = href.trim_end_matches('/');
        let name = trimmed.rsplit('/').next().unwrap_or(trimmed).to_string();
        if name.is_empty() {
            continue;
        }
        // Skip the collection itself.
        let normalized_request = request_path.trim_end_matches('/');
        if !normalized_request.is_empty() && normalized_request.ends_with(&name) {
            continue;
        }
        let size = length_pattern
            .captures(block)
            .and_then(|c| c[1].parse::<u64>().ok())
            .unwrap_or(0);
        let is_directory = collection_pattern.is_match(block);
        entries.push(RemoteFileInfo {
            name,
            is_directory,
            size,
            time_modified: 0,
            user_id: 0,
            group_id: 0,
            permission: 0,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propfind_parsing() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/backups/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/backups/a.bar</D:href>
    <D:propstat><D:prop><D:getcontentlength>12345</D:getcontentlength><D:resourcetype/></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/backups/sub/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        let entries = parse_propfind(body, "backups/");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.bar");
        assert_eq!(entries[0].size, 12345);
        assert!(!entries[0].is_directory);
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].is_directory);
    }
}
