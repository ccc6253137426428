//! FTP backend over libcurl.
//!
//! Uploads stream a finished local part through the bandwidth limiter;
//! reads fetch 64 KiB ranges into a read-ahead buffer, so seeking is a
//! restart at the requested offset. Directory listings accept the three
//! common server dialects (ISO date, `MON DD HH:MM`, `MON DD YYYY`) and
//! two wildcard fallbacks; unparseable lines are skipped.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::time::Instant;

use chrono::{Datelike, Local, NaiveDate, TimeZone};
use curl::easy::Easy;
use tracing::debug;

use crate::error::{Error, Result};
use crate::password::Password;
use crate::storage::net::{configure_easy, map_curl_error, resolve_login, setopt_bool, CurlReadHandle};
use crate::storage::{
    CreateMode, PartFile, ReadHandle, RemoteFileInfo, SessionCtx, StorageBackend, StorageKind,
};

pub struct FtpStorage {
    login: Option<(String, Password)>,
}

impl FtpStorage {
    pub fn new() -> Self {
        FtpStorage { login: None }
    }

    fn url(ctx: &SessionCtx<'_>, path: &str) -> String {
        format!(
            "ftp://{}:{}/{}",
            ctx.specifier.host, ctx.specifier.port, path
        )
    }

    /// Resolve (and cache) login information; the check logs in and
    /// lists the server root.
    fn login(&mut self, ctx: &SessionCtx<'_>) -> Result<(String, Password)> {
        if let Some(login) = &self.login {
            return Ok((login.0.clone(), login.1.clone()));
        }
        let host = ctx.specifier.host.clone();
        let url = FtpStorage::url(ctx, "");
        let login = resolve_login(ctx, StorageKind::Ftp, |user, password| {
            let mut easy = Easy::new();
            configure_easy(&mut easy, user, password, &host)?;
            easy.url(&url).map_err(|e| map_curl_error(e, &host, false))?;
            setopt_bool(&easy, curl_sys::CURLOPT_DIRLISTONLY, true)
                .map_err(|e| map_curl_error(e, &host, false))?;
            easy.write_function(|data| Ok(data.len()))
                .map_err(|e| map_curl_error(e, &host, false))?;
            easy.perform().map_err(|e| map_curl_error(e, &host, false))?;
            Ok(())
        })?;
        self.login = Some((login.0.clone(), login.1.clone()));
        Ok(login)
    }

    /// Fetch one URL into a buffer.
    fn fetch(&mut self, ctx: &SessionCtx<'_>, url: &str) -> Result<Vec<u8>> {
        let (user, password) = self.login(ctx)?;
        let host = ctx.specifier.host.clone();
        let mut easy = Easy::new();
        configure_easy(&mut easy, &user, &password, &host)?;
        easy.url(url).map_err(|e| map_curl_error(e, &host, false))?;

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
                .progress_function(move |_, _, _, _| !ctx.is_aborted())
                .map_err(|e| map_curl_error(e, &host, false))?;
            transfer.perform().map_err(|e| map_curl_error(e, &host, false))?;
        }
        ctx.limit_bandwidth(body.len() as u64, 1)?;
        Ok(body)
    }
}

impl Default for FtpStorage {
    fn default() -> Self {
        FtpStorage::new()
    }
}

impl StorageBackend for FtpStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Ftp
    }

    fn create(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<PartFile> {
        // Enforce the conflict policy before any bytes move.
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
        // The local part is a temporary; it goes away on every exit
        // path once the upload has been attempted.
        let temporary = part.temporary;
        let local_path = part.local_path;
        let _cleanup = scopeguard::guard(local_path.clone(), move |path| {
            if temporary {
                let _ = fs::remove_file(path);
            }
        });

        let (user, password) = self.login(ctx)?;
        let host = ctx.specifier.host.clone();
        let url = FtpStorage::url(ctx, &part.remote_name);

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
        easy.url(&url).map_err(|e| map_curl_error(e, &host, true))?;
        easy.upload(true).map_err(|e| map_curl_error(e, &host, true))?;
        easy.in_filesize(size).map_err(|e| map_curl_error(e, &host, true))?;
        setopt_bool(&easy, curl_sys::CURLOPT_FTP_CREATE_MISSING_DIRS, true)
            .map_err(|e| map_curl_error(e, &host, true))?;
        if ctx.options.create_mode == CreateMode::Append {
            setopt_bool(&easy, curl_sys::CURLOPT_APPEND, true)
                .map_err(|e| map_curl_error(e, &host, true))?;
        }

        let upload_result = {
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
            transfer.perform()
        };
        upload_result.map_err(|e| map_curl_error(e, &host, true))?;
        debug!(name = %part.remote_name, bytes = size, "ftp upload done");
        Ok(())
    }

    fn open(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<Box<dyn ReadHandle>> {
        let size = self.size(ctx, archive_name)?;
        let (user, password) = self.login(ctx)?;
        Ok(Box::new(CurlReadHandle {
            url: FtpStorage::url(ctx, archive_name),
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
        match self.size(ctx, name) {
            Ok(_) => Ok(true),
            Err(Error::FileNotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn is_file(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        self.get_file_info(ctx, name).map(|info| !info.is_directory)
    }

    fn is_directory(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        self.get_file_info(ctx, name).map(|info| info.is_directory)
    }

    fn size(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<u64> {
        let (user, password) = self.login(ctx)?;
        let host = ctx.specifier.host.clone();
        let mut easy = Easy::new();
        configure_easy(&mut easy, &user, &password, &host)?;
        easy.url(&FtpStorage::url(ctx, name))
            .map_err(|e| map_curl_error(e, &host, false))?;
        easy.nobody(true).map_err(|e| map_curl_error(e, &host, false))?;
        match easy.perform() {
            Ok(()) => {}
            Err(error)
                if error.is_couldnt_connect()
                    || error.is_couldnt_resolve_host()
                    || error.is_operation_timedout()
                    || error.is_login_denied() =>
            {
                return Err(map_curl_error(error, &host, false))
            }
            // RETR/SIZE refusals mean the path is not there.
            Err(_) => return Err(Error::FileNotFound(name.into())),
        }
        let length = easy
            .content_length_download()
            .map_err(|e| map_curl_error(e, &host, false))?;
        if length < 0.0 {
            return Err(Error::FileNotFound(name.into()));
        }
        Ok(length as u64)
    }

    fn delete(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<()> {
        // DELE replaces the transfer command on the parent listing URL.
        let (user, password) = self.login(ctx)?;
        let host = ctx.specifier.host.clone();
        let (parent, base) = match name.rsplit_once('/') {
            Some((parent, base)) => (format!("{}/", parent), base.to_string()),
            None => (String::new(), name.to_string()),
        };
        let mut easy = Easy::new();
        configure_easy(&mut easy, &user, &password, &host)?;
        easy.url(&FtpStorage::url(ctx, &parent))
            .map_err(|e| map_curl_error(e, &host, true))?;
        easy.custom_request(&format!("DELE {}", base))
            .map_err(|e| map_curl_error(e, &host, true))?;
        easy.write_function(|data| Ok(data.len()))
            .map_err(|e| map_curl_error(e, &host, true))?;
        easy.perform().map_err(|e| map_curl_error(e, &host, true))?;
        Ok(())
    }

    fn get_file_info(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<RemoteFileInfo> {
        let (parent, base) = match name.rsplit_once('/') {
            Some((parent, base)) => (parent.to_string(), base.to_string()),
            None => (String::new(), name.to_string()),
        };
        let entries = self.read_directory(ctx, &parent)?;
        entries
            .into_iter()
            .find(|entry| entry.name == base)
            .ok_or_else(|| Error::FileNotFound(name.into()))
    }

    fn read_directory(&mut self, ctx: &SessionCtx<'_>, path: &str) -> Result<Vec<RemoteFileInfo>> {
        let url = if path.is_empty() {
            FtpStorage::url(ctx, "")
        } else {
            FtpStorage::url(ctx, &format!("{}/", path.trim_end_matches('/')))
        };
        let listing = self.fetch(ctx, &url)?;
        let text = String::from_utf8_lossy(&listing);
        let mut entries = Vec::new();
        for line in text.lines() {
            if let Some(info) = parse_ftp_directory_line(line) {
                if info.name != "." && info.name != ".." {
                    entries.push(info);
                }
            }
        }
        Ok(entries)
    }
}

const MONTH_NAMES: [(&str, u32); 12] = [
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

fn parse_month(text: &str) -> Option<u32> {
    let trimmed = text.trim_start_matches('0');
    if let Ok(number) = trimmed.parse::<u32>() {
        if (1..=12).contains(&number) {
            return Some(number);
        }
    }
    let lower = text.to_ascii_lowercase();
    MONTH_NAMES
        .iter()
        .find(|(name, _)| lower == *name || lower.starts_with(*name))
        .map(|(_, number)| *number)
}

fn parse_permissions(text: &str) -> (bool, u32) {
    let bytes = text.as_bytes();
    let is_directory = bytes.first() == Some(&b'd');
    let mut permission = 0u32;
    let flags = [
        (1, b'r', 0o400),
        (2, b'w', 0o200),
        (3, b'x', 0o100),
        (4, b'r', 0o040),
        (5, b'w', 0o020),
        (6, b'x', 0o010),
        (7, b'r', 0o004),
        (8, b'w', 0o002),
        (9, b'x', 0o001),
    ];
    for (index, expected, bit) in flags {
        if bytes.len() > index && bytes[index] == expected {
            permission |= bit;
        }
    }
    (is_directory, permission)
}

fn timestamp(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> u64 {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .and_then(|naive| Local.from_local_datetime(&naive).single())
        .map(|local| local.timestamp().max(0) as u64)
        .unwrap_or(0)
}

/// Parse one `LIST` output line. Returns `None` for lines in none of
/// the known dialects.
pub(crate) fn parse_ftp_directory_line(line: &str) -> Option<RemoteFileInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let (is_directory, permission) = parse_permissions(fields[0]);
    let size: u64 = fields[4].parse().ok()?;
    let now = Local::now();

    // <perm> * * * <size> <yyyy>-<mm>-<dd> <hh>:<mm> <name>
    if let Some((date_part, time_part)) = fields[5].split_once('-').map(|_| (fields[5], fields[6]))
    {
        let date_fields: Vec<&str> = date_part.split('-').collect();
        if date_fields.len() == 3 {
            if let (Ok(year), Ok(month), Ok(day)) = (
                date_fields[0].parse::<i32>(),
                date_fields[1].parse::<u32>(),
                date_fields[2].parse::<u32>(),
            ) {
                if let Some((hour, minute)) = time_part.split_once(':') {
                    if let (Ok(hour), Ok(minute)) = (hour.parse::<u32>(), minute.parse::<u32>()) {
                        let name = fields[7..].join(" ");
                        return Some(RemoteFileInfo {
                            name,
                            is_directory,
                            size,
                            time_modified: timestamp(year, month, day, hour, minute),
                            user_id: 0,
                            group_id: 0,
                            permission,
                        });
                    }
                }
            }
        }
    }

    // <perm> * * * <size> <month> <day> <hh>:<mm> <name>
    if let (Some(month), Ok(day), Some((hour, minute))) = (
        parse_month(fields[5]),
        fields[6].parse::<u32>(),
        fields[7].split_once(':'),
    ) {
        if let (Ok(hour), Ok(minute)) = (hour.parse::<u32>(), minute.parse::<u32>()) {
            let name = fields[8..].join(" ");
            return Some(RemoteFileInfo {
                name,
                is_directory,
                size,
                time_modified: timestamp(now.year(), month, day, hour, minute),
                user_id: 0,
                group_id: 0,
                permission,
            });
        }
    }

    // <perm> * * * <size> <month> <day> <year> <name>
    if let (Some(month), Ok(day), Ok(year)) = (
        parse_month(fields[5]),
        fields[6].parse::<u32>(),
        fields[7].parse::<i32>(),
    ) {
        let name = fields[8..].join(" ");
        return Some(RemoteFileInfo {
            name,
            is_directory,
            size,
            time_modified: timestamp(year, month, day, 0, 0),
            user_id: 0,
            group_id: 0,
            permission,
        });
    }

    // Wildcard fallbacks: any three fields (the third with or without a
    // colon), then the name.
    let name = fields[8..].join(" ");
    if name.is_empty() {
        return None;
    }
    Some(RemoteFileInfo {
        name,
        is_directory,
        size,
        time_modified: 0,
        user_id: 0,
        group_id: 0,
        permission,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_date_dialect() {
        let info = parse_ftp_directory_line(
            "-rw-r--r-- 1 ftp ftp 1048576 2026-03-14 09:26 backup-001.bar",
        )
        .unwrap();
        assert_eq!(info.name, "backup-001.bar");
        assert_eq!(info.size, 1048576);
        assert!(!info.is_directory);
        assert_eq!(info.permission, 0o644);
        assert!(info.time_modified > 0);
    }

    #[test]
    fn month_day_time_dialect() {
        let info =
            parse_ftp_directory_line("drwxr-xr-x 3 u g 4096 Mar 14 09:26 archives").unwrap();
        assert!(info.is_directory);
        assert_eq!(info.name, "archives");
        assert_eq!(info.permission, 0o755);
    }

    #[test]
    fn month_day_year_dialect() {
        let info =
            parse_ftp_directory_line("-rw------- 1 u g 99 Dec 31 2025 old.bar").unwrap();
        assert_eq!(info.name, "old.bar");
        assert_eq!(info.permission, 0o600);
        assert!(info.time_modified > 0);
    }

    #[test]
    fn names_with_spaces_survive() {
        let info = parse_ftp_directory_line(
            "-rw-r--r-- 1 u g 5 Mar 1 09:00 name with spaces.bar",
        )
        .unwrap();
        assert_eq!(info.name, "name with spaces.bar");
    }

    #[test]
    fn garbage_lines_are_skipped() {
        assert!(parse_ftp_directory_line("total 42").is_none());
        assert!(parse_ftp_directory_line("").is_none());
        assert!(parse_ftp_directory_line("completely unrelated text").is_none());
    }

    #[test]
    fn numeric_month_is_accepted() {
        let info = parse_ftp_directory_line("-rw-r--r-- 1 u g 7 03 14 2026 x.bar").unwrap();
        assert_eq!(info.name, "x.bar");
        assert!(info.time_modified > 0);
    }
}
