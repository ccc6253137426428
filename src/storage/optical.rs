//! CD/DVD/BD backend.
//!
//! Parts accumulate in a staging directory; once the staged size crosses
//! the per-volume limit (or the session closes), the post-process
//! pipeline runs: image-pre → create image → ecc-pre/ecc/ecc-post →
//! image-post → blank → write → verify. Every step is driven by a
//! command template; image creation and burning fall back to builtin
//! implementations (the in-process ISO9660 writer and an image-to-device
//! copy) when no template is configured.
//!
//! The blank/write/verify triple is retried up to three times; between
//! attempts a new medium is requested through the volume-request
//! protocol (callback, external command, or console prompt).

use std::fs;
use std::io::{BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::Regex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exec::{execute_template, TextMacros};
use crate::iso9660::{self, ISO_BLOCK_SIZE};
use crate::runtime::{MessageCode, VolumeRequestResult};
use crate::storage::{
    PartFile, ReadHandle, RemoteFileInfo, SessionCtx, StorageBackend, StorageKind,
    StorageSpecifier,
};

pub const CD_VOLUME_SIZE: u64 = 700 * 1024 * 1024;
pub const CD_VOLUME_ECC_SIZE: u64 = 560 * 1024 * 1024;
pub const DVD_VOLUME_SIZE: u64 = 4482 * 1024 * 1024;
pub const DVD_VOLUME_ECC_SIZE: u64 = 3600 * 1024 * 1024;
pub const BD_VOLUME_SIZE: u64 = 25 * 1024 * 1024 * 1024;
pub const BD_VOLUME_ECC_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Burn attempts before the volume is given up.
const WRITE_RETRY_COUNT: u32 = 3;

/// Settle time after a tray load/unload command ran.
const TRAY_SETTLE: Duration = Duration::from_secs(2);

/// How long to keep retrying to open the medium for verification.
const VERIFY_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeState {
    Unknown,
    Loaded,
    Unloaded,
    Wait,
}

pub struct OpticalStorage {
    kind: StorageKind,
    device_name: String,
    staging: Option<TempDir>,
    /// Parts already flushed into the staging directory.
    staged: Vec<PathBuf>,
    staged_size: u64,
    /// Ordinal of the volume currently being filled.
    number: u32,
    /// Ordinal of the medium currently in the drive.
    loaded_number: u32,
    request_number: u32,
    new_volume_flag: bool,
    volume_state: VolumeState,
    step: u32,
    total_steps: u32,
    last_part_name: String,
    percent: Regex,
}

impl OpticalStorage {
    pub fn new(specifier: &StorageSpecifier) -> Result<Self> {
        debug_assert!(matches!(
            specifier.kind,
            StorageKind::Cd | StorageKind::Dvd | StorageKind::Bd
        ));
        Ok(OpticalStorage {
            kind: specifier.kind,
            device_name: specifier.device_name.clone(),
            staging: None,
            staged: Vec::new(),
            staged_size: 0,
            number: 1,
            loaded_number: 1,
            request_number: 1,
            new_volume_flag: false,
            volume_state: VolumeState::Unknown,
            step: 0,
            total_steps: 0,
            last_part_name: String::new(),
            percent: Regex::new(r"(\d{1,3})\s*%").expect("valid percent pattern"),
        })
    }

    fn device_name(&self) -> Result<&str> {
        if self.device_name.is_empty() {
            // Platform default drive.
            #[cfg(target_os = "linux")]
            return Ok("/dev/sr0");
            #[cfg(not(target_os = "linux"))]
            return Err(Error::OpticalDriveNotFound);
        }
        Ok(&self.device_name)
    }

    /// Medium capacity, honoring the ECC reservation.
    fn volume_size(&self, ctx: &SessionCtx<'_>) -> u64 {
        if ctx.options.volume_size > 0 {
            return ctx.options.volume_size;
        }
        match (self.kind, ctx.options.error_correction_codes) {
            (StorageKind::Cd, false) => CD_VOLUME_SIZE,
            (StorageKind::Cd, true) => CD_VOLUME_ECC_SIZE,
            (StorageKind::Dvd, false) => DVD_VOLUME_SIZE,
            (StorageKind::Dvd, true) => DVD_VOLUME_ECC_SIZE,
            (StorageKind::Bd, false) => BD_VOLUME_SIZE,
            (StorageKind::Bd, true) => BD_VOLUME_ECC_SIZE,
            _ => CD_VOLUME_SIZE,
        }
    }

    fn staging_dir(&mut self, ctx: &SessionCtx<'_>) -> Result<&Path> {
        if self.staging.is_none() {
            let root = ctx
                .options
                .staging_directory
                .clone()
                .unwrap_or_else(|| ctx.runtime.tmp_directory().clone());
            let staging = tempfile::Builder::new()
                .prefix("barque-optical-")
                .tempdir_in(&root)
                .map_err(|e| Error::io(e, &root))?;
            debug!(directory = %staging.path().display(), "created staging directory");
            self.staging = Some(staging);
        }
        Ok(self.staging.as_ref().expect("staging created").path())
    }

    fn macros(&self, image: Option<&Path>) -> Result<TextMacros> {
        let sectors = image
            .and_then(|path| fs::metadata(path).ok())
            .map(|meta| meta.len().div_ceil(ISO_BLOCK_SIZE as u64))
            .unwrap_or(0);
        let mut macros = TextMacros::new()
            .set("%device", self.device_name()?.to_string())
            .set("%number", self.request_number.to_string())
            .set("%file", self.last_part_name.clone())
            .set("%sectors", sectors.to_string())
            .with_parallelism();
        if let Some(staging) = self.staging.as_ref() {
            macros = macros.set("%directory", staging.path().to_string_lossy().into_owned());
        }
        if let Some(image) = image {
            macros = macros.set("%image", image.to_string_lossy().into_owned());
        }
        Ok(macros)
    }

    /// Complete the current step and bump the volume progress.
    fn step_done(&mut self, ctx: &SessionCtx<'_>) -> Result<()> {
        self.step += 1;
        ctx.set_volume_done(self.step, self.total_steps, 0.0)
    }

    fn tray_command(&mut self, ctx: &SessionCtx<'_>, template: &str) -> Result<()> {
        if template.is_empty() {
            return Ok(());
        }
        let macros = self.macros(None)?;
        execute_template(template, &macros, None)?;
        // Give the hardware time to settle before touching the medium.
        let waited = Instant::now();
        while waited.elapsed() < TRAY_SETTLE {
            if ctx.is_aborted() {
                return Err(Error::Aborted);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    fn unload_volume(&mut self, ctx: &SessionCtx<'_>) -> Result<()> {
        ctx.report(MessageCode::UnloadVolume, "")?;
        let template = ctx.options.templates.unload_volume.clone();
        self.tray_command(ctx, &template)
    }

    fn load_volume(&mut self, ctx: &SessionCtx<'_>) -> Result<()> {
        ctx.report(MessageCode::LoadVolume, "")?;
        let template = ctx.options.templates.load_volume.clone();
        self.tray_command(ctx, &template)
    }

    /// The volume-request protocol: callback, external command, or
    /// console prompt, in that priority order.
    fn request_new_medium(
        &mut self,
        ctx: &SessionCtx<'_>,
        message: Option<&str>,
        wait: bool,
    ) -> Result<()> {
        if matches!(self.volume_state, VolumeState::Unknown | VolumeState::Loaded) {
            info!(volume = self.loaded_number, "unloading medium");
            let _ = self.unload_volume(ctx);
            self.volume_state = VolumeState::Unloaded;
        }

        let mut requested = false;
        let mut result = VolumeRequestResult::Fail;
        if let Some(request) = ctx.callbacks.volume_request.as_ref() {
            requested = true;
            loop {
                ctx.report(MessageCode::RequestVolume, message.unwrap_or(""))?;
                match request(self.request_number, message) {
                    VolumeRequestResult::Unload => {
                        let _ = self.unload_volume(ctx);
                    }
                    other => {
                        result = other;
                        break;
                    }
                }
            }
            self.volume_state = VolumeState::Wait;
        } else if !ctx.options.templates.request_volume.is_empty() {
            requested = true;
            info!(volume = self.request_number, "requesting new medium via command");
            let template = ctx.options.templates.request_volume.clone();
            let macros = self.macros(None)?;
            result = match execute_template(&template, &macros, None) {
                Ok(()) => VolumeRequestResult::Ok,
                Err(_) => VolumeRequestResult::Fail,
            };
            self.volume_state = VolumeState::Wait;
        } else if wait {
            requested = true;
            eprintln!(
                "Please insert medium #{} into drive '{}' and press ENTER to continue",
                self.request_number,
                self.device_name()?
            );
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            result = VolumeRequestResult::Ok;
            self.volume_state = VolumeState::Wait;
        } else {
            eprintln!(
                "Please insert medium #{} into drive '{}'",
                self.request_number,
                self.device_name()?
            );
            self.volume_state = VolumeState::Wait;
        }

        if !requested {
            return Ok(());
        }
        match result {
            VolumeRequestResult::Ok => {
                self.load_volume(ctx)?;
                self.loaded_number = self.request_number;
                ctx.set_volume_number(self.loaded_number);
                self.volume_state = VolumeState::Loaded;
                Ok(())
            }
            VolumeRequestResult::Abort => Err(Error::Aborted),
            _ => Err(Error::LoadVolumeFail),
        }
    }

    /// Image pipeline: image-pre, create image, ecc trio, image-post.
    fn create_image(&mut self, ctx: &SessionCtx<'_>, image: &Path) -> Result<()> {
        ctx.report(MessageCode::CreateImage, "")?;

        // Image pre-processing.
        if !ctx.options.templates.image_pre.is_empty() {
            let template = ctx.options.templates.image_pre.clone();
            let macros = self.macros(Some(image))?;
            execute_template(&template, &macros, None)?;
        }
        self.step_done(ctx)?;

        // Create the ISO9660 image.
        if ctx.options.templates.image.is_empty() {
            let staging = self.staging.as_ref().expect("staged parts exist").path().to_path_buf();
            let label = format!("BACKUP{:03}", self.request_number);
            let bytes = iso9660::write_image(&staging, image, &label)
                .map_err(|e| Error::CreateIso(e.to_string()))?;
            info!(volume = self.request_number, bytes, "created ISO image");
        } else {
            let template = ctx.options.templates.image.clone();
            let macros = self.macros(Some(image))?;
            execute_template(&template, &macros, None)
                .map_err(|e| Error::CreateIso(e.to_string()))?;
        }
        self.step_done(ctx)?;

        // Error correction codes.
        if ctx.options.error_correction_codes {
            ctx.report(MessageCode::AddErrorCorrectionCodes, "")?;
            for template in [
                ctx.options.templates.ecc_pre.clone(),
                ctx.options.templates.ecc.clone(),
                ctx.options.templates.ecc_post.clone(),
            ] {
                if !template.is_empty() {
                    let macros = self.macros(Some(image))?;
                    let mut on_line = self.percent_progress(ctx);
                    execute_template(&template, &macros, Some(&mut on_line))?;
                }
                self.step_done(ctx)?;
            }
        }

        // Image post-processing.
        if !ctx.options.templates.image_post.is_empty() {
            let template = ctx.options.templates.image_post.clone();
            let macros = self.macros(Some(image))?;
            execute_template(&template, &macros, None)?;
        }
        self.step_done(ctx)?;
        Ok(())
    }

    /// Stdout hook translating a trailing `NN%` into step progress.
    fn percent_progress<'c>(&self, ctx: &'c SessionCtx<'c>) -> impl FnMut(&str) + 'c {
        let percent = self.percent.clone();
        let step = self.step;
        let total = self.total_steps;
        move |line: &str| {
            if let Some(captures) = percent.captures_iter(line).last() {
                if let Ok(pct) = captures[1].parse::<f64>() {
                    let _ = ctx.set_volume_done(step, total, pct.min(100.0));
                }
            }
        }
    }

    fn blank_volume(&mut self, ctx: &SessionCtx<'_>) -> Result<()> {
        if !ctx.options.blank {
            return Ok(());
        }
        ctx.report(MessageCode::BlankVolume, "")?;
        if !ctx.options.templates.blank.is_empty() {
            let template = ctx.options.templates.blank.clone();
            let macros = self.macros(None)?;
            let mut on_line = self.percent_progress(ctx);
            execute_template(&template, &macros, Some(&mut on_line))
                .map_err(|e| Error::WriteOptical(e.to_string()))?;
        }
        self.step_done(ctx)
    }

    /// Copy a finished image onto the device node, updating progress.
    fn write_image_builtin(&mut self, ctx: &SessionCtx<'_>, image: &Path) -> Result<()> {
        let device = self.device_name()?.to_string();
        let mut source = fs::File::open(image).map_err(|e| Error::io(e, image))?;
        let total = source.metadata().map_err(|e| Error::io(e, image))?.len();
        let mut target = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&device)
            .map_err(|_| Error::WriteOptical(format!("cannot open '{}'", device)))?;

        let mut buffer = vec![0u8; 256 * 1024];
        let mut written = 0u64;
        loop {
            if ctx.is_aborted() {
                return Err(Error::Aborted);
            }
            let n = source.read(&mut buffer).map_err(|e| Error::io(e, image))?;
            if n == 0 {
                break;
            }
            target
                .write_all(&buffer[..n])
                .map_err(|e| Error::WriteOptical(e.to_string()))?;
            written += n as u64;
            let pct = if total == 0 { 100.0 } else { written as f64 * 100.0 / total as f64 };
            ctx.set_volume_done(self.step, self.total_steps, pct)?;
        }
        target.sync_all().map_err(|e| Error::WriteOptical(e.to_string()))?;
        Ok(())
    }

    /// Burn step: template (image or directory mode) or builtin copy.
    fn write_volume(
        &mut self,
        ctx: &SessionCtx<'_>,
        image: Option<&Path>,
        internal_image: &Path,
    ) -> Result<()> {
        ctx.report(MessageCode::WriteVolume, "")?;
        match image {
            Some(image) => {
                if ctx.options.templates.write_image.is_empty() {
                    self.write_image_builtin(ctx, image)?;
                } else {
                    let template = ctx.options.templates.write_image.clone();
                    let macros = self.macros(Some(image))?;
                    let mut on_line = self.percent_progress(ctx);
                    execute_template(&template, &macros, Some(&mut on_line))
                        .map_err(|e| Error::WriteOptical(e.to_string()))?;
                }
            }
            None => {
                if ctx.options.templates.write.is_empty() {
                    // Builtin direct mode: build a throwaway image of the
                    // staging directory and copy it over.
                    let staging =
                        self.staging.as_ref().expect("staged parts exist").path().to_path_buf();
                    let label = format!("BACKUP{:03}", self.request_number);
                    iso9660::write_image(&staging, internal_image, &label)
                        .map_err(|e| Error::WriteOptical(e.to_string()))?;
                    self.write_image_builtin(ctx, internal_image)?;
                } else {
                    let template = ctx.options.templates.write.clone();
                    let macros = self.macros(None)?;
                    let mut on_line = self.percent_progress(ctx);
                    execute_template(&template, &macros, Some(&mut on_line))
                        .map_err(|e| Error::WriteOptical(e.to_string()))?;
                }
            }
        }
        self.step_done(ctx)
    }

    /// Compare every staged file block-by-block against its ISO9660
    /// counterpart on the medium.
    fn verify_volume(&mut self, ctx: &SessionCtx<'_>) -> Result<()> {
        ctx.report(MessageCode::VerifyVolume, "")?;

        // Unload and reload the tray so the OS drops its caches.
        let _ = self.unload_volume(ctx);
        let _ = self.load_volume(ctx);

        let device = self.device_name()?.to_string();
        let opened = Instant::now();
        let mut reader = loop {
            match fs::File::open(&device)
                .map_err(|_| Error::OpenOptical)
                .and_then(iso9660::IsoReader::open)
            {
                Ok(reader) => break reader,
                Err(error) => {
                    if ctx.is_aborted() {
                        return Err(Error::Aborted);
                    }
                    if opened.elapsed() >= VERIFY_OPEN_TIMEOUT {
                        return Err(error);
                    }
                    std::thread::sleep(Duration::from_millis(500));
                }
            }
        };

        let total_files = self.staged.len().max(1);
        for (index, path) in self.staged.iter().enumerate() {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let entry = reader
                .stat(&file_name)?
                .ok_or_else(|| Error::FileNotFound(path.clone()))?;

            let mut staged = fs::File::open(path).map_err(|e| Error::io(e, path))?;
            let staged_size = staged.metadata().map_err(|e| Error::io(e, path))?.len();
            let mut buffer = [0u8; ISO_BLOCK_SIZE];
            let mut block_index = 0u64;
            let mut remaining = staged_size;
            while remaining > 0 {
                if ctx.is_aborted() {
                    return Err(Error::Aborted);
                }
                let want = remaining.min(ISO_BLOCK_SIZE as u64) as usize;
                staged
                    .read_exact(&mut buffer[..want])
                    .map_err(|e| Error::io(e, path))?;
                let medium = reader.read_block(&entry, block_index)?;
                if buffer[..want] != medium[..want] {
                    // Locate the first differing octet for the report.
                    let delta = buffer[..want]
                        .iter()
                        .zip(medium[..want].iter())
                        .position(|(a, b)| a != b)
                        .unwrap_or(0) as u64;
                    return Err(Error::VerifyFailed {
                        path: path.clone(),
                        offset: block_index * ISO_BLOCK_SIZE as u64 + delta,
                    });
                }
                remaining -= want as u64;
                block_index += 1;
            }

            let pct = (index + 1) as f64 * 100.0 / total_files as f64;
            ctx.set_volume_done(self.step, self.total_steps, pct)?;
        }

        info!(volume = self.number, "verified volume");
        self.step_done(ctx)
    }

    /// Flush the staged parts onto one volume.
    fn write_out_volume(&mut self, ctx: &SessionCtx<'_>) -> Result<()> {
        ctx.reset_volume_done();

        let need_image =
            ctx.options.always_create_image || ctx.options.error_correction_codes;
        self.total_steps = u32::from(ctx.options.blank)
            + if need_image { 3 } else { 0 }
            + if ctx.options.error_correction_codes { 3 } else { 0 }
            + 1  // write
            + 1; // verify
        self.step = 0;

        // A new medium is required when the loaded one is not the
        // requested ordinal.
        if self.loaded_number != self.request_number {
            self.request_new_medium(ctx, None, true)?;
        }

        let image = tempfile::Builder::new()
            .prefix("barque-volume-")
            .suffix(".iso")
            .tempfile_in(ctx.runtime.tmp_directory())
            .map_err(|e| Error::io(e, ctx.runtime.tmp_directory()))?
            .into_temp_path();

        let mut result = Ok(());
        if need_image {
            result = self.create_image(ctx, &image);
        }

        // blank + write + verify, retried with a fresh medium.
        if result.is_ok() {
            let saved_step = self.step;
            let mut retries_left = WRITE_RETRY_COUNT;
            loop {
                self.step = saved_step;
                result = self
                    .blank_volume(ctx)
                    .and_then(|()| {
                        self.write_volume(
                            ctx,
                            if need_image { Some(image.as_ref()) } else { None },
                            image.as_ref(),
                        )
                    })
                    .and_then(|()| self.verify_volume(ctx));
                match &result {
                    Ok(()) => break,
                    Err(Error::Aborted) => break,
                    Err(error) => {
                        retries_left -= 1;
                        if retries_left == 0 {
                            break;
                        }
                        warn!(volume = self.request_number, %error, "volume write failed, requesting new medium");
                        let message = error.to_string();
                        if self.request_new_medium(ctx, Some(&message), true).is_err() {
                            break;
                        }
                    }
                }
            }
        }

        // Staged parts are removed on success and on failure alike; the
        // archive itself still lives on the caller's source.
        if result.is_ok() {
            for path in self.staged.drain(..) {
                let _ = fs::remove_file(&path);
            }
            self.staged_size = 0;
            self.new_volume_flag = true;
            ctx.set_volume_done(self.total_steps, self.total_steps, 0.0)?;
        }

        result
    }
}

struct OpticalReadHandle {
    file: iso9660::IsoFile<fs::File>,
}

impl Read for OpticalReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for OpticalReadHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ReadHandle for OpticalReadHandle {
    fn size(&self) -> Option<u64> {
        Some(self.file.size())
    }
}

fn base_name(archive_name: &str) -> String {
    archive_name.rsplit('/').next().unwrap_or(archive_name).to_string()
}

impl StorageBackend for OpticalStorage {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    fn pre_process(&mut self, ctx: &SessionCtx<'_>, _initial: bool) -> Result<()> {
        if self.new_volume_flag {
            self.number += 1;
            self.new_volume_flag = false;
            self.request_number = self.number;
        }
        if self.loaded_number != self.request_number {
            self.request_new_medium(ctx, None, false)?;
        }
        if !ctx.options.templates.write_pre.is_empty() {
            let template = ctx.options.templates.write_pre.clone();
            let macros = self.macros(None)?;
            execute_template(&template, &macros, None)?;
        }
        Ok(())
    }

    fn post_process(&mut self, ctx: &SessionCtx<'_>, final_flag: bool) -> Result<()> {
        let limit = self.volume_size(ctx);
        if self.staged_size >= limit || (final_flag && self.staged_size > 0) {
            self.write_out_volume(ctx)?;
        }
        if !ctx.options.templates.write_post.is_empty() {
            let template = ctx.options.templates.write_post.clone();
            let macros = self.macros(None)?;
            execute_template(&template, &macros, None)?;
        }
        Ok(())
    }

    fn create(&mut self, ctx: &SessionCtx<'_>, archive_name: &str) -> Result<PartFile> {
        let staging = self.staging_dir(ctx)?.to_path_buf();
        let local_path = staging.join(base_name(archive_name));
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&local_path)
            .map_err(|e| Error::io(e, &local_path))?;
        Ok(PartFile {
            file,
            local_path,
            remote_name: archive_name.to_string(),
            temporary: false,
        })
    }

    fn store(&mut self, _ctx: &SessionCtx<'_>, part: PartFile) -> Result<()> {
        part.file
            .sync_all()
            .map_err(|e| Error::io(e, &part.local_path))?;
        let size = fs::metadata(&part.local_path)
            .map_err(|e| Error::io(e, &part.local_path))?
            .len();
        self.staged_size += size;
        self.last_part_name = part.remote_name.clone();
        self.staged.push(part.local_path);
        debug!(staged = self.staged.len(), bytes = self.staged_size, "part staged");
        Ok(())
    }

    fn open(&mut self, _ctx: &SessionCtx<'_>, archive_name: &str) -> Result<Box<dyn ReadHandle>> {
        let device = self.device_name()?.to_string();
        let source = fs::File::open(&device).map_err(|_| Error::OpenOptical)?;
        let file = iso9660::IsoFile::open(source, &base_name(archive_name))?;
        Ok(Box::new(OpticalReadHandle { file }))
    }

    fn exists(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        let device = self.device_name()?.to_string();
        let source = fs::File::open(&device).map_err(|_| Error::OpenOptical)?;
        let mut reader = iso9660::IsoReader::open(source)?;
        Ok(reader.stat(&base_name(name))?.is_some())
    }

    fn is_file(&mut self, ctx: &SessionCtx<'_>, name: &str) -> Result<bool> {
        self.exists(ctx, name)
    }

    fn size(&mut self, _ctx: &SessionCtx<'_>, name: &str) -> Result<u64> {
        let device = self.device_name()?.to_string();
        let source = fs::File::open(&device).map_err(|_| Error::OpenOptical)?;
        let mut reader = iso9660::IsoReader::open(source)?;
        reader
            .stat(&base_name(name))?
            .map(|entry| entry.size)
            .ok_or_else(|| Error::FileNotFound(name.into()))
    }

    fn read_directory(&mut self, _ctx: &SessionCtx<'_>, _path: &str) -> Result<Vec<RemoteFileInfo>> {
        let device = self.device_name()?.to_string();
        let source = fs::File::open(&device).map_err(|_| Error::OpenOptical)?;
        let mut reader = iso9660::IsoReader::open(source)?;
        Ok(reader
            .list_root()?
            .into_iter()
            .map(|entry| RemoteFileInfo {
                name: entry.name,
                is_directory: entry.is_directory,
                size: entry.size,
                time_modified: 0,
                user_id: 0,
                group_id: 0,
                permission: 0,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("backups/2026/a.bar"), "a.bar");
        assert_eq!(base_name("a.bar"), "a.bar");
    }

    #[test]
    fn step_model_matches_configuration() {
        // blank + image(3) + ecc(3) + write + verify = 9
        let blank = true;
        let ecc = true;
        let always_image = false;
        let need_image = always_image || ecc;
        let total = u32::from(blank)
            + if need_image { 3 } else { 0 }
            + if ecc { 3 } else { 0 }
            + 1
            + 1;
        assert_eq!(total, 9);
    }
}
