//! Raw block-device backend.
//!
//! The same staging scheme as the optical backend, with a shorter
//! pipeline and no blank/verify: image-pre → create image →
//! ecc-pre/ecc/ecc-post → image-post → write-pre → write → write-post.
//! Image creation has no builtin here (a device image layout is site
//! specific); the write step defaults to copying the built image onto
//! the device node.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::exec::{execute_template, TextMacros};
use crate::iso9660::ISO_BLOCK_SIZE;
use crate::runtime::MessageCode;
use crate::storage::{
    PartFile, ReadHandle, SessionCtx, StorageBackend, StorageKind, StorageSpecifier,
};

pub struct DeviceStorage {
    device_name: String,
    staging: Option<TempDir>,
    staged: Vec<PathBuf>,
    staged_size: u64,
    number: u32,
    new_volume_flag: bool,
    step: u32,
    total_steps: u32,
    last_part_name: String,
}

impl DeviceStorage {
    pub fn new(specifier: &StorageSpecifier) -> Result<Self> {
        debug_assert_eq!(specifier.kind, StorageKind::Device);
        if specifier.device_name.is_empty() {
            return Err(Error::InvalidUri { scheme: "device".to_string() });
        }
        Ok(DeviceStorage {
            device_name: specifier.device_name.clone(),
            staging: None,
            staged: Vec::new(),
            staged_size: 0,
            number: 1,
            new_volume_flag: false,
            step: 0,
            total_steps: 0,
            last_part_name: String::new(),
        })
    }

    fn volume_size(&self, ctx: &SessionCtx<'_>) -> u64 {
        if ctx.options.volume_size > 0 {
            ctx.options.volume_size
        } else {
            // Without a configured limit everything goes onto one image
            // at session close.
            u64::MAX
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
                .prefix("barque-device-")
                .tempdir_in(&root)
                .map_err(|e| Error::io(e, &root))?;
            debug!(directory = %staging.path().display(), "created staging directory");
            self.staging = Some(staging);
        }
        Ok(self.staging.as_ref().expect("staging created").path())
    }

    fn macros(&self, image: Option<&Path>) -> TextMacros {
        let sectors = image
            .and_then(|path| fs::metadata(path).ok())
            .map(|meta| meta.len().div_ceil(ISO_BLOCK_SIZE as u64))
            .unwrap_or(0);
        let mut macros = TextMacros::new()
            .set("%device", self.device_name.clone())
            .set("%number", self.number.to_string())
            .set("%file", self.last_part_name.clone())
            .set("%sectors", sectors.to_string())
            .with_parallelism();
        if let Some(staging) = self.staging.as_ref() {
            macros = macros.set("%directory", staging.path().to_string_lossy().into_owned());
        }
        if let Some(image) = image {
            macros = macros.set("%image", image.to_string_lossy().into_owned());
        }
        macros
    }

    fn step_done(&mut self, ctx: &SessionCtx<'_>) -> Result<()> {
        self.step += 1;
        ctx.set_volume_done(self.step, self.total_steps, 0.0)
    }

    fn run_step(
        &mut self,
        ctx: &SessionCtx<'_>,
        template: &str,
        image: Option<&Path>,
    ) -> Result<()> {
        if ctx.is_aborted() {
            return Err(Error::Aborted);
        }
        if !template.is_empty() {
            let macros = self.macros(image);
            execute_template(template, &macros, None)?;
        }
        self.step_done(ctx)
    }

    /// Copy the built image onto the device node.
    fn write_builtin(&mut self, ctx: &SessionCtx<'_>, image: &Path) -> Result<()> {
        let mut source = fs::File::open(image).map_err(|e| Error::io(e, image))?;
        let total = source.metadata().map_err(|e| Error::io(e, image))?.len();
        let device = Path::new(&self.device_name);
        let mut target = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(device)
            .map_err(|e| Error::io(e, device))?;
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
            target.write_all(&buffer[..n]).map_err(|e| Error::io(e, device))?;
            written += n as u64;
            let pct = if total == 0 { 100.0 } else { written as f64 * 100.0 / total as f64 };
            ctx.set_volume_done(self.step, self.total_steps, pct)?;
        }
        target.sync_all().map_err(|e| Error::io(e, device))?;
        Ok(())
    }

    fn write_out_volume(&mut self, ctx: &SessionCtx<'_>) -> Result<()> {
        ctx.reset_volume_done();
        let ecc = ctx.options.error_correction_codes;
        self.total_steps = 3 + if ecc { 3 } else { 0 } + 1;
        self.step = 0;

        let image = tempfile::Builder::new()
            .prefix("barque-device-image-")
            .tempfile_in(ctx.runtime.tmp_directory())
            .map_err(|e| Error::io(e, ctx.runtime.tmp_directory()))?
            .into_temp_path();

        ctx.report(MessageCode::CreateImage, "")?;
        let templates = ctx.options.templates.clone();
        self.run_step(ctx, &templates.image_pre, Some(image.as_ref()))?;
        self.run_step(ctx, &templates.image, Some(image.as_ref()))?;
        if ecc {
            ctx.report(MessageCode::AddErrorCorrectionCodes, "")?;
            self.run_step(ctx, &templates.ecc_pre, Some(image.as_ref()))?;
            self.run_step(ctx, &templates.ecc, Some(image.as_ref()))?;
            self.run_step(ctx, &templates.ecc_post, Some(image.as_ref()))?;
        }
        self.run_step(ctx, &templates.image_post, Some(image.as_ref()))?;

        if !templates.write_pre.is_empty() {
            let macros = self.macros(Some(image.as_ref()));
            execute_template(&templates.write_pre, &macros, None)?;
        }
        ctx.report(MessageCode::WriteVolume, "")?;
        if templates.write.is_empty() {
            self.write_builtin(ctx, image.as_ref())?;
            self.step_done(ctx)?;
        } else {
            self.run_step(ctx, &templates.write, Some(image.as_ref()))?;
        }
        if !templates.write_post.is_empty() {
            let macros = self.macros(Some(image.as_ref()));
            execute_template(&templates.write_post, &macros, None)?;
        }

        for path in self.staged.drain(..) {
            let _ = fs::remove_file(&path);
        }
        self.staged_size = 0;
        self.new_volume_flag = true;
        ctx.set_volume_done(self.total_steps, self.total_steps, 0.0)?;
        info!(volume = self.number, device = %self.device_name, "device volume written");
        Ok(())
    }
}

fn base_name(archive_name: &str) -> &str {
    archive_name.rsplit('/').next().unwrap_or(archive_name)
}

impl StorageBackend for DeviceStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Device
    }

    fn pre_process(&mut self, _ctx: &SessionCtx<'_>, _initial: bool) -> Result<()> {
        if self.new_volume_flag {
            self.number += 1;
            self.new_volume_flag = false;
        }
        Ok(())
    }

    fn post_process(&mut self, ctx: &SessionCtx<'_>, final_flag: bool) -> Result<()> {
        let limit = self.volume_size(ctx);
        if self.staged_size >= limit || (final_flag && self.staged_size > 0) {
            self.write_out_volume(ctx)?;
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
        part.file.sync_all().map_err(|e| Error::io(e, &part.local_path))?;
        let size = fs::metadata(&part.local_path)
            .map_err(|e| Error::io(e, &part.local_path))?
            .len();
        self.staged_size += size;
        self.last_part_name = part.remote_name.clone();
        self.staged.push(part.local_path);
        Ok(())
    }

    // Reading an arbitrary device image back is site specific; the
    // original left these operations unimplemented.
    fn open(&mut self, _ctx: &SessionCtx<'_>, _archive_name: &str) -> Result<Box<dyn ReadHandle>> {
        Err(Error::NotSupported)
    }
}
