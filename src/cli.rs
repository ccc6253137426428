//! Command-line interface for the `barque` binary.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use walkdir::WalkDir;

use crate::archive::restore::{restore_part, RestoreOptions};
use crate::archive::{
    format_part_name, ArchiveOptions, ArchiveReader, ArchiveWriter, EntryKind,
};
use crate::bandwidth::BandwidthRule;
use crate::compress::{CompressAlgorithm, CompressConfig};
use crate::crypto::CryptAlgorithm;
use crate::error::{Error, Result};
use crate::fsx;
use crate::password::Password;
use crate::runtime::CoreRuntime;
use crate::storage::{
    CreateMode, SessionCallbacks, StorageOptions, StorageSession, StorageSpecifier,
};

#[derive(Parser, Debug)]
#[command(
    name = "barque",
    version,
    about = "Chunked backup archiver with filesystem, network, optical and raw-device storage"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CompressArg {
    None,
    Zstd,
    Xz,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CryptArg {
    None,
    Aes128,
    Aes192,
    Aes256,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ModeArg {
    Stop,
    Append,
    Overwrite,
    Rename,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an archive from files and directories.
    Create {
        /// Target archive URI (path, ftp://, sftp://, cd://, ...).
        archive: String,
        /// Files and directories to archive.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long, value_enum, default_value = "zstd")]
        compress: CompressArg,
        #[arg(long, value_enum, default_value = "none")]
        crypt: CryptArg,
        /// Password for encryption (prompted when omitted).
        #[arg(long)]
        password: Option<String>,
        /// Split the archive into parts of this many bytes.
        #[arg(long, default_value_t = 0)]
        part_size: u64,
        /// Do not compress files smaller than this.
        #[arg(long, default_value_t = 32)]
        min_compress_size: u64,
        #[arg(long, value_enum, default_value = "stop")]
        mode: ModeArg,
        /// Cap transfer bandwidth (bits per second).
        #[arg(long)]
        max_bandwidth: Option<u64>,
        /// Per-volume byte limit for optical/device targets.
        #[arg(long, default_value_t = 0)]
        volume_size: u64,
        /// Add Reed-Solomon error correction to volume images.
        #[arg(long)]
        ecc: bool,
        /// Blank the medium before burning.
        #[arg(long)]
        blank: bool,
        /// Archive block devices given as inputs as raw images.
        #[arg(long)]
        raw_devices: bool,
    },
    /// List the entries of an archive.
    List {
        archive: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Restore an archive into a directory.
    Extract {
        archive: String,
        #[arg(long, default_value = ".")]
        destination: PathBuf,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        overwrite: bool,
    },
    /// Read the whole archive and verify it decodes.
    Test {
        archive: String,
        #[arg(long)]
        password: Option<String>,
    },
}

fn password_from(arg: Option<String>, needed: bool, label: &str) -> Result<Option<Password>> {
    if let Some(text) = arg {
        return Ok(Some(Password::from_bytes(text.as_bytes())));
    }
    if !needed {
        return Ok(None);
    }
    let text = rpassword::prompt_password(format!("{label}: "))
        .map_err(|e| Error::io(e, "tty"))?;
    Ok(Some(Password::from_bytes(text.as_bytes())))
}

fn session_callbacks() -> SessionCallbacks {
    SessionCallbacks {
        password_prompt: Some(Box::new(|label| {
            rpassword::prompt_password(format!("{label}: "))
                .ok()
                .map(|text| Password::from_bytes(text.as_bytes()))
        })),
        ..Default::default()
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let runtime = CoreRuntime::default();
    match cli.command {
        Commands::Create {
            archive,
            inputs,
            compress,
            crypt,
            password,
            part_size,
            min_compress_size,
            mode,
            max_bandwidth,
            volume_size,
            ecc,
            blank,
            raw_devices,
        } => {
            let crypt = match crypt {
                CryptArg::None => CryptAlgorithm::None,
                CryptArg::Aes128 => CryptAlgorithm::Aes128,
                CryptArg::Aes192 => CryptAlgorithm::Aes192,
                CryptArg::Aes256 => CryptAlgorithm::Aes256,
            };
            let compress = match compress {
                CompressArg::None => CompressAlgorithm::None,
                CompressArg::Zstd => CompressAlgorithm::Zstd,
                CompressArg::Xz => CompressAlgorithm::Xz,
            };
            let password =
                password_from(password, crypt != CryptAlgorithm::None, "Archive password")?;

            let specifier = StorageSpecifier::parse(&archive)?;
            let options = StorageOptions {
                create_mode: match mode {
                    ModeArg::Stop => CreateMode::Stop,
                    ModeArg::Append => CreateMode::Append,
                    ModeArg::Overwrite => CreateMode::Overwrite,
                    ModeArg::Rename => CreateMode::RenameOnConflict,
                },
                max_bandwidth: max_bandwidth
                    .map(|cap| vec![BandwidthRule::always(cap)])
                    .unwrap_or_default(),
                volume_size,
                error_correction_codes: ecc,
                blank,
                ..Default::default()
            };
            let mut session =
                StorageSession::open(&runtime, specifier, options, session_callbacks())?;
            let archive_options = ArchiveOptions {
                crypt,
                compress: CompressConfig { algorithm: compress, min_file_size: min_compress_size },
                part_size,
            };
            let mut writer =
                ArchiveWriter::create(&mut session, archive_options, password.as_ref())?;
            for input in &inputs {
                add_tree(&mut writer, input, raw_devices)?;
            }
            writer.close()?;
            Ok(())
        }
        Commands::List { archive, password } => {
            let password = password.map(|p| Password::from_bytes(p.as_bytes()));
            for_each_part(&runtime, &archive, |reader| {
                while let Some(info) = reader.read_entry()? {
                    let kind = match info.entry.kind {
                        EntryKind::File { .. } => "file",
                        EntryKind::Directory => "dir",
                        EntryKind::Link { .. } => "link",
                        EntryKind::Special { .. } => "special",
                        EntryKind::Image { .. } => "image",
                    };
                    if info.part_offset > 0 {
                        println!(
                            "{:<8} {:>12} +{:<12} {}",
                            kind,
                            info.entry.kind.size(),
                            info.part_offset,
                            info.entry.name_lossy()
                        );
                    } else {
                        println!(
                            "{:<8} {:>12} {}",
                            kind,
                            info.entry.kind.size(),
                            info.entry.name_lossy()
                        );
                    }
                }
                Ok(())
            }, password.as_ref())
        }
        Commands::Extract { archive, destination, password, overwrite } => {
            let password = password.map(|p| Password::from_bytes(p.as_bytes()));
            let mut total = 0u64;
            for_each_part(&runtime, &archive, |reader| {
                let stats =
                    restore_part(reader, &destination, RestoreOptions { overwrite })?;
                total += stats.entries;
                Ok(())
            }, password.as_ref())?;
            println!("{total} entries restored");
            Ok(())
        }
        Commands::Test { archive, password } => {
            let password = password.map(|p| Password::from_bytes(p.as_bytes()));
            let mut entries = 0u64;
            let mut bytes = 0u64;
            for_each_part(&runtime, &archive, |reader| {
                while let Some(_info) = reader.read_entry()? {
                    bytes += reader.copy_entry_data(&mut std::io::sink())?;
                    entries += 1;
                }
                Ok(())
            }, password.as_ref())?;
            println!("{entries} entries ok ({bytes} bytes)");
            Ok(())
        }
    }
}

/// Walk one input tree and append every entry to the archive.
fn add_tree(writer: &mut ArchiveWriter<'_, '_>, input: &Path, raw_devices: bool) -> Result<()> {
    let base = if input.is_dir() {
        input.to_path_buf()
    } else {
        input.parent().map(Path::to_path_buf).unwrap_or_else(|| input.to_path_buf())
    };
    for walked in WalkDir::new(input).follow_links(false) {
        let walked = walked.map_err(|e| {
            Error::io(
                e.io_error()
                    .map(|io| std::io::Error::new(io.kind(), io.to_string()))
                    .unwrap_or_else(|| std::io::Error::other("walk failed")),
                input,
            )
        })?;
        let path = walked.path();
        let relative = path.strip_prefix(&base).unwrap_or(path);
        if relative.as_os_str().is_empty() {
            continue;
        }
        let mut entry = fsx::entry_from_path(path, relative)?;

        // Block devices become raw images on request.
        if raw_devices {
            if let EntryKind::Special {
                kind: crate::archive::SpecialKind::BlockDevice, ..
            } = entry.kind
            {
                entry.kind = EntryKind::Image { size: fsx::device_or_file_size(path)? };
            }
        }

        if entry.kind.has_data() {
            let mut source = File::open(path).map_err(|e| Error::io(e, path))?;
            let mut data = writer.new_data_entry(entry)?;
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                let n = source.read(&mut buffer).map_err(|e| Error::io(e, path))?;
                if n == 0 {
                    break;
                }
                data.write(&buffer[..n])?;
            }
            data.finish()?;
        } else {
            writer.add_entry(&entry)?;
        }
    }
    Ok(())
}

/// Open every part of an archive in order and hand its reader to `f`.
fn for_each_part(
    runtime: &CoreRuntime,
    archive: &str,
    mut f: impl FnMut(&mut ArchiveReader<Box<dyn crate::storage::ReadHandle>>) -> Result<()>,
    password: Option<&Password>,
) -> Result<()> {
    let specifier = StorageSpecifier::parse(archive)?;
    let base = specifier.archive_name.clone();
    let mut session = StorageSession::open(
        runtime,
        specifier,
        StorageOptions::default(),
        session_callbacks(),
    )?;

    let mut part_number = 1u32;
    loop {
        let name = format_part_name(&base, part_number, 1);
        if part_number > 1 && !session.exists(&name).unwrap_or(false) {
            break;
        }
        let handle = match session.open_part(&name) {
            Ok(handle) => handle,
            Err(Error::FileNotFound(_)) if part_number > 1 => break,
            Err(error) => return Err(error),
        };
        let mut reader = ArchiveReader::open(handle, password)?;
        f(&mut reader)?;
        part_number += 1;
    }
    Ok(())
}
