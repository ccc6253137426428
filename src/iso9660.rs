//! Minimal ISO9660 (level 2) image writer and reader.
//!
//! The optical pipeline needs two things from the ISO layer: building a
//! volume image from the flat staging directory when no external
//! mkisofs-style command is configured, and reading files back from a
//! burned medium for verification. Images carry Rock Ridge `NM`/`PX`
//! entries so the original file names survive the 8.3-ish identifier
//! mangling.
//!
//! Only what the backend uses is implemented: a single root directory
//! of regular files.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// ISO9660 logical block size; verification compares in these units.
pub const ISO_BLOCK_SIZE: usize = 2048;

const SYSTEM_AREA_SECTORS: u64 = 16;
const PVD_SECTOR: u64 = 16;
const L_PATH_TABLE_SECTOR: u64 = 18;
const M_PATH_TABLE_SECTOR: u64 = 19;
const ROOT_EXTENT_SECTOR: u64 = 20;

const FLAG_DIRECTORY: u8 = 0x02;

fn both_u16(value: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&value.to_le_bytes());
    out[2..].copy_from_slice(&value.to_be_bytes());
    out
}

fn both_u32(value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&value.to_le_bytes());
    out[4..].copy_from_slice(&value.to_be_bytes());
    out
}

fn sectors_for(bytes: u64) -> u64 {
    bytes.div_ceil(ISO_BLOCK_SIZE as u64)
}

/// Map a file name onto an ISO level-2 identifier (d-characters,
/// `;1` version suffix).
fn iso_identifier(name: &str, taken: &mut Vec<String>) -> String {
    let mut id: String = name
        .to_ascii_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '_' })
        .take(30)
        .collect();
    if id.is_empty() {
        id.push('_');
    }
    let mut candidate = id.clone();
    let mut counter = 0u32;
    while taken.contains(&candidate) {
        counter += 1;
        candidate = format!("{}{}", &id[..id.len().min(27)], counter);
    }
    taken.push(candidate.clone());
    format!("{};1", candidate)
}

/// Rock Ridge `NM` + `PX` system-use area for one file record.
fn susp_for(name: &str, mode: u32) -> Vec<u8> {
    let mut susp = Vec::with_capacity(5 + name.len() + 36);
    // NM: alternate name.
    let name_bytes = name.as_bytes();
    susp.extend_from_slice(b"NM");
    susp.push((5 + name_bytes.len()) as u8);
    susp.push(1); // version
    susp.push(0); // flags: whole name in one entry
    susp.extend_from_slice(name_bytes);
    // PX: POSIX attributes (RRIP 1.10 layout).
    susp.extend_from_slice(b"PX");
    susp.push(36);
    susp.push(1);
    susp.extend_from_slice(&both_u32(mode));
    susp.extend_from_slice(&both_u32(1)); // links
    susp.extend_from_slice(&both_u32(0)); // uid
    susp.extend_from_slice(&both_u32(0)); // gid
    susp
}

fn directory_record(
    extent: u32,
    size: u32,
    flags: u8,
    file_id: &[u8],
    susp: &[u8],
) -> Vec<u8> {
    let mut record = Vec::with_capacity(34 + file_id.len() + susp.len());
    record.push(0); // length, patched below
    record.push(0); // extended attribute length
    record.extend_from_slice(&both_u32(extent));
    record.extend_from_slice(&both_u32(size));
    record.extend_from_slice(&[0u8; 7]); // recording date: unspecified
    record.push(flags);
    record.push(0); // interleave unit size
    record.push(0); // interleave gap
    record.extend_from_slice(&both_u16(1)); // volume sequence number
    record.push(file_id.len() as u8);
    record.extend_from_slice(file_id);
    if record.len() % 2 != 0 {
        record.push(0);
    }
    record.extend_from_slice(susp);
    if record.len() % 2 != 0 {
        record.push(0);
    }
    debug_assert!(record.len() <= 255);
    record[0] = record.len() as u8;
    record
}

struct PlannedFile {
    name: String,
    iso_id: String,
    size: u64,
    extent: u32,
    path: std::path::PathBuf,
}

/// Build an ISO9660 image of the regular files directly inside
/// `staging`, writing it to `image`. Returns the image size in bytes.
pub fn write_image(staging: &Path, image: &Path, volume_id: &str) -> Result<u64> {
    // Collect the flat file list, sorted for deterministic layout.
    let mut files: Vec<(String, u64, std::path::PathBuf)> = Vec::new();
    for entry in fs::read_dir(staging).map_err(|e| Error::io(e, staging))? {
        let entry = entry.map_err(|e| Error::io(e, staging))?;
        let meta = entry.metadata().map_err(|e| Error::io(e, staging))?;
        if meta.is_file() {
            files.push((
                entry.file_name().to_string_lossy().into_owned(),
                meta.len(),
                entry.path(),
            ));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    // Plan records first; extents depend on the root extent length.
    let mut taken = Vec::new();
    let mut planned: Vec<PlannedFile> = files
        .into_iter()
        .map(|(name, size, path)| {
            let iso_id = iso_identifier(&name, &mut taken);
            PlannedFile { name, iso_id, size, extent: 0, path }
        })
        .collect();

    // Root extent: ".", "..", then one record per file. Records never
    // cross sector boundaries, so lay them out sector by sector.
    let build_records = |planned: &mut Vec<PlannedFile>, root_size: u32| -> (Vec<u8>, u32) {
        let root_record_dot = directory_record(
            ROOT_EXTENT_SECTOR as u32,
            root_size,
            FLAG_DIRECTORY,
            &[0x00],
            // SUSP "SP" marker in the first record announces Rock Ridge.
            &[b'S', b'P', 7, 1, 0xBE, 0xEF, 0],
        );
        let root_record_dotdot = directory_record(
            ROOT_EXTENT_SECTOR as u32,
            root_size,
            FLAG_DIRECTORY,
            &[0x01],
            &[],
        );
        let mut extent = Vec::new();
        extent.extend_from_slice(&root_record_dot);
        extent.extend_from_slice(&root_record_dotdot);
        for file in planned.iter() {
            let record = directory_record(
                file.extent,
                file.size as u32,
                0,
                file.iso_id.as_bytes(),
                &susp_for(&file.name, 0o100644),
            );
            let used_in_sector = extent.len() % ISO_BLOCK_SIZE;
            if used_in_sector + record.len() > ISO_BLOCK_SIZE {
                extent.resize(extent.len() + ISO_BLOCK_SIZE - used_in_sector, 0);
            }
            extent.extend_from_slice(&record);
        }
        let size = sectors_for(extent.len() as u64).max(1) as u32 * ISO_BLOCK_SIZE as u32;
        extent.resize(size as usize, 0);
        (extent, size)
    };

    // First pass with zero extents fixes the root size; assign extents
    // and rebuild with real values.
    let (_, root_size) = build_records(&mut planned, 0);
    let root_sectors = sectors_for(root_size as u64);
    let mut next_extent = ROOT_EXTENT_SECTOR + root_sectors;
    for file in planned.iter_mut() {
        file.extent = next_extent as u32;
        next_extent += sectors_for(file.size).max(1);
    }
    let (root_extent, root_size) = build_records(&mut planned, root_size);
    debug_assert_eq!(root_size as u64, root_sectors * ISO_BLOCK_SIZE as u64);

    let total_sectors = next_extent;

    let mut out = fs::File::create(image).map_err(|e| Error::io(e, image))?;

    // System area.
    out.write_all(&vec![0u8; (SYSTEM_AREA_SECTORS * ISO_BLOCK_SIZE as u64) as usize])
        .map_err(|e| Error::io(e, image))?;

    // Primary volume descriptor.
    let mut pvd = vec![0u8; ISO_BLOCK_SIZE];
    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;
    pvd[8..40].fill(b' ');
    let mut volume_field = [b' '; 32];
    for (i, b) in volume_id.bytes().take(32).enumerate() {
        volume_field[i] = b.to_ascii_uppercase();
    }
    pvd[40..72].copy_from_slice(&volume_field);
    pvd[80..88].copy_from_slice(&both_u32(total_sectors as u32));
    pvd[120..124].copy_from_slice(&both_u16(1));
    pvd[124..128].copy_from_slice(&both_u16(1));
    pvd[128..132].copy_from_slice(&both_u16(ISO_BLOCK_SIZE as u16));
    pvd[132..140].copy_from_slice(&both_u32(10)); // path table size
    pvd[140..144].copy_from_slice(&(L_PATH_TABLE_SECTOR as u32).to_le_bytes());
    pvd[148..152].copy_from_slice(&(M_PATH_TABLE_SECTOR as u32).to_be_bytes());
    let root_record = directory_record(
        ROOT_EXTENT_SECTOR as u32,
        root_size,
        FLAG_DIRECTORY,
        &[0x00],
        &[],
    );
    pvd[156..156 + root_record.len()].copy_from_slice(&root_record);
    pvd[190..318].fill(b' '); // volume set id
    pvd[318..702].fill(b' '); // publisher/preparer/application ids
    pvd[881] = 1; // file structure version
    out.write_all(&pvd).map_err(|e| Error::io(e, image))?;

    // Set terminator.
    let mut terminator = vec![0u8; ISO_BLOCK_SIZE];
    terminator[0] = 255;
    terminator[1..6].copy_from_slice(b"CD001");
    terminator[6] = 1;
    out.write_all(&terminator).map_err(|e| Error::io(e, image))?;

    // Path tables: a single root record each.
    let mut l_table = vec![0u8; ISO_BLOCK_SIZE];
    l_table[0] = 1; // identifier length
    l_table[2..6].copy_from_slice(&(ROOT_EXTENT_SECTOR as u32).to_le_bytes());
    l_table[6..8].copy_from_slice(&1u16.to_le_bytes());
    out.write_all(&l_table).map_err(|e| Error::io(e, image))?;
    let mut m_table = vec![0u8; ISO_BLOCK_SIZE];
    m_table[0] = 1;
    m_table[2..6].copy_from_slice(&(ROOT_EXTENT_SECTOR as u32).to_be_bytes());
    m_table[6..8].copy_from_slice(&1u16.to_be_bytes());
    out.write_all(&m_table).map_err(|e| Error::io(e, image))?;

    // Root directory extent.
    out.write_all(&root_extent).map_err(|e| Error::io(e, image))?;

    // File extents, sector padded.
    for file in &planned {
        let mut source = fs::File::open(&file.path).map_err(|e| Error::io(e, &file.path))?;
        let copied = std::io::copy(&mut source, &mut out).map_err(|e| Error::io(e, &file.path))?;
        if copied != file.size {
            return Err(Error::CreateIso(format!(
                "'{}' changed size during image build",
                file.name
            )));
        }
        let sector_bytes = sectors_for(file.size).max(1) * ISO_BLOCK_SIZE as u64;
        let pad = sector_bytes - file.size;
        if pad > 0 {
            out.write_all(&vec![0u8; pad as usize]).map_err(|e| Error::io(e, image))?;
        }
    }

    out.sync_all().map_err(|e| Error::io(e, image))?;
    Ok(total_sectors * ISO_BLOCK_SIZE as u64)
}

/// One root-directory entry of an opened image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoEntry {
    /// Rock Ridge name when present, otherwise the ISO identifier
    /// without its `;1` version suffix.
    pub name: String,
    pub extent: u32,
    pub size: u64,
    pub is_directory: bool,
}

/// Reader over an ISO9660 image (a device node or a regular file).
pub struct IsoReader<R: Read + Seek> {
    source: R,
    root_extent: u32,
    root_size: u32,
}

impl<R: Read + Seek> IsoReader<R> {
    pub fn open(mut source: R) -> Result<Self> {
        let mut pvd = vec![0u8; ISO_BLOCK_SIZE];
        source
            .seek(SeekFrom::Start(PVD_SECTOR * ISO_BLOCK_SIZE as u64))
            .map_err(|_| Error::OpenOptical)?;
        source.read_exact(&mut pvd).map_err(|_| Error::OpenOptical)?;
        if pvd[0] != 1 || &pvd[1..6] != b"CD001" {
            return Err(Error::OpenOptical);
        }
        let root_extent = u32::from_le_bytes(pvd[158..162].try_into().expect("4"));
        let root_size = u32::from_le_bytes(pvd[166..170].try_into().expect("4"));
        Ok(IsoReader { source, root_extent, root_size })
    }

    /// List the root directory.
    pub fn list_root(&mut self) -> Result<Vec<IsoEntry>> {
        let mut extent = vec![0u8; self.root_size as usize];
        self.source
            .seek(SeekFrom::Start(self.root_extent as u64 * ISO_BLOCK_SIZE as u64))
            .map_err(|_| Error::OpenOptical)?;
        self.source.read_exact(&mut extent).map_err(|_| Error::OpenOptical)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < extent.len() {
            let record_length = extent[offset] as usize;
            if record_length == 0 {
                // Records never cross sectors; jump to the next one.
                let next = (offset / ISO_BLOCK_SIZE + 1) * ISO_BLOCK_SIZE;
                if next >= extent.len() {
                    break;
                }
                offset = next;
                continue;
            }
            if record_length < 34 || offset + record_length > extent.len() {
                break;
            }
            let record = &extent[offset..offset + record_length];
            offset += record_length;

            let file_extent = u32::from_le_bytes(record[2..6].try_into().expect("4"));
            let size = u32::from_le_bytes(record[10..14].try_into().expect("4")) as u64;
            let flags = record[25];
            let id_length = record[32] as usize;
            let id = &record[33..33 + id_length];
            if id == [0x00] || id == [0x01] {
                continue; // "." and ".."
            }

            let susp_start = 33 + id_length + (1 - id_length % 2);
            let name = rock_ridge_name(&record[susp_start.min(record.len())..])
                .unwrap_or_else(|| {
                    let text = String::from_utf8_lossy(id);
                    text.split(';').next().unwrap_or_default().to_string()
                });

            entries.push(IsoEntry {
                name,
                extent: file_extent,
                size,
                is_directory: flags & FLAG_DIRECTORY != 0,
            });
        }
        Ok(entries)
    }

    /// Find a root entry by name: Rock Ridge names match exactly, plain
    /// identifiers case-insensitively.
    pub fn stat(&mut self, name: &str) -> Result<Option<IsoEntry>> {
        let entries = self.list_root()?;
        if let Some(found) = entries.iter().find(|e| e.name == name) {
            return Ok(Some(found.clone()));
        }
        Ok(entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    /// Read the `index`-th 2048-octet block of an entry. Short final
    /// blocks are zero padded.
    pub fn read_block(&mut self, entry: &IsoEntry, index: u64) -> Result<[u8; ISO_BLOCK_SIZE]> {
        let mut block = [0u8; ISO_BLOCK_SIZE];
        let start = entry.extent as u64 * ISO_BLOCK_SIZE as u64 + index * ISO_BLOCK_SIZE as u64;
        self.source.seek(SeekFrom::Start(start)).map_err(|_| Error::OpenOptical)?;
        let remaining = entry.size.saturating_sub(index * ISO_BLOCK_SIZE as u64);
        let want = (remaining.min(ISO_BLOCK_SIZE as u64)) as usize;
        if want > 0 {
            self.source.read_exact(&mut block[..want]).map_err(|_| Error::OpenOptical)?;
        }
        Ok(block)
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}

/// Extract the `NM` alternate name from a system-use area.
fn rock_ridge_name(mut susp: &[u8]) -> Option<String> {
    let mut name = Vec::new();
    while susp.len() >= 4 {
        let length = susp[2] as usize;
        if length < 4 || length > susp.len() {
            break;
        }
        if &susp[..2] == b"NM" && length > 5 {
            name.extend_from_slice(&susp[5..length]);
            let continues = susp[4] & 0x01 != 0;
            if !continues {
                return Some(String::from_utf8_lossy(&name).into_owned());
            }
        }
        susp = &susp[length..];
    }
    if name.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&name).into_owned())
    }
}

/// A single file inside an image, exposed as `Read + Seek` for the
/// archive reader.
pub struct IsoFile<R: Read + Seek> {
    reader: IsoReader<R>,
    entry: IsoEntry,
    position: u64,
}

impl<R: Read + Seek> IsoFile<R> {
    pub fn open(source: R, name: &str) -> Result<Self> {
        let mut reader = IsoReader::open(source)?;
        let entry = reader
            .stat(name)?
            .ok_or_else(|| Error::FileNotFound(name.into()))?;
        Ok(IsoFile { reader, entry, position: 0 })
    }

    pub fn size(&self) -> u64 {
        self.entry.size
    }
}

impl<R: Read + Seek> Read for IsoFile<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.entry.size {
            return Ok(0);
        }
        let start =
            self.entry.extent as u64 * ISO_BLOCK_SIZE as u64 + self.position;
        self.reader
            .source
            .seek(SeekFrom::Start(start))?;
        let remaining = (self.entry.size - self.position) as usize;
        let want = remaining.min(buf.len());
        let n = self.reader.source.read(&mut buf[..want])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for IsoFile<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => self.entry.size as i64 + delta,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    #[test]
    fn image_roundtrip() {
        let staging = stage(&[
            ("backup-001.bar", b"first part content".as_slice()),
            ("backup-002.bar", &[0xA5u8; 5000]),
        ]);
        let out = tempfile::tempdir().unwrap();
        let image = out.path().join("volume.iso");
        let size = write_image(staging.path(), &image, "BACKUP").unwrap();
        assert_eq!(size % ISO_BLOCK_SIZE as u64, 0);
        assert_eq!(fs::metadata(&image).unwrap().len(), size);

        let mut reader = IsoReader::open(fs::File::open(&image).unwrap()).unwrap();
        let entries = reader.list_root().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "backup-001.bar");
        assert_eq!(entries[1].name, "backup-002.bar");
        assert_eq!(entries[0].size, 18);
        assert_eq!(entries[1].size, 5000);

        let first = reader.stat("backup-001.bar").unwrap().unwrap();
        let block = reader.read_block(&first, 0).unwrap();
        assert_eq!(&block[..18], b"first part content");
        assert!(block[18..].iter().all(|&b| b == 0));
    }

    #[test]
    fn iso_file_reads_and_seeks() {
        let staging = stage(&[("data.bar", &[1u8, 2, 3, 4, 5, 6, 7, 8])]);
        let out = tempfile::tempdir().unwrap();
        let image = out.path().join("v.iso");
        write_image(staging.path(), &image, "V").unwrap();

        let mut file = IsoFile::open(fs::File::open(&image).unwrap(), "data.bar").unwrap();
        assert_eq!(file.size(), 8);
        let mut buffer = [0u8; 3];
        file.read_exact(&mut buffer).unwrap();
        assert_eq!(buffer, [1, 2, 3]);
        file.seek(SeekFrom::Start(6)).unwrap();
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, vec![7, 8]);
    }

    #[test]
    fn identifier_mangling_is_unique() {
        let mut taken = Vec::new();
        let a = iso_identifier("backup part#1.bar", &mut taken);
        let b = iso_identifier("backup_part_1.bar", &mut taken);
        assert!(a.ends_with(";1"));
        assert_ne!(a, b);
    }

    #[test]
    fn many_files_span_root_sectors() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..64 {
            fs::write(
                dir.path().join(format!("a-very-long-part-name-{:03}.bar", i)),
                [i as u8; 100],
            )
            .unwrap();
        }
        let out = tempfile::tempdir().unwrap();
        let image = out.path().join("big.iso");
        write_image(dir.path(), &image, "BIG").unwrap();
        let mut reader = IsoReader::open(fs::File::open(&image).unwrap()).unwrap();
        let entries = reader.list_root().unwrap();
        assert_eq!(entries.len(), 64);
        assert_eq!(entries[10].name, "a-very-long-part-name-010.bar");
        let block = reader.read_block(&entries[10], 0).unwrap();
        assert_eq!(block[0], 10);
    }
}
