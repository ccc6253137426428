//! Archive engine: packs entries into chunk containers and reads them
//! back.
//!
//! # Container layout
//!
//! Every part starts with a `BAR0` header chunk (format version, cipher
//! id, archive salt) and ends with a zero-length `END0` marker. Between
//! them, one container chunk per entry:
//!
//! ```text
//! FIL0 ─ FENT (metadata, encrypted)
//!      └ FDAT (part_offset, part_size, IV, flags, payload)
//! DIR0 ─ DENT          LNK0 ─ LENT
//! SPE0 ─ SENT          IMG0 ─ IENT ─ IDAT
//! ```
//!
//! Payload bytes are compressed first, then encrypted; the chunk layer
//! pads the tail with encrypted zero-fill to a whole number of cipher
//! blocks. A part split closes the data chunk on a block boundary and
//! re-emits the entry header in the next part with the continuation
//! offset, so every part decodes on its own.

pub mod reader;
pub mod restore;
pub mod writer;

pub use reader::{ArchiveReader, EntryInfo};
pub use writer::{ArchiveOptions, ArchiveWriter};

use crate::chunk;
use crate::crypto::CryptAlgorithm;
use crate::error::{Error, Result};

/// On-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Plain prologue of an entry-header chunk: compress id, crypt id, IV.
pub const ENTRY_PROLOGUE_LENGTH: u64 = 2 + 2 + 16;

/// Plain prologue of a data chunk: part offset, part size, IV, flags.
pub const DATA_PROLOGUE_LENGTH: u64 = 8 + 8 + 16 + 4;

/// Data-chunk flag: payload is compressed.
pub const DATA_FLAG_COMPRESSED: u32 = 1 << 0;

/// First word of every encrypted metadata region; a mismatch after
/// decryption means a wrong key (or corruption) and stops the read
/// before garbage metadata escapes.
pub(crate) const META_CHECK: u32 = 0x4241_5251;

/// Variants of a special entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl SpecialKind {
    pub fn id(self) -> u16 {
        match self {
            SpecialKind::CharDevice => 0,
            SpecialKind::BlockDevice => 1,
            SpecialKind::Fifo => 2,
            SpecialKind::Socket => 3,
        }
    }

    pub fn from_id(id: u16, offset: u64) -> Result<Self> {
        match id {
            0 => Ok(SpecialKind::CharDevice),
            1 => Ok(SpecialKind::BlockDevice),
            2 => Ok(SpecialKind::Fifo),
            3 => Ok(SpecialKind::Socket),
            _ => Err(Error::CorruptArchive { offset }),
        }
    }
}

/// POSIX attributes every entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryMetadata {
    pub user_id: u32,
    pub group_id: u32,
    pub permission: u32,
    pub time_last_access: u64,
    pub time_modified: u64,
    pub time_last_changed: u64,
}

/// What an entry is, plus the kind-specific attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File { size: u64 },
    Directory,
    Link { destination: Vec<u8> },
    Special { kind: SpecialKind, major: u32, minor: u32 },
    /// Raw block-device image.
    Image { size: u64 },
}

impl EntryKind {
    pub fn size(&self) -> u64 {
        match self {
            EntryKind::File { size } | EntryKind::Image { size } => *size,
            _ => 0,
        }
    }

    pub fn has_data(&self) -> bool {
        matches!(self, EntryKind::File { .. } | EntryKind::Image { .. })
    }
}

/// One logical archived item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path-separator-normalized octet string.
    pub name: Vec<u8>,
    pub metadata: EntryMetadata,
    pub kind: EntryKind,
}

impl Entry {
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Chunk ids for one entry kind.
pub(crate) struct EntryChunkIds {
    pub container: chunk::ChunkId,
    pub entry: chunk::ChunkId,
    pub data: Option<chunk::ChunkId>,
}

pub(crate) fn chunk_ids_for(kind: &EntryKind) -> EntryChunkIds {
    match kind {
        EntryKind::File { .. } => EntryChunkIds {
            container: chunk::CHUNK_ID_FILE,
            entry: chunk::CHUNK_ID_FILE_ENTRY,
            data: Some(chunk::CHUNK_ID_FILE_DATA),
        },
        EntryKind::Directory => EntryChunkIds {
            container: chunk::CHUNK_ID_DIRECTORY,
            entry: chunk::CHUNK_ID_DIRECTORY_ENTRY,
            data: None,
        },
        EntryKind::Link { .. } => EntryChunkIds {
            container: chunk::CHUNK_ID_LINK,
            entry: chunk::CHUNK_ID_LINK_ENTRY,
            data: None,
        },
        EntryKind::Special { .. } => EntryChunkIds {
            container: chunk::CHUNK_ID_SPECIAL,
            entry: chunk::CHUNK_ID_SPECIAL_ENTRY,
            data: None,
        },
        EntryKind::Image { .. } => EntryChunkIds {
            container: chunk::CHUNK_ID_IMAGE,
            entry: chunk::CHUNK_ID_IMAGE_ENTRY,
            data: Some(chunk::CHUNK_ID_IMAGE_DATA),
        },
    }
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_metadata(out: &mut Vec<u8>, metadata: &EntryMetadata) {
    put_u64(out, metadata.time_last_access);
    put_u64(out, metadata.time_modified);
    put_u64(out, metadata.time_last_changed);
    put_u32(out, metadata.user_id);
    put_u32(out, metadata.group_id);
    put_u32(out, metadata.permission);
}

/// Serialize the (to-be-encrypted) metadata region of an entry header.
pub(crate) fn encode_entry_meta(entry: &Entry) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + entry.name.len());
    put_u32(&mut out, META_CHECK);
    match &entry.kind {
        EntryKind::File { size } | EntryKind::Image { size } => {
            put_u64(&mut out, *size);
            put_metadata(&mut out, &entry.metadata);
            out.extend_from_slice(&entry.name);
        }
        EntryKind::Directory => {
            put_metadata(&mut out, &entry.metadata);
            out.extend_from_slice(&entry.name);
        }
        EntryKind::Link { destination } => {
            put_metadata(&mut out, &entry.metadata);
            debug_assert!(entry.name.len() <= u16::MAX as usize);
            put_u16(&mut out, entry.name.len() as u16);
            out.extend_from_slice(&entry.name);
            out.extend_from_slice(destination);
        }
        EntryKind::Special { kind, major, minor } => {
            put_u16(&mut out, kind.id());
            put_u32(&mut out, *major);
            put_u32(&mut out, *minor);
            put_metadata(&mut out, &entry.metadata);
            out.extend_from_slice(&entry.name);
        }
    }
    out
}

struct MetaCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    offset: u64,
}

impl<'a> MetaCursor<'a> {
    fn new(bytes: &'a [u8], offset: u64) -> Self {
        MetaCursor { bytes, pos: 0, offset }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::CorruptArchive { offset: self.offset });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn rest(self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    fn metadata(&mut self) -> Result<EntryMetadata> {
        Ok(EntryMetadata {
            time_last_access: self.u64()?,
            time_modified: self.u64()?,
            time_last_changed: self.u64()?,
            user_id: self.u32()?,
            group_id: self.u32()?,
            permission: self.u32()?,
        })
    }
}

/// Parse the decrypted metadata region; `entry_id` selects the layout.
/// `offset` is only used for error reporting.
pub(crate) fn decode_entry_meta(
    entry_id: &chunk::ChunkId,
    bytes: &[u8],
    offset: u64,
) -> Result<Entry> {
    let mut cursor = MetaCursor::new(bytes, offset);
    if cursor.u32()? != META_CHECK {
        return Err(Error::CorruptArchive { offset });
    }
    match *entry_id {
        chunk::CHUNK_ID_FILE_ENTRY | chunk::CHUNK_ID_IMAGE_ENTRY => {
            let size = cursor.u64()?;
            let metadata = cursor.metadata()?;
            let name = cursor.rest().to_vec();
            let kind = if *entry_id == chunk::CHUNK_ID_FILE_ENTRY {
                EntryKind::File { size }
            } else {
                EntryKind::Image { size }
            };
            Ok(Entry { name, metadata, kind })
        }
        chunk::CHUNK_ID_DIRECTORY_ENTRY => {
            let metadata = cursor.metadata()?;
            let name = cursor.rest().to_vec();
            Ok(Entry { name, metadata, kind: EntryKind::Directory })
        }
        chunk::CHUNK_ID_LINK_ENTRY => {
            let metadata = cursor.metadata()?;
            let name_length = cursor.u16()? as usize;
            let name = cursor.take(name_length)?.to_vec();
            let destination = cursor.rest().to_vec();
            Ok(Entry { name, metadata, kind: EntryKind::Link { destination } })
        }
        chunk::CHUNK_ID_SPECIAL_ENTRY => {
            let kind = SpecialKind::from_id(cursor.u16()?, offset)?;
            let major = cursor.u32()?;
            let minor = cursor.u32()?;
            let metadata = cursor.metadata()?;
            let name = cursor.rest().to_vec();
            Ok(Entry { name, metadata, kind: EntryKind::Special { kind, major, minor } })
        }
        _ => Err(Error::CorruptArchive { offset }),
    }
}

/// Compose the on-backend name of one part.
///
/// A run of `#` in the base name is replaced by the zero-padded part
/// number (for all parts); otherwise part 1 keeps the plain name and
/// later parts get a `.N` suffix.
pub fn format_part_name(base: &str, part_number: u32, part_size: u64) -> String {
    if part_size == 0 {
        return base.to_string();
    }
    if let Some(start) = base.find('#') {
        let run_length = base[start..].bytes().take_while(|&b| b == b'#').count();
        let mut name = String::with_capacity(base.len() + 8);
        name.push_str(&base[..start]);
        name.push_str(&format!("{:0width$}", part_number, width = run_length));
        name.push_str(&base[start + run_length..]);
        return name;
    }
    if part_number <= 1 {
        base.to_string()
    } else {
        format!("{}.{}", base, part_number)
    }
}

/// The `BAR0` archive header payload.
pub(crate) struct ArchiveHeader {
    pub version: u16,
    pub crypt: CryptAlgorithm,
    pub salt: [u8; crate::crypto::SALT_LENGTH],
}

impl ArchiveHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.salt.len());
        put_u16(&mut out, self.version);
        put_u16(&mut out, self.crypt.id());
        out.extend_from_slice(&self.salt);
        out
    }

    pub fn decode(bytes: &[u8], offset: u64) -> Result<Self> {
        let mut cursor = MetaCursor::new(bytes, offset);
        let version = cursor.u16()?;
        let crypt = CryptAlgorithm::from_id(cursor.u16()?)?;
        let salt_bytes = cursor.take(crate::crypto::SALT_LENGTH)?;
        let mut salt = [0u8; crate::crypto::SALT_LENGTH];
        salt.copy_from_slice(salt_bytes);
        Ok(ArchiveHeader { version, crypt, salt })
    }
}
