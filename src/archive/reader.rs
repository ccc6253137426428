//! Archive read path.

use std::io::{Read, Seek};

use crate::archive::{
    decode_entry_meta, ArchiveHeader, Entry, DATA_FLAG_COMPRESSED, DATA_PROLOGUE_LENGTH,
    ENTRY_PROLOGUE_LENGTH,
};
use crate::chunk::{self, align_up, ChunkHeader, ChunkReader};
use crate::compress::{CompressAlgorithm, Decompressor};
use crate::crypto::{CryptAlgorithm, CryptKey, Decryptor};
use crate::error::{Error, Result};
use crate::password::Password;

/// Ciphertext bytes fetched per read iteration (whole blocks).
const READ_SLICE: usize = 64 * 1024;

/// Metadata of one entry as read back, including its continuation
/// window within the whole logical stream.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub entry: Entry,
    pub crypt: CryptAlgorithm,
    pub compress: CompressAlgorithm,
    /// First source byte this part carries.
    pub part_offset: u64,
    /// Source bytes this part carries.
    pub part_size: u64,
}

struct DataState {
    decryptor: Decryptor,
    decompressor: Option<Decompressor>,
    /// Padded ciphertext bytes still on disk.
    disk_remaining: u64,
    /// Unpadded (compressed) payload bytes still to consume.
    logical_remaining: u64,
    /// Source bytes already handed to the caller.
    produced: u64,
    part_size: u64,
    pending: Vec<u8>,
    pending_pos: usize,
}

/// Reads entries back from one archive part (or a concatenation of
/// parts).
pub struct ArchiveReader<R: Read + Seek> {
    chunks: ChunkReader<R>,
    password: Option<Password>,
    crypt: CryptAlgorithm,
    salt: [u8; crate::crypto::SALT_LENGTH],
    /// Keys are derived lazily per cipher id and cached; derivation is
    /// deliberately expensive.
    keys: [Option<CryptKey>; 4],
    data: Option<DataState>,
    /// Where the current entry's container ends; the next
    /// [`ArchiveReader::read_entry`] resumes there.
    pending_end: Option<u64>,
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// Open an archive part. The first chunk must be the `BAR0` header;
    /// it announces the cipher (and thus the block alignment) and the
    /// archive salt.
    pub fn open(source: R, password: Option<&Password>) -> Result<Self> {
        let mut chunks = ChunkReader::new(source, 1);
        let header = chunks
            .next_chunk()?
            .ok_or(Error::CorruptArchive { offset: 0 })?;
        if header.id != chunk::CHUNK_ID_ARCHIVE {
            return Err(Error::CorruptArchive { offset: header.offset });
        }
        let payload = chunks.read_payload(header.length)?;
        let parsed = ArchiveHeader::decode(&payload, header.offset)?;
        chunks.set_block_length(parsed.crypt.block_length());
        Ok(ArchiveReader {
            chunks,
            password: password.cloned(),
            crypt: parsed.crypt,
            salt: parsed.salt,
            keys: [None, None, None, None],
            data: None,
            pending_end: None,
        })
    }

    pub fn crypt(&self) -> CryptAlgorithm {
        self.crypt
    }

    fn key_for(&mut self, crypt: CryptAlgorithm) -> Result<&CryptKey> {
        let index = crypt.id() as usize;
        debug_assert!(index < self.keys.len());
        if self.keys[index].is_none() {
            if crypt != CryptAlgorithm::None && self.password.is_none() {
                return Err(Error::NoCryptPassword);
            }
            let password = self.password.clone().unwrap_or_default();
            self.keys[index] = Some(CryptKey::derive(crypt, &password, &self.salt));
        }
        Ok(self.keys[index].as_ref().expect("key cached"))
    }

    /// Read the next entry header, skipping unknown chunk types intact.
    /// `None` is the end of the archive.
    pub fn read_entry(&mut self) -> Result<Option<EntryInfo>> {
        self.data = None;
        if let Some(end) = self.pending_end.take() {
            self.chunks.seek_to(end)?;
        }
        loop {
            let header = match self.chunks.next_chunk()? {
                Some(header) => header,
                None => return Ok(None),
            };
            match header.id {
                chunk::CHUNK_ID_ARCHIVE => {
                    // A following part was concatenated (or appended):
                    // adopt its salt and cipher.
                    let payload = self.chunks.read_payload(header.length)?;
                    let parsed = ArchiveHeader::decode(&payload, header.offset)?;
                    self.crypt = parsed.crypt;
                    self.salt = parsed.salt;
                    self.keys = [None, None, None, None];
                    self.chunks.set_block_length(parsed.crypt.block_length());
                }
                chunk::CHUNK_ID_END => {
                    self.chunks.skip(&header)?;
                }
                id if chunk::is_container(&id) => {
                    return self.parse_entry(header).map(Some);
                }
                _ => {
                    // Unknown chunk type: skip intact.
                    self.chunks.skip(&header)?;
                }
            }
        }
    }

    fn expected_entry_id(container: &chunk::ChunkId) -> chunk::ChunkId {
        match *container {
            chunk::CHUNK_ID_FILE => chunk::CHUNK_ID_FILE_ENTRY,
            chunk::CHUNK_ID_DIRECTORY => chunk::CHUNK_ID_DIRECTORY_ENTRY,
            chunk::CHUNK_ID_LINK => chunk::CHUNK_ID_LINK_ENTRY,
            chunk::CHUNK_ID_SPECIAL => chunk::CHUNK_ID_SPECIAL_ENTRY,
            chunk::CHUNK_ID_IMAGE => chunk::CHUNK_ID_IMAGE_ENTRY,
            _ => unreachable!("caller checked is_container"),
        }
    }

    fn expected_data_id(container: &chunk::ChunkId) -> Option<chunk::ChunkId> {
        match *container {
            chunk::CHUNK_ID_FILE => Some(chunk::CHUNK_ID_FILE_DATA),
            chunk::CHUNK_ID_IMAGE => Some(chunk::CHUNK_ID_IMAGE_DATA),
            _ => None,
        }
    }

    /// Find the child with `wanted` id before `container_end`, skipping
    /// unknown children intact.
    fn find_child(&mut self, wanted: chunk::ChunkId, container_end: u64) -> Result<ChunkHeader> {
        loop {
            let position = self.chunks.position()?;
            if position >= container_end {
                return Err(Error::CorruptArchive { offset: position });
            }
            let header = self
                .chunks
                .next_chunk()?
                .ok_or(Error::CorruptArchive { offset: position })?;
            if header.id == wanted {
                return Ok(header);
            }
            self.chunks.skip(&header)?;
        }
    }

    fn parse_entry(&mut self, container: ChunkHeader) -> Result<EntryInfo> {
        let container_end = container.payload_end();
        let block = self.chunks.block_length();

        // Entry-header chunk: plain prologue, then encrypted metadata.
        let entry_header =
            self.find_child(Self::expected_entry_id(&container.id), container_end)?;
        if entry_header.length < ENTRY_PROLOGUE_LENGTH {
            return Err(Error::CorruptArchive { offset: entry_header.offset });
        }
        let mut prologue = [0u8; ENTRY_PROLOGUE_LENGTH as usize];
        self.chunks.read_exact(&mut prologue)?;
        let compress =
            CompressAlgorithm::from_id(u16::from_be_bytes(prologue[0..2].try_into().expect("2")))?;
        let crypt =
            CryptAlgorithm::from_id(u16::from_be_bytes(prologue[2..4].try_into().expect("2")))?;
        let iv: [u8; 16] = prologue[4..20].try_into().expect("16");

        let meta_length = entry_header.length - ENTRY_PROLOGUE_LENGTH;
        let disk_length = align_up(meta_length, block);
        let mut meta = self.chunks.read_payload(disk_length)?;
        let key = self.key_for(crypt)?;
        let mut decryptor = Decryptor::new(crypt, key, &iv)?;
        decryptor.process(&mut meta);
        meta.truncate(meta_length as usize);
        let entry = decode_entry_meta(&entry_header.id, &meta, entry_header.offset)?;

        let (part_offset, part_size) = if let Some(data_id) = Self::expected_data_id(&container.id)
        {
            let data_header = self.find_child(data_id, container_end)?;
            if data_header.length < DATA_PROLOGUE_LENGTH {
                return Err(Error::CorruptArchive { offset: data_header.offset });
            }
            let mut data_prologue = [0u8; DATA_PROLOGUE_LENGTH as usize];
            self.chunks.read_exact(&mut data_prologue)?;
            let part_offset = u64::from_be_bytes(data_prologue[0..8].try_into().expect("8"));
            let part_size = u64::from_be_bytes(data_prologue[8..16].try_into().expect("8"));
            let data_iv: [u8; 16] = data_prologue[16..32].try_into().expect("16");
            let flags = u32::from_be_bytes(data_prologue[32..36].try_into().expect("4"));

            let logical = data_header.length - DATA_PROLOGUE_LENGTH;
            let disk = align_up(logical, block);
            let key = self.key_for(crypt)?;
            let decryptor = Decryptor::new(crypt, key, &data_iv)?;
            let decompressor = if flags & DATA_FLAG_COMPRESSED != 0 {
                Some(Decompressor::new(compress)?)
            } else {
                None
            };
            self.data = Some(DataState {
                decryptor,
                decompressor,
                disk_remaining: disk,
                logical_remaining: logical,
                produced: 0,
                part_size,
                pending: Vec::new(),
                pending_pos: 0,
            });
            (part_offset, part_size)
        } else {
            debug_assert!(!entry.kind.has_data());
            (0, 0)
        };

        self.pending_end = Some(container_end);
        Ok(EntryInfo { entry, crypt, compress, part_offset, part_size })
    }

    /// Read decoded entry content into `out`; returns 0 when the data
    /// chunk is exhausted.
    pub fn read_entry_data(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            let Some(state) = self.data.as_mut() else {
                return Ok(0);
            };

            // Serve buffered output first.
            if state.pending_pos < state.pending.len() {
                let available = state.pending.len() - state.pending_pos;
                let n = available.min(out.len());
                out[..n].copy_from_slice(&state.pending[state.pending_pos..state.pending_pos + n]);
                state.pending_pos += n;
                state.produced += n as u64;
                if state.pending_pos == state.pending.len() {
                    state.pending.clear();
                    state.pending_pos = 0;
                }
                return Ok(n);
            }

            if state.logical_remaining == 0 {
                if let Some(decompressor) = state.decompressor.take() {
                    let tail = decompressor.finish()?;
                    if !tail.is_empty() {
                        state.pending = tail;
                        state.pending_pos = 0;
                        continue;
                    }
                }
                let produced = state.produced;
                let part_size = state.part_size;
                self.data = None;
                if produced != part_size {
                    let offset = self.chunks.position()?;
                    return Err(Error::CorruptArchive { offset });
                }
                return Ok(0);
            }

            // Fetch and decrypt the next run of whole cipher blocks.
            let fetch = state.disk_remaining.min(READ_SLICE as u64);
            if fetch == 0 {
                // Length fields disagree with the payload on disk.
                let offset = self.chunks.position()?;
                self.data = None;
                return Err(Error::CorruptArchive { offset });
            }
            let mut ciphertext = self.chunks.read_payload(fetch)?;
            state.disk_remaining -= fetch;
            state.decryptor.process(&mut ciphertext);

            let logical_take = state.logical_remaining.min(ciphertext.len() as u64) as usize;
            let payload = &ciphertext[..logical_take];
            state.logical_remaining -= logical_take as u64;

            let produced = match state.decompressor.as_mut() {
                Some(decompressor) => decompressor.feed(payload)?,
                None => payload.to_vec(),
            };
            if !produced.is_empty() {
                state.pending = produced;
                state.pending_pos = 0;
            }
        }
    }

    /// Drain the remaining entry content to `sink`.
    pub fn copy_entry_data(&mut self, sink: &mut dyn std::io::Write) -> Result<u64> {
        let mut buffer = vec![0u8; READ_SLICE];
        let mut total = 0u64;
        loop {
            let n = self.read_entry_data(&mut buffer)?;
            if n == 0 {
                return Ok(total);
            }
            sink.write_all(&buffer[..n])?;
            total += n as u64;
        }
    }
}
