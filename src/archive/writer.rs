//! Archive write path.

use tracing::debug;

use crate::archive::{
    chunk_ids_for, encode_entry_meta, ArchiveHeader, Entry, EntryChunkIds,
    DATA_FLAG_COMPRESSED, DATA_PROLOGUE_LENGTH, ENTRY_PROLOGUE_LENGTH, FORMAT_VERSION,
};
use crate::chunk::{self, align_up, ChunkWriter, OpenChunk};
use crate::compress::{CompressAlgorithm, CompressConfig, Compressor};
use crate::crypto::{generate_iv, generate_salt, CryptAlgorithm, CryptKey, Encryptor};
use crate::error::{Error, Result};
use crate::password::Password;
use crate::storage::{PartFile, StorageSession};

/// Source bytes fed per iteration of the data loop; the split check
/// runs between slices.
const WRITE_SLICE: usize = 64 * 1024;

/// Settings for one archive being written.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveOptions {
    pub crypt: CryptAlgorithm,
    pub compress: CompressConfig,
    /// Split the archive after this many source bytes per part;
    /// 0 = unlimited.
    pub part_size: u64,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            crypt: CryptAlgorithm::None,
            compress: CompressConfig::default(),
            part_size: 0,
        }
    }
}

/// Write-side archive state: the chunk writer for the current part plus
/// the crypto material shared by all parts.
pub struct ArchiveWriter<'s, 'r> {
    session: &'s mut StorageSession<'r>,
    options: ArchiveOptions,
    key: CryptKey,
    salt: [u8; crate::crypto::SALT_LENGTH],
    base_name: String,
    part_number: u32,
    part: Option<ChunkWriter<PartFile>>,
    /// Source bytes accumulated in the current part, for the split check.
    part_bytes: u64,
}

impl<'s, 'r> ArchiveWriter<'s, 'r> {
    /// Open a new archive for writing on `session`.
    ///
    /// With a cipher configured, `password` is required; the key is
    /// derived once from it and a fresh archive salt.
    pub fn create(
        session: &'s mut StorageSession<'r>,
        options: ArchiveOptions,
        password: Option<&Password>,
    ) -> Result<Self> {
        let base_name = session.specifier().archive_name.clone();
        if base_name.is_empty() {
            return Err(Error::NoArchiveFileName);
        }
        let salt = generate_salt();
        let key = match (options.crypt, password) {
            (CryptAlgorithm::None, _) => {
                CryptKey::derive(CryptAlgorithm::None, &Password::new(), &salt)
            }
            (crypt, Some(password)) => CryptKey::derive(crypt, password, &salt),
            (_, None) => return Err(Error::NoCryptPassword),
        };
        Ok(ArchiveWriter {
            session,
            options,
            key,
            salt,
            base_name,
            part_number: 1,
            part: None,
            part_bytes: 0,
        })
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    fn block_length(&self) -> usize {
        self.options.crypt.block_length()
    }

    /// Open the current part if none is open, writing the `BAR0` header.
    fn ensure_part(&mut self) -> Result<()> {
        if self.part.is_some() {
            return Ok(());
        }
        let name = super::format_part_name(&self.base_name, self.part_number, self.options.part_size);
        let part_file = self.session.create_part(&name)?;
        let mut chunks = ChunkWriter::new(part_file, self.block_length());
        let header = ArchiveHeader {
            version: FORMAT_VERSION,
            crypt: self.options.crypt,
            salt: self.salt,
        };
        chunks.write_leaf(chunk::CHUNK_ID_ARCHIVE, &header.encode())?;
        debug!(part = %name, number = self.part_number, "opened archive part");
        self.part = Some(chunks);
        Ok(())
    }

    /// Finalize and store the current part.
    fn close_part(&mut self) -> Result<()> {
        if let Some(mut chunks) = self.part.take() {
            chunks.write_leaf(chunk::CHUNK_ID_END, &[])?;
            chunks.pad_to_alignment()?;
            chunks.flush()?;
            let part_file = chunks.into_inner();
            self.session.finish_part(part_file)?;
            self.part_number += 1;
            self.part_bytes = 0;
        }
        Ok(())
    }

    /// Roll over to the next part when the split threshold is reached.
    fn roll_part_if_full(&mut self) -> Result<()> {
        if self.options.part_size > 0 && self.part.is_some() && self.part_bytes >= self.options.part_size
        {
            self.close_part()?;
        }
        Ok(())
    }

    fn chunks(&mut self) -> &mut ChunkWriter<PartFile> {
        self.part.as_mut().expect("part is open")
    }

    /// Write the entry-header chunk (prologue + encrypted metadata) and
    /// return the still-open container.
    fn write_entry_header(&mut self, ids: &EntryChunkIds, entry: &Entry) -> Result<OpenChunk> {
        let compress_id = self.options.compress.algorithm.id();
        let crypt_id = self.options.crypt.id();
        let iv = generate_iv();
        let block = self.block_length();

        let meta = encode_entry_meta(entry);
        let mut padded = meta.clone();
        padded.resize(align_up(meta.len() as u64, block) as usize, 0);
        let mut encryptor = Encryptor::new(self.options.crypt, &self.key, &iv)?;
        encryptor.process(&mut padded);

        let container = self.chunks().begin_chunk(ids.container)?;
        let entry_chunk = self.chunks().begin_chunk(ids.entry)?;
        let mut prologue = Vec::with_capacity(ENTRY_PROLOGUE_LENGTH as usize);
        prologue.extend_from_slice(&compress_id.to_be_bytes());
        prologue.extend_from_slice(&crypt_id.to_be_bytes());
        prologue.extend_from_slice(&iv);
        self.chunks().write_payload(&prologue)?;
        self.chunks().write_payload(&padded)?;
        self.chunks()
            .end_chunk(entry_chunk, ENTRY_PROLOGUE_LENGTH + meta.len() as u64)?;
        Ok(container)
    }

    fn end_container(&mut self, container: OpenChunk) -> Result<()> {
        let end = self.chunks().position()?;
        let span = end - container.payload_offset();
        self.chunks().end_chunk(container, span)
    }

    /// Add a data-less entry (directory, link, special).
    pub fn add_entry(&mut self, entry: &Entry) -> Result<()> {
        debug_assert!(!entry.kind.has_data());
        if self.session.is_aborted() {
            return Err(Error::Aborted);
        }
        self.roll_part_if_full()?;
        self.ensure_part()?;
        let ids = chunk_ids_for(&entry.kind);
        let container = self.write_entry_header(&ids, entry)?;
        self.end_container(container)?;
        Ok(())
    }

    /// Begin a file or device-image entry; stream its content through
    /// the returned handle, then call [`EntryDataWriter::finish`].
    pub fn new_data_entry(&mut self, entry: Entry) -> Result<EntryDataWriter<'_, 's, 'r>> {
        debug_assert!(entry.kind.has_data());
        if self.session.is_aborted() {
            return Err(Error::Aborted);
        }
        self.roll_part_if_full()?;
        self.ensure_part()?;

        let use_compression = self.options.compress.algorithm != CompressAlgorithm::None
            && entry.kind.size() >= self.options.compress.min_file_size;

        let mut writer = EntryDataWriter {
            archive: self,
            entry,
            use_compression,
            source_offset: 0,
            open: None,
        };
        writer.open_chunks()?;
        Ok(writer)
    }

    /// Close the archive: finalize the last part and run the backend's
    /// final post-processing.
    pub fn close(mut self) -> Result<()> {
        self.close_part()?;
        self.session.close()
    }
}

/// Per-part state of an open data chunk.
struct OpenDataChunks {
    container: OpenChunk,
    data: OpenChunk,
    prologue_offset: u64,
    compressor: Option<Compressor>,
    encryptor: Encryptor,
    /// Compressed bytes not yet encrypted (cipher needs whole blocks).
    carry: Vec<u8>,
    /// Compressed logical bytes in this part's data chunk.
    compressed_logical: u64,
    /// Source bytes in this part's data chunk.
    part_source_bytes: u64,
}

/// Streams one entry's content into the archive, splitting parts as the
/// size limit is reached.
pub struct EntryDataWriter<'a, 's, 'r> {
    archive: &'a mut ArchiveWriter<'s, 'r>,
    entry: Entry,
    use_compression: bool,
    /// Total source bytes consumed, across parts.
    source_offset: u64,
    open: Option<OpenDataChunks>,
}

impl<'a, 's, 'r> EntryDataWriter<'a, 's, 'r> {
    /// Open container + entry header + data chunk in the current part,
    /// with `source_offset` as the continuation offset.
    fn open_chunks(&mut self) -> Result<()> {
        debug_assert!(self.open.is_none());
        let ids = chunk_ids_for(&self.entry.kind);
        let data_id = ids.data.expect("data entry kind");
        let container = self.archive.write_entry_header(&ids, &self.entry)?;

        let iv = generate_iv();
        let encryptor = Encryptor::new(self.archive.options.crypt, &self.archive.key, &iv)?;
        let compressor = if self.use_compression {
            Some(Compressor::new(self.archive.options.compress.algorithm)?)
        } else {
            None
        };
        let mut flags = 0u32;
        if self.use_compression {
            flags |= DATA_FLAG_COMPRESSED;
        }

        let data = self.archive.chunks().begin_chunk(data_id)?;
        let prologue_offset = data.payload_offset();
        let mut prologue = Vec::with_capacity(DATA_PROLOGUE_LENGTH as usize);
        prologue.extend_from_slice(&self.source_offset.to_be_bytes());
        prologue.extend_from_slice(&0u64.to_be_bytes()); // part size, patched on close
        prologue.extend_from_slice(&iv);
        prologue.extend_from_slice(&flags.to_be_bytes());
        self.archive.chunks().write_payload(&prologue)?;

        self.open = Some(OpenDataChunks {
            container,
            data,
            prologue_offset,
            compressor,
            encryptor,
            carry: Vec::new(),
            compressed_logical: 0,
            part_source_bytes: 0,
        });
        Ok(())
    }

    /// Encrypt and write every whole cipher block buffered in `carry`.
    fn drain_carry(&mut self) -> Result<()> {
        let block = self.archive.block_length();
        let open = self.open.as_mut().expect("data chunk open");
        let writable = open.carry.len() - open.carry.len() % block;
        if writable == 0 {
            return Ok(());
        }
        let mut chunk_bytes: Vec<u8> = open.carry.drain(..writable).collect();
        open.encryptor.process(&mut chunk_bytes);
        self.archive.chunks().write_payload(&chunk_bytes)?;
        Ok(())
    }

    /// Finalize this part's data chunk on a cipher-block boundary and
    /// patch the prologue/length fields.
    fn finish_data_chunk(&mut self) -> Result<()> {
        let block = self.archive.block_length();
        let mut open = self.open.take().expect("data chunk open");

        if let Some(compressor) = open.compressor.take() {
            let tail = compressor.finish()?;
            open.compressed_logical += tail.len() as u64;
            open.carry.extend_from_slice(&tail);
        }
        // Zero-fill to a whole number of blocks; the fill is encrypted
        // along with the payload tail.
        let padded = align_up(open.carry.len() as u64, block) as usize;
        open.carry.resize(padded, 0);
        open.encryptor.process(&mut open.carry);
        self.archive.chunks().write_payload(&open.carry)?;

        self.archive
            .chunks()
            .patch(open.prologue_offset + 8, &open.part_source_bytes.to_be_bytes())?;
        self.archive
            .chunks()
            .end_chunk(open.data, DATA_PROLOGUE_LENGTH + open.compressed_logical)?;
        self.archive.end_container(open.container)?;
        Ok(())
    }

    /// Append source bytes to the entry.
    pub fn write(&mut self, mut input: &[u8]) -> Result<()> {
        while !input.is_empty() {
            if self.archive.session.is_aborted() {
                return Err(Error::Aborted);
            }
            // Never run past the part limit inside one slice, so the
            // split lands exactly at `part_size` source bytes.
            let remaining_allowance = if self.archive.options.part_size > 0 {
                (self.archive.options.part_size.saturating_sub(self.archive.part_bytes))
                    .max(1)
                    .min(usize::MAX as u64) as usize
            } else {
                usize::MAX
            };
            let slice_len = input.len().min(WRITE_SLICE).min(remaining_allowance);
            let (slice, rest) = input.split_at(slice_len);
            input = rest;

            {
                let open = self.open.as_mut().expect("data chunk open");
                let produced = match open.compressor.as_mut() {
                    Some(compressor) => compressor.feed(slice)?,
                    None => slice.to_vec(),
                };
                open.compressed_logical += produced.len() as u64;
                open.carry.extend_from_slice(&produced);
                open.part_source_bytes += slice_len as u64;
            }
            self.drain_carry()?;

            self.source_offset += slice_len as u64;
            self.archive.part_bytes += slice_len as u64;
            self.archive.session.add_bytes(slice_len as u64)?;

            // Split once the limit is reached and more data follows; an
            // exact fit closes normally and the next entry rolls over.
            if self.archive.options.part_size > 0
                && self.archive.part_bytes >= self.archive.options.part_size
                && !input.is_empty()
            {
                self.split_part()?;
            }
        }
        Ok(())
    }

    /// Close the data chunk, the part, and reopen everything in the
    /// next part with the continuation offset.
    fn split_part(&mut self) -> Result<()> {
        self.finish_data_chunk()?;
        self.archive.close_part()?;
        self.archive.ensure_part()?;
        self.open_chunks()
    }

    /// Finish the entry.
    pub fn finish(mut self) -> Result<()> {
        self.finish_data_chunk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_plain() {
        let options = ArchiveOptions::default();
        assert_eq!(options.crypt, CryptAlgorithm::None);
        assert_eq!(options.compress.algorithm, CompressAlgorithm::None);
        assert_eq!(options.part_size, 0);
    }
}
