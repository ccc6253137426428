//! Chunk wire codec.
//!
//! # On-disk layout
//!
//! ```text
//! type[4] | length[8, big-endian] | payload[length]
//! ```
//!
//! Every chunk header starts at an offset that is a multiple of the
//! cipher block length (1 when unencrypted). The length field always
//! holds the unpadded logical payload length; zero-fill up to the next
//! aligned offset is implicit from where the following chunk starts.
//!
//! Container chunks (`FIL0`, `DIR0`, `LNK0`, `SPE0`, `IMG0`) hold a
//! sequence of child chunks; their length field covers the whole child
//! span including the alignment gaps between children, so an unknown
//! container can be skipped like any leaf.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

pub const CHUNK_HEADER_LENGTH: u64 = 12;

pub type ChunkId = [u8; 4];

/// Archive header: format version + archive salt. Always the first
/// chunk of every part.
pub const CHUNK_ID_ARCHIVE: ChunkId = *b"BAR0";
/// Part-close marker, zero length.
pub const CHUNK_ID_END: ChunkId = *b"END0";

pub const CHUNK_ID_FILE: ChunkId = *b"FIL0";
pub const CHUNK_ID_FILE_ENTRY: ChunkId = *b"FENT";
pub const CHUNK_ID_FILE_DATA: ChunkId = *b"FDAT";

pub const CHUNK_ID_DIRECTORY: ChunkId = *b"DIR0";
pub const CHUNK_ID_DIRECTORY_ENTRY: ChunkId = *b"DENT";

pub const CHUNK_ID_LINK: ChunkId = *b"LNK0";
pub const CHUNK_ID_LINK_ENTRY: ChunkId = *b"LENT";

pub const CHUNK_ID_SPECIAL: ChunkId = *b"SPE0";
pub const CHUNK_ID_SPECIAL_ENTRY: ChunkId = *b"SENT";

pub const CHUNK_ID_IMAGE: ChunkId = *b"IMG0";
pub const CHUNK_ID_IMAGE_ENTRY: ChunkId = *b"IENT";
pub const CHUNK_ID_IMAGE_DATA: ChunkId = *b"IDAT";

pub fn is_container(id: &ChunkId) -> bool {
    matches!(
        id,
        &CHUNK_ID_FILE
            | &CHUNK_ID_DIRECTORY
            | &CHUNK_ID_LINK
            | &CHUNK_ID_SPECIAL
            | &CHUNK_ID_IMAGE
    )
}

/// Round `offset` up to the next multiple of `block_length`.
pub fn align_up(offset: u64, block_length: usize) -> u64 {
    debug_assert!(block_length > 0);
    let block = block_length as u64;
    offset.div_ceil(block) * block
}

/// Header of one chunk, plus where it sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: ChunkId,
    /// Unpadded logical payload length.
    pub length: u64,
    /// File offset of the first header octet.
    pub offset: u64,
}

impl ChunkHeader {
    /// Offset of the first payload octet.
    pub fn payload_offset(&self) -> u64 {
        self.offset + CHUNK_HEADER_LENGTH
    }

    /// Offset just past the logical payload.
    pub fn payload_end(&self) -> u64 {
        self.payload_offset() + self.length
    }
}

/// A chunk whose length field is still a placeholder.
#[derive(Debug, Clone, Copy)]
pub struct OpenChunk {
    header_offset: u64,
}

impl OpenChunk {
    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }

    pub fn payload_offset(&self) -> u64 {
        self.header_offset + CHUNK_HEADER_LENGTH
    }
}

/// Writes chunks into a seekable sink, maintaining block alignment and
/// back-patching container lengths.
pub struct ChunkWriter<W: Write + Seek> {
    sink: W,
    block_length: usize,
}

impl<W: Write + Seek> ChunkWriter<W> {
    pub fn new(sink: W, block_length: usize) -> Self {
        debug_assert!(block_length > 0);
        ChunkWriter { sink, block_length }
    }

    pub fn block_length(&self) -> usize {
        self.block_length
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.sink.stream_position()?)
    }

    /// Zero-fill up to the next block boundary; returns the aligned
    /// offset.
    fn align(&mut self) -> Result<u64> {
        let position = self.sink.stream_position()?;
        let aligned = align_up(position, self.block_length);
        if aligned > position {
            let pad = vec![0u8; (aligned - position) as usize];
            self.sink.write_all(&pad)?;
        }
        Ok(aligned)
    }

    /// Start a chunk with a placeholder length; finish with
    /// [`ChunkWriter::end_chunk`].
    pub fn begin_chunk(&mut self, id: ChunkId) -> Result<OpenChunk> {
        let header_offset = self.align()?;
        self.sink.write_all(&id)?;
        self.sink.write_all(&0u64.to_be_bytes())?;
        Ok(OpenChunk { header_offset })
    }

    /// Append payload bytes to the chunk opened last.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.write_all(bytes)?;
        Ok(())
    }

    /// Patch the length field of `open` to `logical_length` and return
    /// to the stream end.
    pub fn end_chunk(&mut self, open: OpenChunk, logical_length: u64) -> Result<()> {
        let end = self.sink.stream_position()?;
        self.sink.seek(SeekFrom::Start(open.header_offset + 4))?;
        self.sink.write_all(&logical_length.to_be_bytes())?;
        self.sink.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Overwrite `count` bytes at `offset` without disturbing the
    /// stream end; used to finalize data-chunk prologues.
    pub fn patch(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = self.sink.stream_position()?;
        self.sink.seek(SeekFrom::Start(offset))?;
        self.sink.write_all(bytes)?;
        self.sink.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Zero-fill to the next block boundary; keeps a finished part's
    /// total length a whole number of blocks, so concatenated or
    /// appended parts stay aligned.
    pub fn pad_to_alignment(&mut self) -> Result<()> {
        self.align()?;
        Ok(())
    }

    /// Write a complete leaf chunk in one go.
    pub fn write_leaf(&mut self, id: ChunkId, payload: &[u8]) -> Result<u64> {
        let header_offset = self.align()?;
        self.sink.write_all(&id)?;
        self.sink.write_all(&(payload.len() as u64).to_be_bytes())?;
        self.sink.write_all(payload)?;
        Ok(header_offset)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.sink
    }
}

/// Reads chunks from a seekable source.
pub struct ChunkReader<R: Read + Seek> {
    source: R,
    block_length: usize,
}

impl<R: Read + Seek> ChunkReader<R> {
    pub fn new(source: R, block_length: usize) -> Self {
        debug_assert!(block_length > 0);
        ChunkReader { source, block_length }
    }

    pub fn block_length(&self) -> usize {
        self.block_length
    }

    /// The block length is announced by the archive header chunk; the
    /// reader starts at 1 and switches after parsing it.
    pub fn set_block_length(&mut self, block_length: usize) {
        debug_assert!(block_length > 0);
        self.block_length = block_length;
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.source.stream_position()?)
    }

    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.source.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Advance to the next aligned chunk header and read it.
    ///
    /// Returns `None` on a clean end of stream (EOF at the very first
    /// header octet); a torn header is `CorruptArchive`.
    pub fn next_chunk(&mut self) -> Result<Option<ChunkHeader>> {
        let position = self.source.stream_position()?;
        let aligned = align_up(position, self.block_length);
        if aligned != position {
            self.source.seek(SeekFrom::Start(aligned))?;
        }

        let mut header = [0u8; CHUNK_HEADER_LENGTH as usize];
        let mut filled = 0usize;
        while filled < header.len() {
            let n = self.source.read(&mut header[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::CorruptArchive { offset: aligned });
            }
            filled += n;
        }

        let mut id = [0u8; 4];
        id.copy_from_slice(&header[..4]);
        let length = u64::from_be_bytes(header[4..12].try_into().expect("8 bytes"));
        Ok(Some(ChunkHeader { id, length, offset: aligned }))
    }

    /// Read exactly `length` payload bytes; truncation is
    /// `CorruptArchive` at the current offset.
    pub fn read_payload(&mut self, length: u64) -> Result<Vec<u8>> {
        let offset = self.source.stream_position()?;
        let mut payload = vec![0u8; length as usize];
        self.source
            .read_exact(&mut payload)
            .map_err(|_| Error::CorruptArchive { offset })?;
        Ok(payload)
    }

    /// Fill `buffer` from the payload; truncation is `CorruptArchive`.
    pub fn read_exact(&mut self, buffer: &mut [u8]) -> Result<()> {
        let offset = self.source.stream_position()?;
        self.source
            .read_exact(buffer)
            .map_err(|_| Error::CorruptArchive { offset })?;
        Ok(())
    }

    /// Skip a whole chunk (header already consumed). Works for unknown
    /// types, containers included: the length covers the full span.
    pub fn skip(&mut self, header: &ChunkHeader) -> Result<()> {
        self.source.seek(SeekFrom::Start(header.payload_end()))?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn leaf_roundtrip_unencrypted() {
        let mut writer = ChunkWriter::new(Cursor::new(Vec::new()), 1);
        writer.write_leaf(CHUNK_ID_ARCHIVE, b"payload").unwrap();
        writer.write_leaf(CHUNK_ID_END, b"").unwrap();
        let mut cursor = writer.into_inner();
        cursor.set_position(0);

        let mut reader = ChunkReader::new(cursor, 1);
        let first = reader.next_chunk().unwrap().unwrap();
        assert_eq!(first.id, CHUNK_ID_ARCHIVE);
        assert_eq!(first.length, 7);
        assert_eq!(reader.read_payload(first.length).unwrap(), b"payload");
        let second = reader.next_chunk().unwrap().unwrap();
        assert_eq!(second.id, CHUNK_ID_END);
        assert_eq!(second.length, 0);
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn headers_start_on_block_boundaries() {
        let mut writer = ChunkWriter::new(Cursor::new(Vec::new()), 16);
        let a = writer.write_leaf(*b"AAA0", b"12345").unwrap();
        let b = writer.write_leaf(*b"BBB0", b"x").unwrap();
        let c = writer.write_leaf(*b"CCC0", b"").unwrap();
        assert_eq!(a % 16, 0);
        assert_eq!(b % 16, 0);
        assert_eq!(c % 16, 0);
        // 12-byte header + 5 payload = 17 -> next boundary is 32.
        assert_eq!(b, 32);
    }

    #[test]
    fn unknown_chunks_are_skippable() {
        let mut writer = ChunkWriter::new(Cursor::new(Vec::new()), 1);
        writer.write_leaf(*b"XYZ9", b"mystery").unwrap();
        writer.write_leaf(CHUNK_ID_END, b"").unwrap();
        let mut cursor = writer.into_inner();
        cursor.set_position(0);

        let mut reader = ChunkReader::new(cursor, 1);
        let unknown = reader.next_chunk().unwrap().unwrap();
        assert_eq!(&unknown.id, b"XYZ9");
        reader.skip(&unknown).unwrap();
        let end = reader.next_chunk().unwrap().unwrap();
        assert_eq!(end.id, CHUNK_ID_END);
    }

    #[test]
    fn torn_header_is_corrupt() {
        // 4 id bytes and a truncated length field.
        let bytes = b"FIL0\x00\x00\x00".to_vec();
        let mut reader = ChunkReader::new(Cursor::new(bytes), 1);
        match reader.next_chunk() {
            Err(Error::CorruptArchive { offset }) => assert_eq!(offset, 0),
            other => panic!("expected CorruptArchive, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let mut writer = ChunkWriter::new(Cursor::new(Vec::new()), 1);
        writer.write_leaf(*b"DAT0", b"abcdef").unwrap();
        let mut bytes = writer.into_inner().into_inner();
        bytes.truncate(bytes.len() - 3);

        let mut reader = ChunkReader::new(Cursor::new(bytes), 1);
        let header = reader.next_chunk().unwrap().unwrap();
        assert!(matches!(
            reader.read_payload(header.length),
            Err(Error::CorruptArchive { .. })
        ));
    }

    #[test]
    fn container_length_backpatch() {
        let mut writer = ChunkWriter::new(Cursor::new(Vec::new()), 16);
        let open = writer.begin_chunk(CHUNK_ID_FILE).unwrap();
        let child_start = writer.write_leaf(CHUNK_ID_FILE_ENTRY, b"meta").unwrap();
        assert_eq!(child_start % 16, 0);
        let end = writer.position().unwrap();
        let span = end - CHUNK_HEADER_LENGTH; // container header sits at offset 0
        writer.end_chunk(open, span).unwrap();

        let mut cursor = writer.into_inner();
        cursor.set_position(0);
        let mut reader = ChunkReader::new(cursor, 16);
        let container = reader.next_chunk().unwrap().unwrap();
        assert_eq!(container.id, CHUNK_ID_FILE);
        assert_eq!(container.length, span);
        let child = reader.next_chunk().unwrap().unwrap();
        assert_eq!(child.id, CHUNK_ID_FILE_ENTRY);
        assert_eq!(child.length, 4);
    }
}
