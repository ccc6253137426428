//! Streaming compression pipeline.
//!
//! The archive writer feeds source bytes through a [`Compressor`] and
//! encrypts whatever comes out; the reader mirrors this with a
//! [`Decompressor`]. Both sides tolerate arbitrary slice boundaries:
//! every part of a split archive starts a fresh stream so each volume
//! can be decoded independently.

use std::io::Write;

use crate::error::{Error, Result};

/// Supported compressors. The small integer ids are part of the on-disk
/// format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressAlgorithm {
    None,
    Zstd,
    Xz,
}

impl CompressAlgorithm {
    pub fn id(self) -> u16 {
        match self {
            CompressAlgorithm::None => 0,
            CompressAlgorithm::Zstd => 1,
            CompressAlgorithm::Xz => 2,
        }
    }

    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            0 => Ok(CompressAlgorithm::None),
            1 => Ok(CompressAlgorithm::Zstd),
            2 => Ok(CompressAlgorithm::Xz),
            other => Err(Error::UnsupportedCompression(other)),
        }
    }
}

/// Compression settings for one archive.
#[derive(Debug, Clone, Copy)]
pub struct CompressConfig {
    pub algorithm: CompressAlgorithm,
    /// Files smaller than this are stored raw; compressing tiny files
    /// costs more than it saves.
    pub min_file_size: u64,
}

impl Default for CompressConfig {
    fn default() -> Self {
        CompressConfig { algorithm: CompressAlgorithm::None, min_file_size: 32 }
    }
}

const ZSTD_LEVEL: i32 = 3;
const XZ_PRESET: u32 = 6;

/// Streaming compressor: `feed` produces zero or more output octets,
/// `finish` drains the remainder.
pub enum Compressor {
    None,
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
    Xz(xz2::write::XzEncoder<Vec<u8>>),
}

impl Compressor {
    pub fn new(algorithm: CompressAlgorithm) -> Result<Self> {
        match algorithm {
            CompressAlgorithm::None => Ok(Compressor::None),
            CompressAlgorithm::Zstd => {
                let encoder = zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL)
                    .map_err(Error::from)?;
                Ok(Compressor::Zstd(encoder))
            }
            CompressAlgorithm::Xz => {
                Ok(Compressor::Xz(xz2::write::XzEncoder::new(Vec::new(), XZ_PRESET)))
            }
        }
    }

    /// Feed source bytes; returns whatever compressed output became
    /// available (possibly empty).
    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(input.to_vec()),
            Compressor::Zstd(encoder) => {
                encoder.write_all(input)?;
                Ok(std::mem::take(encoder.get_mut()))
            }
            Compressor::Xz(encoder) => {
                encoder.write_all(input)?;
                Ok(std::mem::take(encoder.get_mut()))
            }
        }
    }

    /// Terminate the stream and drain the final octets.
    pub fn finish(self) -> Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(Vec::new()),
            Compressor::Zstd(encoder) => Ok(encoder.finish()?),
            Compressor::Xz(encoder) => Ok(encoder.finish()?),
        }
    }
}

/// Streaming decompressor; the mirror of [`Compressor`].
pub enum Decompressor {
    None,
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
    Xz(xz2::write::XzDecoder<Vec<u8>>),
}

impl Decompressor {
    pub fn new(algorithm: CompressAlgorithm) -> Result<Self> {
        match algorithm {
            CompressAlgorithm::None => Ok(Decompressor::None),
            CompressAlgorithm::Zstd => {
                let decoder = zstd::stream::write::Decoder::new(Vec::new())
                    .map_err(Error::from)?;
                Ok(Decompressor::Zstd(decoder))
            }
            CompressAlgorithm::Xz => {
                Ok(Decompressor::Xz(xz2::write::XzDecoder::new(Vec::new())))
            }
        }
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Decompressor::None => Ok(input.to_vec()),
            Decompressor::Zstd(decoder) => {
                decoder.write_all(input)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Decompressor::Xz(decoder) => {
                decoder.write_all(input)?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        match self {
            Decompressor::None => Ok(Vec::new()),
            Decompressor::Zstd(mut decoder) => {
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Decompressor::Xz(mut decoder) => Ok(decoder.finish()?),
        }
    }
}
