//! Pluggable batch compressors.

use std::io::{self, Write};

use flate2::write::DeflateEncoder;
use flate2::Compression;

/// A codec compressing packet batches, identified on the wire by a single byte.
///
/// A compressor is shared by every worker of a pool: it must be safe to use from several threads at once.
pub trait Compressor: Send + Sync {
    /// Network id prefixed to every compressed batch.
    fn id(&self) -> u8;

    fn compress(&self, payload: &[u8]) -> io::Result<Vec<u8>>;
}

/// Raw deflate compressor.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: Compression,
}

impl ZlibCompressor {
    pub const NETWORK_ID: u8 = 0;
    pub const DEFAULT_LEVEL: u32 = 7;

    #[inline]
    pub fn new() -> Self {
        Self {
            level: Compression::new(Self::DEFAULT_LEVEL),
        }
    }

    /// Build a new `ZlibCompressor` with given compression level, from 0 to 9.
    #[inline]
    pub fn with_level(self, level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for ZlibCompressor {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for ZlibCompressor {
    #[inline]
    fn id(&self) -> u8 {
        Self::NETWORK_ID
    }

    fn compress(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(payload.len() / 2), self.level);
        encoder.write_all(payload)?;
        encoder.finish()
    }
}

/// Compressor leaving batches untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompressor;

impl NoCompressor {
    pub const NETWORK_ID: u8 = 0xff;
}

impl Compressor for NoCompressor {
    #[inline]
    fn id(&self) -> u8 {
        Self::NETWORK_ID
    }

    #[inline]
    fn compress(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}
