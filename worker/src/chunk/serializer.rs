//! Chunk serialization, both for snapshots and for the network.
//!
//! Snapshot terrain layout:
//!
//! ```text
//!     u8 version
//!     u8 sub-chunk slot count
//!     per slot:
//!       u8 present
//!       if present:
//!         u16le palette length
//!         u32le palette entries...
//!         u16le block indices (4096)
//! ```
//!
//! Snapshot tiles are a varint count followed by varint-length-prefixed NBT blobs.

use std::borrow::Cow;
use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Chunk, SubChunk, MAX_SUB_CHUNKS, SUB_CHUNK_BLOCKS};
use crate::protocol;

/// Number of empty sub-chunks sent below the lowest sub-chunk, covering the extended world height.
pub const LOWER_PADDING_SIZE: u32 = 4;

const TERRAIN_VERSION: u8 = 1;
const SUB_CHUNK_VERSION: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorruptChunk {
    #[error("unexpected end of terrain")]
    Truncated,
    #[error("unsupported terrain version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected sub-chunk count {0}")]
    SubChunkCount(usize),
    #[error("invalid palette in sub-chunk {0}")]
    InvalidPalette(usize),
    #[error("{0} trailing terrain bytes")]
    TrailingBytes(usize),
    #[error("malformed tile buffer")]
    MalformedTiles,
    #[error("block {0} has no network id")]
    UnmappedBlock(u32),
}

/// Translation from block ids to the ids known by clients.
pub trait BlockMapping: Send + Sync {
    fn network_id(&self, block: u32) -> Option<u32>;
}

/// A mapping sending block ids as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMapping;

impl BlockMapping for IdentityMapping {
    #[inline]
    fn network_id(&self, block: u32) -> Option<u32> {
        Some(block)
    }
}

impl BlockMapping for HashMap<u32, u32> {
    #[inline]
    fn network_id(&self, block: u32) -> Option<u32> {
        self.get(&block).copied()
    }
}

/// Copy the terrain of a chunk into a snapshot buffer.
///
/// Empty sub-chunks are not copied.
pub fn serialize_terrain(chunk: &Chunk) -> Bytes {
    let mut buf = BytesMut::new();

    buf.put_u8(TERRAIN_VERSION);
    buf.put_u8(chunk.sub_chunks().len() as u8);

    for sub_chunk in chunk.sub_chunks() {
        if sub_chunk.is_empty() {
            buf.put_u8(0);
            continue;
        }

        buf.put_u8(1);
        buf.put_u16_le(sub_chunk.palette().len() as u16);
        for &block in sub_chunk.palette() {
            buf.put_u32_le(block);
        }
        for &index in sub_chunk.indices() {
            buf.put_u16_le(index);
        }
    }

    buf.freeze()
}

/// Read back the terrain of a snapshot, slot by slot.
pub fn deserialize_terrain(mut buf: Bytes) -> Result<Vec<Option<SubChunk>>, CorruptChunk> {
    fn ensure(buf: &Bytes, len: usize) -> Result<(), CorruptChunk> {
        (buf.remaining() >= len).then_some(()).ok_or(CorruptChunk::Truncated)
    }

    ensure(&buf, 2)?;
    match buf.get_u8() {
        TERRAIN_VERSION => {}
        version => return Err(CorruptChunk::UnsupportedVersion(version)),
    }

    let count = buf.get_u8() as usize;
    if count > MAX_SUB_CHUNKS {
        return Err(CorruptChunk::SubChunkCount(count));
    }

    let mut sub_chunks = Vec::with_capacity(count);

    for y in 0..count {
        ensure(&buf, 1)?;
        if buf.get_u8() == 0 {
            sub_chunks.push(None);
            continue;
        }

        ensure(&buf, 2)?;
        let len = buf.get_u16_le() as usize;

        ensure(&buf, len * 4 + SUB_CHUNK_BLOCKS * 2)?;
        let palette = (0..len).map(|_| buf.get_u32_le()).collect();
        let mut indices = Box::new([0; SUB_CHUNK_BLOCKS]);
        for index in indices.iter_mut() {
            *index = buf.get_u16_le();
        }

        let sub_chunk = SubChunk::from_parts(palette, indices).ok_or(CorruptChunk::InvalidPalette(y))?;
        sub_chunks.push(Some(sub_chunk));
    }

    if buf.has_remaining() {
        return Err(CorruptChunk::TrailingBytes(buf.remaining()));
    }

    Ok(sub_chunks)
}

/// Copy the tiles of a chunk into a snapshot buffer.
pub fn serialize_tiles(chunk: &Chunk) -> Bytes {
    let mut buf = BytesMut::new();

    protocol::put_var_u32(&mut buf, chunk.tiles().count() as u32);
    for tile in chunk.tiles() {
        protocol::put_string(&mut buf, tile);
    }

    buf.freeze()
}

/// Concatenate the NBT blobs of a snapshot tile buffer.
pub fn deserialize_tiles(mut buf: Bytes) -> Result<BytesMut, CorruptChunk> {
    let count = protocol::get_var_u32(&mut buf).map_err(|_| CorruptChunk::MalformedTiles)?;
    let mut nbt = BytesMut::with_capacity(buf.len());

    for _ in 0..count {
        let tile = protocol::get_string(&mut buf).map_err(|_| CorruptChunk::MalformedTiles)?;
        nbt.put(tile);
    }

    if buf.has_remaining() {
        return Err(CorruptChunk::MalformedTiles);
    }

    Ok(nbt)
}

/// Return the number of sub-chunks to send, ie. up to the highest one holding any block.
pub fn sub_chunk_count(sub_chunks: &[Option<SubChunk>]) -> u32 {
    sub_chunks
        .iter()
        .rposition(|sub_chunk| sub_chunk.as_ref().is_some_and(|sub_chunk| !sub_chunk.is_empty()))
        .map_or(0, |y| y as u32 + 1)
}

/// Serialize a whole chunk column as expected by clients: padding, sub-chunks, border blocks and tiles NBT.
pub fn serialize_full_chunk(sub_chunks: &[Option<SubChunk>], mapping: &dyn BlockMapping, tiles: &[u8]) -> Result<Bytes, CorruptChunk> {
    let mut buf = BytesMut::with_capacity(16 * 1024);

    for _ in 0..LOWER_PADDING_SIZE {
        buf.put_slice(&[SUB_CHUNK_VERSION, 0]);
    }

    for sub_chunk in &sub_chunks[..sub_chunk_count(sub_chunks) as usize] {
        match sub_chunk {
            Some(sub_chunk) => {
                buf.put_slice(&[SUB_CHUNK_VERSION, 1]);
                serialize_block_storage(&mut buf, sub_chunk, mapping)?;
            }
            None => buf.put_slice(&[SUB_CHUNK_VERSION, 0]),
        }
    }

    // no border blocks
    buf.put_u8(0);
    buf.put_slice(tiles);

    Ok(buf.freeze())
}

fn bits_per_block(palette_len: usize) -> u32 {
    [1, 2, 3, 4, 5, 6, 8, 16]
        .into_iter()
        .find(|&bits| palette_len <= 1 << bits)
        .unwrap_or(16)
}

fn serialize_block_storage(buf: &mut BytesMut, sub_chunk: &SubChunk, mapping: &dyn BlockMapping) -> Result<(), CorruptChunk> {
    // blocks overwritten since the last compaction must neither be sent nor mapped
    let sub_chunk = if sub_chunk.is_compact() {
        Cow::Borrowed(sub_chunk)
    } else {
        let mut compacted = sub_chunk.clone();
        compacted.compact();
        Cow::Owned(compacted)
    };

    let bits = bits_per_block(sub_chunk.palette().len());
    let blocks_per_word = (32 / bits) as usize;

    // lowest bit flags runtime ids
    buf.put_u8((bits << 1) as u8 | 1);

    for word in sub_chunk.indices().chunks(blocks_per_word) {
        let word = word
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, &index)| acc | (index as u32) << (i as u32 * bits));
        buf.put_u32_le(word);
    }

    protocol::put_var_i32(buf, sub_chunk.palette().len() as i32);
    for &block in sub_chunk.palette() {
        let id = mapping.network_id(block).ok_or(CorruptChunk::UnmappedBlock(block))?;
        protocol::put_var_i32(buf, id as i32);
    }

    Ok(())
}
