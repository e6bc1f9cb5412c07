//! This module turns chunk snapshots into compressed, network-ready batches.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::chunk::serializer::{self, BlockMapping, CorruptChunk, IdentityMapping, LOWER_PADDING_SIZE};
use crate::chunk::{ChunkSnapshot, DimensionId};
use crate::compression::Compressor;
use crate::protocol::{LevelChunkPacket, PacketBatch};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("corrupt chunk snapshot: {0}")]
    Corrupt(#[from] CorruptChunk),
    #[error("compression failed: {0}")]
    Compression(#[from] io::Error),
}

/// Chunk encoder.
///
/// Encoding is a pure function of its inputs: it performs no I/O and only reads the given snapshot and its own block mapping, so that it can
/// safely run on any worker thread.
#[derive(Clone)]
pub struct ChunkEncoder {
    mapping: Arc<dyn BlockMapping>,
}

impl ChunkEncoder {
    /// Create an encoder sending block ids as they are.
    pub fn new() -> Self {
        Self {
            mapping: Arc::new(IdentityMapping),
        }
    }

    /// Build a new `ChunkEncoder` translating block ids with given mapping.
    #[inline]
    pub fn with_mapping(self, mapping: Arc<dyn BlockMapping>) -> Self {
        Self { mapping }
    }

    /// Encode `snapshot` as a `LevelChunk` packet batch compressed with `compressor`.
    ///
    /// The returned buffer starts with the compressor network id, followed by the compressed batch.
    pub fn encode(&self, snapshot: &ChunkSnapshot, dimension: DimensionId, compressor: &dyn Compressor) -> Result<Bytes, EncodeError> {
        let sub_chunks = serializer::deserialize_terrain(snapshot.terrain().clone())?;
        let tiles = serializer::deserialize_tiles(snapshot.tiles().clone())?;

        let sub_chunk_count = serializer::sub_chunk_count(&sub_chunks) + LOWER_PADDING_SIZE;
        let payload = serializer::serialize_full_chunk(&sub_chunks, self.mapping.as_ref(), &tiles)?;

        let packet = LevelChunkPacket {
            chunk_x: snapshot.x(),
            chunk_z: snapshot.z(),
            dimension,
            sub_chunk_count,
            cache_enabled: false,
            payload,
        };
        let batch = PacketBatch::encode([&packet]);

        let compressed = compressor.compress(&batch)?;

        let mut buf = BytesMut::with_capacity(compressed.len() + 1);
        buf.put_u8(compressor.id());
        buf.put_slice(&compressed);

        Ok(buf.freeze())
    }
}

impl Default for ChunkEncoder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkEncoder").finish_non_exhaustive()
    }
}

/// Encode `snapshot` with the default [`ChunkEncoder`].
#[inline]
pub fn encode(snapshot: &ChunkSnapshot, dimension: DimensionId, compressor: &dyn Compressor) -> Result<Bytes, EncodeError> {
    ChunkEncoder::new().encode(snapshot, dimension, compressor)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::io::Read;

    use flate2::read::DeflateDecoder;

    use super::*;
    use crate::chunk::Chunk;
    use crate::compression::ZlibCompressor;

    /// Compressor returning batches untouched with a configurable id.
    pub(crate) struct Identity(pub u8);

    impl Compressor for Identity {
        fn id(&self) -> u8 {
            self.0
        }

        fn compress(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
            Ok(payload.to_vec())
        }
    }

    struct Failing;

    impl Compressor for Failing {
        fn id(&self) -> u8 {
            1
        }

        fn compress(&self, _: &[u8]) -> io::Result<Vec<u8>> {
            Err(io::Error::other("out of memory"))
        }
    }

    /// A chunk whose first `sub_chunks` sub-chunks hold a block, with `seed` making its content distinguishable.
    pub(crate) fn chunk(sub_chunks: usize, seed: u32) -> Chunk {
        let mut chunk = Chunk::new();
        for y in 0..sub_chunks {
            chunk.set_block((seed % 16) as usize, y * 16, 0, seed + 1);
        }
        chunk.set_tile(0, 0, 0, Bytes::from(seed.to_le_bytes().to_vec()));
        chunk
    }

    pub(crate) fn decode(buf: &Bytes) -> LevelChunkPacket {
        let mut packets = PacketBatch::decode(buf.slice(1..)).unwrap();
        assert_eq!(packets.len(), 1);
        LevelChunkPacket::decode(packets.remove(0)).unwrap()
    }

    #[test]
    fn test_end_to_end() {
        let snapshot = ChunkSnapshot::capture(5, -7, &chunk(3, 0));

        let buf = encode(&snapshot, DimensionId::Overworld, &Identity(9)).unwrap();

        assert_eq!(buf[0], 9);

        let packet = decode(&buf);
        assert_eq!(packet.sub_chunk_count, 3 + LOWER_PADDING_SIZE);
        assert_eq!((packet.chunk_x, packet.chunk_z), (5, -7));
        assert_eq!(packet.dimension, DimensionId::Overworld);
        assert!(!packet.cache_enabled);
        assert!(packet.payload.ends_with(&0u32.to_le_bytes()));
    }

    #[test]
    fn test_codec_prefix() {
        let snapshot = ChunkSnapshot::capture(0, 0, &chunk(1, 1));

        for compressor in [&Identity(9) as &dyn Compressor, &Identity(42), &ZlibCompressor::new()] {
            let buf = encode(&snapshot, DimensionId::End, compressor).unwrap();
            assert_eq!(buf[0], compressor.id());
        }
    }

    #[test]
    fn test_zlib_batch() {
        let snapshot = ChunkSnapshot::capture(2, 3, &chunk(2, 4));

        let raw = encode(&snapshot, DimensionId::Nether, &Identity(ZlibCompressor::NETWORK_ID)).unwrap();
        let compressed = encode(&snapshot, DimensionId::Nether, &ZlibCompressor::new()).unwrap();

        let mut batch = vec![];
        DeflateDecoder::new(&compressed[1..]).read_to_end(&mut batch).unwrap();

        assert_eq!(batch, raw[1..]);
    }

    #[test]
    fn test_deterministic() {
        let snapshot = ChunkSnapshot::capture(8, 8, &chunk(5, 11));
        let compressor = ZlibCompressor::new();

        let first = encode(&snapshot, DimensionId::Overworld, &compressor).unwrap();
        let second = encode(&snapshot.clone(), DimensionId::Overworld, &compressor).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_chunk() {
        let snapshot = ChunkSnapshot::capture(0, 0, &Chunk::new());

        let packet = decode(&encode(&snapshot, DimensionId::Overworld, &Identity(0)).unwrap());

        assert_eq!(packet.sub_chunk_count, LOWER_PADDING_SIZE);
    }

    #[test]
    fn test_corrupt() {
        let valid = ChunkSnapshot::capture(0, 0, &chunk(1, 2));

        let truncated = ChunkSnapshot::from_raw(0, 0, valid.terrain().slice(..10), valid.tiles().clone());
        let bad_tiles = ChunkSnapshot::from_raw(0, 0, valid.terrain().clone(), Bytes::from_static(&[3]));

        for snapshot in [truncated, bad_tiles] {
            let err = encode(&snapshot, DimensionId::Overworld, &Identity(0)).unwrap_err();
            assert!(matches!(err, EncodeError::Corrupt(_)), "{err:?}");
        }
    }

    #[test]
    fn test_unmapped_block() {
        let snapshot = ChunkSnapshot::capture(0, 0, &chunk(1, 2));
        let encoder = ChunkEncoder::new().with_mapping(Arc::new(HashMap::from([(0u32, 0u32)])));

        let err = encoder.encode(&snapshot, DimensionId::Overworld, &Identity(0)).unwrap_err();

        assert!(matches!(err, EncodeError::Corrupt(CorruptChunk::UnmappedBlock(3))));
    }

    #[test]
    fn test_overwritten_block_not_mapped() {
        let mut live = Chunk::new();
        live.set_block(0, 0, 0, 5);
        live.set_block(0, 0, 0, 1);

        let snapshot = ChunkSnapshot::capture(0, 0, &live);
        let encoder = ChunkEncoder::new().with_mapping(Arc::new(HashMap::from([(0u32, 0u32), (1, 1)])));

        let packet = decode(&encoder.encode(&snapshot, DimensionId::Overworld, &Identity(0)).unwrap());

        assert_eq!(packet.sub_chunk_count, 1 + LOWER_PADDING_SIZE);
    }

    #[test]
    fn test_compression_failure() {
        let snapshot = ChunkSnapshot::capture(0, 0, &chunk(1, 2));

        let err = encode(&snapshot, DimensionId::Overworld, &Failing).unwrap_err();

        assert!(matches!(err, EncodeError::Compression(_)));
        assert_eq!(err.to_string(), "compression failed: out of memory");
    }
}
