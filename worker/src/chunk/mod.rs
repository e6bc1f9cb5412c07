use std::collections::BTreeMap;

use bytes::Bytes;

pub mod serializer;

/// Number of blocks in a sub-chunk.
pub const SUB_CHUNK_BLOCKS: usize = 16 * 16 * 16;
/// Number of sub-chunks stacked in a chunk.
pub const MAX_SUB_CHUNKS: usize = 16;
/// Block id of air, which every new sub-chunk is filled with.
pub const AIR: u32 = 0;

/// World dimension, as known by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DimensionId {
    Overworld = 0,
    Nether = 1,
    End = 2,
}

impl TryFrom<i32> for DimensionId {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Overworld),
            1 => Ok(Self::Nether),
            2 => Ok(Self::End),
            _ => Err(value),
        }
    }
}

/// A 16x16x16 paletted block storage.
///
/// Blocks are indexed in XZY order: `(x << 8) | (z << 4) | y`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubChunk {
    palette: Vec<u32>,
    indices: Box<[u16; SUB_CHUNK_BLOCKS]>,
}

impl SubChunk {
    /// Create a sub-chunk filled with air.
    pub fn empty() -> Self {
        Self {
            palette: vec![AIR],
            indices: Box::new([0; SUB_CHUNK_BLOCKS]),
        }
    }

    /// Create a sub-chunk from raw parts, returning `None` if any index is out of the palette.
    pub fn from_parts(palette: Vec<u32>, indices: Box<[u16; SUB_CHUNK_BLOCKS]>) -> Option<Self> {
        indices
            .iter()
            .all(|&i| (i as usize) < palette.len())
            .then_some(Self { palette, indices })
    }

    #[inline]
    fn index(x: usize, y: usize, z: usize) -> usize {
        assert!(x < 16 && y < 16 && z < 16, "block ({x}, {y}, {z}) out of sub-chunk");
        (x << 8) | (z << 4) | y
    }

    pub fn block(&self, x: usize, y: usize, z: usize) -> u32 {
        self.palette[self.indices[Self::index(x, y, z)] as usize]
    }

    pub fn set_block(&mut self, x: usize, y: usize, z: usize, block: u32) {
        let index = Self::index(x, y, z);

        let entry = match self.palette.iter().position(|&b| b == block) {
            Some(entry) => entry,
            None => {
                if self.palette.len() > SUB_CHUNK_BLOCKS {
                    self.compact();
                }
                self.palette.push(block);
                self.palette.len() - 1
            }
        };

        self.indices[index] = entry as u16;
    }

    fn used_entries(&self) -> Vec<bool> {
        let mut used = vec![false; self.palette.len()];
        for &index in self.indices.iter() {
            used[index as usize] = true;
        }
        used
    }

    /// Return `true` if every palette entry is referred to by at least one block.
    pub fn is_compact(&self) -> bool {
        self.used_entries().into_iter().all(|used| used)
    }

    /// Drop palette entries no block refers to anymore, keeping the others in order.
    pub fn compact(&mut self) {
        let mut remap = vec![0u16; self.palette.len()];
        let mut palette = Vec::with_capacity(self.palette.len());

        for (entry, used) in self.used_entries().into_iter().enumerate() {
            if used {
                remap[entry] = palette.len() as u16;
                palette.push(self.palette[entry]);
            }
        }

        for index in self.indices.iter_mut() {
            *index = remap[*index as usize];
        }

        self.palette = palette;
    }

    /// Return `true` if the sub-chunk only contains air.
    pub fn is_empty(&self) -> bool {
        self.indices.iter().all(|&i| self.palette[i as usize] == AIR)
    }

    #[inline]
    pub fn palette(&self) -> &[u32] {
        &self.palette
    }

    #[inline]
    pub fn indices(&self) -> &[u16; SUB_CHUNK_BLOCKS] {
        &self.indices
    }
}

impl Default for SubChunk {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

/// A live chunk column, owned and mutated by the simulation thread.
///
/// Tiles are stored as already NBT-encoded blobs keyed by their block position within the chunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    sub_chunks: Vec<SubChunk>,
    tiles: BTreeMap<(usize, usize, usize), Bytes>,
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            sub_chunks: (0..MAX_SUB_CHUNKS).map(|_| SubChunk::empty()).collect(),
            tiles: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn sub_chunks(&self) -> &[SubChunk] {
        &self.sub_chunks
    }

    #[inline]
    pub fn sub_chunk(&self, y: usize) -> &SubChunk {
        &self.sub_chunks[y]
    }

    pub fn block(&self, x: usize, y: usize, z: usize) -> u32 {
        self.sub_chunks[y >> 4].block(x, y & 0xf, z)
    }

    pub fn set_block(&mut self, x: usize, y: usize, z: usize, block: u32) {
        assert!(y < MAX_SUB_CHUNKS * 16, "block height {y} out of chunk");
        self.sub_chunks[y >> 4].set_block(x, y & 0xf, z, block)
    }

    /// Attach an NBT-encoded tile to the block at the given position, replacing any previous one.
    pub fn set_tile(&mut self, x: usize, y: usize, z: usize, nbt: impl Into<Bytes>) {
        assert!(x < 16 && y < MAX_SUB_CHUNKS * 16 && z < 16, "tile ({x}, {y}, {z}) out of chunk");
        self.tiles.insert((x, y, z), nbt.into());
    }

    pub fn remove_tile(&mut self, x: usize, y: usize, z: usize) -> Option<Bytes> {
        self.tiles.remove(&(x, y, z))
    }

    /// Iterate over tiles in position order.
    pub fn tiles(&self) -> impl Iterator<Item = &Bytes> {
        self.tiles.values()
    }
}

impl Default for Chunk {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable copy of a chunk's terrain and tiles, which can be handed over to another thread.
///
/// The live chunk may keep being mutated once the snapshot has been taken: the snapshot will never observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSnapshot {
    x: i32,
    z: i32,
    terrain: Bytes,
    tiles: Bytes,
}

impl ChunkSnapshot {
    /// Take a snapshot of the chunk at `(x, z)`.
    pub fn capture(x: i32, z: i32, chunk: &Chunk) -> Self {
        Self {
            x,
            z,
            terrain: serializer::serialize_terrain(chunk),
            tiles: serializer::serialize_tiles(chunk),
        }
    }

    /// Build a snapshot from already serialized terrain and tiles.
    ///
    /// Buffers are validated lazily, when encoded.
    pub fn from_raw(x: i32, z: i32, terrain: Bytes, tiles: Bytes) -> Self {
        Self { x, z, terrain, tiles }
    }

    #[inline]
    pub fn x(&self) -> i32 {
        self.x
    }

    #[inline]
    pub fn z(&self) -> i32 {
        self.z
    }

    #[inline]
    pub fn terrain(&self) -> &Bytes {
        &self.terrain
    }

    #[inline]
    pub fn tiles(&self) -> &Bytes {
        &self.tiles
    }
}
