//! This module provides a cache of compressed chunks, shared by every client of a world.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::chunk::{Chunk, ChunkSnapshot, DimensionId};
use crate::compression::Compressor;
use crate::encode::ChunkEncoder;
use crate::request::{ChunkRequestTask, CompressBatchPromise};
use crate::task::{Pool, PoolError};

/// A chunk position, in chunk coordinates.
pub type ChunkPos = (i32, i32);

/// Compressed chunk cache for a single dimension and compressor.
///
/// Every chunk is encoded at most once until it is invalidated, no matter how many clients request it: concurrent requests share the same
/// [`CompressBatchPromise`]. The cache lives on the thread owning the world, which is also the one dispatching task completions.
///
/// When an encoding fails, its entry is evicted so that the next request for this chunk submits a fresh task.
/// When an entry is invalidated while its task is still running, the task completion resolves a promise nobody holds anymore.
pub struct ChunkCache {
    dimension: DimensionId,
    compressor: Arc<dyn Compressor>,
    encoder: ChunkEncoder,
    /// In-memory cache protected for concurrent R/W access, as error hooks need to evict entries.
    entries: Arc<RwLock<HashMap<ChunkPos, CompressBatchPromise>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChunkCache {
    pub fn new(dimension: DimensionId, compressor: Arc<dyn Compressor>) -> Self {
        Self {
            dimension,
            compressor,
            encoder: ChunkEncoder::default(),
            entries: Arc::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build a new `ChunkCache` encoding chunks with given encoder.
    #[inline]
    pub fn with_encoder(self, encoder: ChunkEncoder) -> Self {
        Self { encoder, ..self }
    }

    #[inline]
    pub fn dimension(&self) -> DimensionId {
        self.dimension
    }

    /// Request the compressed chunk at `pos`.
    ///
    /// Return the cached promise if any, otherwise take a snapshot of `chunk` and submit its encoding to `pool`.
    pub fn request(&self, pool: &Pool, pos: ChunkPos, chunk: &Chunk) -> Result<CompressBatchPromise, PoolError> {
        if let Some(promise) = self.entries.read().unwrap().get(&pos) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(promise.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);

        let promise = CompressBatchPromise::new();
        let snapshot = ChunkSnapshot::capture(pos.0, pos.1, chunk);

        let entries = Arc::clone(&self.entries);
        let requested = promise.clone();
        let task = ChunkRequestTask::new(snapshot, self.dimension, promise.clone(), Arc::clone(&self.compressor))
            .with_encoder(self.encoder.clone())
            .with_error_hook(move || {
                let mut entries = entries.write().unwrap();

                // the entry may have been invalidated or replaced in the meantime
                if entries.get(&pos).is_some_and(|cached| cached.ptr_eq(&requested)) {
                    tracing::debug!("Evicting chunk ({}, {}) after failed encoding", pos.0, pos.1);

                    entries.remove(&pos);
                }
            });

        self.entries.write().unwrap().insert(pos, promise.clone());

        if let Err(e) = pool.submit(task) {
            self.entries.write().unwrap().remove(&pos);
            return Err(e);
        }

        Ok(promise)
    }

    /// Drop the cached chunk at `pos`, typically because it has changed or has been unloaded.
    ///
    /// Return `true` if an entry has been removed.
    pub fn invalidate(&self, pos: ChunkPos) -> bool {
        let removed = self.entries.write().unwrap().remove(&pos).is_some();

        if removed {
            tracing::trace!("Invalidated chunk ({}, {})", pos.0, pos.1);
        }

        removed
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return `true` if the chunk at `pos` is cached, whether its encoding has completed or not.
    #[inline]
    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.entries.read().unwrap().contains_key(&pos)
    }

    /// Ratio of requests served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        match hits + misses {
            0 => 0.0,
            total => hits as f64 / total as f64,
        }
    }

    /// Total size of the compressed chunks cached so far, pending ones excluded.
    pub fn size_in_bytes(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter_map(|promise| promise.get().map(|buf| buf.len()))
            .sum()
    }
}

impl fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCache")
            .field("dimension", &self.dimension)
            .field("compressor", &self.compressor.id())
            .field("entries", &self.len())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish_non_exhaustive()
    }
}
