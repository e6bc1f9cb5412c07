//! A simple crate providing chunk worker features.
//!
//! A generic, robust and efficient crate providing features dedicated to:
//! - running CPU-heavy asynchronous tasks on a pool of workers, away from the thread owning the world,
//! - bridging task outcomes back to the owning thread through single-resolution promises,
//! - snapshotting, encoding and compressing world chunks into network-ready batches,
//! - caching compressed chunks so that each of them is encoded once for every client.
//!
//! It makes use of both synchronous and asynchronous implementations of synchronization primitives such as `atomic` primitive types,
//! `RwLock`s and `Mutex`es, as well as _multi-producer single-consumer_ channels to move tasks to workers and their outcomes back to the
//! owning thread.
//!
//! As a **strong hypothesis**, we can assume that:
//! - a single thread owns the world: it creates tasks and drains their completions, typically once per tick;
//! - compressors are stateless, or internally synchronized, so that workers may share them.
//!
//! Here is the life of a chunk request:
//!
//! ```text
//!     owning thread                         worker
//!       L snapshot live chunk
//!       L create promise
//!       L submit ChunkRequestTask  ------>  L decode snapshot terrain and tiles
//!                                           L serialize LevelChunk packet batch
//!                                           L compress, prefix with codec id
//!       L collect completions      <------  L send outcome
//!         L resolve promise (success)
//!         L call error hook (failure, promise left pending)
//! ```
//!
//! The live chunk is never touched by workers: they only ever see the snapshot they were given, while the world keeps on ticking.

pub mod cache;
pub mod chunk;
pub mod compression;
pub mod encode;
pub mod promise;
pub mod protocol;
pub mod request;
pub mod task;

pub use cache::ChunkCache;
pub use chunk::{Chunk, ChunkSnapshot, DimensionId};
pub use compression::Compressor;
pub use encode::{encode, ChunkEncoder, EncodeError};
pub use promise::Promise;
pub use request::{ChunkRequestTask, CompressBatchPromise};
pub use task::{AsyncTask, Pool};
