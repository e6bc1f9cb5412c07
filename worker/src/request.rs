//! This module provides the task encoding a chunk in the background.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::chunk::{ChunkSnapshot, DimensionId};
use crate::compression::Compressor;
use crate::encode::{ChunkEncoder, EncodeError};
use crate::promise::Promise;
use crate::task::{AsyncTask, TaskError};

/// A promise on a compressed batch, as delivered to clients.
pub type CompressBatchPromise = Promise<Bytes>;

/// Hook called on the owning thread when a chunk could not be encoded.
pub type ErrorHook = Box<dyn FnOnce() + Send>;

/// A task encoding and compressing a chunk snapshot.
///
/// On success the promise is resolved with the compressed batch. On failure the error hook is called, if any, and the promise is left pending
/// forever: waiters relying on it must bring their own timeout (see [`Promise::wait_timeout()`]) or watch for its abandonment.
pub struct ChunkRequestTask {
    snapshot: ChunkSnapshot,
    dimension: DimensionId,
    encoder: ChunkEncoder,
    compressor: Arc<dyn Compressor>,
    promise: CompressBatchPromise,
    on_error: Option<ErrorHook>,
}

impl ChunkRequestTask {
    pub fn new(snapshot: ChunkSnapshot, dimension: DimensionId, promise: CompressBatchPromise, compressor: Arc<dyn Compressor>) -> Self {
        Self {
            snapshot,
            dimension,
            encoder: ChunkEncoder::default(),
            compressor,
            promise,
            on_error: None,
        }
    }

    /// Build a new `ChunkRequestTask` using given encoder.
    #[inline]
    pub fn with_encoder(self, encoder: ChunkEncoder) -> Self {
        Self { encoder, ..self }
    }

    /// Build a new `ChunkRequestTask` calling `hook` on failure.
    #[inline]
    pub fn with_error_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_error: Some(Box::new(hook)),
            ..self
        }
    }
}

impl AsyncTask for ChunkRequestTask {
    type Output = Bytes;
    type Error = EncodeError;

    fn run(&mut self) -> Result<Bytes, EncodeError> {
        self.encoder.encode(&self.snapshot, self.dimension, self.compressor.as_ref())
    }

    fn on_completion(self, output: Bytes) {
        if self.promise.resolve(output).is_err() {
            tracing::debug!(
                "Ignoring duplicate completion for chunk ({}, {})",
                self.snapshot.x(),
                self.snapshot.z()
            );
        }
    }

    fn on_error(self, error: TaskError<EncodeError>) {
        tracing::warn!(
            "Failed to encode chunk ({}, {}) in {:?}: {error}",
            self.snapshot.x(),
            self.snapshot.z(),
            self.dimension
        );

        if let Some(hook) = self.on_error {
            hook();
        }
    }
}

impl fmt::Debug for ChunkRequestTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkRequestTask")
            .field("x", &self.snapshot.x())
            .field("z", &self.snapshot.z())
            .field("dimension", &self.dimension)
            .field("compressor", &self.compressor.id())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}
