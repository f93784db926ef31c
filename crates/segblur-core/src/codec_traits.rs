//! Media source/sink traits shared across crate boundaries.
//!
//! Sources decode input into [`Batch`]es; sinks encode processed batches.
//! Both live in `segblur-media`; the orchestrator only sees these traits.

use crate::context::ExecutionStream;
use crate::error::Result;
use crate::types::{Batch, Framerate, MemorySpace, Modality, TensorLayout};

// ─── Source ──────────────────────────────────────────────────────────────────

/// Produces batches of decoded frames in index order.
pub trait MediaSource {
    /// Open the underlying resource.  Failures are `SourceOpen` errors.
    fn start(&mut self) -> Result<()>;

    /// Decode the next batch.
    ///
    /// Returns `Ok(None)` exactly once the input is exhausted.  Decoder
    /// failures are errors, never end-of-stream.  Batch indices start at 0
    /// and increase by one with no gaps.
    fn next_batch(&mut self, stream: &ExecutionStream) -> Result<Option<Batch>>;

    /// Source framerate.  [`Framerate::ZERO`] for image collections.
    fn framerate(&self) -> Framerate;

    fn modality(&self) -> Modality;
}

// ─── Sink ────────────────────────────────────────────────────────────────────

/// Consumes processed batches and writes one artifact per input unit.
pub trait MediaSink {
    /// Prepare the output location.
    fn start(&mut self) -> Result<()>;

    /// Enqueue a batch for writing.  Batches must arrive in strictly
    /// increasing index order.
    fn accept(&mut self, batch: Batch, stream: &ExecutionStream) -> Result<()>;

    /// Block until every accepted batch is written.  Idempotent: calls after
    /// the first successful one return `Ok(())` immediately.
    fn join(&mut self) -> Result<()>;

    /// Axis order this sink expects its frames in.
    fn input_layout(&self) -> TensorLayout;

    /// Memory space this sink reads its frames from.
    fn memory_space(&self) -> MemorySpace;
}

/// Ordering guard shared by sink implementations.
#[derive(Debug, Default)]
pub struct SinkOrder {
    last: Option<u64>,
}

impl SinkOrder {
    /// Accept `index` if it is greater than every index seen so far.
    pub fn admit(&mut self, index: u64) -> Result<()> {
        if let Some(last) = self.last
            && index <= last
        {
            return Err(crate::error::EngineError::BatchIndexMismatch {
                expected: last + 1,
                actual: index,
            });
        }
        self.last = Some(index);
        Ok(())
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}
