//! Execution context: one device, one stream, scoped release.
//!
//! ```text
//!   ExecutionContext ── owns ──▶ ExecutionStream (the only stream)
//!        │                           │
//!        │ release()/Drop            │ batch_scope(i) ─▶ BatchScope
//!        ▼                           │     issue(Decode) … issue(Encode)
//!   synchronize + mark released      │     finish()/Drop ─▶ synchronize
//! ```
//!
//! Every stage submits its work to the same [`ExecutionStream`], so work is
//! executed in issue order.  The stream records `(batch, stage)` submissions
//! and rejects any submission that would reorder stages within a batch or
//! move backwards across batches.
//!
//! With the `cuda` feature the context retains the device's primary CUDA
//! context and forks exactly one stream from it.  Without it the context is a
//! host execution queue with the same ordering and accounting semantics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, CudaStream};
use ndarray::Array4;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::types::{FrameTensor, MemorySpace};

/// Number of stream submissions kept for inspection.
const ISSUE_HISTORY: usize = 64;

// ─── Stage identity ──────────────────────────────────────────────────────────

/// Pipeline stages in the order they must be issued within one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Preprocess,
    Inference,
    Postprocess,
    Encode,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Decode,
        Stage::Preprocess,
        Stage::Inference,
        Stage::Postprocess,
        Stage::Encode,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Preprocess => "preprocess",
            Self::Inference => "inference",
            Self::Postprocess => "postprocess",
            Self::Encode => "encode",
        }
    }
}

/// One recorded stream submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamOp {
    pub batch: u64,
    pub stage: Stage,
}

// ─── Accounting ──────────────────────────────────────────────────────────────

/// Lifetime counters shared between a context and whoever acquired it.
#[derive(Debug, Default)]
pub struct ContextStats {
    acquired: AtomicU64,
    released: AtomicU64,
    fences: AtomicU64,
    issued: AtomicU64,
}

impl ContextStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// Stream synchronizations performed.
    pub fn fences(&self) -> u64 {
        self.fences.load(Ordering::Relaxed)
    }

    /// Stage submissions accepted by the stream.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Contexts acquired but not yet released.
    pub fn live(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

/// Atomic byte counters.  Lock-free reads.
struct MemoryAccounting {
    current: AtomicUsize,
    peak: AtomicUsize,
    batch: AtomicUsize,
    transferred: AtomicUsize,
}

impl MemoryAccounting {
    const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            batch: AtomicUsize::new(0),
            transferred: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn on_alloc(&self, bytes: usize) {
        let prev = self.current.fetch_add(bytes, Ordering::Relaxed);
        self.peak.fetch_max(prev + bytes, Ordering::Relaxed);
        self.batch.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Batch-scoped allocations are dead once the batch is synchronized.
    #[inline]
    fn on_batch_end(&self) {
        let bytes = self.batch.swap(0, Ordering::Relaxed);
        self.current.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline]
    fn snapshot(&self) -> (usize, usize) {
        (
            self.current.load(Ordering::Relaxed),
            self.peak.load(Ordering::Relaxed),
        )
    }
}

/// Point-in-time view of a context, reported at the end of a run.
#[derive(Clone, Debug, Serialize)]
pub struct ContextSnapshot {
    pub device_id: usize,
    pub fences: u64,
    pub issued_ops: u64,
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub transferred_bytes: usize,
}

// ─── Stream ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct IssueLog {
    last: Option<StreamOp>,
    pending: usize,
    history: VecDeque<StreamOp>,
}

/// The single ordered execution queue of a run.
pub struct ExecutionStream {
    device_id: usize,
    #[cfg(feature = "cuda")]
    cuda: CudaStream,
    log: Mutex<IssueLog>,
    memory: MemoryAccounting,
    stats: Arc<ContextStats>,
}

impl ExecutionStream {
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Raw CUDA stream handle shared with external libraries.
    #[cfg(feature = "cuda")]
    pub fn cuda_stream(&self) -> &CudaStream {
        &self.cuda
    }

    /// Record that `stage` submits work for `batch`.
    ///
    /// Fails with a consistency error when the submission would run before
    /// work already issued (earlier stage in the same batch, or an older
    /// batch).
    pub fn issue(&self, batch: u64, stage: Stage) -> Result<()> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| EngineError::Consistency("stream issue log poisoned".into()))?;
        if let Some(last) = log.last {
            let backwards = batch < last.batch || (batch == last.batch && stage <= last.stage);
            if backwards {
                return Err(EngineError::Consistency(format!(
                    "stream issue order violated: {} for batch {batch} after {} for batch {}",
                    stage.name(),
                    last.stage.name(),
                    last.batch
                )));
            }
        }
        let op = StreamOp { batch, stage };
        log.last = Some(op);
        log.pending += 1;
        if log.history.len() == ISSUE_HISTORY {
            log.history.pop_front();
        }
        log.history.push_back(op);
        self.stats.issued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Block until every issued submission has completed.
    pub fn synchronize(&self) -> Result<()> {
        #[cfg(feature = "cuda")]
        {
            // SAFETY: `self.cuda.stream` is a live stream forked from the
            // context this stream's owner retains.
            unsafe { cudarc::driver::result::stream::synchronize(self.cuda.stream) }?;
        }
        if let Ok(mut log) = self.log.lock() {
            log.pending = 0;
        }
        self.stats.fences.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Submissions issued since the last synchronization.
    pub fn pending(&self) -> usize {
        self.log.lock().map(|log| log.pending).unwrap_or(0)
    }

    /// Most recent submissions, oldest first.
    pub fn history(&self) -> Vec<StreamOp> {
        self.log
            .lock()
            .map(|log| log.history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Allocate a batch-scoped tensor filled with `fill`.
    pub fn alloc<A: Clone>(&self, shape: (usize, usize, usize, usize), fill: A) -> Array4<A> {
        let array = Array4::from_elem(shape, fill);
        self.memory.on_alloc(array.len() * std::mem::size_of::<A>());
        array
    }

    /// Account an externally produced batch-scoped tensor.
    pub fn track<A>(&self, array: Array4<A>) -> Array4<A> {
        self.memory.on_alloc(array.len() * std::mem::size_of::<A>());
        array
    }

    /// Move `tensor` into `space`, accounting the copy when it crosses the
    /// host/device boundary.
    pub fn transfer(&self, tensor: FrameTensor, space: MemorySpace) -> FrameTensor {
        if tensor.space() == space {
            return tensor;
        }
        let bytes = tensor.byte_len();
        self.memory.transferred.fetch_add(bytes, Ordering::Relaxed);
        debug!(bytes, from = ?tensor.space(), to = ?space, "Tensor transfer");
        tensor.with_space(space)
    }

    /// `(current, peak)` bytes of batch-scoped allocations.
    pub fn memory_usage(&self) -> (usize, usize) {
        self.memory.snapshot()
    }

    /// Open the scope of batch `batch`.  The scope synchronizes the stream
    /// when finished or dropped.
    pub fn batch_scope(&self, batch: u64) -> BatchScope<'_> {
        BatchScope {
            stream: self,
            batch,
            finished: false,
        }
    }

    fn end_batch(&self) -> Result<()> {
        let synced = self.synchronize();
        self.memory.on_batch_end();
        synced
    }
}

/// Per-batch stream scope.  Exiting the scope is a synchronization point.
pub struct BatchScope<'a> {
    stream: &'a ExecutionStream,
    batch: u64,
    finished: bool,
}

impl BatchScope<'_> {
    pub fn batch(&self) -> u64 {
        self.batch
    }

    pub fn stream(&self) -> &ExecutionStream {
        self.stream
    }

    /// Record that `stage` submits work for this batch.
    pub fn issue(&self, stage: Stage) -> Result<()> {
        self.stream.issue(self.batch, stage)
    }

    /// Close the scope, surfacing synchronization errors.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.stream.end_batch()
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.stream.end_batch() {
            warn!(batch = self.batch, error = %e, "Batch scope synchronization failed");
        }
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// Device context plus its single execution stream.
///
/// Released exactly once: explicitly through [`ExecutionContext::release`] or
/// implicitly on drop, so every exit path of a run gives the device back.
pub struct ExecutionContext {
    device_id: usize,
    #[cfg(feature = "cuda")]
    device: Arc<CudaDevice>,
    stream: ExecutionStream,
    stats: Arc<ContextStats>,
    released: bool,
}

impl ExecutionContext {
    /// Acquire the context of `device_id`.
    pub fn acquire(device_id: usize) -> Result<Self> {
        Self::acquire_with_stats(device_id, ContextStats::new())
    }

    /// Acquire the context of `device_id`, reporting into `stats`.
    pub fn acquire_with_stats(device_id: usize, stats: Arc<ContextStats>) -> Result<Self> {
        #[cfg(feature = "cuda")]
        let (device, cuda) = {
            let device = CudaDevice::new(device_id)?;
            let cuda = device.fork_default_stream()?;
            (device, cuda)
        };

        stats.acquired.fetch_add(1, Ordering::AcqRel);
        info!(
            device_id,
            executor = Self::executor_name(),
            "Execution context acquired"
        );

        Ok(Self {
            device_id,
            #[cfg(feature = "cuda")]
            device,
            stream: ExecutionStream {
                device_id,
                #[cfg(feature = "cuda")]
                cuda,
                log: Mutex::new(IssueLog::default()),
                memory: MemoryAccounting::new(),
                stats: Arc::clone(&stats),
            },
            stats,
            released: false,
        })
    }

    /// `"cuda"` or `"host"`, depending on how the crate was built.
    pub fn executor_name() -> &'static str {
        if cfg!(feature = "cuda") { "cuda" } else { "host" }
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    #[cfg(feature = "cuda")]
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// The run's only stream.
    pub fn stream(&self) -> &ExecutionStream {
        &self.stream
    }

    pub fn stats(&self) -> &Arc<ContextStats> {
        &self.stats
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let (current_bytes, peak_bytes) = self.stream.memory_usage();
        ContextSnapshot {
            device_id: self.device_id,
            fences: self.stats.fences(),
            issued_ops: self.stats.issued(),
            current_bytes,
            peak_bytes,
            transferred_bytes: self.stream.memory.transferred.load(Ordering::Relaxed),
        }
    }

    /// Drain the stream and release the context.
    pub fn release(mut self) -> Result<ContextSnapshot> {
        let synced = self.stream.synchronize();
        let snapshot = self.snapshot();
        self.mark_released();
        synced.map(|_| snapshot)
    }

    fn mark_released(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stats.released.fetch_add(1, Ordering::AcqRel);
        info!(device_id = self.device_id, "Execution context released");
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.stream.synchronize() {
            warn!(device_id = self.device_id, error = %e, "Stream drain on context drop failed");
        }
        self.mark_released();
    }
}
