//! Image sink: writes `out_<input name>` per frame on a background writer.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use image::RgbImage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use segblur_core::codec_traits::{MediaSink, SinkOrder};
use segblur_core::context::ExecutionStream;
use segblur_core::error::{EngineError, Result};
use segblur_core::types::{Batch, MemorySpace, TensorLayout};

use crate::frame_to_rgb;

/// Batches in flight between `accept` and the writer thread.
const WRITE_QUEUE_DEPTH: usize = 4;

struct WriteJob {
    batch: u64,
    images: Vec<(PathBuf, RgbImage)>,
}

/// Encodes each frame to the format implied by its input file extension.
pub struct ImageSink {
    output_dir: PathBuf,
    order: SinkOrder,
    tx: Option<mpsc::Sender<WriteJob>>,
    worker: Option<JoinHandle<Result<u64>>>,
    written: u64,
    joined: bool,
    /// Message of a failed `join`, replayed by later calls.
    join_failure: Option<String>,
}

impl ImageSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            order: SinkOrder::default(),
            tx: None,
            worker: None,
            written: 0,
            joined: false,
            join_failure: None,
        }
    }

    /// Output file for an input unit named `unit`.
    pub fn output_path(&self, unit: &str) -> PathBuf {
        let name = if crate::modality::is_image_file(Path::new(unit)) {
            format!("out_{unit}")
        } else {
            format!("out_{unit}.png")
        };
        self.output_dir.join(name)
    }

    /// Frames written so far.  Final after [`MediaSink::join`].
    pub fn written(&self) -> u64 {
        self.written
    }

    fn collect_worker(&mut self) -> Result<()> {
        self.tx = None;
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let count = worker
            .join()
            .map_err(|_| EngineError::Encode("image writer thread panicked".into()))??;
        self.written = count;
        Ok(())
    }
}

fn write_images(mut rx: mpsc::Receiver<WriteJob>) -> Result<u64> {
    let mut count = 0u64;
    while let Some(job) = rx.blocking_recv() {
        for (path, img) in &job.images {
            img.save(path)
                .map_err(|e| EngineError::Encode(format!("{}: {e}", path.display())))?;
            count += 1;
        }
        debug!(batch = job.batch, images = job.images.len(), "Wrote image batch");
    }
    Ok(count)
}

impl MediaSink for ImageSink {
    fn start(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let worker = std::thread::Builder::new()
            .name("segblur-image-writer".into())
            .spawn(move || write_images(rx))?;
        self.tx = Some(tx);
        self.worker = Some(worker);
        info!(output_dir = %self.output_dir.display(), "Image sink started");
        Ok(())
    }

    fn accept(&mut self, batch: Batch, _stream: &ExecutionStream) -> Result<()> {
        if self.joined {
            return Err(EngineError::Consistency("image sink accepted after join()".into()));
        }
        self.order.admit(batch.index)?;
        if batch.units.len() != batch.len() {
            return Err(EngineError::Consistency(format!(
                "batch {} carries {} unit names for {} frames",
                batch.index,
                batch.units.len(),
                batch.len()
            )));
        }

        let mut images = Vec::with_capacity(batch.len());
        for (i, unit) in batch.units.iter().enumerate() {
            images.push((self.output_path(unit), frame_to_rgb(batch.frames.frame(i))?));
        }
        let job = WriteJob {
            batch: batch.index,
            images,
        };

        let Some(tx) = &self.tx else {
            return Err(EngineError::Consistency("image sink used before start()".into()));
        };
        if tx.blocking_send(job).is_err() {
            // The writer only hangs up after failing; surface its error.
            return Err(match self.collect_worker() {
                Err(e) => e,
                Ok(()) => EngineError::ChannelClosed,
            });
        }
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        if self.joined {
            return match &self.join_failure {
                Some(msg) => Err(EngineError::Encode(msg.clone())),
                None => Ok(()),
            };
        }
        self.joined = true;
        if let Err(e) = self.collect_worker() {
            self.join_failure = Some(e.to_string());
            return Err(e);
        }
        info!(images = self.written, "Image sink drained");
        Ok(())
    }

    fn input_layout(&self) -> TensorLayout {
        TensorLayout::Nchw
    }

    fn memory_space(&self) -> MemorySpace {
        MemorySpace::Host
    }
}

impl Drop for ImageSink {
    fn drop(&mut self) {
        if let Err(e) = self.collect_worker() {
            warn!(error = %e, "Image writer failed during drop");
        }
    }
}
