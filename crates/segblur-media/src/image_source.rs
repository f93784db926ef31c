//! Image-collection source: one file or every image in a directory.

use std::path::{Path, PathBuf};

use image::RgbImage;
use ndarray::{ArrayView3, Axis};
use tracing::{debug, info};

use segblur_core::codec_traits::MediaSource;
use segblur_core::context::ExecutionStream;
use segblur_core::error::{EngineError, Result};
use segblur_core::types::{Batch, FrameTensor, Framerate, Modality, unit_name};

use crate::modality::is_image_file;

/// Decodes images in file-name order into dense batches.
///
/// A batch never mixes frame sizes: an image whose dimensions differ from
/// the batch's first image closes the batch early and opens the next one.
pub struct ImageSource {
    input: PathBuf,
    batch_size: usize,
    files: Vec<PathBuf>,
    cursor: usize,
    pending: Option<(String, RgbImage)>,
    next_index: u64,
    started: bool,
}

impl ImageSource {
    pub fn new(input: impl Into<PathBuf>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(EngineError::Configuration(
                "batch size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            input: input.into(),
            batch_size,
            files: Vec::new(),
            cursor: 0,
            pending: None,
            next_index: 0,
            started: false,
        })
    }

    /// Files discovered by [`MediaSource::start`], in processing order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

/// Images `input` names, sorted: the file itself, or every supported image
/// in the directory.  An unreadable path or an empty directory is a
/// source-open error.
pub fn list_images(input: &Path) -> Result<Vec<PathBuf>> {
    if !input.is_dir() {
        std::fs::File::open(input).map_err(|e| EngineError::source_open(input, e.to_string()))?;
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(input)
        .map_err(|e| EngineError::source_open(input, e.to_string()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image_file(p))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(EngineError::source_open(
            input,
            "directory contains no supported images",
        ));
    }
    Ok(files)
}

impl ImageSource {
    fn decode(path: &Path) -> Result<RgbImage> {
        let img = image::open(path)
            .map_err(|e| EngineError::Decode(format!("{}: {e}", path.display())))?;
        Ok(img.to_rgb8())
    }
}

impl MediaSource for ImageSource {
    fn start(&mut self) -> Result<()> {
        self.files = list_images(&self.input)?;
        self.started = true;
        info!(
            input = %self.input.display(),
            images = self.files.len(),
            batch_size = self.batch_size,
            "Image source opened"
        );
        Ok(())
    }

    fn next_batch(&mut self, stream: &ExecutionStream) -> Result<Option<Batch>> {
        if !self.started {
            return Err(EngineError::Consistency(
                "image source read before start()".into(),
            ));
        }

        let mut frames: Vec<(String, RgbImage)> = Vec::with_capacity(self.batch_size);
        frames.extend(self.pending.take());
        while frames.len() < self.batch_size && self.cursor < self.files.len() {
            let path = &self.files[self.cursor];
            self.cursor += 1;
            let img = Self::decode(path)?;
            let name = unit_name(path);
            if let Some((_, first)) = frames.first()
                && first.dimensions() != img.dimensions()
            {
                debug!(image = %name, "Frame size changed; closing batch early");
                self.pending = Some((name, img));
                break;
            }
            frames.push((name, img));
        }

        let Some((_, first)) = frames.first() else {
            return Ok(None);
        };
        let (w, h) = first.dimensions();
        let (w, h) = (w as usize, h as usize);
        let mut data = stream.alloc((frames.len(), h, w, 3), 0u8);
        for (i, (_, img)) in frames.iter().enumerate() {
            let view = ArrayView3::from_shape((h, w, 3), img.as_raw())
                .map_err(|e| EngineError::DimensionMismatch(format!("decoded image: {e}")))?;
            data.index_axis_mut(Axis(0), i).assign(&view);
        }

        let index = self.next_index;
        self.next_index += 1;
        debug!(batch = index, frames = frames.len(), width = w, height = h, "Decoded image batch");
        Ok(Some(Batch {
            index,
            frames: FrameTensor::from_nhwc(data)?,
            modality: Modality::Images,
            units: frames.into_iter().map(|(name, _)| name).collect(),
        }))
    }

    fn framerate(&self) -> Framerate {
        Framerate::ZERO
    }

    fn modality(&self) -> Modality {
        Modality::Images
    }
}
