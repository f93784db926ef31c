#![doc = include_str!("../README.md")]

/// Directory-of-images [`segblur_core::codec_traits::MediaSink`].
pub mod image_sink;
/// Single-image or directory [`segblur_core::codec_traits::MediaSource`].
pub mod image_source;
/// Input classification and pre-acquisition checks.
pub mod modality;
/// ffmpeg-backed video source, sink, and probe.
pub mod video;

use std::path::Path;

use image::RgbImage;
use ndarray::ArrayView3;

use segblur_core::codec_traits::{MediaSink, MediaSource};
use segblur_core::error::{EngineError, Result};
use segblur_core::types::{Framerate, Modality};

pub use image_sink::ImageSink;
pub use image_source::{ImageSource, list_images};
pub use modality::{detect_modality, preflight};
pub use video::{VideoInfo, VideoSink, VideoSource, probe_video};

/// Copy an `[H, W, 3]` frame view into an owned RGB image.
pub fn frame_to_rgb(frame: ArrayView3<'_, u8>) -> Result<RgbImage> {
    let (h, w, c) = frame.dim();
    if c != 3 {
        return Err(EngineError::DimensionMismatch(format!(
            "expected 3 channels, got {c}"
        )));
    }
    let bytes: Vec<u8> = frame.iter().copied().collect();
    RgbImage::from_raw(w as u32, h as u32, bytes).ok_or_else(|| {
        EngineError::DimensionMismatch(format!("frame buffer does not fit {w}x{h}"))
    })
}

/// Open the source matching `modality`.
pub fn open_source(
    modality: Modality,
    input: &Path,
    batch_size: usize,
) -> Result<Box<dyn MediaSource>> {
    Ok(match modality {
        Modality::Images => Box::new(ImageSource::new(input, batch_size)?),
        Modality::Video => Box::new(VideoSource::open(input, batch_size)?),
    })
}

/// Open the sink matching `modality`.  Video sinks need the source framerate.
pub fn open_sink(
    modality: Modality,
    output_dir: &Path,
    input: &Path,
    framerate: Framerate,
) -> Result<Box<dyn MediaSink>> {
    Ok(match modality {
        Modality::Images => Box::new(ImageSink::new(output_dir)),
        Modality::Video => Box::new(VideoSink::new(output_dir, input, framerate)?),
    })
}
