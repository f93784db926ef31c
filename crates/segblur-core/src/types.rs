//! Batch and tensor data model shared by every stage.
//!
//! Frames travel through the pipeline as one dense 4-D `u8` tensor per batch.
//! The logical shape is always `[N, H, W, C]`; the physical axis order is
//! described by [`TensorLayout`] so the postprocessor can hand the sink
//! exactly the layout it declared.

use std::fmt;
use std::path::Path;

use ndarray::{Array4, ArrayView3, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Channels per frame.  Frames are packed RGB.
pub const FRAME_CHANNELS: usize = 3;

// ─── Modality ────────────────────────────────────────────────────────────────

/// Kind of media a run processes.  Chosen once from the input path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// A single image file or a directory of images.
    Images,
    /// A single video container.
    Video,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Layout / memory space ───────────────────────────────────────────────────

/// Physical axis order of a frame tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TensorLayout {
    /// `[N, H, W, C]`: interleaved pixels.
    Nhwc,
    /// `[N, C, H, W]`: planar channels.
    Nchw,
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nhwc => f.write_str("NHWC"),
            Self::Nchw => f.write_str("NCHW"),
        }
    }
}

/// Where a tensor's backing memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySpace {
    Host,
    Device,
}

// ─── Framerate ───────────────────────────────────────────────────────────────

/// Rational framerate.  Image collections report [`Framerate::ZERO`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const ZERO: Self = Self { num: 0, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        Self {
            num,
            den: den.max(1),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den.max(1) as f64
    }

    /// Parse `"30000/1001"`, `"25/1"` or a bare integer `"30"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (num, den) = match raw.split_once('/') {
            Some((n, d)) => (n.trim(), d.trim()),
            None => (raw, "1"),
        };
        let num = num
            .parse::<u32>()
            .map_err(|_| EngineError::Configuration(format!("invalid framerate '{raw}'")))?;
        let den = den
            .parse::<u32>()
            .map_err(|_| EngineError::Configuration(format!("invalid framerate '{raw}'")))?;
        if den == 0 {
            // ffprobe reports "0/0" for streams without a declared rate.
            return Ok(Self::ZERO);
        }
        Ok(Self { num, den })
    }
}

impl fmt::Display for Framerate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Spatial size in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ─── Frame tensor ────────────────────────────────────────────────────────────

/// Dense batch of 8-bit RGB frames.
#[derive(Clone, Debug)]
pub struct FrameTensor {
    data: Array4<u8>,
    layout: TensorLayout,
    space: MemorySpace,
}

impl FrameTensor {
    /// Wrap an array whose axes follow `layout`.
    pub fn new(data: Array4<u8>, layout: TensorLayout, space: MemorySpace) -> Result<Self> {
        let channels = match layout {
            TensorLayout::Nhwc => data.len_of(Axis(3)),
            TensorLayout::Nchw => data.len_of(Axis(1)),
        };
        if channels != FRAME_CHANNELS {
            return Err(EngineError::DimensionMismatch(format!(
                "frame tensor must have {FRAME_CHANNELS} channels, got {channels} ({layout})"
            )));
        }
        Ok(Self {
            data,
            layout,
            space,
        })
    }

    /// Wrap an `[N, H, W, 3]` host array.
    pub fn from_nhwc(data: Array4<u8>) -> Result<Self> {
        Self::new(data, TensorLayout::Nhwc, MemorySpace::Host)
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn batch_len(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn size(&self) -> ImageSize {
        let (h, w) = match self.layout {
            TensorLayout::Nhwc => (self.data.len_of(Axis(1)), self.data.len_of(Axis(2))),
            TensorLayout::Nchw => (self.data.len_of(Axis(2)), self.data.len_of(Axis(3))),
        };
        ImageSize::new(w as u32, h as u32)
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Raw array in the tensor's own layout.
    pub fn data(&self) -> &Array4<u8> {
        &self.data
    }

    pub fn into_data(self) -> Array4<u8> {
        self.data
    }

    /// Logical `[N, H, W, C]` view regardless of physical layout.
    pub fn nhwc_view(&self) -> ArrayView4<'_, u8> {
        match self.layout {
            TensorLayout::Nhwc => self.data.view(),
            TensorLayout::Nchw => self.data.view().permuted_axes([0, 2, 3, 1]),
        }
    }

    /// Frame `n` as an `[H, W, C]` view.
    pub fn frame(&self, n: usize) -> ArrayView3<'_, u8> {
        self.nhwc_view().index_axis_move(Axis(0), n)
    }

    /// Re-pack into `layout`.  A no-op when the layout already matches.
    pub fn into_layout(self, layout: TensorLayout) -> Self {
        if self.layout == layout {
            return self;
        }
        let data = match layout {
            TensorLayout::Nhwc => self.data.permuted_axes([0, 2, 3, 1]),
            TensorLayout::Nchw => self.data.permuted_axes([0, 3, 1, 2]),
        };
        Self {
            data: data.as_standard_layout().into_owned(),
            layout,
            space: self.space,
        }
    }

    /// Re-tag the memory space.  Only [`crate::context::ExecutionStream::transfer`]
    /// should call this, so copies are accounted.
    pub(crate) fn with_space(mut self, space: MemorySpace) -> Self {
        self.space = space;
        self
    }
}

// ─── Batch ───────────────────────────────────────────────────────────────────

/// One unit of work flowing from source to sink.
#[derive(Clone, Debug)]
pub struct Batch {
    /// Monotonically increasing from 0 within a run, no gaps.
    pub index: u64,
    /// `N ≤ batch_size` frames of identical size.
    pub frames: FrameTensor,
    pub modality: Modality,
    /// Per-frame source unit names (image file names, or the video file name
    /// repeated).  Sinks derive output names from these.
    pub units: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.frames.batch_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// File name component of `path` as an owned string, or `"input"`.
pub fn unit_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, h: usize, w: usize) -> Array4<u8> {
        Array4::from_shape_fn((n, h, w, 3), |(b, y, x, c)| {
            (b * 50 + y * 10 + x * 3 + c) as u8
        })
    }

    #[test]
    fn framerate_parses_ntsc_and_integer_forms() {
        let ntsc = Framerate::parse("30000/1001").unwrap();
        assert_eq!(ntsc, Framerate::new(30000, 1001));
        assert!((ntsc.as_f64() - 29.97).abs() < 0.01);
        assert_eq!(Framerate::parse("25").unwrap(), Framerate::new(25, 1));
        assert!(Framerate::parse("0/0").unwrap().is_zero());
        assert!(Framerate::parse("abc").is_err());
    }

    #[test]
    fn layout_round_trip_preserves_pixels() {
        let t = FrameTensor::from_nhwc(ramp(2, 3, 4)).unwrap();
        let planar = t.clone().into_layout(TensorLayout::Nchw);
        assert_eq!(planar.data().shape(), &[2, 3, 3, 4]);
        assert_eq!(planar.size(), ImageSize::new(4, 3));
        assert_eq!(planar.nhwc_view(), t.nhwc_view());
        let back = planar.into_layout(TensorLayout::Nhwc);
        assert_eq!(back.data(), t.data());
    }

    #[test]
    fn rejects_non_rgb_tensors() {
        let gray = Array4::<u8>::zeros((1, 2, 2, 1));
        assert!(FrameTensor::from_nhwc(gray).is_err());
    }

    #[test]
    fn frame_view_selects_one_image() {
        let t = FrameTensor::from_nhwc(ramp(2, 2, 2)).unwrap();
        let second = t.frame(1);
        assert_eq!(second.shape(), &[2, 2, 3]);
        assert_eq!(second[[0, 0, 0]], 50);
    }
}
