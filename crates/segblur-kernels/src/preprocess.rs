//! Resize + normalize: turns decoded frames into model input.
//!
//! ```text
//!   frames [N,H,W,3] u8 ──┬──────────────────────────────▶ original
//!                         └─ resize (triangle) ─▶ [N,h,w,3] u8 ─▶ resized
//!                                                    │
//!                          (x/255 − mean) / std ◀────┘
//!                                  ▼
//!                        [N,3,h,w] f32 ─▶ normalized
//! ```

use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::{Array4, ArrayView3, Axis};

use segblur_core::context::ExecutionStream;
use segblur_core::error::{EngineError, Result};
use segblur_core::types::{FrameTensor, ImageSize};

/// Per-channel ImageNet mean used by torchvision segmentation models.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel ImageNet standard deviation.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Output of [`Preprocessor::apply`].
pub struct Preprocessed {
    /// The input frames, untouched.
    pub original: FrameTensor,
    /// `[N, h, w, 3]` frames at model resolution.
    pub resized: FrameTensor,
    /// `[N, 3, h, w]` normalized model input.
    pub normalized: Array4<f32>,
}

#[derive(Clone, Debug)]
pub struct Preprocessor {
    mean: [f32; 3],
    std: [f32; 3],
    filter: FilterType,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            filter: FilterType::Triangle,
        }
    }
}

impl Preprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom per-channel normalization constants.
    pub fn with_normalization(mean: [f32; 3], std: [f32; 3]) -> Result<Self> {
        if std.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(EngineError::Configuration(format!(
                "normalization std must be finite and > 0, got {std:?}"
            )));
        }
        Ok(Self {
            mean,
            std,
            ..Self::default()
        })
    }

    /// Resize `frames` to `out_size` and normalize them.
    pub fn apply(
        &self,
        stream: &ExecutionStream,
        frames: FrameTensor,
        out_size: ImageSize,
    ) -> Result<Preprocessed> {
        if out_size.width == 0 || out_size.height == 0 {
            return Err(EngineError::Configuration(format!(
                "preprocess target size must be non-zero, got {out_size}"
            )));
        }
        let n = frames.batch_len();
        let (ow, oh) = (out_size.width as usize, out_size.height as usize);
        let same_size = frames.size() == out_size;

        let mut resized = stream.alloc((n, oh, ow, 3), 0u8);
        for i in 0..n {
            let frame = frames.frame(i);
            let mut slot = resized.index_axis_mut(Axis(0), i);
            if same_size {
                slot.assign(&frame);
                continue;
            }
            let scaled = imageops::resize(
                &to_rgb_image(frame)?,
                out_size.width,
                out_size.height,
                self.filter,
            );
            let view = ArrayView3::from_shape((oh, ow, 3), scaled.as_raw())
                .map_err(|e| EngineError::DimensionMismatch(format!("resized frame: {e}")))?;
            slot.assign(&view);
        }

        let mut normalized = stream.alloc((n, 3, oh, ow), 0f32);
        for ((b, y, x, c), &v) in resized.indexed_iter() {
            normalized[[b, c, y, x]] = (v as f32 / 255.0 - self.mean[c]) / self.std[c];
        }

        Ok(Preprocessed {
            original: frames,
            resized: FrameTensor::from_nhwc(resized)?,
            normalized,
        })
    }
}

/// Copy an `[H, W, 3]` view into an owned `RgbImage`.
pub fn to_rgb_image(frame: ArrayView3<'_, u8>) -> Result<RgbImage> {
    let (h, w, _) = frame.dim();
    let raw: Vec<u8> = frame.iter().copied().collect();
    RgbImage::from_raw(w as u32, h as u32, raw).ok_or_else(|| {
        EngineError::DimensionMismatch(format!("frame buffer does not match {w}x{h} RGB"))
    })
}
