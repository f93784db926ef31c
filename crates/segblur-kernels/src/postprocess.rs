//! Class-selective background blur.
//!
//! ```text
//!   probabilities[:, class] ─▶ mask [N,h,w] ─▶ joint bilateral (guide = resized)
//!                                                  │
//!                                    bilinear upsample to original H×W
//!                                                  │
//!   original ──┬───────────────────────────────────┤
//!              └─ box blur ─▶ blurred ─────────────┤
//!                                                  ▼
//!                      out = m·original + (1 − m)·blurred
//!                                                  │
//!                         sink layout + sink memory space
//! ```
//!
//! Where the mask is exactly 1 the original pixel is copied bit-for-bit.

use ndarray::{Array2, Array4, ArrayView2, ArrayView3, ArrayViewMut3, Axis, s};
use serde::{Deserialize, Serialize};

use segblur_core::context::ExecutionStream;
use segblur_core::error::{EngineError, Result};
use segblur_core::types::{FrameTensor, MemorySpace, TensorLayout};

use crate::blur::{BlurConfig, box_blur};

/// Edge-aware mask refinement parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefineConfig {
    pub radius: usize,
    /// Spatial falloff in pixels.
    pub sigma_space: f32,
    /// Guide luminance falloff, luminance in `[0, 1]`.
    pub sigma_color: f32,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            radius: 2,
            sigma_space: 2.0,
            sigma_color: 0.1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Postprocessor {
    layout: TensorLayout,
    space: MemorySpace,
    blur: BlurConfig,
    refine: Option<RefineConfig>,
}

impl Postprocessor {
    /// Build a postprocessor delivering frames in the sink's `layout` and
    /// memory `space`.
    pub fn new(layout: TensorLayout, space: MemorySpace, blur: BlurConfig) -> Result<Self> {
        blur.validate()?;
        Ok(Self {
            layout,
            space,
            blur,
            refine: Some(RefineConfig::default()),
        })
    }

    /// Replace (or disable, with `None`) the edge refinement step.
    pub fn with_refinement(mut self, refine: Option<RefineConfig>) -> Self {
        self.refine = refine;
        self
    }

    pub fn output_layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn output_space(&self) -> MemorySpace {
        self.space
    }

    pub fn apply(
        &self,
        stream: &ExecutionStream,
        probabilities: &Array4<f32>,
        original: &FrameTensor,
        resized: &FrameTensor,
        class_index: usize,
    ) -> Result<FrameTensor> {
        let (n, classes, ph, pw) = probabilities.dim();
        if class_index >= classes {
            return Err(EngineError::DimensionMismatch(format!(
                "class index {class_index} out of range for {classes} classes"
            )));
        }
        if n != original.batch_len() || n != resized.batch_len() {
            return Err(EngineError::DimensionMismatch(format!(
                "batch sizes differ: probabilities {n}, original {}, resized {}",
                original.batch_len(),
                resized.batch_len()
            )));
        }
        let model_size = resized.size();
        if (pw, ph) != (model_size.width as usize, model_size.height as usize) {
            return Err(EngineError::DimensionMismatch(format!(
                "probability map {pw}x{ph} does not match resized frames {model_size}"
            )));
        }

        let size = original.size();
        let (oh, ow) = (size.height as usize, size.width as usize);
        let mut out = stream.alloc((n, oh, ow, 3), 0u8);
        for i in 0..n {
            let plane = probabilities.slice(s![i, class_index, .., ..]);
            let mask = match &self.refine {
                Some(cfg) => joint_bilateral(plane, resized.frame(i), cfg),
                None => plane.to_owned(),
            };
            let mask = upsample_bilinear(mask.view(), oh, ow);
            let frame = original.frame(i);
            let blurred = box_blur(frame, &self.blur);
            composite(
                frame,
                blurred.view(),
                mask.view(),
                out.index_axis_mut(Axis(0), i),
            );
        }

        let out = FrameTensor::from_nhwc(out)?.into_layout(self.layout);
        Ok(stream.transfer(out, self.space))
    }
}

/// Smooth `mask` while respecting edges of `guide` (an `[h, w, 3]` frame).
pub fn joint_bilateral(
    mask: ArrayView2<'_, f32>,
    guide: ArrayView3<'_, u8>,
    cfg: &RefineConfig,
) -> Array2<f32> {
    let (h, w) = mask.dim();
    let luma = Array2::from_shape_fn((h, w), |(y, x)| {
        (0.299 * guide[[y, x, 0]] as f32
            + 0.587 * guide[[y, x, 1]] as f32
            + 0.114 * guide[[y, x, 2]] as f32)
            / 255.0
    });
    let r = cfg.radius as isize;
    let space_denom = 2.0 * cfg.sigma_space * cfg.sigma_space;
    let color_denom = 2.0 * cfg.sigma_color * cfg.sigma_color;

    Array2::from_shape_fn((h, w), |(y, x)| {
        let center = luma[[y, x]];
        let mut acc = 0.0f32;
        let mut norm = 0.0f32;
        for dy in -r..=r {
            let yy = y as isize + dy;
            if yy < 0 || yy >= h as isize {
                continue;
            }
            for dx in -r..=r {
                let xx = x as isize + dx;
                if xx < 0 || xx >= w as isize {
                    continue;
                }
                let (yy, xx) = (yy as usize, xx as usize);
                let d_lum = luma[[yy, xx]] - center;
                let weight = (-((dx * dx + dy * dy) as f32) / space_denom).exp()
                    * (-(d_lum * d_lum) / color_denom).exp();
                acc += weight * mask[[yy, xx]];
                norm += weight;
            }
        }
        if norm > 0.0 { acc / norm } else { mask[[y, x]] }
    })
}

/// Half-pixel-centred bilinear resize of a 2-D plane.
pub fn upsample_bilinear(src: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (h, w) = src.dim();
    if (h, w) == (out_h, out_w) {
        return src.to_owned();
    }
    let sy = h as f32 / out_h as f32;
    let sx = w as f32 / out_w as f32;
    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, (h - 1) as f32);
        let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, (w - 1) as f32);
        let (y0, x0) = (fy.floor() as usize, fx.floor() as usize);
        let (y1, x1) = ((y0 + 1).min(h - 1), (x0 + 1).min(w - 1));
        let (wy, wx) = (fy - y0 as f32, fx - x0 as f32);
        // lerp form: equal neighbours reproduce their value exactly
        let top = src[[y0, x0]] + (src[[y0, x1]] - src[[y0, x0]]) * wx;
        let bottom = src[[y1, x0]] + (src[[y1, x1]] - src[[y1, x0]]) * wx;
        top + (bottom - top) * wy
    })
}

/// Alpha-blend `original` over `blurred` with per-pixel weights `mask`.
pub fn composite(
    original: ArrayView3<'_, u8>,
    blurred: ArrayView3<'_, u8>,
    mask: ArrayView2<'_, f32>,
    mut out: ArrayViewMut3<'_, u8>,
) {
    for ((y, x, c), px) in out.indexed_iter_mut() {
        let m = mask[[y, x]].clamp(0.0, 1.0);
        let o = original[[y, x, c]];
        let b = blurred[[y, x, c]];
        *px = if m >= 1.0 {
            o
        } else if m <= 0.0 {
            b
        } else {
            (o as f32 * m + b as f32 * (1.0 - m)).round() as u8
        };
    }
}
