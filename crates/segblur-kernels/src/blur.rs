//! Background blur kernels.
//!
//! Separable box blur with clamped edges.  Repeating the box pass
//! `iterations` times approaches a Gaussian of the configured sigma.

use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use segblur_core::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    pub sigma: f32,
    pub iterations: u32,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            sigma: 12.0,
            iterations: 3,
        }
    }
}

impl BlurConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(EngineError::Configuration(
                "blur requires iterations > 0".into(),
            ));
        }
        if !self.sigma.is_finite() || self.sigma <= 0.0 {
            return Err(EngineError::Configuration(
                "blur requires finite sigma > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn radius(&self) -> usize {
        self.sigma.ceil().max(1.0) as usize
    }
}

/// Blur one `[H, W, 3]` frame.
pub fn box_blur(frame: ArrayView3<'_, u8>, cfg: &BlurConfig) -> Array3<u8> {
    let (h, w, c) = frame.dim();
    if h == 0 || w == 0 {
        return frame.to_owned();
    }
    let radius = cfg.radius();
    let mut a: Vec<f32> = frame.iter().map(|&v| v as f32).collect();
    let mut b = vec![0.0f32; a.len()];
    for _ in 0..cfg.iterations {
        blur_pass(&a, &mut b, w, h, c, radius, Direction::Horizontal);
        blur_pass(&b, &mut a, w, h, c, radius, Direction::Vertical);
    }
    let out: Vec<u8> = a.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect();
    Array3::from_shape_vec((h, w, c), out).unwrap_or_else(|_| frame.to_owned())
}

#[derive(Clone, Copy)]
enum Direction {
    Horizontal,
    Vertical,
}

/// One sliding-window box pass over interleaved `[H, W, C]` data.
fn blur_pass(
    src: &[f32],
    dst: &mut [f32],
    width: usize,
    height: usize,
    channels: usize,
    radius: usize,
    dir: Direction,
) {
    let (lines, len) = match dir {
        Direction::Horizontal => (height, width),
        Direction::Vertical => (width, height),
    };
    let index = |line: usize, pos: usize, ch: usize| match dir {
        Direction::Horizontal => (line * width + pos) * channels + ch,
        Direction::Vertical => (pos * width + line) * channels + ch,
    };
    let r = radius as isize;
    let last = len as isize - 1;
    let norm = 1.0 / (2 * radius + 1) as f32;

    for line in 0..lines {
        for ch in 0..channels {
            let at = |p: isize| src[index(line, p.clamp(0, last) as usize, ch)];
            let mut sum: f32 = (-r..=r).map(at).sum();
            for pos in 0..len {
                dst[index(line, pos, ch)] = sum * norm;
                let p = pos as isize;
                sum += at(p + r + 1) - at(p - r);
            }
        }
    }
}
