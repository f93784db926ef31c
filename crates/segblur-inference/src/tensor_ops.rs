//! Host-side tensor helpers shared by both backends.

use ndarray::{Array4, Axis};

use segblur_core::error::{EngineError, Result};

/// Numerically stable softmax along the class axis of `[N, C, H, W]` logits.
pub fn softmax_classes(logits: &mut Array4<f32>) {
    for mut pixel in logits.lanes_mut(Axis(1)) {
        let max = pixel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for v in pixel.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        if sum > 0.0 {
            pixel.mapv_inplace(|v| v / sum);
        }
    }
}

/// Fraction of pixels on which two `[N, C, H, W]` maps pick the same class.
pub fn argmax_agreement(a: &Array4<f32>, b: &Array4<f32>) -> Result<f64> {
    if a.shape() != b.shape() {
        return Err(EngineError::DimensionMismatch(format!(
            "cannot compare probability maps {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let argmax = |lane: ndarray::ArrayView1<'_, f32>| {
        lane.iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                if v > best.1 { (i, v) } else { best }
            })
            .0
    };
    let mut total = 0usize;
    let mut same = 0usize;
    for (la, lb) in a.lanes(Axis(1)).into_iter().zip(b.lanes(Axis(1))) {
        total += 1;
        if argmax(la) == argmax(lb) {
            same += 1;
        }
    }
    if total == 0 {
        return Ok(1.0);
    }
    Ok(same as f64 / total as f64)
}
