//! Inference backend trait: the segmentation contract.

use std::fmt;
use std::str::FromStr;

use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionStream;
use crate::error::{EngineError, Result};

/// How the segmentation model is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Graph executed operator by operator; no ahead-of-time build.
    Interpreted,
    /// Graph compiled into an optimized engine before the first batch.
    Compiled,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interpreted => "interpreted",
            Self::Compiled => "compiled",
        }
    }

    /// Resolve a backend selector.  Unknown selectors are configuration
    /// errors.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "interpreted" | "pytorch" | "cuda" => Ok(Self::Interpreted),
            "compiled" | "tensorrt" | "trt" => Ok(Self::Compiled),
            other => Err(EngineError::Configuration(format!(
                "unknown inference backend '{other}' (expected 'interpreted' or 'compiled')"
            ))),
        }
    }
}

impl FromStr for BackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata extracted from a model's input/output tensor descriptors.
#[derive(Clone, Debug)]
pub struct ModelMetadata {
    /// Name of the model's input tensor node.
    pub input_name: String,
    /// Name of the model's output tensor node.
    pub output_name: String,
    /// Number of classes the model predicts per pixel.
    pub num_classes: usize,
}

/// Per-pixel class probabilities for one batch.
#[derive(Clone, Debug)]
pub struct InferenceResult {
    /// `[N, num_classes, H, W]`, softmax-normalized along the class axis.
    pub probabilities: Array4<f32>,
    /// Class selected for this run.
    pub class_index: usize,
}

impl InferenceResult {
    pub fn num_classes(&self) -> usize {
        self.probabilities.shape()[1]
    }
}

/// Segmentation inference backend.
///
/// Implementations resolve their class index at construction and submit all
/// device work on the run's shared stream.
pub trait InferenceBackend {
    /// Run the model on a normalized `[N, 3, H, W]` tensor.
    fn infer(&mut self, stream: &ExecutionStream, normalized: &Array4<f32>)
    -> Result<InferenceResult>;

    /// Index of the class whose pixels are kept sharp.
    fn class_index(&self) -> usize;

    fn kind(&self) -> BackendKind;
}
