//! Run configuration, resolved once before the pipeline starts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use segblur_core::error::{EngineError, Result};
use segblur_core::types::ImageSize;
use segblur_kernels::{BlurConfig, IMAGENET_MEAN, IMAGENET_STD, Preprocessor};

/// Immutable configuration of one segmentation run.
///
/// Layered as built-in defaults, then an optional JSON file (missing keys
/// keep their defaults), then explicit command-line flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Image file, directory of images, or video file.
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// ONNX segmentation model producing `[N, classes, H, W]` logits.
    pub model_path: PathBuf,
    /// Newline-separated class names replacing the PASCAL VOC table.
    pub labels_path: Option<PathBuf>,
    /// Class kept sharp: a name from the class table or a numeric index.
    pub class_name: String,
    pub batch_size: usize,
    pub target_width: u32,
    pub target_height: u32,
    pub device_id: usize,
    /// `interpreted` or `compiled` (plus aliases).  Parsed by the orchestrator
    /// so an invalid selector fails before any device work.
    pub backend: String,
    pub blur: BlurConfig,
    /// Per-channel normalization the model was trained with, on `[0, 1]` RGB.
    pub normalize_mean: [f32; 3],
    pub normalize_std: [f32; 3],
    /// Joint-bilateral refinement of the class mask before upsampling.
    pub refine_edges: bool,
    /// Allow FP16 kernels in the compiled backend.
    pub fp16: bool,
    /// Write `perf_<name>.json` into `output_dir` after the run.
    pub perf_report: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output_dir: PathBuf::from("/tmp"),
            model_path: PathBuf::from("fcn_resnet101.onnx"),
            labels_path: None,
            class_name: "__background__".into(),
            batch_size: 4,
            target_width: 224,
            target_height: 224,
            device_id: 0,
            backend: "compiled".into(),
            blur: BlurConfig::default(),
            normalize_mean: IMAGENET_MEAN,
            normalize_std: IMAGENET_STD,
            refine_edges: true,
            fp16: false,
            perf_report: false,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file.  Unknown keys are rejected so typos surface.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw).map_err(|e| match e {
            EngineError::Configuration(msg) => {
                EngineError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| EngineError::Configuration(format!("invalid config JSON: {e}")))?;
        if let Some(obj) = value.as_object() {
            let known = serde_json::to_value(Self::default())
                .map_err(|e| EngineError::Configuration(e.to_string()))?;
            for key in obj.keys() {
                if known.get(key).is_none() {
                    return Err(EngineError::Configuration(format!(
                        "unknown config key '{key}'"
                    )));
                }
            }
        }
        serde_json::from_value(value)
            .map_err(|e| EngineError::Configuration(format!("invalid config: {e}")))
    }

    pub fn target_size(&self) -> ImageSize {
        ImageSize::new(self.target_width, self.target_height)
    }

    /// Where the compiled backend caches built engines.
    pub fn engine_cache_dir(&self) -> PathBuf {
        self.output_dir.join("trt_cache")
    }

    /// Preprocessor for this run's normalization constants.
    pub fn preprocessor(&self) -> Result<Preprocessor> {
        Preprocessor::with_normalization(self.normalize_mean, self.normalize_std)
    }

    /// Reject values no stage can run with.
    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(EngineError::Configuration("input path is required".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Configuration(
                "batch size must be greater than zero".into(),
            ));
        }
        if self.target_width == 0 || self.target_height == 0 {
            return Err(EngineError::Configuration(format!(
                "target size must be non-zero, got {}",
                self.target_size()
            )));
        }
        if self.class_name.trim().is_empty() {
            return Err(EngineError::Configuration("class name is empty".into()));
        }
        self.preprocessor()?;
        self.blur.validate()
    }
}
