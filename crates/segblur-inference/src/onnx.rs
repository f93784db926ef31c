//! ONNX Runtime segmentation backends.
//!
//! Both variants load the same ONNX graph and differ only in how it is
//! executed:
//!
//! | Backend | Execution provider | Startup | Steady state |
//! |---|---|---|---|
//! | [`InterpretedBackend`] | CUDA EP, basic graph optimizations | fast | slower |
//! | [`CompiledBackend`] | TensorRT EP, engine cache on disk | engine build + warm-up | faster |
//!
//! Model outputs are treated as per-pixel class logits and softmaxed on the
//! host before they leave the backend.

use std::path::Path;

use ndarray::Array4;
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use tracing::{debug, info};

use segblur_core::backend::{BackendKind, InferenceBackend, InferenceResult, ModelMetadata};
use segblur_core::context::ExecutionStream;
use segblur_core::error::{EngineError, Result};

use crate::BackendSpec;
use crate::tensor_ops::softmax_classes;

fn ort_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Inference(e.to_string())
}

fn ensure_model(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(EngineError::Configuration(format!(
            "model file not found: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Everything construction checks that does not need a device: the class
/// selector and the model file.
pub fn check_available(_kind: BackendKind, spec: &BackendSpec) -> Result<()> {
    spec.classes.resolve(&spec.class_name)?;
    ensure_model(&spec.model_path)
}

// ─── Shared session wrapper ──────────────────────────────────────────────────

struct OrtSegmenter {
    session: Session,
    meta: ModelMetadata,
    class_index: usize,
}

impl OrtSegmenter {
    fn new(session: Session, spec: &BackendSpec, class_index: usize) -> Result<Self> {
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| EngineError::Inference("model declares no inputs".into()))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| EngineError::Inference("model declares no outputs".into()))?;
        info!(
            model = %spec.model_path.display(),
            input = %input_name,
            output = %output_name,
            classes = spec.classes.len(),
            class_index,
            "Segmentation model loaded"
        );
        Ok(Self {
            session,
            meta: ModelMetadata {
                input_name,
                output_name,
                num_classes: spec.classes.len(),
            },
            class_index,
        })
    }

    fn run(&mut self, stream: &ExecutionStream, normalized: &Array4<f32>) -> Result<InferenceResult> {
        // Preprocess output must be complete before the runtime reads it.
        stream.synchronize()?;

        let input = Tensor::from_array(normalized.to_owned()).map_err(ort_err)?;
        let outputs = self
            .session
            .run(ort::inputs![self.meta.input_name.as_str() => input])
            .map_err(ort_err)?;
        let output = outputs.get(self.meta.output_name.as_str()).ok_or_else(|| {
            EngineError::Inference(format!("missing output '{}'", self.meta.output_name))
        })?;
        let (shape, data) = output.try_extract_tensor::<f32>().map_err(ort_err)?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        let [n, c, h, w] = dims[..] else {
            return Err(EngineError::Inference(format!(
                "expected 4-D logits, got shape {dims:?}"
            )));
        };
        if c != self.meta.num_classes {
            return Err(EngineError::DimensionMismatch(format!(
                "model predicts {c} classes, class table has {}",
                self.meta.num_classes
            )));
        }
        let mut probabilities = Array4::from_shape_vec((n, c, h, w), data.to_vec())
            .map_err(|e| EngineError::DimensionMismatch(format!("logits: {e}")))?;
        softmax_classes(&mut probabilities);
        debug!(batch = n, classes = c, height = h, width = w, "Inference complete");

        Ok(InferenceResult {
            probabilities,
            class_index: self.class_index,
        })
    }
}

// ─── Interpreted ─────────────────────────────────────────────────────────────

/// Executes the graph node by node through the CUDA execution provider.
pub struct InterpretedBackend {
    inner: OrtSegmenter,
}

impl InterpretedBackend {
    pub fn new(spec: &BackendSpec, _stream: &ExecutionStream) -> Result<Self> {
        let class_index = spec.classes.resolve(&spec.class_name)?;
        ensure_model(&spec.model_path)?;

        let cuda_ep = CUDAExecutionProvider::default().with_device_id(spec.device_id as i32);
        let session = Session::builder()
            .map_err(ort_err)?
            .with_execution_providers([cuda_ep.build().error_on_failure()])
            .map_err(ort_err)?
            .with_optimization_level(GraphOptimizationLevel::Level1)
            .map_err(ort_err)?
            .with_intra_threads(1)
            .map_err(ort_err)?
            .commit_from_file(&spec.model_path)
            .map_err(ort_err)?;

        Ok(Self {
            inner: OrtSegmenter::new(session, spec, class_index)?,
        })
    }
}

impl InferenceBackend for InterpretedBackend {
    fn infer(&mut self, stream: &ExecutionStream, normalized: &Array4<f32>) -> Result<InferenceResult> {
        self.inner.run(stream, normalized)
    }

    fn class_index(&self) -> usize {
        self.inner.class_index
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Interpreted
    }
}

// ─── Compiled ────────────────────────────────────────────────────────────────

/// Compiles the graph into a TensorRT engine before the first batch.
///
/// The engine is cached under `spec.engine_cache_dir`; later runs with the
/// same model and shapes load it instead of rebuilding.
pub struct CompiledBackend {
    inner: OrtSegmenter,
}

impl CompiledBackend {
    pub fn new(spec: &BackendSpec, stream: &ExecutionStream) -> Result<Self> {
        let class_index = spec.classes.resolve(&spec.class_name)?;
        ensure_model(&spec.model_path)?;
        std::fs::create_dir_all(&spec.engine_cache_dir)?;

        let mut trt_ep = TensorRTExecutionProvider::default()
            .with_device_id(spec.device_id as i32)
            .with_engine_cache(true)
            .with_engine_cache_path(spec.engine_cache_dir.to_string_lossy().to_string());
        if spec.fp16 {
            trt_ep = trt_ep.with_fp16(true);
            info!("TRT precision: FP16 mixed precision");
        } else {
            info!("TRT precision: FP32");
        }

        let session = Session::builder()
            .map_err(ort_err)?
            .with_execution_providers([trt_ep.build().error_on_failure()])
            .map_err(ort_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_err)?
            .with_intra_threads(1)
            .map_err(ort_err)?
            .commit_from_file(&spec.model_path)
            .map_err(ort_err)?;

        let mut backend = Self {
            inner: OrtSegmenter::new(session, spec, class_index)?,
        };
        backend.warm_up(spec, stream)?;
        Ok(backend)
    }

    /// Run one zero batch so engine construction happens now, not on the
    /// first real batch.
    fn warm_up(&mut self, spec: &BackendSpec, stream: &ExecutionStream) -> Result<()> {
        let started = std::time::Instant::now();
        let zeros = Array4::<f32>::zeros((
            spec.batch_size,
            3,
            spec.input_size.height as usize,
            spec.input_size.width as usize,
        ));
        self.inner.run(stream, &zeros)?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            cache = %spec.engine_cache_dir.display(),
            "Compiled engine ready"
        );
        Ok(())
    }
}

impl InferenceBackend for CompiledBackend {
    fn infer(&mut self, stream: &ExecutionStream, normalized: &Array4<f32>) -> Result<InferenceResult> {
        self.inner.run(stream, normalized)
    }

    fn class_index(&self) -> usize {
        self.inner.class_index
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Compiled
    }
}
