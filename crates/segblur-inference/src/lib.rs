#![doc = include_str!("../README.md")]

use std::path::PathBuf;

use segblur_core::backend::{BackendKind, InferenceBackend};
use segblur_core::context::ExecutionStream;
use segblur_core::error::Result;
use segblur_core::types::ImageSize;

pub mod classes;
pub mod tensor_ops;

#[cfg(feature = "ort-runtime")]
pub mod onnx;
#[cfg(not(feature = "ort-runtime"))]
#[path = "onnx_stub.rs"]
pub mod onnx;

pub use classes::{ClassTable, VOC_CLASSES};
pub use onnx::{CompiledBackend, InterpretedBackend};
pub use tensor_ops::{argmax_agreement, softmax_classes};

/// Everything a backend needs at construction.
#[derive(Clone, Debug)]
pub struct BackendSpec {
    pub model_path: PathBuf,
    pub device_id: usize,
    pub classes: ClassTable,
    /// Class name or numeric index, resolved against `classes`.
    pub class_name: String,
    pub batch_size: usize,
    /// Model input resolution.
    pub input_size: ImageSize,
    /// Where the compiled backend caches built engines.
    pub engine_cache_dir: PathBuf,
    pub fp16: bool,
}

/// Fail with a configuration error if `kind` cannot be built from `spec`:
/// unknown class, missing model file, or a build without the runtime.
///
/// Needs no device, so callers run it before acquiring one.
pub fn check_backend(kind: BackendKind, spec: &BackendSpec) -> Result<()> {
    onnx::check_available(kind, spec)
}

/// Construct the backend selected by `kind`.
pub fn create_backend(
    kind: BackendKind,
    spec: &BackendSpec,
    stream: &ExecutionStream,
) -> Result<Box<dyn InferenceBackend>> {
    Ok(match kind {
        BackendKind::Interpreted => Box::new(InterpretedBackend::new(spec, stream)?),
        BackendKind::Compiled => Box::new(CompiledBackend::new(spec, stream)?),
    })
}
