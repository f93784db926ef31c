#![allow(missing_docs)]
//! Stub backends for builds without `ort-runtime`.
//!
//! The class selector is still resolved so configuration errors surface the
//! same way; construction then fails with an actionable message.

use ndarray::Array4;

use segblur_core::backend::{BackendKind, InferenceBackend, InferenceResult};
use segblur_core::context::ExecutionStream;
use segblur_core::error::{EngineError, Result};

use crate::BackendSpec;

fn unavailable(kind: BackendKind) -> EngineError {
    EngineError::Configuration(format!(
        "{kind} backend unavailable: segblur-inference was built without `ort-runtime`; \
rebuild with `--features ort-runtime`"
    ))
}

pub fn check_available(kind: BackendKind, spec: &BackendSpec) -> Result<()> {
    spec.classes.resolve(&spec.class_name)?;
    Err(unavailable(kind))
}

pub struct InterpretedBackend {
    class_index: usize,
}

impl InterpretedBackend {
    pub fn new(spec: &BackendSpec, _stream: &ExecutionStream) -> Result<Self> {
        let _class_index = spec.classes.resolve(&spec.class_name)?;
        Err(unavailable(BackendKind::Interpreted))
    }
}

impl InferenceBackend for InterpretedBackend {
    fn infer(&mut self, _stream: &ExecutionStream, _normalized: &Array4<f32>) -> Result<InferenceResult> {
        Err(unavailable(BackendKind::Interpreted))
    }

    fn class_index(&self) -> usize {
        self.class_index
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Interpreted
    }
}

pub struct CompiledBackend {
    class_index: usize,
}

impl CompiledBackend {
    pub fn new(spec: &BackendSpec, _stream: &ExecutionStream) -> Result<Self> {
        let _class_index = spec.classes.resolve(&spec.class_name)?;
        Err(unavailable(BackendKind::Compiled))
    }
}

impl InferenceBackend for CompiledBackend {
    fn infer(&mut self, _stream: &ExecutionStream, _normalized: &Array4<f32>) -> Result<InferenceResult> {
        Err(unavailable(BackendKind::Compiled))
    }

    fn class_index(&self) -> usize {
        self.class_index
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Compiled
    }
}
