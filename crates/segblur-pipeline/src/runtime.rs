//! CLI/runtime bridge helpers.
//!
//! The orchestrator never names concrete sources, sinks, or backends; it asks
//! a [`StageProvider`] for them.  [`DefaultStageProvider`] wires the real
//! media and inference crates so callers only depend on this crate.
//!
//! Providers split their work around device acquisition: `inspect_input` and
//! `check_backend` must not touch a device and carry every source-open and
//! configuration failure the provider can detect up front.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use segblur_core::backend::InferenceBackend;
use segblur_core::codec_traits::{MediaSink, MediaSource};
use segblur_core::context::{ContextStats, ExecutionContext, ExecutionStream};
use segblur_core::error::{EngineError, Result};
use segblur_core::types::{Framerate, Modality};
use segblur_inference::BackendSpec;
use segblur_media::{VideoInfo, detect_modality, list_images, preflight, probe_video};

use crate::config::PipelineConfig;
use crate::pipeline::RunPlan;

/// Factory for everything the orchestrator drives.
///
/// Called only after the static run plan has validated, in the order
/// `inspect_input`, `check_backend`, `acquire_context`, `open_source`,
/// `open_sink`, `create_backend`.
pub trait StageProvider {
    /// Look at the input without a device: list the images or probe the
    /// container.  `modality` is the one the plan dispatched to.
    fn inspect_input(&mut self, config: &PipelineConfig, modality: Modality) -> Result<InputProbe>;

    /// Fail now if the backend `plan` selects could not be constructed.
    fn check_backend(&mut self, config: &PipelineConfig, plan: &RunPlan) -> Result<()>;

    fn acquire_context(&mut self, device_id: usize) -> Result<ExecutionContext>;

    fn open_source(
        &mut self,
        config: &PipelineConfig,
        modality: Modality,
        ctx: &ExecutionContext,
    ) -> Result<Box<dyn MediaSource>>;

    /// `framerate` is the paired source's rate ([`Framerate::ZERO`] for images).
    fn open_sink(
        &mut self,
        config: &PipelineConfig,
        modality: Modality,
        framerate: Framerate,
        ctx: &ExecutionContext,
    ) -> Result<Box<dyn MediaSink>>;

    fn create_backend(
        &mut self,
        config: &PipelineConfig,
        plan: &RunPlan,
        stream: &ExecutionStream,
    ) -> Result<Box<dyn InferenceBackend>>;
}

/// Production wiring: ffmpeg/image media and ONNX Runtime backends.
#[derive(Debug, Default)]
pub struct DefaultStageProvider {
    stats: Option<Arc<ContextStats>>,
}

impl DefaultStageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report context acquisition/release into `stats`.
    pub fn with_stats(stats: Arc<ContextStats>) -> Self {
        Self { stats: Some(stats) }
    }
}

fn backend_spec(config: &PipelineConfig, plan: &RunPlan) -> BackendSpec {
    BackendSpec {
        model_path: config.model_path.clone(),
        device_id: config.device_id,
        classes: plan.classes.clone(),
        class_name: config.class_name.clone(),
        batch_size: config.batch_size,
        input_size: config.target_size(),
        engine_cache_dir: config.engine_cache_dir(),
        fp16: config.fp16,
    }
}

impl StageProvider for DefaultStageProvider {
    fn inspect_input(&mut self, config: &PipelineConfig, modality: Modality) -> Result<InputProbe> {
        inspect(&config.input, modality)
    }

    fn check_backend(&mut self, config: &PipelineConfig, plan: &RunPlan) -> Result<()> {
        segblur_inference::check_backend(plan.backend, &backend_spec(config, plan))
    }

    fn acquire_context(&mut self, device_id: usize) -> Result<ExecutionContext> {
        match &self.stats {
            Some(stats) => ExecutionContext::acquire_with_stats(device_id, Arc::clone(stats)),
            None => ExecutionContext::acquire(device_id),
        }
    }

    fn open_source(
        &mut self,
        config: &PipelineConfig,
        modality: Modality,
        _ctx: &ExecutionContext,
    ) -> Result<Box<dyn MediaSource>> {
        segblur_media::open_source(modality, &config.input, config.batch_size)
    }

    fn open_sink(
        &mut self,
        config: &PipelineConfig,
        modality: Modality,
        framerate: Framerate,
        _ctx: &ExecutionContext,
    ) -> Result<Box<dyn MediaSink>> {
        segblur_media::open_sink(modality, &config.output_dir, &config.input, framerate)
    }

    fn create_backend(
        &mut self,
        config: &PipelineConfig,
        plan: &RunPlan,
        stream: &ExecutionStream,
    ) -> Result<Box<dyn InferenceBackend>> {
        segblur_inference::create_backend(plan.backend, &backend_spec(config, plan), stream)
    }
}

/// What `segblur probe` reports about an input path.
#[derive(Clone, Debug, Serialize)]
pub struct InputProbe {
    pub modality: Modality,
    /// Number of images for image collections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoInfo>,
}

impl InputProbe {
    /// The container's rate for video, [`Framerate::ZERO`] for images.
    pub fn framerate(&self) -> Framerate {
        self.video.map_or(Framerate::ZERO, |v| v.framerate)
    }
}

fn inspect(input: &Path, modality: Modality) -> Result<InputProbe> {
    match modality {
        Modality::Images => Ok(InputProbe {
            modality,
            images: Some(list_images(input)?.len()),
            video: None,
        }),
        Modality::Video => {
            let info = probe_video(input)?;
            if info.framerate.is_zero() {
                return Err(EngineError::Configuration(format!(
                    "{} reports no framerate; video output needs a non-zero rate",
                    input.display()
                )));
            }
            Ok(InputProbe {
                modality,
                images: None,
                video: Some(info),
            })
        }
    }
}

/// Inspect `input` without acquiring a device.
pub fn probe_input(input: &Path) -> Result<InputProbe> {
    preflight(input)?;
    inspect(input, detect_modality(input))
}
