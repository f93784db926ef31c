//! Batched segmentation pipeline: decode → preprocess → infer → postprocess → encode.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────── one ExecutionStream ─────────────────────┐
//! source ──► │ decode ─► preprocess ─► inference ─► postprocess ─► encode   │ ──► sink
//!            └─────────────── BatchScope: sync on exit ─────────────────────┘
//! ```
//!
//! Host control flow is single-threaded.  Every stage of batch *N* is issued
//! onto the shared stream before any stage of batch *N + 1*; the scope exit at
//! the end of each iteration is a synchronization point.
//!
//! # Lifecycle
//!
//! `Init → Running → Draining → Done`.  Validation that can fail without a
//! device runs before the context is acquired: the static plan (backend
//! selector, configuration values, class name, input path) and then the
//! provider's input inspection and backend check.  A stage error moves
//! straight to `Done`; the context is released on every path.
//!
//! # Instrumentation
//!
//! Ranges nest as `run › pipeline › batch › <stage>`.  Each range is closed on
//! both the success and the error path, so the recorder is always balanced
//! when [`SegmentationPipeline::run`] finalizes it.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use segblur_core::backend::{BackendKind, InferenceBackend};
use segblur_core::codec_traits::{MediaSink, MediaSource};
use segblur_core::context::{ContextSnapshot, ExecutionStream, Stage};
use segblur_core::error::{EngineError, Result};
use segblur_core::perf::{PerfRecorder, PerfReport};
use segblur_core::types::Modality;
use segblur_inference::ClassTable;
use segblur_kernels::{Postprocessor, Preprocessor, RefineConfig};
use segblur_media::{detect_modality, preflight};

use crate::config::PipelineConfig;
use crate::runtime::{InputProbe, StageProvider};

/// Name of the run's [`PerfRecorder`]; the JSON report is `perf_<name>.json`.
pub const PERF_RECORDER_NAME: &str = "segmentation";

/// Batch-loop state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Init,
    Running,
    Draining,
    Done,
}

/// Everything resolved before a device is touched.
#[derive(Clone, Debug)]
pub struct RunPlan {
    pub backend: BackendKind,
    pub modality: Modality,
    pub classes: ClassTable,
    pub class_index: usize,
    /// Filled by [`SegmentationPipeline::prepare`]; `None` from the static
    /// [`SegmentationPipeline::plan`].
    pub input: Option<InputProbe>,
}

impl RunPlan {
    pub fn class_label(&self) -> &str {
        self.classes.name(self.class_index).unwrap_or("?")
    }
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunSummary {
    pub batches: u64,
    pub frames: u64,
    pub modality: Modality,
    pub backend: BackendKind,
    pub class_index: usize,
    /// Instrumentation failures land here instead of failing the run.
    pub perf: Result<PerfReport>,
    pub context: ContextSnapshot,
}

struct Progress {
    batches: u64,
    frames: u64,
}

struct Completed {
    plan: RunPlan,
    progress: Progress,
    context: ContextSnapshot,
}

/// Per-run stage set.  Borrowed by the batch loop.
struct Stages<'a> {
    source: &'a mut dyn MediaSource,
    sink: &'a mut dyn MediaSink,
    backend: &'a mut dyn InferenceBackend,
    preprocessor: &'a Preprocessor,
    postprocessor: &'a Postprocessor,
    class_index: usize,
}

/// Drives one run of the segmentation effect.
pub struct SegmentationPipeline {
    config: PipelineConfig,
    state: PipelineState,
    transitions: Vec<PipelineState>,
    perf: PerfRecorder,
}

impl SegmentationPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            state: PipelineState::Init,
            transitions: vec![PipelineState::Init],
            perf: PerfRecorder::new(PERF_RECORDER_NAME),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, starting with `Init`.
    pub fn transitions(&self) -> &[PipelineState] {
        &self.transitions
    }

    fn transition(&mut self, to: PipelineState) {
        debug!(from = ?self.state, to = ?to, "Pipeline state");
        self.state = to;
        self.transitions.push(to);
    }

    /// Pre-acquisition validation.  Pure apart from reading the input path's
    /// metadata and the optional labels file.
    pub fn plan(&self) -> Result<RunPlan> {
        let backend = BackendKind::parse(&self.config.backend)?;
        self.config.validate()?;
        let classes = ClassTable::load(self.config.labels_path.as_deref())?;
        let class_index = classes.resolve(&self.config.class_name)?;
        let modality = detect_modality(&self.config.input);
        preflight(&self.config.input)?;
        Ok(RunPlan {
            backend,
            modality,
            classes,
            class_index,
            input: None,
        })
    }

    /// [`plan`](Self::plan), then the provider's input inspection and
    /// backend check.  Nothing here acquires a device.
    pub fn prepare<P: StageProvider + ?Sized>(&self, provider: &mut P) -> Result<RunPlan> {
        let mut plan = self.plan()?;
        let input = provider.inspect_input(&self.config, plan.modality)?;
        if input.modality != plan.modality {
            return Err(EngineError::Consistency(format!(
                "input inspected as {} but the run dispatched to {}",
                input.modality, plan.modality
            )));
        }
        if plan.modality == Modality::Video && input.framerate().is_zero() {
            return Err(EngineError::Configuration(format!(
                "{} reports no framerate; video output needs a non-zero rate",
                self.config.input.display()
            )));
        }
        plan.input = Some(input);
        provider.check_backend(&self.config, &plan)?;
        Ok(plan)
    }

    /// Run the pipeline to end of stream.
    ///
    /// # Guarantees
    ///
    /// When this returns:
    /// 1. The execution context has been released exactly once.
    /// 2. The sink has been joined (success path) or dropped (error path).
    /// 3. The perf recorder has been finalized and its report emitted.
    #[instrument(skip_all, name = "segmentation_pipeline")]
    pub fn run<P: StageProvider + ?Sized>(&mut self, provider: &mut P) -> Result<RunSummary> {
        if self.state != PipelineState::Init {
            return Err(EngineError::Consistency(format!(
                "pipeline already ran (state {:?})",
                self.state
            )));
        }

        let run_token = self.perf.push_range("run", &[]);
        let outcome = self.execute(provider);
        let frames = outcome.as_ref().map_or(0, |c| c.progress.frames);
        let closed = self.perf.pop_range(run_token, frames);
        self.transition(PipelineState::Done);
        let perf = self.finish_perf(closed.map(|_| ()));

        match outcome {
            Ok(done) => {
                info!(
                    batches = done.progress.batches,
                    frames = done.progress.frames,
                    modality = %done.plan.modality,
                    backend = %done.plan.backend,
                    peak_mb = done.context.peak_bytes / (1024 * 1024),
                    fences = done.context.fences,
                    "Pipeline finished"
                );
                Ok(RunSummary {
                    batches: done.progress.batches,
                    frames: done.progress.frames,
                    modality: done.plan.modality,
                    backend: done.plan.backend,
                    class_index: done.plan.class_index,
                    perf,
                    context: done.context,
                })
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Pipeline failed");
                Err(e)
            }
        }
    }

    fn execute<P: StageProvider + ?Sized>(&mut self, provider: &mut P) -> Result<Completed> {
        let plan = self.prepare(provider)?;
        debug!(
            backend = %plan.backend,
            modality = %plan.modality,
            class = plan.class_label(),
            class_index = plan.class_index,
            batch_size = self.config.batch_size,
            target = %self.config.target_size(),
            "Run plan resolved"
        );

        let ctx = provider.acquire_context(self.config.device_id)?;
        let stream = ctx.stream();

        let mut source = provider.open_source(&self.config, plan.modality, &ctx)?;
        let framerate = source.framerate();
        if plan.modality == Modality::Video && framerate.is_zero() {
            return Err(EngineError::Configuration(
                "video source reports a zero framerate".into(),
            ));
        }
        let mut sink = provider.open_sink(&self.config, plan.modality, framerate, &ctx)?;
        let preprocessor = self.config.preprocessor()?;
        let postprocessor = Postprocessor::new(
            sink.input_layout(),
            sink.memory_space(),
            self.config.blur,
        )?
        .with_refinement(self.config.refine_edges.then(RefineConfig::default));
        let mut backend = provider.create_backend(&self.config, &plan, stream)?;
        if backend.class_index() != plan.class_index {
            return Err(EngineError::Consistency(format!(
                "backend resolved class {} but the run selected {}",
                backend.class_index(),
                plan.class_index
            )));
        }

        source.start()?;
        sink.start()?;
        self.transition(PipelineState::Running);

        let pipeline_token = self.perf.push_range("pipeline", &[]);
        let looped = self.batch_loop(
            Stages {
                source: source.as_mut(),
                sink: sink.as_mut(),
                backend: backend.as_mut(),
                preprocessor: &preprocessor,
                postprocessor: &postprocessor,
                class_index: plan.class_index,
            },
            stream,
        );
        let drained = looped.and_then(|progress| {
            self.transition(PipelineState::Draining);
            sink.join().map(|_| progress)
        });
        let items = drained.as_ref().map_or(0, |p| p.frames);
        self.perf.pop_range(pipeline_token, items)?;
        let progress = drained?;

        drop(backend);
        drop(source);
        drop(sink);
        let context = ctx.release()?;
        Ok(Completed {
            plan,
            progress,
            context,
        })
    }

    fn batch_loop(&mut self, mut stages: Stages<'_>, stream: &ExecutionStream) -> Result<Progress> {
        let mut batch_idx = 0u64;
        let mut frames = 0u64;
        loop {
            let token = self
                .perf
                .push_range("batch", &[("batch_idx", json!(batch_idx))]);
            let step = self.process_batch(&mut stages, stream, batch_idx);
            let items = match &step {
                Ok(Some(n)) => *n as u64,
                _ => 0,
            };
            self.perf.pop_range(token, items)?;
            match step? {
                Some(n) => {
                    batch_idx += 1;
                    frames += n as u64;
                }
                None => break,
            }
        }
        Ok(Progress {
            batches: batch_idx,
            frames,
        })
    }

    /// One iteration.  `Ok(None)` at end of stream, else the frame count.
    fn process_batch(
        &mut self,
        stages: &mut Stages<'_>,
        stream: &ExecutionStream,
        expected: u64,
    ) -> Result<Option<usize>> {
        let token = self.perf.push_range("decode", &[]);
        let next = stages.source.next_batch(stream);
        let decoded = match &next {
            Ok(Some(batch)) => batch.len() as u64,
            _ => 0,
        };
        self.perf.pop_range(token, decoded)?;
        let Some(mut batch) = next? else {
            debug!(batches = expected, "Source reached end of stream");
            return Ok(None);
        };
        if batch.index != expected {
            return Err(EngineError::BatchIndexMismatch {
                expected,
                actual: batch.index,
            });
        }
        info!("Processing batch {expected}");

        let n = batch.len();
        let items = n as u64;
        let original_size = batch.frames.size();
        let scope = stream.batch_scope(batch.index);
        scope.issue(Stage::Decode)?;

        scope.issue(Stage::Preprocess)?;
        let token = self.perf.push_range("preprocess", &[]);
        let pre = stages
            .preprocessor
            .apply(stream, batch.frames, self.config.target_size());
        self.perf.pop_range(token, items)?;
        let pre = pre?;

        scope.issue(Stage::Inference)?;
        let token = self.perf.push_range("inference", &[]);
        let inferred = stages.backend.infer(stream, &pre.normalized);
        self.perf.pop_range(token, items)?;
        let inferred = inferred?;

        scope.issue(Stage::Postprocess)?;
        let token = self.perf.push_range("postprocess", &[]);
        let blurred = stages.postprocessor.apply(
            stream,
            &inferred.probabilities,
            &pre.original,
            &pre.resized,
            stages.class_index,
        );
        self.perf.pop_range(token, items)?;
        let blurred = blurred?;
        let expected_layout = stages.postprocessor.output_layout();
        if blurred.layout() != expected_layout
            || blurred.space() != stages.postprocessor.output_space()
            || blurred.size() != original_size
            || blurred.batch_len() != n
        {
            return Err(EngineError::DimensionMismatch(format!(
                "postprocess produced {} {:?} frames of {}, sink expects {n} {expected_layout:?} frames of {original_size}",
                blurred.batch_len(),
                blurred.layout(),
                blurred.size(),
            )));
        }
        batch.frames = blurred;

        scope.issue(Stage::Encode)?;
        let token = self.perf.push_range("encode", &[]);
        let accepted = stages.sink.accept(batch, stream);
        self.perf.pop_range(token, items)?;
        accepted?;

        scope.finish()?;
        Ok(Some(n))
    }

    /// Close out the recorder.  `closed` carries a failure to pop the outer
    /// range, which is reported like any other unbalanced stack.
    fn finish_perf(&mut self, closed: Result<()>) -> Result<PerfReport> {
        let finalized = self.perf.finalize();
        let report = closed.and(finalized);
        match &report {
            Ok(report) => {
                report.emit();
                if self.config.perf_report {
                    let path = report.default_path(&self.config.output_dir);
                    match report.write_json(&path) {
                        Ok(()) => info!(path = %path.display(), "Perf report written"),
                        Err(e) => warn!(error = %e, "Failed to write perf report"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Perf report unavailable"),
        }
        report
    }
}
