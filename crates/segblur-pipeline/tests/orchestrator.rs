//! Orchestrator behavior against instrumented stage providers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use ndarray::Array4;

use segblur_core::backend::{BackendKind, InferenceBackend, InferenceResult};
use segblur_core::codec_traits::{MediaSink, MediaSource, SinkOrder};
use segblur_core::context::{ContextStats, ExecutionContext, ExecutionStream};
use segblur_core::error::{EngineError, Result};
use segblur_core::types::{
    Batch, FrameTensor, Framerate, ImageSize, MemorySpace, Modality, TensorLayout,
};
use segblur_media::VideoInfo;
use segblur_pipeline::{
    DefaultStageProvider, InputProbe, PipelineConfig, PipelineState, RunPlan,
    SegmentationPipeline, StageProvider,
};

const CLASSES: usize = 21;
const PERSON: usize = 15;

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = std::env::temp_dir().join(format!(
        "segblur_pipeline_{label}_{}_{nanos}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// ─── Mock stages ─────────────────────────────────────────────────────────────

struct ScriptedSource {
    /// `(index, frames)` per batch, produced in order.
    script: Vec<(u64, usize)>,
    cursor: usize,
    started: bool,
    modality: Modality,
    framerate: Framerate,
}

impl MediaSource for ScriptedSource {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn next_batch(&mut self, stream: &ExecutionStream) -> Result<Option<Batch>> {
        assert!(self.started, "next_batch before start");
        let Some(&(index, n)) = self.script.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        let data = stream.alloc((n, 6, 8, 3), 0u8);
        let data = data.mapv(|_| (index * 10) as u8);
        Ok(Some(Batch {
            index,
            frames: FrameTensor::from_nhwc(data)?,
            modality: self.modality,
            units: (0..n).map(|i| format!("img_{index}_{i}.png")).collect(),
        }))
    }

    fn framerate(&self) -> Framerate {
        self.framerate
    }

    fn modality(&self) -> Modality {
        self.modality
    }
}

#[derive(Debug, Default)]
struct SinkLog {
    accepted: Vec<(u64, usize, TensorLayout, MemorySpace)>,
    joins: usize,
    started: bool,
    /// Rate the sink was opened with.
    framerate: Option<Framerate>,
}

struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
    order: SinkOrder,
    joined: bool,
}

impl MediaSink for RecordingSink {
    fn start(&mut self) -> Result<()> {
        self.log.lock().unwrap().started = true;
        Ok(())
    }

    fn accept(&mut self, batch: Batch, _stream: &ExecutionStream) -> Result<()> {
        self.order.admit(batch.index)?;
        self.log.lock().unwrap().accepted.push((
            batch.index,
            batch.len(),
            batch.frames.layout(),
            batch.frames.space(),
        ));
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        if !self.joined {
            self.joined = true;
            self.log.lock().unwrap().joins += 1;
        }
        Ok(())
    }

    fn input_layout(&self) -> TensorLayout {
        TensorLayout::Nchw
    }

    fn memory_space(&self) -> MemorySpace {
        MemorySpace::Device
    }
}

/// Fills the selected class plane with `mask` and splits the rest evenly.
struct PlaneBackend {
    class_index: usize,
    mask: f32,
    fail_on_call: Option<usize>,
    calls: usize,
}

impl InferenceBackend for PlaneBackend {
    fn infer(
        &mut self,
        stream: &ExecutionStream,
        normalized: &Array4<f32>,
    ) -> Result<InferenceResult> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on_call == Some(call) {
            return Err(EngineError::Inference("simulated engine fault".into()));
        }
        let (n, _, h, w) = normalized.dim();
        let rest = (1.0 - self.mask) / (CLASSES - 1) as f32;
        let mut probabilities = stream.alloc((n, CLASSES, h, w), rest);
        probabilities
            .slice_mut(ndarray::s![.., self.class_index, .., ..])
            .fill(self.mask);
        Ok(InferenceResult {
            probabilities,
            class_index: self.class_index,
        })
    }

    fn class_index(&self) -> usize {
        self.class_index
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Interpreted
    }
}

struct MockProvider {
    stats: Arc<ContextStats>,
    acquire_calls: usize,
    script: Vec<(u64, usize)>,
    sink_log: Arc<Mutex<SinkLog>>,
    mask: f32,
    fail_on_call: Option<usize>,
    /// Rate the scripted input reports.
    framerate: Framerate,
    /// Fail the pre-acquisition backend check.
    backend_unavailable: bool,
    /// Use the real image source/sink instead of the scripted ones.
    real_media: bool,
}

impl MockProvider {
    fn scripted(script: Vec<(u64, usize)>) -> Self {
        Self {
            stats: ContextStats::new(),
            acquire_calls: 0,
            script,
            sink_log: Arc::default(),
            mask: 1.0,
            fail_on_call: None,
            framerate: Framerate::ZERO,
            backend_unavailable: false,
            real_media: false,
        }
    }

    fn real_media(mask: f32) -> Self {
        Self {
            real_media: true,
            mask,
            ..Self::scripted(Vec::new())
        }
    }
}

impl StageProvider for MockProvider {
    fn inspect_input(&mut self, config: &PipelineConfig, modality: Modality) -> Result<InputProbe> {
        if self.real_media {
            return DefaultStageProvider::new().inspect_input(config, modality);
        }
        let frames: usize = self.script.iter().map(|&(_, n)| n).sum();
        Ok(InputProbe {
            modality,
            images: (modality == Modality::Images).then_some(frames),
            video: (modality == Modality::Video).then_some(VideoInfo {
                size: ImageSize::new(8, 6),
                framerate: self.framerate,
                frame_count: Some(frames as u64),
            }),
        })
    }

    fn check_backend(&mut self, _config: &PipelineConfig, plan: &RunPlan) -> Result<()> {
        if self.backend_unavailable {
            return Err(EngineError::Configuration(format!(
                "{} backend unavailable",
                plan.backend
            )));
        }
        Ok(())
    }

    fn acquire_context(&mut self, device_id: usize) -> Result<ExecutionContext> {
        self.acquire_calls += 1;
        ExecutionContext::acquire_with_stats(device_id, Arc::clone(&self.stats))
    }

    fn open_source(
        &mut self,
        config: &PipelineConfig,
        modality: Modality,
        ctx: &ExecutionContext,
    ) -> Result<Box<dyn MediaSource>> {
        if self.real_media {
            return DefaultStageProvider::new().open_source(config, modality, ctx);
        }
        Ok(Box::new(ScriptedSource {
            script: self.script.clone(),
            cursor: 0,
            started: false,
            modality,
            framerate: self.framerate,
        }))
    }

    fn open_sink(
        &mut self,
        config: &PipelineConfig,
        modality: Modality,
        framerate: Framerate,
        ctx: &ExecutionContext,
    ) -> Result<Box<dyn MediaSink>> {
        if self.real_media {
            return DefaultStageProvider::new().open_sink(config, modality, framerate, ctx);
        }
        self.sink_log.lock().unwrap().framerate = Some(framerate);
        Ok(Box::new(RecordingSink {
            log: Arc::clone(&self.sink_log),
            order: SinkOrder::default(),
            joined: false,
        }))
    }

    fn create_backend(
        &mut self,
        _config: &PipelineConfig,
        plan: &RunPlan,
        _stream: &ExecutionStream,
    ) -> Result<Box<dyn InferenceBackend>> {
        Ok(Box::new(PlaneBackend {
            class_index: plan.class_index,
            mask: self.mask,
            fail_on_call: self.fail_on_call,
            calls: 0,
        }))
    }
}

fn config(input: &Path, output: &Path) -> PipelineConfig {
    PipelineConfig {
        input: input.to_path_buf(),
        output_dir: output.to_path_buf(),
        class_name: "person".into(),
        batch_size: 2,
        target_width: 4,
        target_height: 3,
        backend: "interpreted".into(),
        ..PipelineConfig::default()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[test]
fn batches_flow_in_index_order_including_partial_tail() {
    let dir = unique_temp_dir("order");
    let mut provider = MockProvider::scripted(vec![(0, 2), (1, 2), (2, 1)]);
    let mut pipeline = SegmentationPipeline::new(config(&dir, &dir));

    let summary = pipeline.run(&mut provider).unwrap();

    assert_eq!(summary.batches, 3);
    assert_eq!(summary.frames, 5);
    assert_eq!(summary.class_index, PERSON);
    let log = provider.sink_log.lock().unwrap();
    let indices: Vec<u64> = log.accepted.iter().map(|a| a.0).collect();
    let sizes: Vec<usize> = log.accepted.iter().map(|a| a.1).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(
        log.accepted
            .iter()
            .all(|a| a.2 == TensorLayout::Nchw && a.3 == MemorySpace::Device),
        "postprocess output must follow the sink's layout and memory space"
    );
    assert_eq!(log.joins, 1);
    assert_eq!(
        pipeline.transitions(),
        &[
            PipelineState::Init,
            PipelineState::Running,
            PipelineState::Draining,
            PipelineState::Done
        ]
    );
    assert_eq!(provider.stats.acquired(), 1);
    assert_eq!(provider.stats.released(), 1);
    assert_eq!(summary.context.issued_ops, 15, "five stages per batch");
    assert!(summary.context.fences >= 3, "one fence per batch scope");
    assert!(summary.context.transferred_bytes > 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn empty_source_drains_cleanly() {
    let dir = unique_temp_dir("empty");
    let mut provider = MockProvider::scripted(Vec::new());
    let mut pipeline = SegmentationPipeline::new(config(&dir, &dir));

    let summary = pipeline.run(&mut provider).unwrap();

    assert_eq!((summary.batches, summary.frames), (0, 0));
    assert_eq!(provider.sink_log.lock().unwrap().joins, 1);
    assert_eq!(pipeline.state(), PipelineState::Done);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn index_gap_is_a_consistency_error() {
    let dir = unique_temp_dir("gap");
    let mut provider = MockProvider::scripted(vec![(0, 2), (2, 2)]);
    let mut pipeline = SegmentationPipeline::new(config(&dir, &dir));

    let err = pipeline.run(&mut provider).unwrap_err();

    assert!(
        matches!(err, EngineError::BatchIndexMismatch { expected: 1, actual: 2 }),
        "{err}"
    );
    assert!(err.is_consistency());
    let log = provider.sink_log.lock().unwrap();
    assert_eq!(log.accepted.len(), 1);
    assert_eq!(log.joins, 0, "a failed run does not drain the sink");
    assert_eq!(provider.stats.live(), 0, "context released on the error path");
    assert_eq!(
        pipeline.transitions().last(),
        Some(&PipelineState::Done)
    );
    assert!(!pipeline.transitions().contains(&PipelineState::Draining));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unknown_backend_fails_before_device_acquisition() {
    let dir = unique_temp_dir("backend");
    let mut provider = MockProvider::scripted(vec![(0, 1)]);
    let mut cfg = config(&dir, &dir);
    cfg.backend = "unknown".into();
    let mut pipeline = SegmentationPipeline::new(cfg);

    let err = pipeline.run(&mut provider).unwrap_err();

    assert!(matches!(err, EngineError::Configuration(_)), "{err}");
    assert_eq!(provider.acquire_calls, 0);
    assert_eq!(provider.stats.acquired(), 0);
    assert!(!provider.sink_log.lock().unwrap().started);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_input_fails_before_device_acquisition() {
    let dir = unique_temp_dir("missing");
    let mut provider = MockProvider::scripted(vec![(0, 1)]);
    let mut pipeline =
        SegmentationPipeline::new(config(&dir.join("nope.mp4"), &dir));

    let err = pipeline.run(&mut provider).unwrap_err();

    assert!(matches!(err, EngineError::SourceOpen { .. }), "{err}");
    assert_eq!(provider.acquire_calls, 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn empty_image_directory_fails_before_device_acquisition() {
    let input = unique_temp_dir("no_images");
    let output = unique_temp_dir("no_images_out");
    let mut provider = MockProvider::real_media(1.0);
    let mut pipeline = SegmentationPipeline::new(config(&input, &output));

    let err = pipeline.run(&mut provider).unwrap_err();

    assert!(matches!(err, EngineError::SourceOpen { .. }), "{err}");
    assert_eq!(provider.acquire_calls, 0);
    assert_eq!(provider.stats.acquired(), 0);
    let _ = std::fs::remove_dir_all(&input);
    let _ = std::fs::remove_dir_all(&output);
}

#[test]
fn unreadable_video_fails_before_device_acquisition() {
    let dir = unique_temp_dir("not_video");
    let clip = dir.join("broken.mp4");
    std::fs::write(&clip, "plain text, not a container").unwrap();
    let mut provider = MockProvider::real_media(1.0);
    let mut pipeline = SegmentationPipeline::new(config(&clip, &dir));

    let err = pipeline.run(&mut provider).unwrap_err();

    // ffprobe rejects the file, or is absent; either way the source cannot open
    assert!(matches!(err, EngineError::SourceOpen { .. }), "{err}");
    assert_eq!(provider.acquire_calls, 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unavailable_backend_fails_before_device_acquisition() {
    let dir = unique_temp_dir("no_backend");
    let mut provider = MockProvider::scripted(vec![(0, 1)]);
    provider.backend_unavailable = true;
    let mut pipeline = SegmentationPipeline::new(config(&dir, &dir));

    let err = pipeline.run(&mut provider).unwrap_err();

    assert!(matches!(err, EngineError::Configuration(_)), "{err}");
    assert_eq!(provider.acquire_calls, 0);
    assert!(!provider.sink_log.lock().unwrap().started);
    assert_eq!(pipeline.state(), PipelineState::Done);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_model_fails_before_device_acquisition_with_default_provider() {
    let input = unique_temp_dir("no_model");
    write_textured_png(&input.join("a.png"), 8, 6, 1);
    let stats = ContextStats::new();
    let mut provider = DefaultStageProvider::with_stats(Arc::clone(&stats));
    let mut cfg = config(&input, &input);
    cfg.model_path = input.join("missing.onnx");
    let mut pipeline = SegmentationPipeline::new(cfg);

    let err = pipeline.run(&mut provider).unwrap_err();

    // missing model, or a build without the runtime: configuration either way
    assert!(matches!(err, EngineError::Configuration(_)), "{err}");
    assert_eq!(stats.acquired(), 0);
    let _ = std::fs::remove_dir_all(&input);
}

#[test]
fn video_sink_is_opened_at_the_source_framerate() {
    let dir = unique_temp_dir("video_rate");
    let clip = dir.join("clip.mp4");
    std::fs::write(&clip, b"").unwrap();
    let mut provider = MockProvider::scripted(vec![(0, 2), (1, 1)]);
    provider.framerate = Framerate::new(30, 1);
    let mut pipeline = SegmentationPipeline::new(config(&clip, &dir));

    let summary = pipeline.run(&mut provider).unwrap();

    assert_eq!(summary.modality, Modality::Video);
    assert_eq!(summary.frames, 3);
    let log = provider.sink_log.lock().unwrap();
    assert_eq!(log.framerate, Some(Framerate::new(30, 1)));
    assert_eq!(log.accepted.len(), 2);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn zero_framerate_video_fails_before_device_acquisition() {
    let dir = unique_temp_dir("video_zero");
    let clip = dir.join("clip.mp4");
    std::fs::write(&clip, b"").unwrap();
    let mut provider = MockProvider::scripted(vec![(0, 1)]);
    provider.framerate = Framerate::ZERO;
    let mut pipeline = SegmentationPipeline::new(config(&clip, &dir));

    let err = pipeline.run(&mut provider).unwrap_err();

    assert!(matches!(err, EngineError::Configuration(_)), "{err}");
    assert_eq!(provider.acquire_calls, 0);
    assert!(provider.sink_log.lock().unwrap().framerate.is_none());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn prepare_carries_the_inspected_input() {
    let dir = unique_temp_dir("prepare");
    let mut provider = MockProvider::scripted(vec![(0, 2), (1, 2), (2, 1)]);
    let pipeline = SegmentationPipeline::new(config(&dir, &dir));

    let plan = pipeline.prepare(&mut provider).unwrap();

    let input = plan.input.unwrap();
    assert_eq!(input.modality, Modality::Images);
    assert_eq!(input.images, Some(5));
    assert_eq!(input.framerate(), Framerate::ZERO);
    assert_eq!(provider.acquire_calls, 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stage_failure_releases_context_and_stops() {
    let dir = unique_temp_dir("fault");
    let mut provider = MockProvider::scripted(vec![(0, 2), (1, 2), (2, 2)]);
    provider.fail_on_call = Some(1);
    let mut pipeline = SegmentationPipeline::new(config(&dir, &dir));

    let err = pipeline.run(&mut provider).unwrap_err();

    assert!(matches!(err, EngineError::Inference(_)), "{err}");
    assert_eq!(provider.sink_log.lock().unwrap().accepted.len(), 1);
    assert_eq!(provider.stats.acquired(), 1);
    assert_eq!(provider.stats.released(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn perf_ranges_nest_per_stage_and_report_is_written() {
    let dir = unique_temp_dir("perf");
    let mut provider = MockProvider::scripted(vec![(0, 2), (1, 1)]);
    let mut cfg = config(&dir, &dir);
    cfg.perf_report = true;
    let mut pipeline = SegmentationPipeline::new(cfg);

    let summary = pipeline.run(&mut provider).unwrap();
    let report = summary.perf.unwrap();

    assert_eq!(report.entry("run").unwrap().count, 1);
    assert_eq!(report.entry("run.pipeline").unwrap().total_items, 3);
    // the end-of-stream iteration opens a batch range too
    assert_eq!(report.entry("run.pipeline.batch").unwrap().count, 3);
    for stage in ["preprocess", "inference", "postprocess", "encode"] {
        let entry = report
            .entry(&format!("run.pipeline.batch.{stage}"))
            .unwrap_or_else(|| panic!("missing {stage}"));
        assert_eq!(entry.count, 2, "{stage}");
        assert_eq!(entry.total_items, 3, "{stage}");
    }
    assert_eq!(report.entry("run.pipeline.batch.decode").unwrap().count, 3);

    let written = dir.join("perf_segmentation.json");
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&written).unwrap()).unwrap();
    assert_eq!(json["name"], "segmentation");
    assert!(json["entries"].as_array().unwrap().len() >= 7);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn pipeline_runs_only_once() {
    let dir = unique_temp_dir("twice");
    let mut provider = MockProvider::scripted(vec![(0, 1)]);
    let mut pipeline = SegmentationPipeline::new(config(&dir, &dir));
    pipeline.run(&mut provider).unwrap();

    let err = pipeline.run(&mut provider).unwrap_err();
    assert!(matches!(err, EngineError::Consistency(_)), "{err}");
    assert_eq!(provider.stats.acquired(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

fn write_textured_png(path: &Path, w: u32, h: u32, seed: u32) {
    image::RgbImage::from_fn(w, h, |x, y| {
        image::Rgb([
            ((x * 37 + y * 11 + seed) % 256) as u8,
            ((x * 5 + y * 71 + seed * 3) % 256) as u8,
            ((x * 19 + y * 23 + seed * 7) % 256) as u8,
        ])
    })
    .save(path)
    .unwrap();
}

#[test]
fn fully_selected_images_are_written_pixel_identical() {
    let input = unique_temp_dir("e2e_in");
    let output = unique_temp_dir("e2e_out");
    for (i, name) in ["a.png", "b.png", "c.png"].iter().enumerate() {
        write_textured_png(&input.join(name), 20, 14, i as u32);
    }
    let mut provider = MockProvider::real_media(1.0);
    let mut pipeline = SegmentationPipeline::new(config(&input, &output));

    let summary = pipeline.run(&mut provider).unwrap();

    assert_eq!(summary.modality, Modality::Images);
    assert_eq!((summary.batches, summary.frames), (2, 3));
    for name in ["a.png", "b.png", "c.png"] {
        let original = image::open(input.join(name)).unwrap().to_rgb8();
        let written = image::open(output.join(format!("out_{name}")))
            .unwrap()
            .to_rgb8();
        assert_eq!(written.dimensions(), original.dimensions());
        assert_eq!(written, original, "{name}");
    }
    let _ = std::fs::remove_dir_all(&input);
    let _ = std::fs::remove_dir_all(&output);
}

#[test]
fn unselected_images_are_blurred() {
    let input = unique_temp_dir("blur_in");
    let output = unique_temp_dir("blur_out");
    write_textured_png(&input.join("only.png"), 24, 16, 9);
    let mut provider = MockProvider::real_media(0.0);
    let mut cfg = config(&input.join("only.png"), &output);
    cfg.batch_size = 1;
    let mut pipeline = SegmentationPipeline::new(cfg);

    pipeline.run(&mut provider).unwrap();

    let original = image::open(input.join("only.png")).unwrap().to_rgb8();
    let written = image::open(output.join("out_only.png")).unwrap().to_rgb8();
    assert_eq!(written.dimensions(), (24, 16));
    assert_ne!(written, original);
    let _ = std::fs::remove_dir_all(&input);
    let _ = std::fs::remove_dir_all(&output);
}

#[test]
#[ignore = "requires ffmpeg and ffprobe on PATH"]
fn video_sink_inherits_source_framerate() {
    let dir = unique_temp_dir("video");
    let clip = dir.join("clip.mp4");
    let status = std::process::Command::new("ffmpeg")
        .args(["-y", "-loglevel", "error", "-f", "lavfi", "-i"])
        .arg("testsrc=size=32x24:rate=30:duration=0.2")
        .args(["-pix_fmt", "yuv420p"])
        .arg(&clip)
        .status()
        .unwrap();
    assert!(status.success());

    let mut provider = MockProvider::real_media(1.0);
    let mut pipeline = SegmentationPipeline::new(config(&clip, &dir));
    let summary = pipeline.run(&mut provider).unwrap();

    assert_eq!(summary.modality, Modality::Video);
    assert_eq!(summary.frames, 6);
    let info = segblur_media::probe_video(&dir.join("out_clip.mp4")).unwrap();
    assert_eq!(info.framerate.as_f64().round(), 30.0);
    let _ = std::fs::remove_dir_all(&dir);
}
