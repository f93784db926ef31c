#![doc = include_str!("../README.md")]

pub mod config;
pub mod pipeline;
pub mod runtime;

pub use config::PipelineConfig;
pub use pipeline::{PERF_RECORDER_NAME, PipelineState, RunPlan, RunSummary, SegmentationPipeline};
pub use runtime::{DefaultStageProvider, InputProbe, StageProvider, probe_input};
