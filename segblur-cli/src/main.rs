//! segblur CLI entrypoint.
//!
//! ```bash
//! segblur segment --input photos/ --output-dir out/ --model fcn.onnx --class person
//! segblur segment --input clip.mp4 --backend interpreted --batch-size 8 --perf-report
//! segblur segment --input photos/ --config run.json --dry-run --json
//! segblur classes --json
//! segblur probe --input clip.mp4
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::json;

use segblur_core::context::ExecutionContext;
use segblur_core::error::{EngineError, Result};
use segblur_inference::ClassTable;
use segblur_pipeline::{
    DefaultStageProvider, PipelineConfig, RunPlan, RunSummary, SegmentationPipeline, probe_input,
};

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "segblur",
    version,
    about = "Batched semantic-segmentation background blur for images and video",
    arg_required_else_help = true,
    after_help = "Examples:\n  segblur segment --input photos/ --output-dir out/ --class person\n  segblur segment --input clip.mp4 --backend interpreted --dry-run --json\n  segblur classes\n  segblur probe --input clip.mp4 --json"
)]
struct Cli {
    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace).
    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Blur everything except the selected class.
    Segment(SegmentArgs),
    /// List the segmentation class table.
    Classes(ClassesArgs),
    /// Report the modality and stream properties of an input.
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
struct SegmentArgs {
    /// Image file, directory of images, or video file.
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Directory receiving the output media.
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// ONNX segmentation model.
    #[arg(short = 'm', long = "model")]
    model: Option<PathBuf>,

    /// Newline-separated class names replacing the PASCAL VOC table.
    #[arg(long = "labels")]
    labels: Option<PathBuf>,

    /// Class kept sharp, by name or index.
    #[arg(short = 'c', long = "class")]
    class_name: Option<String>,

    #[arg(short = 'b', long = "batch-size")]
    batch_size: Option<usize>,

    /// Model input width.
    #[arg(long = "target-width")]
    target_width: Option<u32>,

    /// Model input height.
    #[arg(long = "target-height")]
    target_height: Option<u32>,

    /// CUDA device ordinal.
    #[arg(short = 'd', long = "device")]
    device: Option<usize>,

    /// Inference backend: interpreted or compiled.
    #[arg(long = "backend")]
    backend: Option<String>,

    /// JSON config file; flags given here override its values.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    #[arg(long = "blur-sigma")]
    blur_sigma: Option<f32>,

    #[arg(long = "blur-iterations")]
    blur_iterations: Option<u32>,

    /// Skip edge refinement of the class mask.
    #[arg(long = "no-refine", default_value_t = false)]
    no_refine: bool,

    /// Allow FP16 kernels in the compiled backend.
    #[arg(long = "fp16", default_value_t = false)]
    fp16: bool,

    /// Write perf_segmentation.json into the output directory.
    #[arg(long = "perf-report", default_value_t = false)]
    perf_report: bool,

    /// Resolve configuration, modality and class only; no device work.
    #[arg(long = "dry-run", default_value_t = false)]
    dry_run: bool,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct ClassesArgs {
    #[arg(long = "labels")]
    labels: Option<PathBuf>,

    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct ProbeArgs {
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let json_error_command = match &cli.command {
        Commands::Segment(args) if args.json => Some("segment"),
        Commands::Classes(args) if args.json => Some("classes"),
        Commands::Probe(args) if args.json => Some("probe"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Segment(args) => run_segment(args),
        Commands::Classes(args) => run_classes(args),
        Commands::Probe(args) => run_probe(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            }
            tracing::error!(error = %err, code = err.error_code(), "Command failed");
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing(level: &str) {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

/// Defaults, then `--config`, then explicit flags.
fn resolve_config(args: &SegmentArgs) -> Result<PipelineConfig> {
    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(v) = &args.input {
        cfg.input = v.clone();
    }
    if let Some(v) = &args.output_dir {
        cfg.output_dir = v.clone();
    }
    if let Some(v) = &args.model {
        cfg.model_path = v.clone();
    }
    if let Some(v) = &args.labels {
        cfg.labels_path = Some(v.clone());
    }
    if let Some(v) = &args.class_name {
        cfg.class_name = v.clone();
    }
    if let Some(v) = args.batch_size {
        cfg.batch_size = v;
    }
    if let Some(v) = args.target_width {
        cfg.target_width = v;
    }
    if let Some(v) = args.target_height {
        cfg.target_height = v;
    }
    if let Some(v) = args.device {
        cfg.device_id = v;
    }
    if let Some(v) = &args.backend {
        cfg.backend = v.clone();
    }
    if let Some(v) = args.blur_sigma {
        cfg.blur.sigma = v;
    }
    if let Some(v) = args.blur_iterations {
        cfg.blur.iterations = v;
    }
    if args.no_refine {
        cfg.refine_edges = false;
    }
    cfg.fp16 |= args.fp16;
    cfg.perf_report |= args.perf_report;
    Ok(cfg)
}

fn run_segment(args: SegmentArgs) -> Result<()> {
    let cfg = resolve_config(&args)?;
    let mut pipeline = SegmentationPipeline::new(cfg);

    if args.dry_run {
        let plan = pipeline.plan()?;
        let cfg = pipeline.config();
        if args.json {
            println!("{}", segment_json(cfg, &plan, None));
        } else {
            println!(
                "dry run: {} input {} -> {} | backend {} | class {} ({}) | batch {} | target {}x{}",
                plan.modality,
                cfg.input.display(),
                cfg.output_dir.display(),
                plan.backend,
                plan.class_label(),
                plan.class_index,
                cfg.batch_size,
                cfg.target_width,
                cfg.target_height,
            );
        }
        return Ok(());
    }

    let plan = pipeline.plan()?;
    let started = Instant::now();
    let summary = pipeline.run(&mut DefaultStageProvider::new())?;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let cfg = pipeline.config();
    if args.json {
        println!(
            "{}",
            segment_json(cfg, &plan, Some((&summary, elapsed_ms)))
        );
    } else {
        println!(
            "segmented {} frame(s) in {} batch(es) in {} ms -> {}",
            summary.frames,
            summary.batches,
            elapsed_ms,
            cfg.output_dir.display()
        );
    }
    Ok(())
}

fn segment_json(
    cfg: &PipelineConfig,
    plan: &RunPlan,
    run: Option<(&RunSummary, u64)>,
) -> serde_json::Value {
    let mut out = json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": "segment",
        "ok": true,
        "dry_run": run.is_none(),
        "executor": ExecutionContext::executor_name(),
        "input": cfg.input,
        "output_dir": cfg.output_dir,
        "model": cfg.model_path,
        "modality": plan.modality,
        "backend": plan.backend,
        "class": plan.class_label(),
        "class_index": plan.class_index,
        "batch_size": cfg.batch_size,
        "target": { "width": cfg.target_width, "height": cfg.target_height },
    });
    if let (Some((summary, elapsed_ms)), Some(obj)) = (run, out.as_object_mut()) {
        obj.insert("batches".into(), json!(summary.batches));
        obj.insert("frames".into(), json!(summary.frames));
        obj.insert("elapsed_ms".into(), json!(elapsed_ms));
        obj.insert("context".into(), json!(summary.context));
        obj.insert(
            "perf".into(),
            match &summary.perf {
                Ok(report) => json!(report),
                Err(e) => json!({ "error": e.to_string() }),
            },
        );
    }
    out
}

fn run_classes(args: ClassesArgs) -> Result<()> {
    let table = ClassTable::load(args.labels.as_deref())?;
    if args.json {
        let classes: Vec<_> = table
            .iter()
            .map(|(index, name)| json!({ "index": index, "name": name }))
            .collect();
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "classes",
                "ok": true,
                "classes": classes,
            })
        );
    } else {
        for (index, name) in table.iter() {
            println!("{index:>3}  {name}");
        }
    }
    Ok(())
}

fn run_probe(args: ProbeArgs) -> Result<()> {
    let probe = probe_input(&args.input)?;
    if args.json {
        let mut out = json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "probe",
            "ok": true,
            "input": args.input,
        });
        let details = serde_json::to_value(&probe)
            .map_err(|e| EngineError::Configuration(format!("probe serialization: {e}")))?;
        if let (Some(out), Some(details)) = (out.as_object_mut(), details.as_object()) {
            out.extend(details.clone());
        }
        println!("{out}");
        return Ok(());
    }

    println!("input:    {}", args.input.display());
    println!("modality: {}", probe.modality);
    if let Some(count) = probe.images {
        println!("images:   {count}");
    }
    if let Some(video) = probe.video {
        println!("size:     {}", video.size);
        println!("fps:      {} ({:.3})", video.framerate, video.framerate.as_f64());
        if let Some(frames) = video.frame_count {
            println!("frames:   {frames}");
        }
    }
    Ok(())
}

fn command_error_json(command: &str, err: &EngineError) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.error_code(),
        "error": err.to_string(),
    })
}
