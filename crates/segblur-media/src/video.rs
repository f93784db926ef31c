//! Video-stream source and sink backed by `ffprobe`/`ffmpeg` subprocesses.
//!
//! ```text
//!   VideoSource: ffmpeg -i in.mp4 -f rawvideo -pix_fmt rgb24 -  ──stdout──▶ [N,H,W,3]
//!   VideoSink:   [N,H,W,3] ──channel──▶ writer ──stdin──▶ ffmpeg -f rawvideo … out_<stem>.mp4
//! ```
//!
//! The binaries default to `ffmpeg`/`ffprobe` on `PATH` and can be overridden
//! with `SEGBLUR_FFMPEG` / `SEGBLUR_FFPROBE`.
//!
//! Each child's stderr is drained on its own thread; only the tail is kept
//! for error messages.  Decoding runs with `-noautorotate` so frames keep the
//! coded width and height that `ffprobe` reports.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use segblur_core::codec_traits::{MediaSink, MediaSource, SinkOrder};
use segblur_core::context::ExecutionStream;
use segblur_core::error::{EngineError, Result};
use segblur_core::types::{
    Batch, FrameTensor, Framerate, ImageSize, MemorySpace, Modality, TensorLayout, unit_name,
};

/// Frames in flight between `accept` and the encoder process.
const ENCODE_QUEUE_DEPTH: usize = 16;

/// ffmpeg stderr kept for error messages.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

fn ffmpeg_bin() -> OsString {
    std::env::var_os("SEGBLUR_FFMPEG").unwrap_or_else(|| "ffmpeg".into())
}

fn ffprobe_bin() -> OsString {
    std::env::var_os("SEGBLUR_FFPROBE").unwrap_or_else(|| "ffprobe".into())
}

/// Drains a child's stderr so ffmpeg never stalls on a full pipe.
struct StderrTail {
    handle: Option<JoinHandle<Vec<u8>>>,
}

impl StderrTail {
    fn spawn(stderr: Option<ChildStderr>) -> Result<Self> {
        let Some(mut pipe) = stderr else {
            return Ok(Self { handle: None });
        };
        let handle = std::thread::Builder::new()
            .name("segblur-ffmpeg-stderr".into())
            .spawn(move || {
                let mut tail = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            tail.extend_from_slice(&chunk[..n]);
                            if tail.len() > STDERR_TAIL_BYTES {
                                let excess = tail.len() - STDERR_TAIL_BYTES;
                                tail.drain(..excess);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(_) => break,
                    }
                }
                tail
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Collected text.  Blocks until the child closes stderr, so call it
    /// after the child has exited.
    fn finish(&mut self) -> String {
        self.handle
            .take()
            .and_then(|h| h.join().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .unwrap_or_default()
    }
}

fn decoder_args(input: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostdin",
        "-noautorotate",
        "-i",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(input.as_os_str().to_owned());
    args.extend(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"].map(OsString::from));
    args
}

fn encoder_args(size: ImageSize, framerate: Framerate, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-y"]
        .into_iter()
        .chain(["-f", "rawvideo", "-pix_fmt", "rgb24"])
        .map(OsString::from)
        .collect();
    args.extend([
        OsString::from("-s"),
        OsString::from(size.to_string()),
        OsString::from("-r"),
        OsString::from(framerate.to_string()),
    ]);
    args.extend(["-i", "-", "-c:v", "libx264", "-pix_fmt", "yuv420p"].map(OsString::from));
    args.push(output.as_os_str().to_owned());
    args
}

// ─── Probe ───────────────────────────────────────────────────────────────────

/// Stream properties of a video container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VideoInfo {
    pub size: ImageSize,
    pub framerate: Framerate,
    pub frame_count: Option<u64>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

/// Parse `ffprobe -of json -show_entries stream=…` output.
pub fn parse_probe_json(path: &Path, json: &str) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| EngineError::source_open(path, format!("unreadable ffprobe output: {e}")))?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::source_open(path, "no video stream"))?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(EngineError::source_open(path, "video stream has no dimensions"));
    };
    if width == 0 || height == 0 {
        return Err(EngineError::source_open(path, "video stream has zero dimensions"));
    }

    let mut framerate = Framerate::ZERO;
    for raw in [&stream.avg_frame_rate, &stream.r_frame_rate].into_iter().flatten() {
        if let Ok(rate) = Framerate::parse(raw)
            && !rate.is_zero()
        {
            framerate = rate;
            break;
        }
    }

    Ok(VideoInfo {
        size: ImageSize::new(width, height),
        framerate,
        frame_count: stream.nb_frames.and_then(|n| n.parse().ok()),
    })
}

/// Probe `path` with `ffprobe`.
pub fn probe_video(path: &Path) -> Result<VideoInfo> {
    let output = Command::new(ffprobe_bin())
        .args(["-v", "error", "-select_streams", "v:0", "-show_entries"])
        .arg("stream=width,height,r_frame_rate,avg_frame_rate,nb_frames")
        .args(["-of", "json"])
        .arg(path)
        .output()
        .map_err(|e| EngineError::source_open(path, format!("failed to run ffprobe: {e}")))?;
    if !output.status.success() {
        return Err(EngineError::source_open(
            path,
            format!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    parse_probe_json(path, &String::from_utf8_lossy(&output.stdout))
}

// ─── Source ──────────────────────────────────────────────────────────────────

/// Decodes a video container into RGB batches.
pub struct VideoSource {
    path: PathBuf,
    batch_size: usize,
    info: VideoInfo,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<StderrTail>,
    next_index: u64,
    finished: bool,
}

impl VideoSource {
    /// Probe `path`; fails with `SourceOpen` when it is not a readable video.
    pub fn open(path: impl Into<PathBuf>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(EngineError::Configuration(
                "batch size must be greater than zero".into(),
            ));
        }
        let path = path.into();
        crate::modality::preflight(&path)?;
        let info = probe_video(&path)?;
        info!(
            input = %path.display(),
            size = %info.size,
            fps = %info.framerate,
            "Video source probed"
        );
        Ok(Self {
            path,
            batch_size,
            info,
            child: None,
            stdout: None,
            stderr: None,
            next_index: 0,
            finished: false,
        })
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    /// Read one frame into `buf`.  `Ok(false)` on a clean end of stream.
    fn read_frame(stdout: &mut ChildStdout, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match stdout.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(EngineError::Decode(format!(
                        "truncated frame: got {filled} of {} bytes",
                        buf.len()
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(EngineError::Decode(format!("decoder pipe: {e}"))),
            }
        }
        Ok(true)
    }

    /// Reap the decoder; a non-zero exit is a decode failure.
    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|e| EngineError::Decode(format!("waiting for ffmpeg: {e}")))?;
        let detail = self.stderr.take().map(|mut t| t.finish()).unwrap_or_default();
        if !status.success() {
            return Err(EngineError::Decode(format!("ffmpeg exited with {status}: {detail}")));
        }
        info!(batches = self.next_index, "Video source drained");
        Ok(())
    }
}

impl MediaSource for VideoSource {
    fn start(&mut self) -> Result<()> {
        let mut child = Command::new(ffmpeg_bin())
            .args(decoder_args(&self.path))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::source_open(&self.path, format!("failed to run ffmpeg: {e}")))?;
        self.stdout = child.stdout.take();
        self.stderr = Some(StderrTail::spawn(child.stderr.take())?);
        self.child = Some(child);
        Ok(())
    }

    fn next_batch(&mut self, stream: &ExecutionStream) -> Result<Option<Batch>> {
        if self.finished {
            return Ok(None);
        }
        let Some(stdout) = self.stdout.as_mut() else {
            return Err(EngineError::Consistency("video source read before start()".into()));
        };

        let (w, h) = (self.info.size.width as usize, self.info.size.height as usize);
        let frame_bytes = w * h * 3;
        let mut bytes = vec![0u8; frame_bytes * self.batch_size];
        let mut frames = 0;
        while frames < self.batch_size {
            let slot = &mut bytes[frames * frame_bytes..(frames + 1) * frame_bytes];
            if !Self::read_frame(stdout, slot)? {
                break;
            }
            frames += 1;
        }
        if frames == 0 {
            self.finish()?;
            return Ok(None);
        }

        bytes.truncate(frames * frame_bytes);
        let data = Array4::from_shape_vec((frames, h, w, 3), bytes)
            .map_err(|e| EngineError::DimensionMismatch(format!("decoded video batch: {e}")))?;
        let index = self.next_index;
        self.next_index += 1;
        debug!(batch = index, frames, "Decoded video batch");
        Ok(Some(Batch {
            index,
            frames: FrameTensor::from_nhwc(stream.track(data))?,
            modality: Modality::Video,
            units: vec![unit_name(&self.path); frames],
        }))
    }

    fn framerate(&self) -> Framerate {
        self.info.framerate
    }

    fn modality(&self) -> Modality {
        Modality::Video
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

// ─── Sink ────────────────────────────────────────────────────────────────────

/// Encodes processed frames into `out_<input stem>.mp4` at the source rate.
pub struct VideoSink {
    output_dir: PathBuf,
    output_path: PathBuf,
    framerate: Framerate,
    order: SinkOrder,
    frame_size: Option<ImageSize>,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    worker: Option<JoinHandle<Result<u64>>>,
    written: u64,
    started: bool,
    joined: bool,
    /// Message of a failed `join`, replayed by later calls.
    join_failure: Option<String>,
}

impl VideoSink {
    /// Fails with a configuration error when `framerate` is zero.
    pub fn new(output_dir: impl Into<PathBuf>, input: &Path, framerate: Framerate) -> Result<Self> {
        if framerate.is_zero() {
            return Err(EngineError::Configuration(
                "video sink requires a non-zero framerate".into(),
            ));
        }
        let output_dir = output_dir.into();
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".into());
        Ok(Self {
            output_path: output_dir.join(format!("out_{stem}.mp4")),
            output_dir,
            framerate,
            order: SinkOrder::default(),
            frame_size: None,
            tx: None,
            worker: None,
            written: 0,
            started: false,
            joined: false,
            join_failure: None,
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn spawn_encoder(&mut self, size: ImageSize) -> Result<mpsc::Sender<Vec<u8>>> {
        let mut child = Command::new(ffmpeg_bin())
            .args(encoder_args(size, self.framerate, &self.output_path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Encode(format!("failed to run ffmpeg: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Encode("ffmpeg stdin unavailable".into()))?;
        let stderr = StderrTail::spawn(child.stderr.take())?;

        let (tx, rx) = mpsc::channel(ENCODE_QUEUE_DEPTH);
        let worker = std::thread::Builder::new()
            .name("segblur-video-writer".into())
            .spawn(move || pump_frames(child, stdin, stderr, rx))?;
        self.worker = Some(worker);
        info!(
            output = %self.output_path.display(),
            size = %size,
            fps = %self.framerate,
            "Video encoder started"
        );
        Ok(tx)
    }

    fn collect_worker(&mut self) -> Result<()> {
        self.tx = None;
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.written = worker
            .join()
            .map_err(|_| EngineError::Encode("video writer thread panicked".into()))??;
        Ok(())
    }
}

fn pump_frames(
    mut child: Child,
    mut stdin: ChildStdin,
    mut stderr: StderrTail,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> Result<u64> {
    let mut count = 0u64;
    while let Some(frame) = rx.blocking_recv() {
        if let Err(e) = stdin.write_all(&frame) {
            drop(stdin);
            let _ = child.kill();
            let _ = child.wait();
            let detail = stderr.finish();
            return Err(EngineError::Encode(format!("encoder pipe: {e} {detail}")));
        }
        count += 1;
    }
    drop(stdin);
    let status = child
        .wait()
        .map_err(|e| EngineError::Encode(format!("waiting for ffmpeg: {e}")))?;
    let detail = stderr.finish();
    if !status.success() {
        return Err(EngineError::Encode(format!("ffmpeg exited with {status}: {detail}")));
    }
    Ok(count)
}

impl MediaSink for VideoSink {
    fn start(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        self.started = true;
        Ok(())
    }

    fn accept(&mut self, batch: Batch, _stream: &ExecutionStream) -> Result<()> {
        if !self.started || self.joined {
            return Err(EngineError::Consistency(
                "video sink accepts batches only between start() and join()".into(),
            ));
        }
        self.order.admit(batch.index)?;
        let size = batch.frames.size();
        match self.frame_size {
            Some(expected) if expected != size => {
                return Err(EngineError::DimensionMismatch(format!(
                    "video frame size changed from {expected} to {size}"
                )));
            }
            Some(_) => {}
            None => {
                let tx = self.spawn_encoder(size)?;
                self.tx = Some(tx);
                self.frame_size = Some(size);
            }
        }

        for i in 0..batch.len() {
            let bytes: Vec<u8> = batch.frames.frame(i).iter().copied().collect();
            let Some(tx) = &self.tx else {
                return Err(EngineError::ChannelClosed);
            };
            if tx.blocking_send(bytes).is_err() {
                return Err(match self.collect_worker() {
                    Err(e) => e,
                    Ok(()) => EngineError::ChannelClosed,
                });
            }
        }
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        if self.joined {
            return match &self.join_failure {
                Some(msg) => Err(EngineError::Encode(msg.clone())),
                None => Ok(()),
            };
        }
        self.joined = true;
        if self.frame_size.is_none() {
            warn!(output = %self.output_path.display(), "Video sink received no frames");
        }
        if let Err(e) = self.collect_worker() {
            self.join_failure = Some(e.to_string());
            return Err(e);
        }
        info!(frames = self.written, output = %self.output_path.display(), "Video sink drained");
        Ok(())
    }

    fn input_layout(&self) -> TensorLayout {
        TensorLayout::Nhwc
    }

    fn memory_space(&self) -> MemorySpace {
        MemorySpace::Host
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        if let Err(e) = self.collect_worker() {
            warn!(error = %e, "Video writer failed during drop");
        }
    }
}
