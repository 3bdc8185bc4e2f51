//! Translation of `replay` CLI arguments into a [`ReplayConfig`] the replay
//! loop uses without re-parsing flags.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};

/// Graph presets with the stream names their graphs publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TaskPreset {
    FaceDetection,
    FaceMesh,
    HandTracking,
    PoseTracking,
    Holistic,
    FaceBlendshapes,
}

impl TaskPreset {
    pub fn name(self) -> &'static str {
        match self {
            TaskPreset::FaceDetection => "face-detection",
            TaskPreset::FaceMesh => "face-mesh",
            TaskPreset::HandTracking => "hand-tracking",
            TaskPreset::PoseTracking => "pose-tracking",
            TaskPreset::Holistic => "holistic",
            TaskPreset::FaceBlendshapes => "face-blendshapes",
        }
    }
}

/// How outputs leave the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Handlers run on the engine thread as packets arrive.
    #[default]
    Callback,
    /// One consumer thread per channel drains a poller.
    Poll,
}

/// Where frames come from.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameInput {
    /// Solid frames with a per-frame colour, `count` of them.
    Synthetic { count: u64, fps: f32 },
    /// Raw interleaved `rgb24` file, optionally truncated to `limit` frames.
    RawFile { path: PathBuf, limit: Option<u64> },
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and metrics.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing session spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Print the Prometheus rendering of session metrics to stderr on exit.
    pub print_metrics: bool,
}

#[derive(Clone, Debug)]
/// Everything the replay loop needs.
pub struct ReplayConfig {
    /// Graph description handed to the engine.
    pub graph: PathBuf,
    /// Task preset selecting output shape and stream names.
    pub task: TaskPreset,
    /// Callback or poller delivery.
    pub mode: OutputMode,
    /// Frame source.
    pub input: FrameInput,
    /// Frame dimensions in pixels.
    pub size: (u32, u32),
    /// Fixed timestamp spacing; `None` stamps frames from the session clock.
    pub timestamp_step_us: Option<i64>,
    /// Restrict binding to these output streams; empty binds every channel.
    pub streams: Vec<String>,
    /// Also report frames arriving on the preview stream.
    pub preview: bool,
    /// Bound on each poller queue.
    pub poller_capacity: Option<usize>,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

impl ReplayConfig {
    /// Whether the channel published on `stream` should be bound.
    pub fn wants(&self, stream: &str) -> bool {
        self.streams.is_empty() || self.streams.iter().any(|wanted| wanted == stream)
    }
}

/// CLI arguments accepted by the `replay` subcommand.
#[derive(Debug, Args)]
pub struct ReplayCliArgs {
    /// Graph description file.
    #[arg(long = "graph", value_name = "PATH")]
    pub graph: PathBuf,
    /// Task preset.
    #[arg(long = "task", value_enum)]
    pub task: TaskPreset,
    /// Output delivery mode.
    #[arg(long = "mode", value_enum, default_value_t = OutputMode::Callback)]
    pub mode: OutputMode,
    /// Raw rgb24 frame file; synthetic frames are generated when omitted.
    #[arg(long = "input", value_name = "PATH")]
    pub input: Option<PathBuf>,
    /// Frame count (synthetic) or frame limit (raw input).
    #[arg(long = "frames", value_name = "N")]
    pub frames: Option<u64>,
    /// Frame size as WIDTHxHEIGHT.
    #[arg(long = "size", value_name = "WxH", default_value = "640x480")]
    pub size: String,
    /// Pace synthetic frames at this rate; 0 feeds as fast as possible.
    #[arg(long = "fps", value_name = "FPS", default_value_t = 0.0)]
    pub fps: f32,
    /// Stamp frame N at N * STEP microseconds instead of using the clock.
    #[arg(long = "timestamp-step-us", value_name = "STEP")]
    pub timestamp_step_us: Option<i64>,
    /// Bind only this output stream (repeatable).
    #[arg(long = "stream", value_name = "NAME")]
    pub streams: Vec<String>,
    /// Report preview frames.
    #[arg(long = "preview", action = clap::ArgAction::SetTrue)]
    pub preview: bool,
    /// Bound each poller queue to N packets.
    #[arg(long = "poller-capacity", value_name = "N")]
    pub poller_capacity: Option<usize>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Print session metrics in Prometheus format on exit.
    #[arg(long = "metrics", action = clap::ArgAction::SetTrue)]
    pub metrics: bool,
}

const DEFAULT_SYNTHETIC_FRAMES: u64 = 30;

impl TryFrom<ReplayCliArgs> for ReplayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ReplayCliArgs) -> Result<Self> {
        let size = parse_size(&args.size)?;

        if !(args.fps >= 0.0 && args.fps.is_finite()) {
            bail!("--fps must be a non-negative number");
        }

        if let Some(step) = args.timestamp_step_us {
            if step <= 0 {
                bail!("--timestamp-step-us must be a positive integer");
            }
        }

        if args.poller_capacity == Some(0) {
            bail!("--poller-capacity must be at least 1");
        }

        let input = match args.input {
            Some(path) => FrameInput::RawFile {
                path,
                limit: args.frames,
            },
            None => FrameInput::Synthetic {
                count: args.frames.unwrap_or(DEFAULT_SYNTHETIC_FRAMES),
                fps: args.fps,
            },
        };

        Ok(Self {
            graph: args.graph,
            task: args.task,
            mode: args.mode,
            input,
            size,
            timestamp_step_us: args.timestamp_step_us,
            streams: args.streams,
            preview: args.preview,
            poller_capacity: args.poller_capacity,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                print_metrics: args.metrics,
            },
        })
    }
}

fn parse_size(text: &str) -> Result<(u32, u32)> {
    let Some((width, height)) = text.split_once(['x', 'X']) else {
        bail!("--size must look like WIDTHxHEIGHT, got {text:?}");
    };
    let (Ok(width), Ok(height)) = (width.trim().parse::<u32>(), height.trim().parse::<u32>())
    else {
        bail!("--size must look like WIDTHxHEIGHT, got {text:?}");
    };
    if width == 0 || height == 0 {
        bail!("Frame width and height must be positive integers");
    }
    Ok((width, height))
}
