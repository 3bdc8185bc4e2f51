//! Replay frames through a session and print every output as one JSON line.
//!
//! Outputs are produced on engine or poller threads and funnelled through a
//! channel to a single writer thread so lines never interleave.

use std::{
    io::{self, BufWriter, Write},
    sync::{
        Arc, Once,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use graphpipe_ingest::{
    CaptureError, Frame, Timestamp, open_raw_reader, spawn_synthetic_reader,
};
use graphpipe_session::{
    ChannelLayout, DetectionTask, GraphSource, HolisticLayout, HolisticTask, LoopbackEngine,
    MultiLandmarkTask, OutputPoller, ScoreTask, Session, SessionConfig, SessionError,
    SingleLandmarkTask, TaskVariant, telemetry::spawn_thread,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, info_span, warn};

use crate::config::{FrameInput, OutputMode, ReplayConfig, TaskPreset};

/// One line of replay output.
#[derive(Debug, Serialize)]
struct OutputLine {
    stream: String,
    timestamp: Timestamp,
    present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

impl OutputLine {
    fn new<T: Serialize>(stream: &str, timestamp: Timestamp, value: Option<&T>) -> Self {
        Self {
            stream: stream.to_owned(),
            timestamp,
            present: value.is_some(),
            value: value.and_then(|value| match serde_json::to_value(value) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(stream, %timestamp, "failed to serialize output: {err}");
                    None
                }
            }),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReplaySummary {
    pub(crate) frames_fed: u64,
    pub(crate) lines_written: u64,
    pub(crate) runtime_errors: u64,
}

/// Replay the configured input, stopping early on Ctrl+C.
pub(crate) fn run(config: &ReplayConfig) -> Result<ReplaySummary> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let _span = info_span!(
        "replay",
        task = config.task.name(),
        graph = %config.graph.display(),
        mode = ?config.mode
    )
    .entered();

    match config.task {
        TaskPreset::FaceDetection => {
            replay::<DetectionTask>(config, ChannelLayout::face_detection(), &shutdown)
        }
        TaskPreset::FaceMesh => {
            replay::<MultiLandmarkTask>(config, ChannelLayout::face_mesh(), &shutdown)
        }
        TaskPreset::HandTracking => {
            replay::<MultiLandmarkTask>(config, ChannelLayout::hand_tracking(), &shutdown)
        }
        TaskPreset::PoseTracking => {
            replay::<SingleLandmarkTask>(config, ChannelLayout::pose_tracking(), &shutdown)
        }
        TaskPreset::Holistic => {
            replay::<HolisticTask>(config, HolisticLayout::default(), &shutdown)
        }
        TaskPreset::FaceBlendshapes => {
            replay::<ScoreTask>(config, ChannelLayout::face_blendshapes(), &shutdown)
        }
    }
}

fn replay<V>(config: &ReplayConfig, layout: V::Layout, shutdown: &AtomicBool) -> Result<ReplaySummary>
where
    V: TaskVariant,
    V::Output: Serialize,
{
    let session_config = SessionConfig {
        poller_capacity: config.poller_capacity,
        ..SessionConfig::default()
    };
    let mut session = Session::<V>::with_layout(LoopbackEngine::new(), session_config, layout);
    session
        .configure(GraphSource::file(&config.graph))
        .with_context(|| format!("failed to load graph {}", config.graph.display()))?;

    let runtime_errors = Arc::new(AtomicU64::new(0));
    let error_count = runtime_errors.clone();
    session.set_error_sink(move |_err| {
        error_count.fetch_add(1, Ordering::Relaxed);
    });

    let (line_tx, line_rx) = unbounded::<OutputLine>();
    let writer = spawn_thread("output-writer", move || write_lines(line_rx))
        .context("failed to spawn output writer")?;

    let consumers = bind_outputs::<V>(&mut session, config, &line_tx)?;
    if config.preview {
        let tx = line_tx.clone();
        let stream = session.config().preview_stream.clone();
        session.set_preview_callback(move |timestamp, frame| {
            let size = serde_json::json!({ "width": frame.width(), "height": frame.height() });
            let _ = tx.send(OutputLine::new(&stream, timestamp, Some(&size)));
        })?;
    }
    drop(line_tx);

    session.start().context("failed to start graph")?;
    let fed = feed_frames(&mut session, config, shutdown);
    session.stop();

    for consumer in consumers {
        consumer
            .join()
            .map_err(|_| anyhow!("poller thread panicked"))?
            .context("poller failed")?;
    }
    let lines_written = writer
        .join()
        .map_err(|_| anyhow!("output writer panicked"))?
        .context("failed to write output")?;
    let frames_fed = fed?;

    let summary = ReplaySummary {
        frames_fed,
        lines_written,
        runtime_errors: runtime_errors.load(Ordering::Relaxed),
    };
    info!(
        frames = summary.frames_fed,
        lines = summary.lines_written,
        runtime_errors = summary.runtime_errors,
        "replay finished"
    );
    Ok(summary)
}

type Consumer = JoinHandle<Result<(), SessionError>>;

fn bind_outputs<V>(
    session: &mut Session<V>,
    config: &ReplayConfig,
    lines: &Sender<OutputLine>,
) -> Result<Vec<Consumer>>
where
    V: TaskVariant,
    V::Output: Serialize,
{
    let mut consumers = Vec::new();
    for &slot in V::SLOTS {
        let stream = V::streams(session.layout(), slot).output.to_owned();
        if !config.wants(&stream) {
            continue;
        }
        let tx = lines.clone();
        match config.mode {
            OutputMode::Callback => {
                session.bind_callback(slot, move |timestamp, output| {
                    let _ = tx.send(OutputLine::new(&stream, timestamp, Some(&output)));
                })?;
            }
            OutputMode::Poll => {
                let poller = session.bind_poller(slot)?;
                let consumer = spawn_thread(format!("poll-{stream}"), move || {
                    drain_poller(poller, tx)
                })
                .context("failed to spawn poller thread")?;
                consumers.push(consumer);
            }
        }
    }
    Ok(consumers)
}

fn drain_poller<V>(mut poller: OutputPoller<V>, lines: Sender<OutputLine>) -> Result<(), SessionError>
where
    V: TaskVariant,
    V::Output: Serialize,
{
    let stream = poller.stream().to_owned();
    while let Some(observation) = poller.next()? {
        let line = OutputLine::new(&stream, observation.timestamp, observation.value.as_ref());
        if lines.send(line).is_err() {
            break;
        }
    }
    Ok(())
}

fn feed_frames<V: TaskVariant>(
    session: &mut Session<V>,
    config: &ReplayConfig,
    shutdown: &AtomicBool,
) -> Result<u64> {
    let (frames, limit) = open_input(config)?;
    let mut fed: u64 = 0;
    for frame in frames.iter() {
        if shutdown.load(Ordering::SeqCst) {
            info!("shutdown requested, stopping replay");
            break;
        }
        if limit.is_some_and(|limit| fed >= limit) {
            break;
        }
        let frame = frame.context("frame source failed")?;
        match config.timestamp_step_us {
            Some(step) => {
                let micros = step.saturating_mul(fed as i64 + 1);
                session.feed_at(frame, Timestamp::from_micros(micros))?;
            }
            None => {
                session.feed(frame)?;
            }
        }
        fed += 1;
    }
    Ok(fed)
}

fn open_input(
    config: &ReplayConfig,
) -> Result<(Receiver<Result<Frame, CaptureError>>, Option<u64>)> {
    match &config.input {
        FrameInput::Synthetic { count, fps } => {
            let frames = spawn_synthetic_reader(config.size, *count, *fps)
                .context("failed to start synthetic frame source")?;
            Ok((frames, None))
        }
        FrameInput::RawFile { path, limit } => {
            let frames = open_raw_reader(path, config.size)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Ok((frames, *limit))
        }
    }
}

fn write_lines(lines: Receiver<OutputLine>) -> io::Result<u64> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut written: u64 = 0;
    for line in lines.iter() {
        serde_json::to_writer(&mut out, &line)?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}
