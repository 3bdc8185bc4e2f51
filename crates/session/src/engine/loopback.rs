//! Scripted in-process engine.
//!
//! The graph description is a JSON document naming the input stream, the
//! typed output streams and a cyclic list of per-frame emissions. Each fed
//! frame is handled on a worker thread: the scripted packets for that frame
//! index are delivered to their observers at the frame's timestamp, and the
//! frame itself is echoed on the preview stream when one is declared.
//!
//! ```json
//! {
//!   "input_stream": "input_video",
//!   "preview_stream": "output_video",
//!   "output_streams": { "pose_landmarks": "landmark_list" },
//!   "frames": [
//!     { "emit": [ { "stream": "pose_landmarks",
//!                   "value": { "landmark_list": { "landmark": [ { "x": 0.5 } ] } } } ] },
//!     { "emit": [ { "stream": "pose_landmarks", "value": { "error": "tracker lost" } } ] }
//!   ]
//! }
//! ```

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use graphpipe_ingest::{Frame, Timestamp};
use graphpipe_records::native::{NativeClassificationList, NativeDetection, NativeLandmarkList};
use serde::Deserialize;
use tracing::{debug, debug_span, warn};

use super::{
    EngineFault, EngineStatus, FaultSink, GraphEngine, Packet, PacketHandler, Payload, PayloadKind,
};
use crate::telemetry;

pub const DEFAULT_QUEUE_DEPTH: usize = 16;

fn default_input_stream() -> String {
    "input_video".to_owned()
}

/// Parsed loopback graph description.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopbackGraph {
    #[serde(default = "default_input_stream")]
    pub input_stream: String,
    #[serde(default)]
    pub preview_stream: Option<String>,
    #[serde(default)]
    pub output_streams: BTreeMap<String, PayloadKind>,
    #[serde(default)]
    pub frames: Vec<ScriptedFrame>,
    /// Artificial per-frame processing delay.
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptedFrame {
    #[serde(default)]
    pub emit: Vec<ScriptedPacket>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptedPacket {
    pub stream: String,
    pub value: ScriptedValue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedValue {
    Presence(bool),
    Detections(Vec<NativeDetection>),
    LandmarkList(NativeLandmarkList),
    LandmarkLists(Vec<NativeLandmarkList>),
    Classifications(NativeClassificationList),
    /// Raise a runtime fault on the stream instead of emitting a packet.
    Error(String),
}

impl ScriptedValue {
    fn kind(&self) -> Option<PayloadKind> {
        match self {
            ScriptedValue::Presence(_) => Some(PayloadKind::Presence),
            ScriptedValue::Detections(_) => Some(PayloadKind::Detections),
            ScriptedValue::LandmarkList(_) => Some(PayloadKind::LandmarkList),
            ScriptedValue::LandmarkLists(_) => Some(PayloadKind::LandmarkLists),
            ScriptedValue::Classifications(_) => Some(PayloadKind::Classifications),
            ScriptedValue::Error(_) => None,
        }
    }

    fn to_payload(&self) -> Option<Payload> {
        let payload = match self {
            ScriptedValue::Presence(present) => Payload::Presence(*present),
            ScriptedValue::Detections(list) => Payload::Detections(list.clone()),
            ScriptedValue::LandmarkList(list) => Payload::LandmarkList(list.clone()),
            ScriptedValue::LandmarkLists(lists) => Payload::LandmarkLists(lists.clone()),
            ScriptedValue::Classifications(list) => Payload::Classifications(list.clone()),
            ScriptedValue::Error(_) => return None,
        };
        Some(payload)
    }
}

impl LoopbackGraph {
    pub fn parse(text: &str) -> Result<Self, EngineStatus> {
        let graph: LoopbackGraph = serde_json::from_str(text).map_err(|err| {
            EngineStatus::invalid_argument(format!("graph description is not valid: {err}"))
        })?;
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<(), EngineStatus> {
        if self.input_stream.trim().is_empty() {
            return Err(EngineStatus::invalid_argument("input stream name is empty"));
        }
        if self.output_streams.contains_key(&self.input_stream) {
            return Err(EngineStatus::invalid_argument(format!(
                "stream {:?} is declared as both input and output",
                self.input_stream
            )));
        }
        if let Some(preview) = &self.preview_stream {
            if *preview == self.input_stream || self.output_streams.contains_key(preview) {
                return Err(EngineStatus::invalid_argument(format!(
                    "preview stream {preview:?} collides with another stream"
                )));
            }
        }
        if let Some((name, _)) = self
            .output_streams
            .iter()
            .find(|(_, kind)| **kind == PayloadKind::Image)
        {
            return Err(EngineStatus::invalid_argument(format!(
                "output stream {name:?} cannot carry images; declare it as the preview stream"
            )));
        }

        for (index, frame) in self.frames.iter().enumerate() {
            let mut seen = HashSet::new();
            for packet in &frame.emit {
                let Some(declared) = self.output_streams.get(&packet.stream) else {
                    return Err(EngineStatus::invalid_argument(format!(
                        "frame #{index} emits on undeclared stream {:?}",
                        packet.stream
                    )));
                };
                if !seen.insert(packet.stream.as_str()) {
                    return Err(EngineStatus::invalid_argument(format!(
                        "frame #{index} emits twice on {:?}",
                        packet.stream
                    )));
                }
                if let Some(kind) = packet.value.kind() {
                    if kind != *declared {
                        return Err(EngineStatus::invalid_argument(format!(
                            "frame #{index} emits {kind} on {:?}, declared as {declared}",
                            packet.stream
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn accepts_observer(&self, stream: &str) -> bool {
        self.output_streams.contains_key(stream) || self.preview_stream.as_deref() == Some(stream)
    }

    fn scripted_frame(&self, index: u64) -> Option<&ScriptedFrame> {
        if self.frames.is_empty() {
            return None;
        }
        let slot = (index % self.frames.len() as u64) as usize;
        self.frames.get(slot)
    }
}

struct InputFrame {
    frame: Frame,
    timestamp: Timestamp,
}

struct Run {
    input: Option<Sender<InputFrame>>,
    worker: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
    last_timestamp: Option<Timestamp>,
}

impl Run {
    fn join(self) -> Result<(), EngineStatus> {
        self.worker
            .join()
            .map_err(|_| EngineStatus::internal("graph worker panicked"))
    }
}

/// In-process [`GraphEngine`] replaying a [`LoopbackGraph`] script.
pub struct LoopbackEngine {
    graph: Option<Arc<LoopbackGraph>>,
    observers: HashMap<String, PacketHandler>,
    faults: Option<FaultSink>,
    run: Option<Run>,
    queue_depth: usize,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Frames accepted ahead of the worker before `add_packet` blocks.
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            graph: None,
            observers: HashMap::new(),
            faults: None,
            run: None,
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn graph(&self) -> Option<&LoopbackGraph> {
        self.graph.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    fn loaded_graph(&self) -> Result<&Arc<LoopbackGraph>, EngineStatus> {
        self.graph
            .as_ref()
            .ok_or_else(|| EngineStatus::failed_precondition("graph has not been initialized"))
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphEngine for LoopbackEngine {
    fn initialize(&mut self, graph: &str) -> Result<(), EngineStatus> {
        if self.run.is_some() {
            return Err(EngineStatus::failed_precondition(
                "cannot initialize while a run is in progress",
            ));
        }
        let graph = LoopbackGraph::parse(graph)?;
        debug!(
            input = %graph.input_stream,
            outputs = graph.output_streams.len(),
            frames = graph.frames.len(),
            "loopback graph initialized"
        );
        self.graph = Some(Arc::new(graph));
        self.observers.clear();
        Ok(())
    }

    fn set_fault_sink(&mut self, sink: FaultSink) {
        self.faults = Some(sink);
    }

    fn has_input_stream(&self, stream: &str) -> bool {
        self.graph
            .as_ref()
            .is_some_and(|graph| graph.input_stream == stream)
    }

    fn observe(&mut self, stream: &str, handler: PacketHandler) -> Result<(), EngineStatus> {
        if self.run.is_some() {
            return Err(EngineStatus::failed_precondition(
                "observers must be attached before the run starts",
            ));
        }
        if !self.loaded_graph()?.accepts_observer(stream) {
            return Err(EngineStatus::not_found(format!(
                "graph has no output stream named {stream:?}"
            )));
        }
        self.observers.insert(stream.to_owned(), handler);
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineStatus> {
        if self.run.is_some() {
            return Err(EngineStatus::failed_precondition("graph is already running"));
        }
        let graph = self.loaded_graph()?.clone();
        let observers = std::mem::take(&mut self.observers);
        let faults = self.faults.clone();
        let (tx, rx) = bounded(self.queue_depth);
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = cancelled.clone();

        let worker = telemetry::spawn_thread("graphpipe-loopback", move || {
            run_worker(graph, observers, faults, rx, &worker_cancelled)
        })
        .map_err(|err| EngineStatus::internal(format!("failed to spawn graph worker: {err}")))?;

        self.run = Some(Run {
            input: Some(tx),
            worker,
            cancelled,
            last_timestamp: None,
        });
        Ok(())
    }

    fn add_packet(
        &mut self,
        stream: &str,
        frame: Frame,
        timestamp: Timestamp,
    ) -> Result<(), EngineStatus> {
        let input_stream = &self.loaded_graph()?.input_stream;
        if stream != input_stream {
            return Err(EngineStatus::not_found(format!(
                "graph has no input stream named {stream:?}"
            )));
        }
        let run = self
            .run
            .as_mut()
            .ok_or_else(|| EngineStatus::failed_precondition("graph is not running"))?;
        let input = run
            .input
            .as_ref()
            .ok_or_else(|| EngineStatus::failed_precondition("input stream is closed"))?;
        if let Some(last) = run.last_timestamp {
            if timestamp <= last {
                return Err(EngineStatus::invalid_argument(format!(
                    "timestamp {timestamp} is not after {last}"
                )));
            }
        }
        input
            .send(InputFrame { frame, timestamp })
            .map_err(|_| EngineStatus::unavailable("graph worker has exited"))?;
        run.last_timestamp = Some(timestamp);
        Ok(())
    }

    fn close_input(&mut self, stream: &str) -> Result<(), EngineStatus> {
        let input_stream = &self.loaded_graph()?.input_stream;
        if stream != input_stream {
            return Err(EngineStatus::not_found(format!(
                "graph has no input stream named {stream:?}"
            )));
        }
        let run = self
            .run
            .as_mut()
            .ok_or_else(|| EngineStatus::failed_precondition("graph is not running"))?;
        run.input = None;
        Ok(())
    }

    fn wait_until_done(&mut self) -> Result<(), EngineStatus> {
        let Some(run) = self.run.take() else {
            return Ok(());
        };
        if run.input.is_some() {
            self.run = Some(run);
            return Err(EngineStatus::failed_precondition(
                "input stream must be closed before waiting",
            ));
        }
        run.join()
    }

    fn cancel(&mut self) -> Result<(), EngineStatus> {
        let Some(mut run) = self.run.take() else {
            return Ok(());
        };
        run.cancelled.store(true, Ordering::SeqCst);
        run.input = None;
        debug!(last = ?run.last_timestamp, "cancelling loopback run");
        run.join()
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        if let Some(mut run) = self.run.take() {
            run.input = None;
            if run.worker.join().is_err() {
                warn!("loopback worker panicked during shutdown");
            }
        }
    }
}

fn run_worker(
    graph: Arc<LoopbackGraph>,
    mut observers: HashMap<String, PacketHandler>,
    faults: Option<FaultSink>,
    input: Receiver<InputFrame>,
    cancelled: &AtomicBool,
) {
    let latency = Duration::from_millis(graph.latency_ms);
    let mut index: u64 = 0;

    for InputFrame { frame, timestamp } in input.iter() {
        if cancelled.load(Ordering::SeqCst) {
            debug!(frames = index, "loopback worker cancelled");
            return;
        }
        let _span = debug_span!("loopback.frame", %timestamp, index).entered();
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        if let Some(scripted) = graph.scripted_frame(index) {
            for packet in &scripted.emit {
                match &packet.value {
                    ScriptedValue::Error(message) => report(
                        &faults,
                        EngineFault {
                            stream: Some(packet.stream.clone()),
                            timestamp: Some(timestamp),
                            status: EngineStatus::internal(message.clone()),
                        },
                    ),
                    value => {
                        if let Some(payload) = value.to_payload() {
                            deliver(&mut observers, &faults, &packet.stream, timestamp, payload);
                        }
                    }
                }
            }
        }

        if let Some(preview) = graph.preview_stream.as_deref() {
            deliver(
                &mut observers,
                &faults,
                preview,
                timestamp,
                Payload::Image(frame),
            );
        }
        index += 1;
    }

    debug!(frames = index, "loopback worker drained");
}

fn deliver(
    observers: &mut HashMap<String, PacketHandler>,
    faults: &Option<FaultSink>,
    stream: &str,
    timestamp: Timestamp,
    payload: Payload,
) {
    // Packets on streams nobody observes are discarded.
    let Some(handler) = observers.get_mut(stream) else {
        return;
    };
    if let Err(status) = handler(Packet::new(timestamp, payload)) {
        report(
            faults,
            EngineFault {
                stream: Some(stream.to_owned()),
                timestamp: Some(timestamp),
                status,
            },
        );
    }
}

fn report(faults: &Option<FaultSink>, fault: EngineFault) {
    match faults {
        Some(sink) => sink(fault),
        None => warn!(
            stream = fault.stream.as_deref().unwrap_or("-"),
            "unhandled graph fault: {}", fault.status
        ),
    }
}
