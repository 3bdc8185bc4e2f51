//! The seam between a session and the dataflow graph runtime.
//!
//! A session never evaluates graphs itself. It drives a [`GraphEngine`]:
//! hand it a graph description, register observers on named output streams,
//! start it, push frames into the input stream, then close the input and
//! wait for the graph to drain.

pub mod loopback;

use std::{fmt, sync::Arc};

use graphpipe_ingest::{Frame, Timestamp};
use graphpipe_records::native::{NativeClassificationList, NativeDetection, NativeLandmarkList};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical status codes reported by an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unavailable,
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::NotFound => "not found",
            StatusCode::AlreadyExists => "already exists",
            StatusCode::FailedPrecondition => "failed precondition",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Internal => "internal",
        };
        f.write_str(text)
    }
}

/// Error status returned by engine operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct EngineStatus {
    pub code: StatusCode,
    pub message: String,
}

impl EngineStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

/// Shape of the payload carried on a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Image,
    Presence,
    Detections,
    LandmarkList,
    LandmarkLists,
    Classifications,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PayloadKind::Image => "image",
            PayloadKind::Presence => "presence",
            PayloadKind::Detections => "detections",
            PayloadKind::LandmarkList => "landmark list",
            PayloadKind::LandmarkLists => "landmark lists",
            PayloadKind::Classifications => "classifications",
        };
        f.write_str(text)
    }
}

/// Engine-native packet contents.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Image(Frame),
    Presence(bool),
    Detections(Vec<NativeDetection>),
    LandmarkList(NativeLandmarkList),
    LandmarkLists(Vec<NativeLandmarkList>),
    Classifications(NativeClassificationList),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Image(_) => PayloadKind::Image,
            Payload::Presence(_) => PayloadKind::Presence,
            Payload::Detections(_) => PayloadKind::Detections,
            Payload::LandmarkList(_) => PayloadKind::LandmarkList,
            Payload::LandmarkLists(_) => PayloadKind::LandmarkLists,
            Payload::Classifications(_) => PayloadKind::Classifications,
        }
    }
}

/// A timestamped payload emitted on an output stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub timestamp: Timestamp,
    pub payload: Payload,
}

impl Packet {
    pub fn new(timestamp: Timestamp, payload: Payload) -> Self {
        Self { timestamp, payload }
    }
}

/// Observer invoked on an engine-owned thread for every packet of a stream.
///
/// Returning an error does not stop the graph; the engine forwards it to the
/// registered [`FaultSink`].
pub type PacketHandler = Box<dyn FnMut(Packet) -> Result<(), EngineStatus> + Send>;

/// An error raised while the graph was running rather than by a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineFault {
    pub stream: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub status: EngineStatus,
}

pub type FaultSink = Arc<dyn Fn(EngineFault) + Send + Sync>;

/// Dataflow graph runtime driven by a session.
///
/// Calls arrive from a single owner in the order `initialize`, `observe`*,
/// `start`, `add_packet`*, `close_input`, `wait_until_done`. A finished
/// engine may be initialized again for a new run.
pub trait GraphEngine: Send {
    /// Parse and validate a textual graph description.
    fn initialize(&mut self, graph: &str) -> Result<(), EngineStatus>;

    /// Register where runtime faults go. Replaces any previous sink.
    fn set_fault_sink(&mut self, sink: FaultSink);

    /// Whether the loaded graph accepts frames on `stream`.
    fn has_input_stream(&self, stream: &str) -> bool;

    /// Attach `handler` to an output stream before the run starts.
    fn observe(&mut self, stream: &str, handler: PacketHandler) -> Result<(), EngineStatus>;

    fn start(&mut self) -> Result<(), EngineStatus>;

    /// Push one frame into an input stream. Timestamps must strictly increase.
    fn add_packet(
        &mut self,
        stream: &str,
        frame: Frame,
        timestamp: Timestamp,
    ) -> Result<(), EngineStatus>;

    fn close_input(&mut self, stream: &str) -> Result<(), EngineStatus>;

    /// Block until every accepted frame has been processed and delivered.
    /// Observers are released once this returns.
    fn wait_until_done(&mut self) -> Result<(), EngineStatus>;

    /// Tear down the current run whatever state its inputs are in. Queued
    /// frames may be dropped; observers are released once this returns.
    fn cancel(&mut self) -> Result<(), EngineStatus>;
}

impl<E: GraphEngine + ?Sized> GraphEngine for Box<E> {
    fn initialize(&mut self, graph: &str) -> Result<(), EngineStatus> {
        (**self).initialize(graph)
    }

    fn set_fault_sink(&mut self, sink: FaultSink) {
        (**self).set_fault_sink(sink)
    }

    fn has_input_stream(&self, stream: &str) -> bool {
        (**self).has_input_stream(stream)
    }

    fn observe(&mut self, stream: &str, handler: PacketHandler) -> Result<(), EngineStatus> {
        (**self).observe(stream, handler)
    }

    fn start(&mut self) -> Result<(), EngineStatus> {
        (**self).start()
    }

    fn add_packet(
        &mut self,
        stream: &str,
        frame: Frame,
        timestamp: Timestamp,
    ) -> Result<(), EngineStatus> {
        (**self).add_packet(stream, frame, timestamp)
    }

    fn close_input(&mut self, stream: &str) -> Result<(), EngineStatus> {
        (**self).close_input(stream)
    }

    fn wait_until_done(&mut self) -> Result<(), EngineStatus> {
        (**self).wait_until_done()
    }

    fn cancel(&mut self) -> Result<(), EngineStatus> {
        (**self).cancel()
    }
}
