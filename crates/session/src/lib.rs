//! Streaming session around a dataflow graph engine.
//!
//! A [`Session`] loads a graph description into a [`GraphEngine`], binds the
//! task's output channels to callbacks or pollers, feeds timestamped frames
//! and drains the graph on stop. Outputs are marshaled into caller-owned
//! records from `graphpipe-records` before they leave the engine thread or
//! poller.
//!
//! ```no_run
//! use graphpipe_ingest::Frame;
//! use graphpipe_session::{LoopbackEngine, Session, SingleLandmarkTask};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = Session::<SingleLandmarkTask>::new(LoopbackEngine::new());
//! session.configure(std::path::Path::new("pose.json"))?;
//! let mut poller = session.output_poller()?;
//! session.start()?;
//! session.feed(Frame::filled(640, 480, [0, 0, 0])?)?;
//! session.stop();
//! while let Some(observation) = poller.next()? {
//!     println!("{} -> {:?}", observation.timestamp, observation.value);
//! }
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod preview;
pub mod session;
pub mod task;
pub mod telemetry;

pub use binding::{BindingMode, BindingTable, Gated, GatedPoller, PollResult, Poller};
pub use config::{GraphSource, SessionConfig};
pub use engine::{
    EngineFault, EngineStatus, FaultSink, GraphEngine, Packet, PacketHandler, Payload,
    PayloadKind, StatusCode, loopback::LoopbackEngine,
};
pub use error::{ErrorSink, Result, SessionError};
pub use lifecycle::SessionState;
pub use preview::LatestFrame;
pub use session::{Observation, OutputPoller, Session};
pub use task::{
    BufferedTask, ChannelLayout, DetectionTask, HolisticLayout, HolisticPart, HolisticTask,
    MultiLandmarkTask, Primary, ScoreTask, SingleLandmarkTask, Streams, TaskKind, TaskVariant,
};
