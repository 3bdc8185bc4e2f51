use std::sync::Arc;

use graphpipe_ingest::Timestamp;
use graphpipe_records::MarshalError;
use thiserror::Error;

use crate::{
    binding::BindingMode,
    engine::{EngineStatus, PayloadKind},
    lifecycle::SessionState,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("graph configuration failed: {0}")]
    Config(#[source] EngineStatus),
    #[error("failed to read graph description {path:?}")]
    GraphFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("graph failed to start: {0}")]
    Start(#[source] EngineStatus),
    #[error("cannot {operation} while the session is {state}")]
    Lifecycle {
        operation: &'static str,
        state: SessionState,
    },
    #[error("frame at {timestamp} rejected: it does not follow the previous frame at {previous}")]
    OutOfOrderFrame {
        timestamp: Timestamp,
        previous: Timestamp,
    },
    #[error("engine rejected frame at {timestamp}: {status}")]
    FeedRejected {
        timestamp: Timestamp,
        #[source]
        status: EngineStatus,
    },
    #[error("stream {stream:?} is already bound to a {existing}; it cannot also be bound to a {requested}")]
    DualBinding {
        stream: String,
        existing: BindingMode,
        requested: BindingMode,
    },
    #[error(
        "graph reported an error on {}: {status}",
        .stream.as_deref().unwrap_or("the graph")
    )]
    EngineRuntime {
        stream: Option<String>,
        timestamp: Option<Timestamp>,
        #[source]
        status: EngineStatus,
    },
    #[error("stream {stream:?} carried {found} where {expected} was expected")]
    UnexpectedPayload {
        stream: String,
        expected: PayloadKind,
        found: PayloadKind,
    },
    #[error("presence at {presence} on {stream:?} was paired with a payload at {payload}")]
    PairingBroken {
        stream: String,
        presence: Timestamp,
        payload: Timestamp,
    },
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

impl SessionError {
    /// Stable label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Config(_) | SessionError::GraphFile { .. } => "config",
            SessionError::Start(_) => "start",
            SessionError::Lifecycle { .. } => "lifecycle",
            SessionError::OutOfOrderFrame { .. } => "out_of_order",
            SessionError::FeedRejected { .. } => "feed_rejected",
            SessionError::DualBinding { .. } => "dual_binding",
            SessionError::EngineRuntime { .. } => "engine_runtime",
            SessionError::UnexpectedPayload { .. } => "unexpected_payload",
            SessionError::PairingBroken { .. } => "pairing_broken",
            SessionError::Marshal(_) => "output_size",
        }
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Caller-supplied destination for errors raised on engine threads.
pub type ErrorSink = Arc<dyn Fn(&SessionError) + Send + Sync>;
