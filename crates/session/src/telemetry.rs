//! Thread spawning and metric names shared by the session and its engines.

use std::{io, thread};

pub const FRAMES_FED: &str = "graphpipe_frames_fed_total";
pub const FRAMES_REJECTED: &str = "graphpipe_frames_rejected_total";
pub const PACKETS_DISPATCHED: &str = "graphpipe_packets_dispatched_total";
pub const RUNTIME_ERRORS: &str = "graphpipe_runtime_errors_total";
pub const POLLER_DEPTH: &str = "graphpipe_poller_depth";
pub const FEED_LATENCY: &str = "graphpipe_feed_latency_seconds";

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}
