use std::{
    marker::PhantomData,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use graphpipe_ingest::{Frame, Timestamp};
use graphpipe_records::marshal;
use tracing::{debug, error, info, info_span, trace, warn};

use crate::{
    binding::{BindingTable, Gated, GatedPoller, PollResult, Poller, Wait},
    config::{GraphSource, SessionConfig},
    engine::{EngineFault, EngineStatus, FaultSink, GraphEngine, Packet},
    error::{ErrorSink, Result, SessionError},
    lifecycle::{Lifecycle, SessionState},
    preview::{LatestFrame, preview_handler},
    task::{BufferedTask, Primary, TaskKind, TaskVariant, decode},
    telemetry::{FEED_LATENCY, FRAMES_FED, FRAMES_REJECTED, RUNTIME_ERRORS},
};

type SharedSink = Arc<Mutex<Option<ErrorSink>>>;

/// A graph run for one task, from configuration through drain.
///
/// Outputs are bound while the session is configured and take effect when it
/// starts. Frames are fed from a single caller thread; callbacks and poller
/// queues are filled on the engine's own threads.
pub struct Session<V: TaskVariant> {
    engine: Box<dyn GraphEngine>,
    config: SessionConfig,
    layout: V::Layout,
    lifecycle: Lifecycle,
    bindings: BindingTable,
    graph: Option<String>,
    error_sink: SharedSink,
    _task: PhantomData<fn() -> V>,
}

impl<V: TaskVariant> Session<V> {
    pub fn new(engine: impl GraphEngine + 'static) -> Self {
        Self::with_config(engine, SessionConfig::default())
    }

    pub fn with_config(engine: impl GraphEngine + 'static, config: SessionConfig) -> Self {
        Self::with_layout(engine, config, V::default_layout())
    }

    pub fn with_layout(
        engine: impl GraphEngine + 'static,
        config: SessionConfig,
        layout: V::Layout,
    ) -> Self {
        let bindings = BindingTable::new(config.poller_capacity);
        Self {
            engine: Box::new(engine),
            config,
            layout,
            lifecycle: Lifecycle::new(),
            bindings,
            graph: None,
            error_sink: Arc::new(Mutex::new(None)),
            _task: PhantomData,
        }
    }

    pub fn kind(&self) -> TaskKind {
        V::KIND
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn layout(&self) -> &V::Layout {
        &self.layout
    }

    /// Timestamp of the last frame the engine accepted in this run.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.lifecycle.last_timestamp()
    }

    /// Receive errors raised on engine threads. Every such error is also
    /// logged and counted whether or not a sink is set.
    pub fn set_error_sink<F>(&mut self, sink: F)
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        *self
            .error_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(sink));
    }

    /// Load and validate a graph. Allowed before the first run and after a
    /// stop; on failure the session keeps its previous state.
    pub fn configure(&mut self, graph: impl Into<GraphSource>) -> Result<()> {
        self.lifecycle.ensure_configurable()?;
        let source = graph.into();
        let _span = info_span!("session.configure", task = %V::KIND, source = ?source).entered();

        let text = source.load()?;
        self.engine.initialize(&text).map_err(|status| {
            warn!("graph rejected: {status}");
            SessionError::Config(status)
        })?;
        if !self.engine.has_input_stream(&self.config.input_stream) {
            let status = EngineStatus::not_found(format!(
                "graph has no input stream named {:?}",
                self.config.input_stream
            ));
            warn!("graph rejected: {status}");
            return Err(SessionError::Config(status));
        }

        self.graph = Some(text);
        self.bindings.clear();
        self.lifecycle.configured();
        info!("graph configured");
        Ok(())
    }

    /// Deliver every output of `slot` to `handler` on the engine thread.
    ///
    /// Presence streams are not consulted in callback mode; the handler runs
    /// once per payload packet.
    pub fn bind_callback<F>(&mut self, slot: V::Slot, mut handler: F) -> Result<()>
    where
        F: FnMut(Timestamp, V::Output) + Send + 'static,
    {
        self.lifecycle.ensure_bindable("bind a callback")?;
        let stream = V::streams(&self.layout, slot).output.to_owned();
        let label = stream.clone();
        self.bindings.bind_callback(
            &stream,
            Box::new(move |packet: Packet| {
                let output = decode::<V>(&label, &packet.payload)
                    .map_err(|err| EngineStatus::invalid_argument(err.to_string()))?;
                handler(packet.timestamp, output);
                Ok(())
            }),
        )
    }

    /// Queue the outputs of `slot` for the caller to poll. When the layout
    /// names a presence stream the poller is gated on it.
    pub fn bind_poller(&mut self, slot: V::Slot) -> Result<OutputPoller<V>> {
        self.lifecycle.ensure_bindable("bind a poller")?;
        let streams = V::streams(&self.layout, slot);
        let source = match streams.presence {
            Some(presence) => {
                OutputSource::Gated(self.bindings.bind_gated(streams.output, presence)?)
            }
            None => OutputSource::Plain(self.bindings.bind_poller(streams.output)?),
        };
        Ok(OutputPoller::new(source, self.config.poll_timeout))
    }

    /// Observe any graph stream with raw engine packets.
    pub fn observe_stream<F>(&mut self, stream: &str, mut handler: F) -> Result<()>
    where
        F: FnMut(Packet) + Send + 'static,
    {
        self.lifecycle.ensure_bindable("observe a stream")?;
        self.bindings.bind_callback(
            stream,
            Box::new(move |packet| {
                handler(packet);
                Ok(())
            }),
        )
    }

    /// Queue raw engine packets from any graph stream.
    pub fn poll_stream(&mut self, stream: &str) -> Result<Poller> {
        self.lifecycle.ensure_bindable("poll a stream")?;
        self.bindings.bind_poller(stream)
    }

    /// Call `handler` with every frame the graph emits on the preview stream.
    pub fn set_preview_callback<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(Timestamp, &Frame) + Send + 'static,
    {
        self.lifecycle.ensure_bindable("bind the preview")?;
        let stream = self.config.preview_stream.clone();
        let handler = preview_handler(stream.clone(), handler);
        self.bindings.bind_callback(&stream, handler)
    }

    /// Keep the newest preview frame in a shared slot.
    pub fn preview_latest(&mut self) -> Result<LatestFrame> {
        let latest = LatestFrame::new();
        let slot = latest.clone();
        self.set_preview_callback(move |timestamp, frame| slot.store(timestamp, frame.clone()))?;
        Ok(latest)
    }

    /// Install bindings and start the graph. If the engine refuses, the
    /// bindings are dropped and the session is stopped; configure again to
    /// retry.
    pub fn start(&mut self) -> Result<()> {
        self.lifecycle.ensure_startable()?;
        let _span = info_span!(
            "session.start",
            task = %V::KIND,
            bindings = self.bindings.len()
        )
        .entered();

        self.engine.set_fault_sink(fault_sink(self.error_sink.clone()));
        let started = match self.bindings.install(self.engine.as_mut()) {
            Ok(()) => self.engine.start(),
            Err(status) => Err(status),
        };
        if let Err(status) = started {
            error!("graph failed to start: {status}");
            self.bindings.clear();
            // Reloading the graph drops observers installed before the failure.
            if let Some(graph) = &self.graph {
                if let Err(reset) = self.engine.initialize(graph) {
                    warn!("failed to reset engine after start failure: {reset}");
                }
            }
            self.lifecycle.stopped();
            return Err(SessionError::Start(status));
        }

        self.lifecycle.running();
        info!("graph running");
        Ok(())
    }

    /// Feed a frame stamped from the session clock, returning the stamp used.
    pub fn feed(&mut self, frame: Frame) -> Result<Timestamp> {
        let timestamp = self.lifecycle.next_clock_timestamp();
        self.feed_at(frame, timestamp)?;
        Ok(timestamp)
    }

    /// Feed a frame at an explicit timestamp, which must be later than every
    /// frame accepted before it in this run.
    pub fn feed_at(&mut self, frame: Frame, timestamp: Timestamp) -> Result<()> {
        if let Err(err) = self.lifecycle.admit(timestamp) {
            reject(&err);
            return Err(err);
        }

        let started = Instant::now();
        if let Err(status) = self
            .engine
            .add_packet(&self.config.input_stream, frame, timestamp)
        {
            let err = SessionError::FeedRejected { timestamp, status };
            reject(&err);
            return Err(err);
        }

        self.lifecycle.accepted(timestamp);
        metrics::counter!(FRAMES_FED).increment(1);
        metrics::histogram!(FEED_LATENCY).record(started.elapsed().as_secs_f64());
        trace!(%timestamp, "frame fed");
        Ok(())
    }

    /// Close the input and block until every accepted frame has been
    /// delivered. Pollers report closed once drained. If the engine cannot
    /// drain, the run is cancelled instead. Stopping a session that is not
    /// running only updates its state.
    pub fn stop(&mut self) {
        match self.lifecycle.state() {
            SessionState::Running => {
                let _span = info_span!("session.stop", task = %V::KIND).entered();
                let drained = self
                    .engine
                    .close_input(&self.config.input_stream)
                    .inspect_err(|status| warn!("failed to close input stream: {status}"))
                    .and_then(|()| self.engine.wait_until_done());
                if let Err(status) = drained {
                    warn!("graph did not drain cleanly, cancelling: {status}");
                    if let Err(status) = self.engine.cancel() {
                        error!("failed to cancel graph: {status}");
                    }
                }
                self.lifecycle.stopped();
                info!(last = ?self.lifecycle.last_timestamp(), "graph stopped");
            }
            SessionState::Configured => {
                self.bindings.clear();
                self.lifecycle.stopped();
                debug!("session stopped before start");
            }
            SessionState::Unconfigured | SessionState::Stopped => {}
        }
    }
}

impl<V> Session<V>
where
    V: TaskVariant<Slot = Primary>,
{
    pub fn on_output<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(Timestamp, V::Output) + Send + 'static,
    {
        self.bind_callback(Primary, handler)
    }

    pub fn output_poller(&mut self) -> Result<OutputPoller<V>> {
        self.bind_poller(Primary)
    }
}

impl<V: TaskVariant> Drop for Session<V> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fault_sink(shared: SharedSink) -> FaultSink {
    Arc::new(move |fault: EngineFault| {
        let timestamp = fault.timestamp;
        let err = SessionError::EngineRuntime {
            stream: fault.stream,
            timestamp: fault.timestamp,
            status: fault.status,
        };
        metrics::counter!(RUNTIME_ERRORS).increment(1);
        error!(?timestamp, "{err}");
        let sink = shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink(&err);
        }
    })
}

fn reject(err: &SessionError) {
    metrics::counter!(FRAMES_REJECTED, "reason" => err.kind()).increment(1);
    debug!("frame rejected: {err}");
}

enum OutputSource {
    Plain(Poller),
    Gated(GatedPoller),
}

/// One polled output. `value` is `None` when the presence stream reported
/// that nothing was found in the frame at `timestamp`.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation<T> {
    pub timestamp: Timestamp,
    pub value: Option<T>,
}

/// Caller-side queue of marshaled outputs for one task channel.
pub struct OutputPoller<V: TaskVariant> {
    source: OutputSource,
    timeout: Option<Duration>,
    _task: PhantomData<fn() -> V>,
}

impl<V: TaskVariant> OutputPoller<V> {
    fn new(source: OutputSource, timeout: Option<Duration>) -> Self {
        Self {
            source,
            timeout,
            _task: PhantomData,
        }
    }

    pub fn stream(&self) -> &str {
        match &self.source {
            OutputSource::Plain(poller) => poller.stream(),
            OutputSource::Gated(poller) => poller.payload_stream(),
        }
    }

    pub fn is_gated(&self) -> bool {
        matches!(self.source, OutputSource::Gated(_))
    }

    /// Block until the next output; `None` once the graph has drained.
    pub fn next(&mut self) -> Result<Option<Observation<V::Output>>> {
        Ok(self.poll(Wait::Block)?.ready())
    }

    pub fn next_timeout(&mut self, timeout: Duration) -> Result<PollResult<Observation<V::Output>>> {
        self.poll(Wait::after(timeout))
    }

    pub fn try_next(&mut self) -> Result<PollResult<Observation<V::Output>>> {
        self.poll(Wait::Never)
    }

    fn poll(&mut self, wait: Wait) -> Result<PollResult<Observation<V::Output>>> {
        let observed = match &mut self.source {
            OutputSource::Plain(poller) => poller.wait(wait).map(Gated::Present),
            OutputSource::Gated(poller) => poller.poll(wait)?,
        };
        match observed {
            PollResult::Ready(Gated::Present(packet)) => {
                let value = decode::<V>(self.stream(), &packet.payload)?;
                Ok(PollResult::Ready(Observation {
                    timestamp: packet.timestamp,
                    value: Some(value),
                }))
            }
            PollResult::Ready(Gated::Absent(timestamp)) => Ok(PollResult::Ready(Observation {
                timestamp,
                value: None,
            })),
            PollResult::Empty => Ok(PollResult::Empty),
            PollResult::Closed => Ok(PollResult::Closed),
        }
    }
}

impl<V: BufferedTask> OutputPoller<V> {
    /// Wait for the next output, up to the configured poll timeout, and copy
    /// it into `buffer`, which must hold exactly as many elements as the
    /// output carries.
    ///
    /// Returns `Ok(false)` when nothing was found, nothing arrived in time or
    /// the graph has drained. A count mismatch is an error and leaves
    /// `buffer` untouched.
    pub fn get_output(&mut self, buffer: &mut [V::Element]) -> Result<bool> {
        let PollResult::Ready(observation) = self.poll(Wait::timeout(self.timeout))? else {
            return Ok(false);
        };
        let Some(output) = observation.value else {
            return Ok(false);
        };
        let elements = V::elements(&output);
        if elements.is_empty() {
            return Ok(false);
        }
        marshal::copy_into(elements, buffer)?;
        Ok(true)
    }
}

impl<V: TaskVariant> std::fmt::Debug for OutputPoller<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPoller")
            .field("task", &V::KIND)
            .field("stream", &self.stream())
            .field("gated", &self.is_gated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{
        engine::loopback::LoopbackEngine,
        task::{DetectionTask, SingleLandmarkTask},
    };

    fn pose_graph() -> String {
        json!({
            "output_streams": { "pose_landmarks": "landmark_list" },
            "frames": [ { "emit": [ { "stream": "pose_landmarks",
                "value": { "landmark_list": { "landmark": [ {}, {} ] } } } ] } ]
        })
        .to_string()
    }

    fn frame() -> Frame {
        Frame::filled(2, 2, [0, 0, 0]).expect("frame")
    }

    #[test]
    fn operations_out_of_order_are_lifecycle_errors() {
        let mut session = Session::<SingleLandmarkTask>::new(LoopbackEngine::new());
        assert!(matches!(
            session.output_poller(),
            Err(SessionError::Lifecycle { state: SessionState::Unconfigured, .. })
        ));
        assert!(matches!(
            session.start(),
            Err(SessionError::Lifecycle { operation: "start", .. })
        ));
        assert!(matches!(
            session.feed(frame()),
            Err(SessionError::Lifecycle { operation: "feed", .. })
        ));

        session.configure(pose_graph()).expect("configure");
        session.start().expect("start");
        assert!(matches!(
            session.configure(pose_graph()),
            Err(SessionError::Lifecycle { state: SessionState::Running, .. })
        ));
        assert!(matches!(
            session.on_output(|_, _| {}),
            Err(SessionError::Lifecycle { state: SessionState::Running, .. })
        ));
    }

    #[test]
    fn failed_configure_keeps_previous_state() {
        let mut session = Session::<SingleLandmarkTask>::new(LoopbackEngine::new());
        assert!(matches!(
            session.configure("not a graph"),
            Err(SessionError::Config(_))
        ));
        assert_eq!(session.state(), SessionState::Unconfigured);
        assert!(matches!(
            session.configure(GraphSource::file("/no/such/graph.json")),
            Err(SessionError::GraphFile { .. })
        ));
        assert_eq!(session.state(), SessionState::Unconfigured);
    }

    #[test]
    fn binding_a_stream_the_graph_lacks_fails_start() {
        let mut session = Session::<DetectionTask>::new(LoopbackEngine::new());
        session.configure(pose_graph()).expect("configure");
        session.on_output(|_, _| {}).expect("bind");
        assert!(matches!(session.start(), Err(SessionError::Start(_))));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn callbacks_fire_once_per_payload_and_stop_is_idempotent() {
        let mut session = Session::<SingleLandmarkTask>::new(LoopbackEngine::new());
        session.configure(pose_graph()).expect("configure");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        session
            .on_output(move |_, landmarks| {
                assert_eq!(landmarks.len(), 2);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("bind");
        session.start().expect("start");
        for _ in 0..4 {
            session.feed(frame()).expect("feed");
        }
        session.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(session.state(), SessionState::Stopped);
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn clock_stamps_follow_explicit_ones() {
        let mut session = Session::<SingleLandmarkTask>::new(LoopbackEngine::new());
        session.configure(pose_graph()).expect("configure");
        session.start().expect("start");
        let far = Timestamp::from_micros(1 << 50);
        session.feed_at(frame(), far).expect("explicit");
        let next = session.feed(frame()).expect("clock");
        assert_eq!(next, far.successor());
    }

    /// Engine whose input refuses to close, so every stop has to cancel.
    struct StuckInput(LoopbackEngine);

    impl GraphEngine for StuckInput {
        fn initialize(&mut self, graph: &str) -> std::result::Result<(), EngineStatus> {
            self.0.initialize(graph)
        }

        fn set_fault_sink(&mut self, sink: FaultSink) {
            self.0.set_fault_sink(sink)
        }

        fn has_input_stream(&self, stream: &str) -> bool {
            self.0.has_input_stream(stream)
        }

        fn observe(
            &mut self,
            stream: &str,
            handler: crate::engine::PacketHandler,
        ) -> std::result::Result<(), EngineStatus> {
            self.0.observe(stream, handler)
        }

        fn start(&mut self) -> std::result::Result<(), EngineStatus> {
            self.0.start()
        }

        fn add_packet(
            &mut self,
            stream: &str,
            frame: Frame,
            timestamp: Timestamp,
        ) -> std::result::Result<(), EngineStatus> {
            self.0.add_packet(stream, frame, timestamp)
        }

        fn close_input(&mut self, _stream: &str) -> std::result::Result<(), EngineStatus> {
            Err(EngineStatus::unavailable("input is wedged"))
        }

        fn wait_until_done(&mut self) -> std::result::Result<(), EngineStatus> {
            self.0.wait_until_done()
        }

        fn cancel(&mut self) -> std::result::Result<(), EngineStatus> {
            self.0.cancel()
        }
    }

    #[test]
    fn graph_with_a_differently_named_input_is_a_config_error() {
        let camera = json!({
            "input_stream": "camera",
            "output_streams": { "pose_landmarks": "landmark_list" },
            "frames": []
        })
        .to_string();
        let mut session = Session::<SingleLandmarkTask>::new(LoopbackEngine::new());
        let err = session.configure(camera.clone()).unwrap_err();
        assert!(
            matches!(&err, SessionError::Config(status) if status.message.contains("input_video")),
            "{err}"
        );
        assert_eq!(session.state(), SessionState::Unconfigured);

        let config = SessionConfig::default().with_input_stream("camera");
        let mut session = Session::<SingleLandmarkTask>::with_config(LoopbackEngine::new(), config);
        session.configure(camera).expect("configure with matching input");
    }

    #[test]
    fn stop_cancels_a_run_that_cannot_drain() {
        let mut session = Session::<SingleLandmarkTask>::new(StuckInput(LoopbackEngine::new()));
        session.configure(pose_graph()).expect("configure");
        let mut poller = session.output_poller().expect("poller");
        session.start().expect("start");
        session
            .feed_at(frame(), Timestamp::from_micros(1))
            .expect("feed");

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        // Cancelling may drop the queued frame, but the poller must close.
        while poller.next().expect("poll").is_some() {}
        session.configure(pose_graph()).expect("reconfigure");
    }

    #[test]
    fn stopping_a_configured_session_closes_pending_pollers() {
        let mut session = Session::<SingleLandmarkTask>::new(LoopbackEngine::new());
        session.configure(pose_graph()).expect("configure");
        let mut poller = session.output_poller().expect("poller");
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(poller.next().expect("poll"), None);
    }
}
