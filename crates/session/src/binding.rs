//! Output channel bindings.
//!
//! Every output stream is bound at most once, either to a callback that the
//! engine invokes on its own thread or to a poller the caller drains. Pollers
//! exist from bind time; their queues are wired into the engine as observers
//! when the session starts, and close once the engine releases its observers
//! after draining.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, unbounded};
use graphpipe_ingest::Timestamp;
use tracing::{debug, trace};

use crate::{
    engine::{EngineStatus, GraphEngine, Packet, PacketHandler, Payload, PayloadKind},
    error::{Result, SessionError},
    telemetry::{PACKETS_DISPATCHED, POLLER_DEPTH},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingMode {
    Callback,
    Poller,
}

impl fmt::Display for BindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingMode::Callback => f.write_str("callback"),
            BindingMode::Poller => f.write_str("poller"),
        }
    }
}

enum Binding {
    Callback(PacketHandler),
    Poller(Sender<Packet>),
}

impl Binding {
    fn mode(&self) -> BindingMode {
        match self {
            Binding::Callback(_) => BindingMode::Callback,
            Binding::Poller(_) => BindingMode::Poller,
        }
    }
}

/// Bindings registered on a configured session, keyed by stream name.
pub struct BindingTable {
    entries: BTreeMap<String, Binding>,
    poller_capacity: Option<usize>,
}

impl BindingTable {
    /// `poller_capacity` bounds each poller queue; a full queue blocks the
    /// engine thread until the caller drains it. `None` leaves queues unbounded.
    pub fn new(poller_capacity: Option<usize>) -> Self {
        Self {
            entries: BTreeMap::new(),
            poller_capacity,
        }
    }

    pub fn mode(&self, stream: &str) -> Option<BindingMode> {
        self.entries.get(stream).map(Binding::mode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn streams(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn check(&self, stream: &str, requested: BindingMode) -> Result<()> {
        match self.mode(stream) {
            Some(existing) if existing != requested => Err(SessionError::DualBinding {
                stream: stream.to_owned(),
                existing,
                requested,
            }),
            _ => Ok(()),
        }
    }

    /// Bind `stream` to a callback, replacing an earlier callback on it.
    pub fn bind_callback(&mut self, stream: &str, handler: PacketHandler) -> Result<()> {
        self.check(stream, BindingMode::Callback)?;
        if self
            .entries
            .insert(stream.to_owned(), Binding::Callback(handler))
            .is_some()
        {
            debug!(stream, "replaced callback binding");
        }
        Ok(())
    }

    /// Bind `stream` to a new poller. An earlier poller on the same stream is
    /// disconnected and reports [`PollResult::Closed`].
    pub fn bind_poller(&mut self, stream: &str) -> Result<Poller> {
        self.check(stream, BindingMode::Poller)?;
        Ok(self.insert_poller(stream))
    }

    /// Bind a payload stream and its presence stream as one gated poller.
    /// Nothing is bound unless both streams accept a poller.
    pub fn bind_gated(&mut self, payload: &str, presence: &str) -> Result<GatedPoller> {
        self.check(payload, BindingMode::Poller)?;
        self.check(presence, BindingMode::Poller)?;
        let payload = self.insert_poller(payload);
        let presence = self.insert_poller(presence);
        Ok(GatedPoller::new(payload, presence))
    }

    fn insert_poller(&mut self, stream: &str) -> Poller {
        let (tx, rx) = match self.poller_capacity {
            Some(capacity) => bounded(capacity.max(1)),
            None => unbounded(),
        };
        if self
            .entries
            .insert(stream.to_owned(), Binding::Poller(tx))
            .is_some()
        {
            debug!(stream, "replaced poller binding");
        }
        Poller::new(stream, rx)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Hand every binding to `engine` as an observer, leaving the table empty.
    pub(crate) fn install<E>(&mut self, engine: &mut E) -> Result<(), EngineStatus>
    where
        E: GraphEngine + ?Sized,
    {
        for (stream, binding) in std::mem::take(&mut self.entries) {
            let handler = observer_for(stream.clone(), binding);
            engine.observe(&stream, handler)?;
        }
        Ok(())
    }
}

fn observer_for(stream: String, binding: Binding) -> PacketHandler {
    match binding {
        Binding::Callback(mut handler) => Box::new(move |packet| {
            metrics::counter!(PACKETS_DISPATCHED, "stream" => stream.clone(), "mode" => "callback")
                .increment(1);
            handler(packet)
        }),
        Binding::Poller(tx) => Box::new(move |packet| {
            metrics::counter!(PACKETS_DISPATCHED, "stream" => stream.clone(), "mode" => "poller")
                .increment(1);
            if tx.send(packet).is_err() {
                trace!(stream = %stream, "poller dropped, discarding packet");
            }
            metrics::gauge!(POLLER_DEPTH, "stream" => stream.clone()).set(tx.len() as f64);
            Ok(())
        }),
    }
}

/// Outcome of a non-blocking or time-limited poll.
#[derive(Debug, PartialEq)]
pub enum PollResult<T> {
    Ready(T),
    /// Nothing arrived in time; more may follow.
    Empty,
    /// The stream has ended and every queued item was consumed.
    Closed,
}

impl<T> PollResult<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            PollResult::Ready(value) => Some(value),
            PollResult::Empty | PollResult::Closed => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PollResult::Closed)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PollResult<U> {
        match self {
            PollResult::Ready(value) => PollResult::Ready(f(value)),
            PollResult::Empty => PollResult::Empty,
            PollResult::Closed => PollResult::Closed,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Wait {
    Block,
    Until(Instant),
    Never,
}

impl Wait {
    pub(crate) fn timeout(timeout: Option<Duration>) -> Self {
        match timeout.and_then(|timeout| Instant::now().checked_add(timeout)) {
            Some(deadline) => Wait::Until(deadline),
            None => Wait::Block,
        }
    }

    pub(crate) fn after(timeout: Duration) -> Self {
        Self::timeout(Some(timeout))
    }
}

/// Caller-side queue of raw packets from one output stream.
pub struct Poller {
    stream: Arc<str>,
    rx: Receiver<Packet>,
}

impl Poller {
    pub(crate) fn new(stream: &str, rx: Receiver<Packet>) -> Self {
        Self {
            stream: Arc::from(stream),
            rx,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Block until a packet arrives; `None` once the stream has closed.
    pub fn next(&self) -> Option<Packet> {
        self.rx.recv().ok()
    }

    pub fn next_timeout(&self, timeout: Duration) -> PollResult<Packet> {
        self.wait(Wait::after(timeout))
    }

    pub fn try_next(&self) -> PollResult<Packet> {
        self.wait(Wait::Never)
    }

    /// Packets queued and not yet taken.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Packet> + '_ {
        self.rx.iter()
    }

    pub(crate) fn wait(&self, wait: Wait) -> PollResult<Packet> {
        match wait {
            Wait::Block => match self.rx.recv() {
                Ok(packet) => PollResult::Ready(packet),
                Err(_) => PollResult::Closed,
            },
            Wait::Until(deadline) => match self.rx.recv_deadline(deadline) {
                Ok(packet) => PollResult::Ready(packet),
                Err(RecvTimeoutError::Timeout) => PollResult::Empty,
                Err(RecvTimeoutError::Disconnected) => PollResult::Closed,
            },
            Wait::Never => match self.rx.try_recv() {
                Ok(packet) => PollResult::Ready(packet),
                Err(TryRecvError::Empty) => PollResult::Empty,
                Err(TryRecvError::Disconnected) => PollResult::Closed,
            },
        }
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("stream", &self.stream)
            .field("queued", &self.rx.len())
            .finish()
    }
}

/// One gated observation: the payload when presence was signalled, or the
/// timestamp of a frame where nothing was found.
#[derive(Debug, PartialEq)]
pub enum Gated {
    Present(Packet),
    Absent(Timestamp),
}

impl Gated {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Gated::Present(packet) => packet.timestamp,
            Gated::Absent(timestamp) => *timestamp,
        }
    }
}

/// Poller that reads a presence stream first and only waits for the paired
/// payload when presence is true. Payload packets are never read ahead of
/// their presence packet.
#[derive(Debug)]
pub struct GatedPoller {
    payload: Poller,
    presence: Poller,
    // Presence already read as true whose payload has not arrived yet.
    pending: Option<Timestamp>,
}

impl GatedPoller {
    pub(crate) fn new(payload: Poller, presence: Poller) -> Self {
        Self {
            payload,
            presence,
            pending: None,
        }
    }

    pub fn payload_stream(&self) -> &str {
        self.payload.stream()
    }

    pub fn presence_stream(&self) -> &str {
        self.presence.stream()
    }

    pub fn next(&mut self) -> Result<Option<Gated>> {
        Ok(self.poll(Wait::Block)?.ready())
    }

    pub fn next_timeout(&mut self, timeout: Duration) -> Result<PollResult<Gated>> {
        self.poll(Wait::after(timeout))
    }

    pub fn try_next(&mut self) -> Result<PollResult<Gated>> {
        self.poll(Wait::Never)
    }

    pub(crate) fn poll(&mut self, wait: Wait) -> Result<PollResult<Gated>> {
        let gate = match self.pending {
            Some(timestamp) => timestamp,
            None => match self.presence.wait(wait) {
                PollResult::Ready(packet) => match packet.payload {
                    Payload::Presence(true) => packet.timestamp,
                    Payload::Presence(false) => {
                        return Ok(PollResult::Ready(Gated::Absent(packet.timestamp)));
                    }
                    other => {
                        return Err(SessionError::UnexpectedPayload {
                            stream: self.presence.stream().to_owned(),
                            expected: PayloadKind::Presence,
                            found: other.kind(),
                        });
                    }
                },
                PollResult::Empty => return Ok(PollResult::Empty),
                PollResult::Closed => return Ok(PollResult::Closed),
            },
        };

        self.pending = Some(gate);
        match self.payload.wait(wait) {
            PollResult::Ready(packet) => {
                self.pending = None;
                if packet.timestamp != gate {
                    return Err(SessionError::PairingBroken {
                        stream: self.payload.stream().to_owned(),
                        presence: gate,
                        payload: packet.timestamp,
                    });
                }
                Ok(PollResult::Ready(Gated::Present(packet)))
            }
            PollResult::Empty => Ok(PollResult::Empty),
            PollResult::Closed => {
                self.pending = None;
                Ok(PollResult::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use graphpipe_records::native::NativeLandmarkList;

    use super::*;

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn presence(micros: i64, present: bool) -> Packet {
        Packet::new(ts(micros), Payload::Presence(present))
    }

    fn landmarks(micros: i64) -> Packet {
        Packet::new(
            ts(micros),
            Payload::LandmarkLists(vec![NativeLandmarkList::default()]),
        )
    }

    fn gated_pair() -> (Sender<Packet>, Sender<Packet>, GatedPoller) {
        let (payload_tx, payload_rx) = unbounded();
        let (presence_tx, presence_rx) = unbounded();
        let poller = GatedPoller::new(
            Poller::new("multi_face_landmarks", payload_rx),
            Poller::new("multi_landmarks_presence", presence_rx),
        );
        (payload_tx, presence_tx, poller)
    }

    #[test]
    fn second_mode_on_a_bound_stream_is_refused() {
        let mut table = BindingTable::new(None);
        table
            .bind_callback("face_detections", Box::new(|_| Ok(())))
            .expect("callback");
        let err = table.bind_poller("face_detections").unwrap_err();
        assert!(matches!(
            err,
            SessionError::DualBinding {
                existing: BindingMode::Callback,
                requested: BindingMode::Poller,
                ..
            }
        ));
        assert_eq!(table.mode("face_detections"), Some(BindingMode::Callback));
    }

    #[test]
    fn gated_binding_is_all_or_nothing() {
        let mut table = BindingTable::new(None);
        table
            .bind_callback("landmarks_presence", Box::new(|_| Ok(())))
            .expect("callback");
        assert!(table.bind_gated("blendshapes", "landmarks_presence").is_err());
        assert_eq!(table.mode("blendshapes"), None);
    }

    #[test]
    fn rebinding_a_poller_closes_the_previous_one() {
        let mut table = BindingTable::new(Some(4));
        let first = table.bind_poller("pose_landmarks").expect("first");
        let _second = table.bind_poller("pose_landmarks").expect("second");
        assert_eq!(table.len(), 1);
        assert_eq!(first.try_next(), PollResult::Closed);
    }

    #[test]
    fn absent_frames_never_touch_the_payload_queue() {
        let (payload_tx, presence_tx, mut poller) = gated_pair();
        presence_tx.send(presence(1, false)).expect("send");
        presence_tx.send(presence(2, true)).expect("send");
        payload_tx.send(landmarks(2)).expect("send");

        assert_eq!(poller.try_next().expect("poll"), PollResult::Ready(Gated::Absent(ts(1))));
        assert_eq!(poller.payload.queued(), 1);
        let second = poller.try_next().expect("poll").ready().expect("ready");
        assert_eq!(second, Gated::Present(landmarks(2)));
        assert_eq!(poller.payload.queued(), 0);
    }

    #[test]
    fn pending_presence_survives_an_empty_poll() {
        let (payload_tx, presence_tx, mut poller) = gated_pair();
        presence_tx.send(presence(7, true)).expect("send");

        assert_eq!(poller.try_next().expect("poll"), PollResult::Empty);
        payload_tx.send(landmarks(7)).expect("send");
        assert_eq!(
            poller.next_timeout(Duration::from_millis(50)).expect("poll"),
            PollResult::Ready(Gated::Present(landmarks(7)))
        );
    }

    #[test]
    fn mismatched_pair_is_reported() {
        let (payload_tx, presence_tx, mut poller) = gated_pair();
        presence_tx.send(presence(3, true)).expect("send");
        payload_tx.send(landmarks(4)).expect("send");
        assert!(matches!(
            poller.try_next(),
            Err(SessionError::PairingBroken { .. })
        ));
    }

    #[test]
    fn gated_poller_closes_with_its_streams() {
        let (payload_tx, presence_tx, mut poller) = gated_pair();
        drop(payload_tx);
        drop(presence_tx);
        assert_eq!(poller.next().expect("poll"), None);
    }
}
