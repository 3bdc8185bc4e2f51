//! Hooks for the annotated frames a graph emits on its preview stream.

use std::sync::{Arc, Mutex, PoisonError};

use graphpipe_ingest::{Frame, Timestamp};

use crate::engine::{EngineStatus, PacketHandler, Payload};

/// Most recent preview frame, shared between the engine thread and a viewer.
#[derive(Clone, Default)]
pub struct LatestFrame {
    slot: Arc<Mutex<Option<(Timestamp, Frame)>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, timestamp: Timestamp, frame: Frame) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some((timestamp, frame));
    }

    /// Copy of the latest frame, if any arrived yet.
    pub fn snapshot(&self) -> Option<(Timestamp, Frame)> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take the latest frame, leaving the slot empty until the next one.
    pub fn take(&self) -> Option<(Timestamp, Frame)> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

pub(crate) fn preview_handler<F>(stream: String, mut handler: F) -> PacketHandler
where
    F: FnMut(Timestamp, &Frame) + Send + 'static,
{
    Box::new(move |packet| match &packet.payload {
        Payload::Image(frame) => {
            handler(packet.timestamp, frame);
            Ok(())
        }
        other => Err(EngineStatus::invalid_argument(format!(
            "preview stream {stream:?} carried {} instead of an image",
            other.kind()
        ))),
    })
}

#[cfg(test)]
mod tests {
    use crate::engine::Packet;

    use super::*;

    #[test]
    fn latest_frame_keeps_only_the_newest() {
        let latest = LatestFrame::new();
        let clone = latest.clone();
        for shade in [10u8, 20] {
            let frame = Frame::filled(1, 1, [shade, 0, 0]).expect("frame");
            clone.store(Timestamp::from_micros(shade as i64), frame);
        }
        let (timestamp, frame) = latest.take().expect("frame");
        assert_eq!(timestamp.as_micros(), 20);
        assert_eq!(frame.pixel(0, 0), Some([20, 0, 0]));
        assert!(latest.snapshot().is_none());
    }

    #[test]
    fn preview_handler_rejects_non_images() {
        let mut handler = preview_handler("output_video".into(), |_, _| {});
        let err = handler(Packet::new(Timestamp::from_micros(1), Payload::Presence(true)))
            .unwrap_err();
        assert!(err.message.contains("output_video"));
    }
}
