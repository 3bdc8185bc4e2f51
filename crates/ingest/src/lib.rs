//! Frame input for graphpipe sessions: the RGB [`Frame`] fed into a graph,
//! the microsecond [`Timestamp`] it is fed at, and background readers that
//! produce frames over a bounded channel.

mod clock;
mod frame;
mod source;

pub use clock::{FrameClock, Timestamp};
pub use frame::{Frame, FrameError, FrameFormat};
pub use source::{CaptureError, open_raw_reader, spawn_raw_reader, spawn_synthetic_reader};
