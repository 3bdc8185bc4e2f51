//! Background frame readers.
//!
//! Each reader runs on its own thread and forwards frames over a small bounded
//! channel so a slow consumer backpressures the reader instead of growing a
//! queue.

use std::{
    fs::File,
    io::{self, BufReader, ErrorKind, Read},
    path::Path,
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use thiserror::Error;
use tracing::debug;

use crate::frame::{Frame, FrameError};

const READER_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open frame source {uri:?}")]
    Open {
        uri: String,
        #[source]
        source: io::Error,
    },
    #[error("frame rate {fps} gives no usable frame interval")]
    FrameRate { fps: f32 },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Spawn a thread producing `frame_count` solid frames whose colour cycles
/// per frame, paced at `fps` (unpaced when `fps` is zero).
pub fn spawn_synthetic_reader(
    size: (u32, u32),
    frame_count: u64,
    fps: f32,
) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    // Reject bad dimensions before a thread exists.
    Frame::byte_len(size.0, size.1)?;
    let (tx, rx) = bounded(READER_QUEUE_DEPTH);
    let pace = if fps > 0.0 {
        let interval = Duration::try_from_secs_f32(1.0 / fps)
            .map_err(|_| CaptureError::FrameRate { fps })?;
        Some(interval)
    } else {
        None
    };

    thread::Builder::new()
        .name("ingest-synthetic".into())
        .spawn(move || synthetic_loop(size, frame_count, pace, tx))?;

    Ok(rx)
}

fn synthetic_loop(
    (width, height): (u32, u32),
    frame_count: u64,
    pace: Option<Duration>,
    tx: Sender<Result<Frame, CaptureError>>,
) {
    for index in 0..frame_count {
        let shade = (index % 256) as u8;
        let frame = Frame::filled(width, height, [shade, shade.wrapping_mul(3), 255 - shade])
            .map_err(CaptureError::from);
        if tx.send(frame).is_err() {
            break;
        }
        if let Some(pace) = pace {
            thread::sleep(pace);
        }
    }
    debug!(frames = frame_count, "synthetic source exhausted");
}

/// Open a raw `rgb24` file and stream it frame by frame.
pub fn open_raw_reader(
    path: &Path,
    size: (u32, u32),
) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let file = File::open(path).map_err(|source| CaptureError::Open {
        uri: path.display().to_string(),
        source,
    })?;
    spawn_raw_reader(BufReader::new(file), size)
}

/// Spawn a thread slicing a raw `rgb24` byte stream into frames of `size`.
///
/// A clean end of stream, including a trailing partial frame, ends the
/// channel; any other read error is forwarded once before stopping.
pub fn spawn_raw_reader<R>(
    reader: R,
    size: (u32, u32),
) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError>
where
    R: Read + Send + 'static,
{
    let frame_bytes = Frame::byte_len(size.0, size.1)?;
    let (tx, rx) = bounded(READER_QUEUE_DEPTH);

    thread::Builder::new()
        .name("ingest-raw".into())
        .spawn(move || raw_loop(reader, size, frame_bytes, tx))?;

    Ok(rx)
}

fn raw_loop<R: Read>(
    mut reader: R,
    (width, height): (u32, u32),
    frame_bytes: usize,
    tx: Sender<Result<Frame, CaptureError>>,
) {
    let mut frames: u64 = 0;
    loop {
        let mut buffer = vec![0u8; frame_bytes];
        match reader.read_exact(&mut buffer) {
            Ok(()) => {
                frames += 1;
                let frame = Frame::new(width, height, buffer).map_err(CaptureError::from);
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!(frames, "raw source reached end of stream");
                break;
            }
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn raw_reader_slices_stream_and_drops_partial_tail() {
        let mut bytes = vec![1u8; 2 * 2 * 3 * 2];
        bytes.extend_from_slice(&[9, 9, 9]);
        let rx = spawn_raw_reader(Cursor::new(bytes), (2, 2)).expect("spawn");

        let frames: Vec<Frame> = rx
            .iter()
            .map(|frame| frame.expect("frame"))
            .collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.data().iter().all(|b| *b == 1)));
    }

    #[test]
    fn synthetic_reader_produces_requested_count() {
        let rx = spawn_synthetic_reader((8, 4), 5, 0.0).expect("spawn");
        let frames: Vec<Frame> = rx.iter().map(|f| f.expect("frame")).collect();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].width(), 8);
        assert_ne!(frames[0].pixel(0, 0), frames[1].pixel(0, 0));
    }

    #[test]
    fn readers_reject_empty_dimensions_up_front() {
        assert!(matches!(
            spawn_synthetic_reader((0, 4), 1, 0.0),
            Err(CaptureError::Frame(FrameError::EmptyFrame { .. }))
        ));
    }

    #[test]
    fn synthetic_reader_rejects_rates_too_slow_to_pace() {
        for fps in [1e-30, f32::MIN_POSITIVE / 4.0] {
            assert!(matches!(
                spawn_synthetic_reader((2, 2), 1, fps),
                Err(CaptureError::FrameRate { .. })
            ));
        }
        let rx = spawn_synthetic_reader((2, 2), 2, 1000.0).expect("paced");
        assert_eq!(rx.iter().count(), 2);
    }

    #[test]
    fn missing_raw_file_reports_open_error() {
        let err = open_raw_reader(Path::new("/definitely/not/here.rgb"), (2, 2)).unwrap_err();
        assert!(matches!(err, CaptureError::Open { .. }));
    }
}
