use std::fmt;

use graphpipe_ingest::{FrameClock, Timestamp};

use crate::error::{Result, SessionError};

/// Where a session is in its configure, start, feed, stop cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Unconfigured => "unconfigured",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// State machine plus the per-run timestamp guard.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: SessionState,
    last_timestamp: Option<Timestamp>,
    clock: FrameClock,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: SessionState::Unconfigured,
            last_timestamp: None,
            clock: FrameClock::new(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn last_timestamp(&self) -> Option<Timestamp> {
        self.last_timestamp
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::Lifecycle {
                operation,
                state: self.state,
            })
        }
    }

    pub(crate) fn ensure_configurable(&self) -> Result<()> {
        self.require(
            "configure",
            &[SessionState::Unconfigured, SessionState::Stopped],
        )
    }

    pub(crate) fn ensure_bindable(&self, operation: &'static str) -> Result<()> {
        self.require(operation, &[SessionState::Configured])
    }

    pub(crate) fn ensure_startable(&self) -> Result<()> {
        self.require("start", &[SessionState::Configured])
    }

    pub(crate) fn configured(&mut self) {
        self.state = SessionState::Configured;
        self.last_timestamp = None;
        self.clock = FrameClock::new();
    }

    pub(crate) fn running(&mut self) {
        self.state = SessionState::Running;
    }

    pub(crate) fn stopped(&mut self) {
        self.state = SessionState::Stopped;
    }

    /// Timestamp for a frame fed without one: the clock reading, bumped past
    /// the previous frame when the clock has not advanced.
    pub(crate) fn next_clock_timestamp(&self) -> Timestamp {
        let now = self.clock.now();
        match self.last_timestamp {
            Some(last) if now <= last => last.successor(),
            _ => now,
        }
    }

    /// Check a frame may be fed at `timestamp` without recording it.
    pub(crate) fn admit(&self, timestamp: Timestamp) -> Result<()> {
        self.require("feed", &[SessionState::Running])?;
        match self.last_timestamp {
            Some(previous) if timestamp <= previous => Err(SessionError::OutOfOrderFrame {
                timestamp,
                previous,
            }),
            _ => Ok(()),
        }
    }

    /// Record a frame the engine accepted.
    pub(crate) fn accepted(&mut self, timestamp: Timestamp) {
        self.last_timestamp = Some(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    #[test]
    fn feeding_requires_a_running_session() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle.admit(ts(1)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Lifecycle {
                operation: "feed",
                state: SessionState::Unconfigured
            }
        ));
    }

    #[test]
    fn timestamps_must_strictly_increase() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.configured();
        lifecycle.running();
        lifecycle.admit(ts(100)).expect("first");
        lifecycle.accepted(ts(100));

        for stale in [100, 99, -5] {
            let err = lifecycle.admit(ts(stale)).unwrap_err();
            assert!(matches!(
                err,
                SessionError::OutOfOrderFrame { previous, .. } if previous == ts(100)
            ));
        }
        lifecycle.admit(ts(101)).expect("next");
    }

    #[test]
    fn rejected_frames_do_not_advance_the_guard() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.configured();
        lifecycle.running();
        lifecycle.admit(ts(50)).expect("admit");
        // Not recorded as accepted, so an earlier stamp is still fine.
        lifecycle.admit(ts(10)).expect("admit earlier");
        assert_eq!(lifecycle.last_timestamp(), None);
    }

    #[test]
    fn clock_timestamps_skip_past_caller_supplied_ones() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.configured();
        lifecycle.running();
        lifecycle.accepted(ts(i64::MAX / 2));
        assert_eq!(lifecycle.next_clock_timestamp(), ts(i64::MAX / 2 + 1));
    }

    #[test]
    fn reconfiguring_resets_the_timestamp_domain() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.configured();
        lifecycle.running();
        lifecycle.accepted(ts(500));
        lifecycle.stopped();
        lifecycle.ensure_configurable().expect("stopped may configure");
        lifecycle.configured();
        lifecycle.running();
        lifecycle.admit(ts(1)).expect("new run starts over");
    }
}
